//! `ptc-ctl` — operator command surface (spec.md §6 "Operator command
//! surface"). A thin display layer over [`ptc::coordinator::Coordinator`];
//! exit code 0 on success, non-zero with a single `Error: <reason>` line
//! on failure.

use clap::{Parser, Subcommand};
use ptc::config::Config;
use ptc::coordinator::Coordinator;
use ptc::model::DeadLetterResolution;
use ptc::store::dead_letters::DeadLetterListParams;
use ptc::store::Store;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ptc-ctl", about = "Operator CLI for the Parallel Task Coordinator")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Human-readable or JSON summary of coordinator state.
    Status,
    /// Lightweight liveness snapshot (queue depths, worker counts, pending acks).
    Health,
    /// Enumerate registered workers.
    Workers,
    /// List the most recent unresolved dead-letter rows.
    DeadLetters,
    /// Resurface a dead-lettered message for redelivery.
    Retry {
        dl_id: Option<String>,
        #[arg(long)]
        all: bool,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Mark a dead-letter row resolved.
    Resolve {
        dl_id: String,
        #[arg(default_value = "skipped")]
        resolution: String,
    },
    /// Breakdown of failures by type and by day.
    Stats {
        #[arg(long)]
        trends: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let coordinator = Arc::new(Coordinator::new(
        config.clone(),
        Store::open(config.messages_db_path())?,
        Store::open(config.workers_db_path())?,
        Store::open(config.task_claims_db_path())?,
        Store::open(config.dead_letters_db_path())?,
        std::env::var("PTC_READY_TASK_COMMAND").unwrap_or_else(|_| "ptc-ready-task".to_string()),
    ));

    // `retry` must push the resurfaced message back through the same
    // pipeline a live coordinator uses (`send`), which requires a started
    // coordinator; the other commands only read, but starting is cheap for
    // a short-lived CLI invocation and keeps every command on one code path.
    coordinator.start().await?;

    let result = match cli.command {
        Command::Status => cmd_status(&coordinator, cli.json).await,
        Command::Health => cmd_health(&coordinator, cli.json).await,
        Command::Workers => cmd_workers(&coordinator, cli.json).await,
        Command::DeadLetters => cmd_dead_letters(&coordinator, cli.json).await,
        Command::Retry { dl_id, all, filter, dry_run } => {
            cmd_retry(&coordinator, dl_id, all, filter, dry_run).await
        }
        Command::Resolve { dl_id, resolution } => cmd_resolve(&coordinator, dl_id, resolution).await,
        Command::Stats { trends } => cmd_stats(&coordinator, trends, cli.json).await,
    };

    coordinator.stop().await?;
    result
}

async fn cmd_status(coordinator: &Coordinator, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let status = coordinator.get_status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Coordinator: {}", status.coordinator_name);
        println!("  running: {}", status.running);
        println!(
            "  workers: active={} stale={} offline={}",
            status.workers_active, status.workers_stale, status.workers_offline
        );
        println!(
            "  messages: pending={} delivered={} acknowledged={} failed={} dead_letter={}",
            status.messages_pending,
            status.messages_delivered,
            status.messages_acknowledged,
            status.messages_failed,
            status.messages_dead_letter
        );
        println!("  dead letters unresolved: {}", status.dead_letters_unresolved);
    }
    Ok(())
}

async fn cmd_health(coordinator: &Coordinator, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let health = coordinator.health().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
    } else {
        println!("running: {}", health.running);
        println!("queue lengths (critical/high/normal/low): {:?}", health.queue.lengths);
        println!(
            "workers: active={} stale={} offline={}",
            health.workers_by_status.active, health.workers_by_status.stale, health.workers_by_status.offline
        );
        println!("acks: pending={} overdue={}", health.pending_acks, health.overdue_acks);
        println!("dead letters unresolved: {}", health.dead_letters_unresolved);
    }
    Ok(())
}

async fn cmd_workers(coordinator: &Coordinator, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let workers = coordinator.registry().list(None).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&workers)?);
    } else {
        for w in workers {
            println!(
                "{}  name={} pid={} status={:?} capabilities=[{}] last_heartbeat={}",
                w.id,
                w.name,
                w.pid,
                w.status,
                w.capabilities.iter().cloned().collect::<Vec<_>>().join(","),
                w.last_heartbeat
            );
        }
    }
    Ok(())
}

async fn cmd_dead_letters(coordinator: &Coordinator, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let entries = coordinator
        .dead_letters()
        .list(DeadLetterListParams {
            unresolved: Some(true),
            limit: 50,
            offset: 0,
            sender: None,
        })
        .await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for dl in entries {
            println!(
                "{}  original={} sender={} type={} error={} retry_count={}",
                dl.id, dl.original_message_id, dl.sender, dl.message_type, dl.error, dl.retry_count
            );
        }
    }
    Ok(())
}

async fn cmd_retry(
    coordinator: &Coordinator,
    dl_id: Option<String>,
    all: bool,
    filter: Option<String>,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let targets: Vec<String> = if let Some(id) = dl_id {
        vec![id]
    } else if all || filter.is_some() {
        let entries = coordinator
            .dead_letters()
            .list(DeadLetterListParams {
                unresolved: Some(true),
                limit: i64::MAX,
                offset: 0,
                sender: None,
            })
            .await?;
        entries
            .into_iter()
            .filter(|dl| match &filter {
                Some(f) => match f.split_once('=') {
                    Some(("type", v)) => dl.message_type == v,
                    Some(("sender", v)) => dl.sender == v,
                    _ => true,
                },
                None => true,
            })
            .map(|dl| dl.id)
            .collect()
    } else {
        return Err("retry requires <dl-id>, --all, or --filter".into());
    };

    println!("{} dead letter(s) selected for retry", targets.len());
    if dry_run {
        for id in &targets {
            println!("[dry-run] would retry {id}");
        }
        return Ok(());
    }

    let mut succeeded = 0usize;
    for id in &targets {
        match coordinator.dead_letters().retry(id).await? {
            Some(msg) => {
                let new_id = msg.id.clone();
                let send_result = coordinator.send(msg, false).await?;
                if send_result.success {
                    println!("retried {id} -> new message {new_id}");
                    succeeded += 1;
                } else {
                    println!("retried {id} -> new message {new_id} but it failed to enqueue");
                }
            }
            None => println!("skipped {id} (missing or already resolved)"),
        }
    }
    println!("retried {succeeded}/{} dead letter(s)", targets.len());
    Ok(())
}

async fn cmd_resolve(coordinator: &Coordinator, dl_id: String, resolution: String) -> Result<(), Box<dyn std::error::Error>> {
    let resolution = DeadLetterResolution::from_str(&resolution)
        .ok_or_else(|| format!("unknown resolution '{resolution}', expected retried|skipped|escalated"))?;
    let resolved = coordinator.dead_letters().resolve(&dl_id, resolution).await?;
    if resolved {
        println!("resolved {dl_id}");
        Ok(())
    } else {
        Err(format!("dead letter {dl_id} not found or already resolved").into())
    }
}

async fn cmd_stats(coordinator: &Coordinator, trends: bool, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let status = coordinator.get_status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!(
            "messages: pending={} delivered={} acknowledged={} failed={} dead_letter={}",
            status.messages_pending,
            status.messages_delivered,
            status.messages_acknowledged,
            status.messages_failed,
            status.messages_dead_letter
        );
        if trends {
            println!("(trend breakdown requires historical sampling; not available from a single snapshot)");
        }
    }
    Ok(())
}
