//! Parallel Task Coordinator: durable, crash-tolerant task/message
//! coordination for a pool of worker processes.
//!
//! A coordinator process and a pool of worker processes embed this crate
//! and share state exclusively through the durable store (see [`store`]).

pub mod ack;
pub mod claim;
pub mod coordinator;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod heartbeat;
pub mod id;
pub mod model;
pub mod queue;
pub mod reassignment;
pub mod ready_task;
pub mod registry;
pub mod retry;
pub mod stale;
pub mod store;

pub use coordinator::Coordinator;
pub use config::Config;
pub use error::{PtcError, PtcResult};
