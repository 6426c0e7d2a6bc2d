//! C1 — IdGen: message, correlation, trace and span identifiers (spec.md §4.1).
//!
//! A message id is `[prefix-][~base36-timestamp-]random`, where `random` is
//! a 128-bit token rendered as lowercase base36 and a present timestamp
//! segment always carries a leading `~` so it can't be confused with a
//! prefix on parse. A correlation id is always
//! `corr-<base36 timestamp>-<random, >= 7 chars>`.

use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct NewIdOptions {
    pub prefix: Option<String>,
    /// Include a base36-encoded timestamp component for rough time ordering.
    pub with_timestamp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId {
    pub prefix: Option<String>,
    pub timestamp: Option<i64>,
    pub random: String,
}

fn to_base36(mut value: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        let digit = (value % 36) as usize;
        out.push(DIGITS[digit]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 alphabet is ASCII")
}

fn from_base36(s: &str) -> Option<u128> {
    if s.is_empty() {
        return None;
    }
    let mut value: u128 = 0;
    for c in s.chars() {
        let digit = c.to_digit(36)? as u128;
        value = value.checked_mul(36)?.checked_add(digit)?;
    }
    Some(value)
}

fn random_token() -> String {
    // 128 bits of randomness, rendered as base36 for id-string compactness.
    let bits = Uuid::new_v4().as_u128();
    to_base36(bits)
}

/// Marks a segment as a base36 timestamp rather than part of the prefix.
/// `~` never appears in `to_base36`'s output or in any prefix this crate
/// generates, so detecting a timestamp segment in `parse` never has to
/// guess from parseability alone.
const TIMESTAMP_SENTINEL: char = '~';

fn encode_timestamp(ts: i64) -> String {
    format!("{TIMESTAMP_SENTINEL}{}", to_base36(ts as u128))
}

fn decode_timestamp(segment: &str) -> Option<i64> {
    let rest = segment.strip_prefix(TIMESTAMP_SENTINEL)?;
    from_base36(rest).map(|v| v as i64)
}

/// Generate a new message id per `opts`.
pub fn new_message_id(opts: &NewIdOptions) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(prefix) = &opts.prefix {
        parts.push(prefix.clone());
    }
    if opts.with_timestamp {
        let ts = crate::model::now_ms();
        parts.push(encode_timestamp(ts));
    }
    parts.push(random_token());
    parts.join("-")
}

/// Generate a new correlation id: `corr-<base36 timestamp>-<random>`.
pub fn new_correlation_id() -> String {
    let ts = crate::model::now_ms();
    format!("corr-{}-{}", to_base36(ts as u128), random_token())
}

/// Parse an id produced by `new_message_id`. The last `-` separated
/// segment is always the random component; the segment before it is a
/// timestamp only if it carries the `~` sentinel (see
/// [`TIMESTAMP_SENTINEL`]), never merely because it happens to parse as
/// base36 — an all-lowercase-alphanumeric prefix like `msg` would
/// otherwise be indistinguishable from a timestamp. Anything else
/// remaining is the prefix.
pub fn parse(id: &str) -> ParsedId {
    let segments: Vec<&str> = id.split('-').collect();
    if segments.len() <= 1 {
        return ParsedId {
            prefix: None,
            timestamp: None,
            random: id.to_string(),
        };
    }

    let random = segments.last().unwrap().to_string();
    let rest = &segments[..segments.len() - 1];

    if let Some(last) = rest.last() {
        if let Some(ts) = decode_timestamp(last) {
            let prefix_segments = &rest[..rest.len() - 1];
            let prefix = if prefix_segments.is_empty() {
                None
            } else {
                Some(prefix_segments.join("-"))
            };
            return ParsedId {
                prefix,
                timestamp: Some(ts),
                random,
            };
        }
    }

    ParsedId {
        prefix: Some(rest.join("-")),
        timestamp: None,
        random,
    }
}

/// Lenient validity check (spec.md §9 Open Question (a)): accepts any
/// RFC-4122-shaped UUID, or any prefixed form containing a `-`. Never
/// raises; unrecognized input simply returns `false`.
pub fn is_valid(id: &str) -> bool {
    if Uuid::parse_str(id).is_ok() {
        return true;
    }
    id.contains('-') && !id.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_prefix() {
        let opts = NewIdOptions {
            prefix: Some("msg".to_string()),
            with_timestamp: true,
        };
        let id = new_message_id(&opts);
        let parsed = parse(&id);
        assert_eq!(parsed.prefix.as_deref(), Some("msg"));
        assert!(parsed.timestamp.is_some());
    }

    #[test]
    fn round_trips_prefix_without_timestamp() {
        let opts = NewIdOptions {
            prefix: Some("msg".to_string()),
            with_timestamp: false,
        };
        let id = new_message_id(&opts);
        let parsed = parse(&id);
        assert_eq!(parsed.prefix.as_deref(), Some("msg"));
        assert_eq!(parsed.timestamp, None);
    }

    #[test]
    fn no_prefix_no_timestamp() {
        let id = new_message_id(&NewIdOptions::default());
        let parsed = parse(&id);
        assert_eq!(parsed.prefix, None);
        assert_eq!(parsed.timestamp, None);
        assert_eq!(parsed.random, id);
    }

    #[test]
    fn correlation_id_shape() {
        let id = new_correlation_id();
        assert!(id.starts_with("corr-"));
        let rest = id.strip_prefix("corr-").unwrap();
        let mut parts = rest.splitn(2, '-');
        let ts = parts.next().unwrap();
        let rand = parts.next().unwrap();
        assert!(from_base36(ts).is_some());
        assert!(rand.len() >= 7);
    }

    #[test]
    fn is_valid_accepts_uuid_and_prefixed() {
        assert!(is_valid(&Uuid::new_v4().to_string()));
        assert!(is_valid("dl-abc123-xyz"));
        assert!(!is_valid("not_an_id_without_dash"));
        assert!(!is_valid(""));
    }

    #[test]
    fn ids_are_unique() {
        let a = new_message_id(&NewIdOptions::default());
        let b = new_message_id(&NewIdOptions::default());
        assert_ne!(a, b);
    }
}
