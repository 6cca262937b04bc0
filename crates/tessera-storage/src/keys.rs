//! Key layout of the single fjall keyspace.
//!
//! | prefix        | contents                                   |
//! |---------------|--------------------------------------------|
//! | `\x01log/`    | `index(8 BE)` -> bincode(LogRecord)        |
//! | `\x02stable/` | label -> raw bytes / u64 BE                 |
//! | `\x03seq/`    | sequence name -> bincode(Sequence)         |
//! | `\x04data/`   | application key -> value                   |
//!
//! Each prefix starts with a distinct byte, so none is a prefix of another.

use tessera_types::Error;

pub const LOG_PREFIX: &[u8] = b"\x01log/";
pub const STABLE_PREFIX: &[u8] = b"\x02stable/";
pub const SEQUENCE_PREFIX: &[u8] = b"\x03seq/";
pub const DATA_PREFIX: &[u8] = b"\x04data/";

fn prefixed(prefix: &[u8], rest: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(prefix.len() + rest.len());
    buf.extend_from_slice(prefix);
    buf.extend_from_slice(rest);
    buf
}

/// Big-endian index, so lexicographic order is numeric order.
pub fn log_key(index: u64) -> Vec<u8> {
    prefixed(LOG_PREFIX, &index.to_be_bytes())
}

pub fn log_index(key: &[u8]) -> Result<u64, Error> {
    let raw: [u8; 8] = key
        .strip_prefix(LOG_PREFIX)
        .and_then(|rest| rest.try_into().ok())
        .ok_or_else(|| Error::Storage("malformed log key".into()))?;
    Ok(u64::from_be_bytes(raw))
}

pub fn stable_key(label: &str) -> Vec<u8> {
    prefixed(STABLE_PREFIX, label.as_bytes())
}

pub fn sequence_key(name: &str) -> Vec<u8> {
    prefixed(SEQUENCE_PREFIX, name.as_bytes())
}

pub fn data_key(key: &[u8]) -> Vec<u8> {
    prefixed(DATA_PREFIX, key)
}

/// Keys a replicated KV command may touch.
pub fn is_replicated_key(key: &[u8]) -> bool {
    key.starts_with(DATA_PREFIX) || key.starts_with(SEQUENCE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_never_collide() {
        let all = [LOG_PREFIX, STABLE_PREFIX, SEQUENCE_PREFIX, DATA_PREFIX];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                if i != j {
                    assert!(!a.starts_with(b), "{a:?} starts with {b:?}");
                }
            }
        }
    }

    #[test]
    fn log_keys_sort_by_index() {
        assert!(log_key(1) < log_key(2));
        assert!(log_key(255) < log_key(256));
        assert!(log_key(u64::MAX - 1) < log_key(u64::MAX));
    }

    #[test]
    fn log_index_round_trips() {
        assert_eq!(log_index(&log_key(42)).unwrap(), 42);
        assert!(log_index(&data_key(b"12345678")).is_err());
        assert!(log_index(b"\x01log/short").is_err());
    }

    #[test]
    fn only_data_and_sequences_are_replicated() {
        assert!(is_replicated_key(&data_key(b"users/1")));
        assert!(is_replicated_key(&sequence_key("users")));
        assert!(!is_replicated_key(&stable_key("node_id")));
        assert!(!is_replicated_key(&log_key(1)));
        assert!(!is_replicated_key(b"users/1"));
    }
}
