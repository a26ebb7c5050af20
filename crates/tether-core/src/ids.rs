//! Short opaque id generation for sessions and schedules.

use rand::RngCore;

/// An 8-character lowercase hex id, e.g. for a PTY session.
pub fn short_id() -> String {
    hex_id(4)
}

/// A schedule id: 8 hex chars, same shape as `short_id` but named separately
/// since the spec calls it out as its own concept.
pub fn schedule_id() -> String {
    hex_id(4)
}

fn hex_id(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_is_eight_hex_chars() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_are_not_trivially_repeated() {
        let a = short_id();
        let b = short_id();
        assert_ne!(a, b);
    }
}
