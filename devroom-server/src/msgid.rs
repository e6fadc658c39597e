//! Time-sortable message ids.
//!
//! 26 characters of Crockford base32: 48 bits of Unix milliseconds followed
//! by 80 random bits. Ids from the same millisecond do not sort by arrival;
//! use the channel sequence number for delivery order.

use rand::Rng;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

pub fn generate() -> String {
    generate_at(chrono::Utc::now().timestamp_millis().max(0) as u64)
}

/// Id for an explicit timestamp (milliseconds since the epoch).
pub fn generate_at(now_ms: u64) -> String {
    let mut rng = rand::thread_rng();
    let random: u128 = rng.r#gen::<u128>() & ((1u128 << 80) - 1);
    let value = ((now_ms as u128 & ((1u128 << 48) - 1)) << 80) | random;

    (0..26)
        .rev()
        .map(|i| CROCKFORD[((value >> (i * 5)) & 0x1F) as usize] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_and_uniqueness() {
        let a = generate();
        let b = generate();
        assert_eq!(a.len(), 26);
        assert_ne!(a, b);
    }

    #[test]
    fn alphabet_is_crockford() {
        for c in generate().chars() {
            assert!(
                c.is_ascii_digit() || (c.is_ascii_uppercase() && !"ILOU".contains(c)),
                "unexpected char {c}"
            );
        }
    }

    #[test]
    fn sorts_by_time() {
        let a = generate_at(1_700_000_000_000);
        let b = generate_at(1_700_000_000_001);
        assert!(a < b, "{a} should sort before {b}");
    }

    #[test]
    fn same_millisecond_shares_time_prefix() {
        let a = generate_at(1_700_000_123_456);
        let b = generate_at(1_700_000_123_456);
        // 48 time bits fill the first ten characters (50 bits, top two zero).
        assert_eq!(a[..10], b[..10]);
        assert_ne!(a[10..], b[10..]);
    }
}
