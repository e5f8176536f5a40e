use rand::rngs::OsRng;
use rand::RngCore;

/// Reinterpret a u64 as sint64 without changing the bit pattern.
///
/// The store keeps every integer id in a signed column; ids above
/// `i64::MAX` land as negative values and convert back losslessly.
pub fn uint64_to_sint64(value: u64) -> i64 {
    value as i64
}

/// Inverse of [`uint64_to_sint64`].
pub fn sint64_to_uint64(value: i64) -> u64 {
    value as u64
}

/// Draw a fresh 64-bit id from the OS entropy source (big-endian
/// interpretation of 8 random bytes). Collisions are possible but the
/// space is 2^64; callers check uniqueness against the store and
/// surface a failure on conflict.
pub fn generate_id() -> u64 {
    let mut buf = [0u8; 8];
    OsRng.fill_bytes(&mut buf);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sint64_round_trip() {
        for x in [
            0u64,
            1,
            42,
            i64::MAX as u64,
            (i64::MAX as u64) + 1,
            u64::MAX - 1,
            u64::MAX,
        ] {
            assert_eq!(sint64_to_uint64(uint64_to_sint64(x)), x);
        }
    }

    #[test]
    fn test_high_bit_maps_to_negative() {
        assert_eq!(uint64_to_sint64(u64::MAX), -1);
        assert_eq!(uint64_to_sint64((i64::MAX as u64) + 1), i64::MIN);
    }

    #[test]
    fn test_generate_id_draws_differ() {
        // 2^-64 false-positive probability; a repeat here means the
        // entropy source is broken.
        assert_ne!(generate_id(), generate_id());
    }
}
