// src/difficulty.rs - Difficulty-to-target arithmetic
use primitive_types::U256;

/// Target below which a PoW hash satisfies `difficulty`:
/// floor((2^256 - 1) / difficulty). Difficulty 0 yields target 0, which
/// no hash satisfies.
pub fn target(difficulty: u64) -> U256 {
    if difficulty == 0 {
        return U256::zero();
    }
    U256::MAX / U256::from(difficulty)
}

/// The target as 32 big-endian bytes, comparable byte-lexicographically
/// with a hash
pub fn target_bytes(difficulty: u64) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    target(difficulty).to_big_endian(&mut bytes);
    bytes
}

/// Whether `hash` satisfies `difficulty` (strictly below the target)
pub fn check_diff(hash: &[u8; 32], difficulty: u64) -> bool {
    hash < &target_bytes(difficulty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_monotonicity() {
        assert!(target(1) > target(2));
        assert!(target(1_000) > target(1_001));
        assert!(target(1_000_000) > target(u64::MAX));
    }

    #[test]
    fn test_difficulty_one_accepts_everything_but_max() {
        // target(1) == 2^256 - 1, so only the all-ones hash fails
        assert!(check_diff(&[0u8; 32], 1));
        assert!(check_diff(&[0xfe; 32], 1));
        assert!(!check_diff(&[0xff; 32], 1));
    }

    #[test]
    fn test_difficulty_zero_rejects_everything() {
        assert_eq!(target(0), U256::zero());
        assert!(!check_diff(&[0u8; 32], 0));
    }

    #[test]
    fn test_target_bytes_big_endian() {
        // (2^256 - 1) / 2^8 leaves the top byte zero and the rest 0xff
        let bytes = target_bytes(256);
        assert_eq!(bytes[0], 0);
        assert!(bytes[1..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn test_harder_difficulty_rejects_borderline_hash() {
        let hash = target_bytes(1_000);
        // a hash exactly at target(1000) is not below it
        assert!(!check_diff(&hash, 1_000));
        // but it is below the easier target
        assert!(check_diff(&hash, 999));
    }
}
