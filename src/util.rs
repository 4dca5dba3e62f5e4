// src/util.rs - Small shared helpers
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in whole seconds
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current unix time in milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current unix time as fractional seconds
pub fn now_precise() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Random connection/session identifier
pub fn random_u64() -> u64 {
    rand::thread_rng().next_u64()
}

/// Random float in [0, 1)
pub fn random_float() -> f64 {
    rand::random::<f64>()
}

/// Strip the port from a `host:port` peer string
pub fn strip_port(addr: &str) -> &str {
    addr.split(':').next().unwrap_or(addr)
}

/// Display helper: atomic units to whole coins
pub fn to_coins(amount: u64, atomic_units: u32) -> f64 {
    amount as f64 / 10f64.powi(atomic_units as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("1.2.3.4:5678"), "1.2.3.4");
        assert_eq!(strip_port("1.2.3.4"), "1.2.3.4");
    }

    #[test]
    fn test_to_coins() {
        assert_eq!(to_coins(150_000_000, 8), 1.5);
        assert_eq!(to_coins(0, 8), 0.0);
    }

    #[test]
    fn test_random_float_range() {
        for _ in 0..100 {
            let f = random_float();
            assert!((0.0..1.0).contains(&f));
        }
    }
}
