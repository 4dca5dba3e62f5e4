// src/address.rs - Wallet address validation and miner login parsing
use crate::constants::MAX_FIXED_DIFFICULTY;

/// Check that `addr` is a well-formed bech32 address carrying the
/// expected human-readable prefix
pub fn is_address_valid(addr: &str, prefix: &str) -> bool {
    match bech32::decode(addr) {
        Ok((hrp, data, _variant)) => hrp == prefix && !data.is_empty(),
        Err(err) => {
            log::debug!("address {} is not valid: {}", addr, err);
            false
        }
    }
}

/// A parsed miner login of the form `wallet[+diff]`, with `.` accepted in
/// place of `+` for miners that cannot type a plus sign
#[derive(Debug, Clone, PartialEq)]
pub struct MinerLogin {
    pub wallet: String,
    pub fixed_diff: Option<u64>,
}

/// Split a login string into wallet and optional fixed difficulty.
/// The difficulty is clamped to `[min_difficulty, MAX_FIXED_DIFFICULTY]`;
/// an unparsable suffix is ignored.
pub fn parse_login(raw: &str, min_difficulty: u64) -> MinerLogin {
    let normalized = raw.replace('.', "+");
    let mut parts = normalized.split('+');

    let wallet = parts.next().unwrap_or_default().to_string();

    let fixed_diff = parts.next().and_then(|suffix| {
        match suffix.parse::<u64>() {
            Ok(diff) => Some(diff.clamp(min_difficulty, MAX_FIXED_DIFFICULTY)),
            Err(err) => {
                log::debug!("ignoring fixed difficulty suffix {:?}: {}", suffix, err);
                None
            }
        }
    });

    MinerLogin { wallet, fixed_diff }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_wallet() {
        let login = parse_login("xel1qqqaddress", 1_000);
        assert_eq!(login.wallet, "xel1qqqaddress");
        assert_eq!(login.fixed_diff, None);
    }

    #[test]
    fn test_parse_fixed_difficulty() {
        let login = parse_login("xel1qqqaddress+50000", 1_000);
        assert_eq!(login.fixed_diff, Some(50_000));

        // dot separator is accepted too
        let login = parse_login("xel1qqqaddress.50000", 1_000);
        assert_eq!(login.fixed_diff, Some(50_000));
    }

    #[test]
    fn test_fixed_difficulty_clamping() {
        let login = parse_login("w+5", 1_000);
        assert_eq!(login.fixed_diff, Some(1_000));

        let login = parse_login("w+99999999999", 1_000);
        assert_eq!(login.fixed_diff, Some(MAX_FIXED_DIFFICULTY));

        let login = parse_login("w+notanumber", 1_000);
        assert_eq!(login.fixed_diff, None);
    }

    #[test]
    fn test_address_validation() {
        // bech32 test vector with hrp "bc"
        let addr = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
        assert!(is_address_valid(addr, "bc"));
        assert!(!is_address_valid(addr, "xel"));
        assert!(!is_address_valid("definitely-not-bech32", "xel"));
        assert!(!is_address_valid("", "xel"));
    }
}
