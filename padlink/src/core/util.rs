use ahash::RandomState;
use std::collections::{HashMap as StdHashMap, HashSet as StdHashSet};
use std::time::Duration;

pub type HashMap<K, V> = StdHashMap<K, V, RandomState>;
pub type HashSet<K> = StdHashSet<K, RandomState>;

/// `ternary!(cond, true_case, false_case)`
#[macro_export]
macro_rules! ternary {
    ($condition: expr, $_true: expr, $_false: expr) => {
        if $condition { $_true } else { $_false }
    };
}

pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Space separated, upper case, two digits per byte: `05 01 FF`
pub fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Inverse of [`hex_string`]. Accepts any whitespace or comma separation and
/// an optional `0x` prefix per byte.
pub fn parse_hex_bytes(text: &str) -> Result<Vec<u8>, String> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .map(|token| {
            let digits =
                token.trim_start_matches("0x").trim_start_matches("0X");
            u8::from_str_radix(digits, 16)
                .map_err(|err| format!("invalid hex byte '{}': {}", token, err))
        })
        .collect()
}
