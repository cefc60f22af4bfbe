//! ID generation utilities for crewloop
//!
//! Provides functions for generating unique identifiers for runs, turns and spawns.

use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn generate_id(prefix: &str) -> String {
    let random: u16 = rand::rng().random();
    format!("{}-{}-{:04x}", prefix, now_ms(), random)
}

/// Generate a loop run ID
///
/// Format: `run-{timestamp_ms}-{random_hex}`
pub fn generate_run_id() -> String {
    generate_id("run")
}

/// Generate a turn ID
///
/// Format: `turn-{timestamp_ms}-{random_hex}`
pub fn generate_turn_id() -> String {
    generate_id("turn")
}

/// Generate a spawn ID
///
/// Format: `spawn-{timestamp_ms}-{random_hex}`
pub fn generate_spawn_id() -> String {
    generate_id("spawn")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_returns_reasonable_timestamp() {
        let ts = now_ms();
        assert!(ts > 1577836800000); // 2020-01-01
        assert!(ts < 4102444800000); // 2100-01-01
    }

    #[test]
    fn test_generate_run_id_format() {
        let id = generate_run_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "run");
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 4);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_prefixes() {
        assert!(generate_turn_id().starts_with("turn-"));
        assert!(generate_spawn_id().starts_with("spawn-"));
    }
}
