//! rollgate-core — shared vocabulary for the Rollgate crates.
//!
//! Holds the strategy parameters and health thresholds that travel from the
//! config file and the API into persisted deployments, plus the
//! `rollgate.toml` parser and the duration-string helper used throughout.

pub mod config;
pub mod types;

pub use config::{ConfigError, RollgateConfig};
pub use types::*;

use std::time::Duration;

/// Parse a duration string like "15s", "500ms", "2m", or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
