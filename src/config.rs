//! Service configuration from environment variables.

use std::env;

/// Configuration loaded from environment variables.
///
/// `SKYPORTAL_URL` and `SKYPORTAL_API_KEY` are required; everything else has
/// a default tuned for the production cadence.
///
/// Environment variables:
/// - `SKYPORTAL_URL` (required)
/// - `SKYPORTAL_API_KEY` (required)
/// - `GROUP_IDS_TO_LISTEN` (comma-separated, default: none)
/// - `GCN_LOOKBACK_HOURS` (default: 48)
/// - `ALERT_LOOKBACK_HOURS` (default: 3)
/// - `FIRST_DETECTION_LOOKBACK_HOURS` (default: 48)
/// - `POLL_INTERVAL_SECS` (default: 20)
/// - `SNR_THRESHOLD` (default: 5.0)
/// - `CUMULATIVE_PROBABILITY` (default: 0.95)
/// - `PHOTOMETRY_FETCH_DELAY_MS` (default: 300)
/// - `SLACK_BOT_TOKEN`, `SLACK_CHANNEL_NAME` (default: chat sink disabled)
/// - `CIRCULAR_ENDPOINT_URL` (default: circular sink disabled)
#[derive(Debug, Clone)]
pub struct Config {
    pub skyportal_url: String,
    pub api_token: String,

    /// Optional tenant/group filter forwarded to the object query.
    pub group_ids: Vec<String>,

    /// TTL for cached skymaps and lookback for the event query, in hours.
    pub gcn_lookback_hours: u64,

    /// Floor of the object refresh window, in hours.
    pub alert_lookback_hours: u64,

    /// How far back a qualifying first detection may lie, in hours.
    pub first_detection_lookback_hours: u64,

    /// Cycle cadence (and post-error delay), in seconds.
    pub poll_interval_secs: u64,

    /// SNR a photometry point must reach to qualify as a detection.
    pub snr_threshold: f64,

    /// Credible-region threshold used when building coverage regions.
    pub cumulative_probability: f64,

    /// Pause between successive per-object photometry fetches, in ms.
    pub photometry_fetch_delay_ms: u64,

    pub slack_bot_token: Option<String>,
    pub slack_channel_name: Option<String>,
    pub circular_endpoint_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let skyportal_url = env::var("SKYPORTAL_URL")
            .expect("SKYPORTAL_URL must be set in .env file");
        let api_token = env::var("SKYPORTAL_API_KEY")
            .expect("SKYPORTAL_API_KEY must be set in .env file");

        let group_ids = env::var("GROUP_IDS_TO_LISTEN")
            .map(|s| {
                s.split(',')
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            skyportal_url,
            api_token,
            group_ids,

            gcn_lookback_hours: env_or("GCN_LOOKBACK_HOURS", 48),
            alert_lookback_hours: env_or("ALERT_LOOKBACK_HOURS", 3),
            first_detection_lookback_hours: env_or("FIRST_DETECTION_LOOKBACK_HOURS", 48),
            poll_interval_secs: env_or("POLL_INTERVAL_SECS", 20),
            snr_threshold: env_or("SNR_THRESHOLD", 5.0),
            cumulative_probability: env_or("CUMULATIVE_PROBABILITY", 0.95),
            photometry_fetch_delay_ms: env_or("PHOTOMETRY_FETCH_DELAY_MS", 300),

            slack_bot_token: env::var("SLACK_BOT_TOKEN").ok(),
            slack_channel_name: env::var("SLACK_CHANNEL_NAME").ok(),
            circular_endpoint_url: env::var("CIRCULAR_ENDPOINT_URL").ok(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_parses_and_defaults() {
        // Test: present + parseable wins, missing or garbage falls back
        env::set_var("SKYMATCH_TEST_SNR", "7.5");
        assert_eq!(env_or("SKYMATCH_TEST_SNR", 5.0), 7.5);
        env::set_var("SKYMATCH_TEST_SNR", "not-a-number");
        assert_eq!(env_or("SKYMATCH_TEST_SNR", 5.0), 5.0);
        env::remove_var("SKYMATCH_TEST_SNR");
        assert_eq!(env_or("SKYMATCH_TEST_SNR", 20u64), 20);
    }
}
