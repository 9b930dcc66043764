pub mod config;
pub mod crossmatch;
pub mod error;
pub mod fits;
pub mod notify;
pub mod region;
pub mod skyportal;

use std::sync::Arc;

use config::Config;
use crossmatch::engine::{CorrelationLoop, LoopSettings, SystemClock};
use notify::{CircularSink, NotificationSink, SlackSink};
use region::SkymapRegionBuilder;
use skyportal::SkyPortalClient;

#[tokio::main]
pub async fn main() {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env();
    log::info!("🚀 Starting skymatch...");
    log::info!("📊 Configuration:");
    log::info!("   SKYPORTAL_URL: {}", config.skyportal_url);
    log::info!("   poll interval: {}s", config.poll_interval_secs);
    log::info!("   SNR threshold: {}", config.snr_threshold);
    log::info!("   cumulative probability: {}", config.cumulative_probability);
    let groups_str = if config.group_ids.is_empty() {
        "None (listening to all groups)".to_string()
    } else {
        format!("{:?}", config.group_ids)
    };
    log::info!("   groups: {}", groups_str);

    if let Err(e) = run(config).await {
        log::error!("❌ skymatch stopped: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), error::CrossmatchError> {
    let source = Arc::new(SkyPortalClient::new(&config.skyportal_url, &config.api_token)?);

    let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();
    if let (Some(token), Some(channel)) = (&config.slack_bot_token, &config.slack_channel_name) {
        sinks.push(Arc::new(SlackSink::new(token, channel, &config.skyportal_url)?));
        log::info!("💬 Slack sink enabled (#{channel})");
    }
    if let Some(endpoint) = &config.circular_endpoint_url {
        sinks.push(Arc::new(CircularSink::new(endpoint)?));
        log::info!("📨 circular-notice sink enabled");
    }
    if sinks.is_empty() {
        log::warn!("no notification sinks configured, crossmatches will only be logged");
    }

    let settings = LoopSettings {
        gcn_ttl: chrono::Duration::hours(config.gcn_lookback_hours as i64),
        alert_window: chrono::Duration::hours(config.alert_lookback_hours as i64),
        first_detection_lookback: chrono::Duration::hours(
            config.first_detection_lookback_hours as i64,
        ),
        poll_interval: std::time::Duration::from_secs(config.poll_interval_secs),
        snr_threshold: config.snr_threshold,
        cumulative_probability: config.cumulative_probability,
        group_ids: config.group_ids.clone(),
        photometry_fetch_delay: std::time::Duration::from_millis(
            config.photometry_fetch_delay_ms,
        ),
    };

    let mut service = CorrelationLoop::startup(
        source,
        Arc::new(SkymapRegionBuilder),
        sinks,
        Arc::new(SystemClock),
        settings,
    )
    .await?;

    service.run().await
}
