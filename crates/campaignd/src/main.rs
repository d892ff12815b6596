//! campaignd - Roadcast campaign management daemon
//!
//! Owns campaign lifecycle (decoder manifest + collection schemes), keeps
//! the store-and-forward streams in sync, and runs the rate-limited
//! forwarder that drains spooled records to the uplink.

use campaignd::config::Config;
use campaignd::manager::CampaignManager;
use clap::Parser;
use roadcast_core::time::SystemClock;
use roadcast_decode::translator::CanInterfaceIdTranslator;
use roadcast_store::forwarder::StreamForwarder;
use roadcast_store::persist::CacheAndPersist;
use roadcast_store::ratelimit::RateLimiter;
use roadcast_store::stream::StreamManager;
use roadcast_uplink::sender::NoopSender;
use roadcast_uplink::telemetry::{PayloadAdaptionConfig, TelemetryDataSender};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("campaignd=info".parse().unwrap()))
        .init();

    // Parse configuration
    let config = Config::parse();
    if let Err(err) = config.validate() {
        error!("Invalid configuration: {err}");
        return ExitCode::FAILURE;
    }

    info!(
        "campaignd v{} - Roadcast Campaign Daemon",
        env!("CARGO_PKG_VERSION")
    );

    let clock = Arc::new(SystemClock::new());

    let persistence = match CacheAndPersist::new(&config.data_dir, config.max_persistence_size) {
        Ok(persistence) => persistence,
        Err(err) => {
            error!("Failed to initialize persistence root: {err}");
            return ExitCode::FAILURE;
        }
    };

    let stream_manager = Arc::new(StreamManager::new(
        config.data_dir.join("streams"),
        clock.clone(),
    ));

    let mut translator = CanInterfaceIdTranslator::new();
    for interface in &config.can_interfaces {
        translator.add(interface.clone());
    }

    // Dry-run transport until an MQTT sender is wired in by the host
    // integration.
    let sender = Arc::new(NoopSender::new(config.max_send_size));
    let adaption = PayloadAdaptionConfig::new(
        config.transmit_threshold_start_percent,
        config.payload_size_limit_min_percent,
        config.payload_size_limit_max_percent,
        config.transmit_threshold_adapt_percent,
    );
    let data_sender = Arc::new(TelemetryDataSender::new(
        sender,
        config.telemetry_topic.clone(),
        adaption,
        adaption,
    ));

    let rate_limiter = RateLimiter::new(clock.clone(), config.max_upload_rate, config.max_upload_rate);
    let forwarder = Arc::new(StreamForwarder::new(
        stream_manager.clone(),
        data_sender,
        rate_limiter,
        config.idle_time_ms,
        clock.clone(),
    ));
    if !forwarder.start() {
        error!("Failed to start stream forwarder");
        return ExitCode::FAILURE;
    }

    let manager = Arc::new(CampaignManager::new(
        clock,
        persistence,
        stream_manager,
        translator,
    ));
    manager.subscribe_dictionary(Box::new(|dictionaries| {
        let active = dictionaries.values().filter(|d| d.is_some()).count();
        info!(active_protocols = active, "Decoder dictionaries published");
    }));
    manager.subscribe_inspection_matrix(Box::new(|matrix| {
        info!(
            conditions = matrix.conditions.len(),
            nodes = matrix.expression_node_storage.len(),
            "Inspection matrix published"
        );
    }));
    manager.subscribe_fetch_matrix(Box::new(|matrix| {
        info!(
            requests = matrix.fetch_requests.len(),
            "Fetch matrix published"
        );
    }));
    manager.restore_persisted();

    // Scheme activation/expiry loop.
    let tick_manager = Arc::clone(&manager);
    let tick_interval = config.tick_interval_ms;
    let tick_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(tick_interval.max(1)));
        loop {
            interval.tick().await;
            let manager = Arc::clone(&tick_manager);
            let _ = tokio::task::spawn_blocking(move || manager.tick()).await;
        }
    });

    info!("campaignd running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");

    tick_task.abort();
    forwarder.stop();

    ExitCode::SUCCESS
}
