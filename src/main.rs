//! Uplink Agent - store-and-forward telemetry uplink for edge devices
//!
//! Periodically captures a picture and a sensor reading, publishes each to
//! the MQTT broker, and queues them on disk while the broker is unreachable.
//! Queued artifacts are resent oldest-first as soon as the connection returns.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables (see `Config`), e.g.:
//!
//! - `UPLINK_BROKER_HOST` / `UPLINK_BROKER_PORT`: MQTT broker
//! - `UPLINK_DEVICE_ID`: device id, topics are prefixed with `iot{id}`
//! - `UPLINK_IMAGE_INTERVAL_SECS` / `UPLINK_SENSOR_INTERVAL_SECS`: capture periods
//! - `UPLINK_QUEUE_DIR`: durable queue directory
//! - `UPLINK_MAX_PACKET_BYTES`: MQTT packet size limit, must fit the largest image
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use uplink_agent::artifact::{ArtifactKind, Topics};
use uplink_agent::config::Config;
use uplink_agent::connection::ConnectionState;
use uplink_agent::dispatcher::UplinkDispatcher;
use uplink_agent::drainer::BacklogDrainer;
use uplink_agent::producer::{FileImageSource, ScheduledProducer, SimulatedSensor};
use uplink_agent::queue::DurableQueue;
use uplink_agent::transport::{MqttTransport, Transport};

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting uplink agent...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                broker = %format!("{}:{}", config.broker_host, config.broker_port),
                device = %config.device_name(),
                image_interval_secs = config.image_interval.as_secs(),
                sensor_interval_secs = config.sensor_interval.as_secs(),
                queue_dir = %config.queue_dir.display(),
                max_packet_bytes = config.max_packet_size,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let queue = match DurableQueue::open(&config.queue_dir).await {
        Ok(queue) => Arc::new(queue),
        Err(e) => {
            error!(error = %e, "Failed to open durable queue");
            std::process::exit(1);
        }
    };

    for kind in ArtifactKind::all() {
        match queue.len(*kind).await {
            Ok(0) => info!(kind = %kind, "No queued artifacts"),
            Ok(n) => info!(kind = %kind, queued = n, "Artifacts waiting to be resent"),
            Err(e) => warn!(kind = %kind, error = %e, "Could not inspect queue"),
        }
    }

    let state = Arc::new(ConnectionState::new());
    let topics = Topics::new(config.device_name());

    let (transport, mut session) = MqttTransport::new(&config, state.clone());
    let transport: Arc<dyn Transport> = Arc::new(transport);

    let drainer = Arc::new(BacklogDrainer::new(
        state.clone(),
        transport.clone(),
        queue.clone(),
        topics.clone(),
    ));
    if let Err(e) = BacklogDrainer::attach(&drainer) {
        error!(error = %e, "Failed to register backlog drainer");
        std::process::exit(1);
    }

    let dispatcher = Arc::new(UplinkDispatcher::new(
        state.clone(),
        transport.clone(),
        queue.clone(),
        topics,
    ));

    let image_producer = ScheduledProducer::new(
        Arc::new(FileImageSource::new(
            config.image_path.clone(),
            config.capture_command.clone(),
        )),
        dispatcher.clone(),
        config.image_interval,
    );
    let sensor_producer = ScheduledProducer::new(
        Arc::new(SimulatedSensor::new()),
        dispatcher.clone(),
        config.sensor_interval,
    );
    session.on_request(image_producer.kind(), image_producer.trigger());
    session.on_request(sensor_producer.kind(), sensor_producer.trigger());

    let session_handle = tokio::spawn(session.run());
    let image_handle = tokio::spawn(image_producer.run());
    let sensor_handle = tokio::spawn(sensor_producer.run());

    info!("Uplink agent running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    // Anything not yet confirmed is either still queued on disk or will be
    // captured again; no in-memory state needs flushing.
    image_handle.abort();
    sensor_handle.abort();
    session_handle.abort();

    let stats = dispatcher.stats();
    info!(
        published = stats.published,
        queued = stats.queued,
        publish_failures = stats.publish_failures,
        lost = stats.lost,
        "Uplink agent stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
