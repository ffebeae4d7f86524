//! Uplink Agent Library
//!
//! Store-and-forward delivery of edge telemetry (still images and sensor
//! readings) over MQTT:
//!
//! - **artifact**: Telemetry artifacts, minute-truncated capture keys, wire encoding
//! - **queue**: Filesystem-backed durable queue of undelivered artifacts
//! - **connection**: Shared online/offline state and reconnect backoff
//! - **dispatcher**: Publish-now-or-queue decision for new artifacts
//! - **drainer**: Ordered resend of the backlog after reconnecting
//! - **transport**: MQTT client with confirmed publishes and the reconnect loop
//! - **producer**: Periodic and on-demand capture
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use uplink_agent::artifact::{Artifact, Payload, Topics};
//! use uplink_agent::config::Config;
//! use uplink_agent::connection::ConnectionState;
//! use uplink_agent::dispatcher::UplinkDispatcher;
//! use uplink_agent::drainer::BacklogDrainer;
//! use uplink_agent::queue::DurableQueue;
//! use uplink_agent::transport::{MqttTransport, Transport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let state = Arc::new(ConnectionState::new());
//!     let queue = Arc::new(DurableQueue::open(&config.queue_dir).await.expect("queue"));
//!
//!     let (transport, session) = MqttTransport::new(&config, state.clone());
//!     let transport: Arc<dyn Transport> = Arc::new(transport);
//!     let topics = Topics::new(config.device_name());
//!
//!     let drainer = Arc::new(BacklogDrainer::new(
//!         state.clone(), transport.clone(), queue.clone(), topics.clone(),
//!     ));
//!     BacklogDrainer::attach(&drainer).expect("single callback");
//!     tokio::spawn(session.run());
//!
//!     let dispatcher = UplinkDispatcher::new(state, transport, queue, topics);
//!     let artifact = Artifact::captured_now(Payload::Image(b"...".to_vec()));
//!     dispatcher.dispatch(artifact).await;
//! }
//! ```

// Module declarations
pub mod artifact;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod drainer;
pub mod producer;
pub mod queue;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root for convenience
pub use artifact::{Artifact, ArtifactKind, Payload, SensorReading, Topics};
pub use config::{Config, ConfigError};
pub use connection::{Backoff, ConnectionError, ConnectionState};
pub use dispatcher::{DispatchOutcome, DispatchStats, UplinkDispatcher};
pub use drainer::{BacklogDrainer, DrainOutcome, DrainReport};
pub use producer::{Capture, CaptureError, FileImageSource, ScheduledProducer, SimulatedSensor};
pub use queue::{DurableQueue, QueueError, QueueKey};
pub use transport::{MqttSession, MqttTransport, PublishError, Transport};
