//! Periodic and on-demand artifact producers.
//!
//! A [`ScheduledProducer`] captures from one [`Capture`] source on a fixed
//! interval (and whenever the server requests it) and hands the result to
//! the dispatcher. Acquisition itself sits behind the [`Capture`] trait.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::artifact::{Artifact, ArtifactKind, Payload, SensorReading};
use crate::dispatcher::{DispatchOutcome, UplinkDispatcher};

/// Errors that can occur while capturing.
#[derive(Debug)]
pub enum CaptureError {
    /// Reading the captured file failed
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The capture command could not run or exited unsuccessfully
    Command { command: String, message: String },

    /// The capture produced no data
    Empty(PathBuf),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::Io { path, source } => {
                write!(f, "Failed to read capture {}: {}", path.display(), source)
            }
            CaptureError::Command { command, message } => {
                write!(f, "Capture command '{}' failed: {}", command, message)
            }
            CaptureError::Empty(path) => write!(f, "Capture {} is empty", path.display()),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A source of artifact payloads.
#[async_trait]
pub trait Capture: Send + Sync {
    fn kind(&self) -> ArtifactKind;

    async fn capture(&self) -> Result<Payload, CaptureError>;
}

/// Image source backed by a file, optionally refreshed by a shell command
/// (e.g. a camera CLI) before every read.
#[derive(Debug, Clone)]
pub struct FileImageSource {
    path: PathBuf,
    command: Option<String>,
}

impl FileImageSource {
    pub fn new(path: impl Into<PathBuf>, command: Option<String>) -> Self {
        Self {
            path: path.into(),
            command,
        }
    }

    async fn run_command(&self, command: &str) -> Result<(), CaptureError> {
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .status()
            .await
            .map_err(|e| CaptureError::Command {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(CaptureError::Command {
                command: command.to_string(),
                message: status.to_string(),
            })
        }
    }
}

#[async_trait]
impl Capture for FileImageSource {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Image
    }

    async fn capture(&self) -> Result<Payload, CaptureError> {
        if let Some(command) = &self.command {
            self.run_command(command).await?;
        }

        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| CaptureError::Io {
                path: self.path.clone(),
                source: e,
            })?;

        if bytes.is_empty() {
            return Err(CaptureError::Empty(self.path.clone()));
        }

        debug!(path = %self.path.display(), bytes = bytes.len(), "Picture captured");
        Ok(Payload::Image(bytes))
    }
}

/// Simulated temperature/pressure/humidity sensor for running without hardware.
#[derive(Debug, Clone, Default)]
pub struct SimulatedSensor;

impl SimulatedSensor {
    pub fn new() -> Self {
        Self
    }

    /// Generate one reading in normal indoor ranges.
    pub fn read(&self) -> SensorReading {
        let mut rng = rand::thread_rng();
        SensorReading::new()
            .with_field("temp", round2(rng.gen_range(18.0..26.0)))
            .with_field("press", round2(rng.gen_range(1000.0..1025.0)))
            .with_field("humidity", round2(rng.gen_range(30.0..70.0)))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[async_trait]
impl Capture for SimulatedSensor {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::SensorReading
    }

    async fn capture(&self) -> Result<Payload, CaptureError> {
        Ok(Payload::Sensor(self.read()))
    }
}

/// Captures on a fixed interval and on request, then dispatches.
pub struct ScheduledProducer {
    source: Arc<dyn Capture>,
    dispatcher: Arc<UplinkDispatcher>,
    period: Duration,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: mpsc::Receiver<()>,
}

impl ScheduledProducer {
    pub fn new(
        source: Arc<dyn Capture>,
        dispatcher: Arc<UplinkDispatcher>,
        period: Duration,
    ) -> Self {
        // One pending request is enough; further requests coalesce.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self {
            source,
            dispatcher,
            period,
            trigger_tx,
            trigger_rx,
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        self.source.kind()
    }

    /// Handle for requesting an out-of-band capture.
    pub fn trigger(&self) -> mpsc::Sender<()> {
        self.trigger_tx.clone()
    }

    /// Capture once and dispatch. Returns `None` if the capture failed.
    pub async fn produce_once(&self) -> Option<DispatchOutcome> {
        let kind = self.source.kind();
        match self.source.capture().await {
            Ok(payload) => {
                let artifact = Artifact::captured_now(payload);
                Some(self.dispatcher.dispatch(artifact).await)
            }
            Err(e) => {
                error!(kind = %kind, error = %e, "Capture failed, skipping");
                None
            }
        }
    }

    /// Run forever: capture immediately, then every period and on each request.
    pub async fn run(mut self) {
        let kind = self.source.kind();
        info!(kind = %kind, period_secs = self.period.as_secs(), "Producer started");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!(kind = %kind, "Scheduled capture");
                    self.produce_once().await;
                }
                Some(()) = self.trigger_rx.recv() => {
                    debug!(kind = %kind, "Requested capture");
                    self.produce_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Topics;
    use crate::connection::ConnectionState;
    use crate::queue::DurableQueue;
    use crate::testing::ScriptedTransport;
    use tokio::time::timeout;

    async fn offline_dispatcher(dir: &std::path::Path) -> Arc<UplinkDispatcher> {
        let queue = Arc::new(DurableQueue::open(dir).await.unwrap());
        Arc::new(UplinkDispatcher::new(
            Arc::new(ConnectionState::new()),
            Arc::new(ScriptedTransport::new()),
            queue,
            Topics::new("iot3"),
        ))
    }

    #[test]
    fn test_simulated_sensor_fields() {
        let reading = SimulatedSensor::new().read();

        let temp = reading.get("temp").unwrap();
        let press = reading.get("press").unwrap();
        let humidity = reading.get("humidity").unwrap();
        assert!((18.0..=26.0).contains(&temp));
        assert!((1000.0..=1025.0).contains(&press));
        assert!((30.0..=70.0).contains(&humidity));
        assert_eq!(reading.len(), 3);
    }

    #[tokio::test]
    async fn test_file_image_source_reads_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("picture.jpg");
        std::fs::write(&path, b"\xff\xd8jpeg").unwrap();

        let payload = FileImageSource::new(&path, None).capture().await.unwrap();
        assert_eq!(payload, Payload::Image(b"\xff\xd8jpeg".to_vec()));
    }

    #[tokio::test]
    async fn test_file_image_source_runs_command_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.jpg");
        let command = format!("printf snap > '{}'", path.display());

        let payload = FileImageSource::new(&path, Some(command))
            .capture()
            .await
            .unwrap();
        assert_eq!(payload, Payload::Image(b"snap".to_vec()));
    }

    #[tokio::test]
    async fn test_file_image_source_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.jpg");
        let result = FileImageSource::new(&missing, None).capture().await;
        assert!(matches!(result, Err(CaptureError::Io { .. })));

        let empty = dir.path().join("empty.jpg");
        std::fs::write(&empty, b"").unwrap();
        let result = FileImageSource::new(&empty, None).capture().await;
        assert!(matches!(result, Err(CaptureError::Empty(_))));

        let result = FileImageSource::new(&empty, Some("exit 3".to_string()))
            .capture()
            .await;
        assert!(matches!(result, Err(CaptureError::Command { .. })));
    }

    #[tokio::test]
    async fn test_produce_once_dispatches() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = offline_dispatcher(dir.path()).await;
        let producer = ScheduledProducer::new(
            Arc::new(SimulatedSensor::new()),
            dispatcher.clone(),
            Duration::from_secs(60),
        );

        assert_eq!(producer.kind(), ArtifactKind::SensorReading);
        assert_eq!(producer.produce_once().await, Some(DispatchOutcome::Queued));
    }

    #[tokio::test]
    async fn test_failed_capture_dispatches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = offline_dispatcher(dir.path()).await;
        let producer = ScheduledProducer::new(
            Arc::new(FileImageSource::new(dir.path().join("nope.jpg"), None)),
            dispatcher.clone(),
            Duration::from_secs(60),
        );

        assert_eq!(producer.produce_once().await, None);
        assert_eq!(dispatcher.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_run_captures_at_start_and_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = offline_dispatcher(dir.path()).await;
        let producer = ScheduledProducer::new(
            Arc::new(SimulatedSensor::new()),
            dispatcher.clone(),
            Duration::from_secs(3600),
        );
        let trigger = producer.trigger();
        let handle = tokio::spawn(producer.run());

        let wait_for = |count: u64| {
            let dispatcher = dispatcher.clone();
            async move {
                while dispatcher.stats().queued < count {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        };

        timeout(Duration::from_secs(5), wait_for(1))
            .await
            .expect("initial capture");
        trigger.send(()).await.unwrap();
        timeout(Duration::from_secs(5), wait_for(2))
            .await
            .expect("requested capture");

        handle.abort();
    }
}
