//! Send-or-buffer decision for freshly captured artifacts.

use std::sync::{Arc, RwLock};

use tracing::{debug, error, info, warn};

use crate::artifact::{Artifact, Topics};
use crate::connection::ConnectionState;
use crate::queue::DurableQueue;
use crate::transport::{publish_artifact, Transport};

/// What happened to a dispatched artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Confirmed by the broker
    Published,

    /// Durably queued for a later drain
    Queued,

    /// Publishing was impossible and the queue write failed
    Lost,
}

/// Statistics about dispatch decisions.
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    /// Artifacts published live
    pub published: u64,

    /// Artifacts written to the durable queue
    pub queued: u64,

    /// Live publish attempts that failed and fell back to the queue
    pub publish_failures: u64,

    /// Artifacts lost to a queue write failure
    pub lost: u64,
}

/// Publishes artifacts when online and queues them otherwise.
///
/// A failed live publish is treated exactly like being offline, so every
/// artifact ends up either confirmed or queued.
pub struct UplinkDispatcher {
    state: Arc<ConnectionState>,
    transport: Arc<dyn Transport>,
    queue: Arc<DurableQueue>,
    topics: Topics,
    stats: RwLock<DispatchStats>,
}

impl UplinkDispatcher {
    pub fn new(
        state: Arc<ConnectionState>,
        transport: Arc<dyn Transport>,
        queue: Arc<DurableQueue>,
        topics: Topics,
    ) -> Self {
        Self {
            state,
            transport,
            queue,
            topics,
            stats: RwLock::new(DispatchStats::default()),
        }
    }

    /// Publish `artifact` now, or queue it for the next drain.
    pub async fn dispatch(&self, artifact: Artifact) -> DispatchOutcome {
        let kind = artifact.kind();
        let captured_at = artifact.captured_at();

        if self.state.is_online() {
            match publish_artifact(self.transport.as_ref(), &self.topics, &artifact).await {
                Ok(()) => {
                    info!(kind = %kind, captured_at = %captured_at, "Artifact published");
                    self.record(|s| s.published += 1);
                    return DispatchOutcome::Published;
                }
                Err(e) => {
                    warn!(
                        kind = %kind,
                        captured_at = %captured_at,
                        error = %e,
                        "Live publish failed, queueing artifact"
                    );
                    self.record(|s| s.publish_failures += 1);
                }
            }
        } else {
            debug!(kind = %kind, captured_at = %captured_at, "Offline, queueing artifact");
        }

        match self.queue.enqueue(&artifact).await {
            Ok(()) => {
                info!(kind = %kind, captured_at = %captured_at, "Artifact queued to resend later");
                self.record(|s| s.queued += 1);
                DispatchOutcome::Queued
            }
            Err(e) => {
                error!(
                    kind = %kind,
                    captured_at = %captured_at,
                    error = %e,
                    "Failed to queue artifact, data lost"
                );
                self.record(|s| s.lost += 1);
                DispatchOutcome::Lost
            }
        }
    }

    /// Get current dispatch statistics.
    pub fn stats(&self) -> DispatchStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, update: impl FnOnce(&mut DispatchStats)) {
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }
}
