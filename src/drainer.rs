//! Resend of queued artifacts after the connection comes back.
//!
//! Each kind is drained oldest-first. A record is removed only after its
//! publish was confirmed. The pass for a kind stops at the first failed
//! publish or as soon as the connection is seen offline, leaving the failed
//! record and everything newer in place for the next transition.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::artifact::{ArtifactKind, Topics};
use crate::connection::{ConnectionError, ConnectionState};
use crate::queue::DurableQueue;
use crate::transport::{publish_artifact, Transport};

/// How a drain pass for one kind ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every record present at the start of the pass was handled
    Completed,

    /// Connection went offline mid-pass
    Disconnected,

    /// A publish failed; the pass stopped to keep ordering
    PublishFailed,

    /// The queue could not be read or updated
    StorageFailed,
}

/// Result of draining one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub kind: ArtifactKind,

    /// Records queued when the pass started
    pub pending: usize,

    /// Records published and removed during the pass
    pub delivered: usize,

    pub outcome: DrainOutcome,
}

/// Walks the durable queue and resends its backlog.
pub struct BacklogDrainer {
    state: Arc<ConnectionState>,
    transport: Arc<dyn Transport>,
    queue: Arc<DurableQueue>,
    topics: Topics,
    // One pass at a time so rapid reconnects never publish a record twice.
    pass: Mutex<()>,
}

impl BacklogDrainer {
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
            pass: Mutex::new(()),
        }
    }

    /// Register this drainer as the connection's online callback.
    pub fn attach(drainer: &Arc<Self>) -> Result<(), ConnectionError> {
        let weak = Arc::downgrade(drainer);
        drainer.state.on_transition_to_online(move || {
            let weak = weak.clone();
            async move {
                if let Some(drainer) = weak.upgrade() {
                    drainer.drain().await;
                }
            }
        })
    }

    /// Run one drain pass over every kind. Kinds are drained concurrently and
    /// independently of each other.
    pub async fn drain(&self) -> Vec<DrainReport> {
        let _pass = self.pass.lock().await;

        let (images, readings) = tokio::join!(
            self.drain_kind(ArtifactKind::Image),
            self.drain_kind(ArtifactKind::SensorReading),
        );

        vec![images, readings]
    }

    /// Drain the backlog of a single kind.
    pub async fn drain_kind(&self, kind: ArtifactKind) -> DrainReport {
        let keys = match self.queue.keys(kind).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(kind = %kind, error = %e, "Failed to list queued artifacts");
                return DrainReport {
                    kind,
                    pending: 0,
                    delivered: 0,
                    outcome: DrainOutcome::StorageFailed,
                };
            }
        };

        let pending = keys.len();
        if pending == 0 {
            debug!(kind = %kind, "Queue empty, nothing to resend");
            return DrainReport {
                kind,
                pending,
                delivered: 0,
                outcome: DrainOutcome::Completed,
            };
        }

        info!(kind = %kind, pending = pending, "Resending queued artifacts");

        let mut delivered = 0;
        let mut outcome = DrainOutcome::Completed;

        for key in keys {
            if !self.state.is_online() {
                info!(
                    kind = %kind,
                    remaining = pending - delivered,
                    "Connection lost, stopping resend"
                );
                outcome = DrainOutcome::Disconnected;
                break;
            }

            let artifact = match self.queue.read(key).await {
                Ok(Some(artifact)) => artifact,
                Ok(None) => continue,
                Err(e) => {
                    error!(kind = %kind, captured_at = %key.captured_at, error = %e, "Failed to read queued artifact");
                    outcome = DrainOutcome::StorageFailed;
                    break;
                }
            };

            if let Err(e) =
                publish_artifact(self.transport.as_ref(), &self.topics, &artifact).await
            {
                warn!(
                    kind = %kind,
                    captured_at = %key.captured_at,
                    error = %e,
                    "Resend failed, keeping remaining artifacts queued"
                );
                outcome = DrainOutcome::PublishFailed;
                break;
            }

            // A same-minute capture queued since the read is removed too, unsent.
            if let Err(e) = self.queue.remove(kind, key.captured_at).await {
                // Delivered but still on disk: it will be sent again next pass.
                error!(kind = %kind, captured_at = %key.captured_at, error = %e, "Failed to remove resent artifact");
                delivered += 1;
                outcome = DrainOutcome::StorageFailed;
                break;
            }

            debug!(kind = %kind, captured_at = %key.captured_at, "Queued artifact resent");
            delivered += 1;
        }

        info!(
            kind = %kind,
            delivered = delivered,
            pending = pending,
            outcome = ?outcome,
            "Resend pass finished"
        );

        DrainReport {
            kind,
            pending,
            delivered,
            outcome,
        }
    }
}
