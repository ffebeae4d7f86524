//! Test doubles shared by the dispatcher and drainer tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rumqttc::QoS;

use crate::connection::ConnectionState;
use crate::transport::{PublishError, Transport};

/// In-memory transport with scripted failures.
#[derive(Default)]
pub struct ScriptedTransport {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    fail_at_attempt: Mutex<Option<usize>>,
    disconnect: Mutex<Option<(usize, Arc<ConnectionState>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publish attempts.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Fail only the attempt with this 1-based index.
    pub fn fail_attempt(&self, attempt: usize) {
        *self.fail_at_attempt.lock().unwrap() = Some(attempt);
    }

    /// Flip `state` offline right after the `n`th successful publish.
    pub fn disconnect_after(&self, n: usize, state: Arc<ConnectionState>) {
        *self.disconnect.lock().unwrap() = Some((n, state));
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn published_topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn published_payloads(&self) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| serde_json::from_slice(body).unwrap())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QoS) -> Result<(), PublishError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let scripted_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure || *self.fail_at_attempt.lock().unwrap() == Some(attempt) {
            return Err(PublishError::NotConnected);
        }

        let sent = {
            let mut published = self.published.lock().unwrap();
            published.push((topic.to_string(), payload));
            published.len()
        };

        if let Some((after, state)) = self.disconnect.lock().unwrap().as_ref() {
            if sent == *after {
                state.set_online(false);
            }
        }

        Ok(())
    }
}
