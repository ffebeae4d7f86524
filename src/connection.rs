//! Shared connection state and the reconnect backoff policy.
//!
//! [`ConnectionState`] is a two-valued online/offline flag written by the
//! transport's event loop and read by the dispatcher and drainer. The single
//! registered online callback runs on its own tokio task for every
//! offline-to-online transition.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Maximum jitter added to a backoff delay, as a fraction of the delay (1/4).
const JITTER_DIVISOR: u64 = 4;

type OnlineFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type OnlineCallback = Box<dyn Fn() -> OnlineFuture + Send + Sync>;

/// Errors from connection state management.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionError {
    /// An online callback is already registered
    CallbackAlreadyRegistered,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::CallbackAlreadyRegistered => {
                write!(f, "An online transition callback is already registered")
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Process-wide online/offline flag.
pub struct ConnectionState {
    online: AtomicBool,
    on_online: OnceLock<OnlineCallback>,
}

impl ConnectionState {
    /// Create a state that starts offline.
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(false),
            on_online: OnceLock::new(),
        }
    }

    /// Latest known value. May be stale by the time the caller acts on it.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Record a connect or disconnect event.
    ///
    /// On an offline-to-online transition the registered callback is spawned
    /// and its handle returned. Repeating the current value is a no-op.
    pub fn set_online(&self, online: bool) -> Option<JoinHandle<()>> {
        let previous = self.online.swap(online, Ordering::AcqRel);
        if previous == online {
            return None;
        }

        if !online {
            warn!("Connection state changed: offline");
            return None;
        }

        info!("Connection state changed: online");
        let callback = match self.on_online.get() {
            Some(callback) => callback,
            None => {
                debug!("No online callback registered");
                return None;
            }
        };

        match Handle::try_current() {
            Ok(handle) => Some(handle.spawn(callback())),
            Err(e) => {
                error!(error = %e, "No async runtime available for online callback");
                None
            }
        }
    }

    /// Register the callback run on every offline-to-online transition.
    /// Only one callback may be registered.
    pub fn on_transition_to_online<F, Fut>(&self, callback: F) -> Result<(), ConnectionError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: OnlineCallback = Box::new(move || Box::pin(callback()));
        self.on_online
            .set(boxed)
            .map_err(|_| ConnectionError::CallbackAlreadyRegistered)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("online", &self.is_online())
            .field("callback_registered", &self.on_online.get().is_some())
            .finish()
    }
}

/// Capped exponential backoff with jitter for reconnect attempts.
///
/// The attempt counter only resets once a connection has stayed up for
/// `stable_after`, so a flapping link keeps backing off.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    stable_after: Duration,
    attempt: u32,
    connected_since: Option<Instant>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, stable_after: Duration) -> Self {
        Self {
            base,
            max,
            stable_after,
            attempt: 0,
            connected_since: None,
        }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = delay_for_attempt(self.base, self.max, self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn on_connected(&mut self) {
        self.connected_since = Some(Instant::now());
    }

    pub fn on_disconnected(&mut self) {
        if let Some(since) = self.connected_since.take() {
            if since.elapsed() >= self.stable_after {
                self.attempt = 0;
            }
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// delay = min(base * 2^attempt + jitter, max), jitter up to 25% of the delay.
fn delay_for_attempt(base: Duration, max: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;

    let exponential = base_ms.saturating_mul(1 << attempt.min(16));
    let jitter = rand::random::<u64>() % (exponential / JITTER_DIVISOR + 1);

    Duration::from_millis(exponential.saturating_add(jitter).min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_starts_offline() {
        let state = ConnectionState::new();
        assert!(!state.is_online());
    }

    #[tokio::test]
    async fn test_callback_fires_once_per_transition() {
        let state = ConnectionState::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        state
            .on_transition_to_online(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        state.set_online(true).expect("transition spawns").await.unwrap();
        assert!(state.set_online(true).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(state.set_online(false).is_none());
        assert!(!state.is_online());

        state.set_online(true).expect("transition spawns").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_registration_rejected() {
        let state = ConnectionState::new();
        state.on_transition_to_online(|| async {}).unwrap();

        let result = state.on_transition_to_online(|| async {});
        assert_eq!(result, Err(ConnectionError::CallbackAlreadyRegistered));
    }

    #[tokio::test]
    async fn test_transition_without_callback() {
        let state = ConnectionState::new();
        assert!(state.set_online(true).is_none());
        assert!(state.is_online());
    }

    #[tokio::test]
    async fn test_callback_does_not_block_event_source() {
        let state = ConnectionState::new();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = std::sync::Mutex::new(Some(release_rx));
        state
            .on_transition_to_online(move || {
                let rx = release_rx.lock().unwrap().take();
                async move {
                    if let Some(rx) = rx {
                        let _ = rx.await;
                    }
                }
            })
            .unwrap();

        let handle = state.set_online(true).unwrap();
        // set_online returned while the callback is still parked
        assert!(!handle.is_finished());
        state.set_online(false);

        release_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(32),
            Duration::from_secs(20),
        );

        let first = backoff.next_delay();
        let second = backoff.next_delay();
        let third = backoff.next_delay();
        assert!(first >= Duration::from_millis(1000) && first <= Duration::from_millis(1250));
        assert!(second >= Duration::from_millis(2000) && second <= Duration::from_millis(2500));
        assert!(third >= Duration::from_millis(4000) && third <= Duration::from_millis(5000));

        for _ in 0..30 {
            assert!(backoff.next_delay() <= Duration::from_secs(32));
        }
    }

    #[test]
    fn test_backoff_resets_after_stable_connection() {
        let mut backoff = Backoff::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
            Duration::ZERO,
        );
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.on_connected();
        backoff.on_disconnected();
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn test_backoff_keeps_growing_when_flapping() {
        let mut backoff = Backoff::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
            Duration::from_secs(3600),
        );
        backoff.next_delay();
        backoff.on_connected();
        backoff.on_disconnected();
        assert_eq!(backoff.attempt(), 1);
    }
}
