use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;

use lib_flights::auth::IntrospectionAuthorizer;
use lib_flights::{SessionCoordinator, SourceConnector};

/// Everything a connection handler needs, shared across all connections.
pub struct AppState<C: SourceConnector> {
    pub authorizer: Arc<IntrospectionAuthorizer>,
    pub coordinator: SessionCoordinator<C>,
    // Broadcasts server shutdown to every live session
    shutdown_tx: broadcast::Sender<()>,
    // Health status, flipped once on shutdown
    serving: Arc<AtomicBool>,
    // Every running session, awaited on shutdown
    pub sessions: TaskTracker,
}

impl<C: SourceConnector> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            authorizer: Arc::clone(&self.authorizer),
            coordinator: self.coordinator.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            serving: Arc::clone(&self.serving),
            sessions: self.sessions.clone(),
        }
    }
}

impl<C: SourceConnector> AppState<C> {
    pub fn new(
        authorizer: Arc<IntrospectionAuthorizer>,
        coordinator: SessionCoordinator<C>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            authorizer,
            coordinator,
            shutdown_tx,
            serving: Arc::new(AtomicBool::new(true)),
            sessions: TaskTracker::new(),
        }
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Flips health to NOT_SERVING and tells every session to stop.
    ///
    /// Returns the number of sessions that were listening.
    pub fn shutdown(&self) -> usize {
        self.serving.store(false, Ordering::SeqCst);
        self.sessions.close();
        self.shutdown_tx.send(()).unwrap_or(0)
    }

    /// A shutdown receiver for a new session.
    ///
    /// `None` once shutdown has started; the caller must refuse the session.
    /// Subscribing before checking the flag means a session either sees the
    /// broadcast or is refused, never neither.
    pub fn subscribe_shutdown(&self) -> Option<broadcast::Receiver<()>> {
        let rx = self.shutdown_tx.subscribe();
        self.is_serving().then_some(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_flights::{DedupCache, SessionSettings};
    use lib_flights::source::MemoryConnector;

    fn state() -> AppState<MemoryConnector> {
        let authorizer = IntrospectionAuthorizer::new("http://127.0.0.1:9/introspect", 0).unwrap();
        let coordinator = SessionCoordinator::new(
            Arc::new(MemoryConnector::default()),
            Arc::new(DedupCache::new()),
            SessionSettings::default(),
        );
        let (shutdown_tx, _) = broadcast::channel(1);
        AppState::new(Arc::new(authorizer), coordinator, shutdown_tx)
    }

    #[tokio::test]
    async fn test_shutdown_reaches_subscribers_and_refuses_new_ones() {
        let state = state();
        assert!(state.is_serving());

        let mut rx = state.subscribe_shutdown().unwrap();
        assert_eq!(state.shutdown(), 1);
        assert!(rx.recv().await.is_ok());

        assert!(!state.is_serving());
        assert!(state.subscribe_shutdown().is_none());
        assert!(state.sessions.is_closed());
    }
}
