//! # Session Coordinator
//!
//! Runs one client session from authorization to close.
//!
//! Three activities run concurrently per session:
//! -   **receive**: reads search parameters from the client and forwards them
//!     to the scheduler.
//! -   **scheduler**: the [`LiveQueryScheduler`] polling the flight source.
//! -   **send**: pushes result batches to the client and watches for server
//!     shutdown.
//!
//! The first of them to hit a terminal condition decides the session's
//! [`SessionOutcome`]. The owner then cancels the rest, waits for all of them,
//! releases the flight source exactly once and only then closes the outbound
//! side with that outcome.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::params::{ClientIdentity, SearchParameters};
use super::scheduler::{LiveQueryScheduler, SchedulerSettings};
use super::termination::{SessionOutcome, TerminationSignal};
use crate::dedup::DedupCache;
use crate::source::{FlightRecord, FlightSource, SourceConnector};

/// Failure reading from the client side of a session.
#[derive(Debug, Error)]
pub enum InboundError {
    /// The client closed the stream; terminal.
    #[error("client closed the stream")]
    Closed,
    /// A read failed but the stream may still be usable.
    #[error("transient receive error: {0}")]
    Transient(String),
}

/// Failure writing to the client side of a session.
#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("client disconnected: {0}")]
    Disconnected(String),
}

/// The inbound half of a session transport.
pub trait ParameterInbound: Send + 'static {
    /// Waits for the next parameters message.
    ///
    /// `Ok(None)` means a message arrived that carries no parameters (a ping,
    /// an unknown frame); the caller keeps reading.
    fn next_parameters(
        &mut self,
    ) -> impl Future<Output = Result<Option<SearchParameters>, InboundError>> + Send;
}

/// The outbound half of a session transport.
pub trait FlightOutbound: Send + 'static {
    fn send_flight(&mut self, flight: &FlightRecord) -> impl Future<Output = Result<(), OutboundError>> + Send;

    /// Ends the stream, reporting `outcome` to the client.
    fn close(self, outcome: &SessionOutcome) -> impl Future<Output = ()> + Send;
}

/// Per-session tuning.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub scheduler: SchedulerSettings,
    /// Parameter updates buffered between the receive activity and the scheduler.
    pub config_buffer: usize,
    /// Consecutive transient receive errors tolerated before the session is
    /// ended with an internal error. Zero retries forever.
    pub max_consecutive_recv_errors: u32,
    pub recv_backoff_base: Duration,
    pub recv_backoff_max: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings::default(),
            config_buffer: 8,
            max_consecutive_recv_errors: 10,
            recv_backoff_base: Duration::from_millis(100),
            recv_backoff_max: Duration::from_secs(5),
        }
    }
}

impl SessionSettings {
    /// Delay after the `attempt`-th consecutive receive error (1-based).
    pub fn recv_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.recv_backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.recv_backoff_max)
    }
}

/// # Session Coordinator
///
/// Shared by every session of the process. Holds the source connector and the
/// process-wide dedup cache.
pub struct SessionCoordinator<C: SourceConnector> {
    connector: Arc<C>,
    dedup: Arc<DedupCache>,
    settings: SessionSettings,
}

impl<C: SourceConnector> Clone for SessionCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            dedup: Arc::clone(&self.dedup),
            settings: self.settings.clone(),
        }
    }
}

impl<C: SourceConnector> SessionCoordinator<C> {
    pub fn new(connector: Arc<C>, dedup: Arc<DedupCache>, settings: SessionSettings) -> Self {
        Self {
            connector,
            dedup,
            settings,
        }
    }

    /// Runs an authorized session to completion.
    ///
    /// # Arguments
    /// * `identity` - The authorized client; also the dedup key.
    /// * `inbound` / `outbound` - The two halves of the client stream.
    /// * `shutdown` - Fires (or closes) when the server stops.
    ///
    /// # Returns
    /// How the session ended. By the time this returns the flight source has
    /// been released and `outbound` closed with the same outcome.
    pub async fn run<I, O>(
        &self,
        identity: ClientIdentity,
        inbound: I,
        outbound: O,
        shutdown: broadcast::Receiver<()>,
    ) -> SessionOutcome
    where
        I: ParameterInbound,
        O: FlightOutbound,
    {
        let key = identity.clone();

        let source = match self.connector.acquire().await {
            Ok(source) => Arc::new(source),
            Err(e) => {
                log::error!("[{}] failed to acquire flight source: {}", key, e);
                let outcome = SessionOutcome::InternalError(e.to_string());
                outbound.close(&outcome).await;
                return outcome;
            }
        };
        log::info!("[{}] session started", key);

        let session = CancellationToken::new();
        let (signal, outcome_rx) = TerminationSignal::new();
        let (config_tx, config_rx) = mpsc::channel(self.settings.config_buffer.max(1));

        let scheduler = LiveQueryScheduler::new(
            Arc::clone(&source),
            Arc::clone(&self.dedup),
            identity,
            self.settings.scheduler.clone(),
        );
        let (results_rx, scheduler_handle) = scheduler.spawn(config_rx, session.child_token());

        let receive_handle = tokio::spawn(receive_parameters(
            inbound,
            config_tx,
            Arc::clone(&signal),
            session.clone(),
            self.settings.clone(),
            key.clone(),
        ));
        let send_handle = tokio::spawn(send_flights(
            outbound,
            results_rx,
            shutdown,
            Arc::clone(&signal),
            session.clone(),
            key.clone(),
        ));

        // Only the activities may decide; if they all vanish the receiver errors.
        drop(signal);
        let outcome = outcome_rx.await.unwrap_or_else(|_| {
            SessionOutcome::InternalError("session activities ended without an outcome".to_string())
        });
        log::info!("[{}] session ending: {}", key, outcome);

        session.cancel();
        if let Err(e) = receive_handle.await {
            log::error!("[{}] receive activity failed: {}", key, e);
        }
        if let Err(e) = scheduler_handle.await {
            log::error!("[{}] scheduler failed: {}", key, e);
        }
        let outbound = match send_handle.await {
            Ok(outbound) => Some(outbound),
            Err(e) => {
                log::error!("[{}] send activity failed: {}", key, e);
                None
            }
        };

        source.release().await;
        log::debug!("[{}] flight source released", key);

        if let Some(outbound) = outbound {
            outbound.close(&outcome).await;
        }
        log::info!("[{}] session closed: {}", key, outcome);
        outcome
    }
}

async fn receive_parameters<I: ParameterInbound>(
    mut inbound: I,
    config_tx: mpsc::Sender<SearchParameters>,
    signal: Arc<TerminationSignal>,
    session: CancellationToken,
    settings: SessionSettings,
    key: ClientIdentity,
) {
    let mut consecutive_errors: u32 = 0;

    loop {
        let received = tokio::select! {
            _ = session.cancelled() => return,
            received = inbound.next_parameters() => received,
        };

        match received {
            Ok(Some(params)) => {
                consecutive_errors = 0;
                log::info!("[{}] received search parameters: {}", key, params);
                tokio::select! {
                    sent = config_tx.send(params) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                    _ = session.cancelled() => return,
                }
            }
            Ok(None) => consecutive_errors = 0,
            Err(InboundError::Closed) => {
                log::info!("[{}] client closed the stream", key);
                signal.fire(SessionOutcome::ClientClosed);
                return;
            }
            Err(InboundError::Transient(e)) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                log::error!("[{}] error receiving search parameters ({}): {}", key, consecutive_errors, e);

                let limit = settings.max_consecutive_recv_errors;
                if limit > 0 && consecutive_errors >= limit {
                    signal.fire(SessionOutcome::InternalError(format!(
                        "{} consecutive receive errors, last: {}",
                        consecutive_errors, e
                    )));
                    return;
                }

                tokio::select! {
                    _ = tokio::time::sleep(settings.recv_backoff(consecutive_errors)) => {}
                    _ = session.cancelled() => return,
                }
            }
        }
    }
}

async fn send_flights<O: FlightOutbound>(
    mut outbound: O,
    mut results: mpsc::Receiver<Vec<FlightRecord>>,
    mut shutdown: broadcast::Receiver<()>,
    signal: Arc<TerminationSignal>,
    session: CancellationToken,
    key: ClientIdentity,
) -> O {
    let mut results_open = true;

    'session: loop {
        tokio::select! {
            _ = session.cancelled() => break,
            _ = shutdown.recv() => {
                log::info!("[{}] server stopping", key);
                signal.fire(SessionOutcome::ServerStopped);
                break;
            }
            batch = results.recv(), if results_open => {
                let Some(batch) = batch else {
                    // Only shutdown and cancellation are left to wait for.
                    results_open = false;
                    continue;
                };
                for flight in &batch {
                    let sent = tokio::select! {
                        sent = outbound.send_flight(flight) => sent,
                        _ = session.cancelled() => break 'session,
                        _ = shutdown.recv() => {
                            log::info!("[{}] server stopping while sending", key);
                            signal.fire(SessionOutcome::ServerStopped);
                            break 'session;
                        }
                    };
                    if let Err(e) = sent {
                        log::error!("[{}] error sending flight {}: {}", key, flight.icao24, e);
                        signal.fire(SessionOutcome::ClientClosed);
                        break 'session;
                    }
                }
                log::debug!("[{}] sent {} flight(s)", key, batch.len());
            }
        }
    }
    outbound
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryConnector;
    use std::sync::Mutex;
    use tokio::task::JoinHandle;
    use tokio::time::sleep;

    const LAT: f64 = 7.067274;
    const LON: f64 = 220.202269;

    struct ChannelInbound(mpsc::Receiver<Result<Option<SearchParameters>, InboundError>>);

    impl ParameterInbound for ChannelInbound {
        async fn next_parameters(&mut self) -> Result<Option<SearchParameters>, InboundError> {
            self.0.recv().await.unwrap_or(Err(InboundError::Closed))
        }
    }

    struct ChannelOutbound {
        tx: mpsc::UnboundedSender<FlightRecord>,
        fail: bool,
        // Never completes a send, like a client that stopped reading.
        stall: bool,
        closed_with: Arc<Mutex<Option<SessionOutcome>>>,
    }

    impl FlightOutbound for ChannelOutbound {
        async fn send_flight(&mut self, flight: &FlightRecord) -> Result<(), OutboundError> {
            if self.fail {
                return Err(OutboundError::Disconnected("broken pipe".to_string()));
            }
            if self.stall {
                std::future::pending::<()>().await;
            }
            self.tx
                .send(flight.clone())
                .map_err(|e| OutboundError::Disconnected(e.to_string()))
        }

        async fn close(self, outcome: &SessionOutcome) {
            *self.closed_with.lock().unwrap() = Some(outcome.clone());
        }
    }

    struct Harness {
        params_tx: mpsc::Sender<Result<Option<SearchParameters>, InboundError>>,
        flights_rx: mpsc::UnboundedReceiver<FlightRecord>,
        shutdown_tx: broadcast::Sender<()>,
        closed_with: Arc<Mutex<Option<SessionOutcome>>>,
        handle: JoinHandle<SessionOutcome>,
    }

    fn flight(icao: &str) -> FlightRecord {
        FlightRecord {
            icao24: icao.to_string(),
            call_sign: "test-flight".to_string(),
            country: "BR".to_string(),
            latitude: LAT,
            longitude: LON,
            velocity: 10.0,
        }
    }

    fn params(secs: u64) -> SearchParameters {
        SearchParameters::new(LAT, LON, 10_000.0, Duration::from_secs(secs))
    }

    fn start(coordinator: &SessionCoordinator<MemoryConnector>, client: &str, fail_outbound: bool) -> Harness {
        start_with(coordinator, client, fail_outbound, false)
    }

    fn start_with(
        coordinator: &SessionCoordinator<MemoryConnector>,
        client: &str,
        fail_outbound: bool,
        stall_outbound: bool,
    ) -> Harness {
        let (params_tx, params_rx) = mpsc::channel(8);
        let (flights_tx, flights_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let closed_with = Arc::new(Mutex::new(None));

        let outbound = ChannelOutbound {
            tx: flights_tx,
            fail: fail_outbound,
            stall: stall_outbound,
            closed_with: Arc::clone(&closed_with),
        };
        let coordinator = coordinator.clone();
        let identity = ClientIdentity::new(client);
        let handle = tokio::spawn(async move {
            coordinator
                .run(identity, ChannelInbound(params_rx), outbound, shutdown_rx)
                .await
        });

        Harness {
            params_tx,
            flights_rx,
            shutdown_tx,
            closed_with,
            handle,
        }
    }

    fn coordinator(connector: &MemoryConnector, settings: SessionSettings) -> SessionCoordinator<MemoryConnector> {
        SessionCoordinator::new(Arc::new(connector.clone()), Arc::new(DedupCache::new()), settings)
    }

    #[test]
    fn test_recv_backoff_grows_and_caps() {
        let settings = SessionSettings::default();
        assert_eq!(settings.recv_backoff(1), Duration::from_millis(100));
        assert_eq!(settings.recv_backoff(2), Duration::from_millis(200));
        assert_eq!(settings.recv_backoff(4), Duration::from_millis(800));
        assert_eq!(settings.recv_backoff(10), Duration::from_secs(5));
        assert_eq!(settings.recv_backoff(u32::MAX), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_once_then_client_closes() {
        let connector = MemoryConnector::new(vec![flight("123456")]);
        let coordinator = coordinator(&connector, SessionSettings::default());
        let mut h = start(&coordinator, "my-client", false);

        h.params_tx.send(Ok(Some(params(1)))).await.unwrap();
        let delivered = h.flights_rx.recv().await.unwrap();
        assert_eq!(delivered.icao24, "123456");
        assert_eq!(delivered.call_sign, "test-flight");

        sleep(Duration::from_secs(3)).await;
        assert!(h.flights_rx.try_recv().is_err());

        drop(h.params_tx);
        let outcome = h.handle.await.unwrap();
        assert_eq!(outcome, SessionOutcome::ClientClosed);
        assert_eq!(connector.acquired(), 1);
        assert_eq!(connector.released(), 1);
        assert_eq!(*h.closed_with.lock().unwrap(), Some(SessionOutcome::ClientClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_idle_session() {
        let connector = MemoryConnector::default();
        let coordinator = coordinator(&connector, SessionSettings::default());
        let h = start(&coordinator, "my-client", false);

        // Let the session subscribe and settle before stopping.
        sleep(Duration::from_millis(10)).await;
        h.shutdown_tx.send(()).unwrap();

        let outcome = h.handle.await.unwrap();
        assert_eq!(outcome, SessionOutcome::ServerStopped);
        assert_eq!(connector.released(), 1);
        assert_eq!(connector.queries(), 0);
        assert_eq!(*h.closed_with.lock().unwrap(), Some(SessionOutcome::ServerStopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_polling() {
        let connector = MemoryConnector::new(vec![flight("123456")]);
        let coordinator = coordinator(&connector, SessionSettings::default());
        let mut h = start(&coordinator, "my-client", false);

        h.params_tx.send(Ok(Some(params(1)))).await.unwrap();
        assert!(h.flights_rx.recv().await.is_some());

        h.shutdown_tx.send(()).unwrap();
        assert_eq!(h.handle.await.unwrap(), SessionOutcome::ServerStopped);

        let queries = connector.queries();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.queries(), queries);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let connector = MemoryConnector::new(vec![flight("123456")]);
        let coordinator = coordinator(&connector, SessionSettings::default());
        let mut h = start(&coordinator, "my-client", false);

        for _ in 0..3 {
            h.params_tx
                .send(Err(InboundError::Transient("bad frame".to_string())))
                .await
                .unwrap();
        }
        h.params_tx.send(Ok(None)).await.unwrap();
        h.params_tx.send(Ok(Some(params(1)))).await.unwrap();

        assert_eq!(h.flights_rx.recv().await.unwrap().icao24, "123456");
        assert!(!h.handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_many_receive_errors_end_session() {
        let connector = MemoryConnector::default();
        let settings = SessionSettings {
            max_consecutive_recv_errors: 3,
            ..SessionSettings::default()
        };
        let coordinator = coordinator(&connector, settings);
        let h = start(&coordinator, "my-client", false);

        for _ in 0..3 {
            h.params_tx
                .send(Err(InboundError::Transient("bad frame".to_string())))
                .await
                .unwrap();
        }

        let outcome = h.handle.await.unwrap();
        assert!(matches!(outcome, SessionOutcome::InternalError(_)));
        assert_eq!(connector.released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_messages_do_not_count_as_errors() {
        let connector = MemoryConnector::new(vec![flight("123456")]);
        let settings = SessionSettings {
            max_consecutive_recv_errors: 3,
            ..SessionSettings::default()
        };
        let coordinator = coordinator(&connector, settings);
        let mut h = start(&coordinator, "my-client", false);

        let transient = || Err(InboundError::Transient("bad frame".to_string()));
        h.params_tx.send(transient()).await.unwrap();
        h.params_tx.send(transient()).await.unwrap();
        for _ in 0..20 {
            h.params_tx.send(Ok(None)).await.unwrap();
        }
        h.params_tx.send(transient()).await.unwrap();
        h.params_tx.send(transient()).await.unwrap();
        h.params_tx.send(Ok(Some(params(1)))).await.unwrap();

        assert_eq!(h.flights_rx.recv().await.unwrap().icao24, "123456");
        assert!(!h.handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reaches_stalled_sender() {
        let connector = MemoryConnector::new(vec![flight("123456")]);
        let coordinator = coordinator(&connector, SessionSettings::default());
        let h = start_with(&coordinator, "my-client", false, true);

        h.params_tx.send(Ok(Some(params(1)))).await.unwrap();
        // First tick hands a batch to the send activity, which then blocks.
        sleep(Duration::from_millis(1_500)).await;
        assert!(connector.queries() >= 1);

        h.shutdown_tx.send(()).unwrap();
        let outcome = h.handle.await.unwrap();
        assert_eq!(outcome, SessionOutcome::ServerStopped);
        assert_eq!(connector.released(), 1);
        assert_eq!(*h.closed_with.lock().unwrap(), Some(SessionOutcome::ServerStopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_failure() {
        let connector = MemoryConnector::default();
        connector.set_fail_acquire(true);
        let coordinator = coordinator(&connector, SessionSettings::default());
        let h = start(&coordinator, "my-client", false);

        let outcome = h.handle.await.unwrap();
        assert!(matches!(outcome, SessionOutcome::InternalError(_)));
        assert_eq!(connector.acquired(), 0);
        assert_eq!(connector.released(), 0);
        assert_eq!(*h.closed_with.lock().unwrap(), Some(outcome));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_failure_ends_session() {
        let connector = MemoryConnector::new(vec![flight("123456")]);
        let coordinator = coordinator(&connector, SessionSettings::default());
        let h = start(&coordinator, "my-client", true);

        h.params_tx.send(Ok(Some(params(1)))).await.unwrap();

        let outcome = h.handle.await.unwrap();
        assert_eq!(outcome, SessionOutcome::ClientClosed);
        assert_eq!(connector.released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfiguration_moves_search() {
        let mut far = flight("far-away");
        far.latitude = 40.0;
        far.longitude = -3.0;
        let connector = MemoryConnector::new(vec![flight("123456"), far]);
        let coordinator = coordinator(&connector, SessionSettings::default());
        let mut h = start(&coordinator, "my-client", false);

        h.params_tx.send(Ok(Some(params(1)))).await.unwrap();
        assert_eq!(h.flights_rx.recv().await.unwrap().icao24, "123456");

        h.params_tx
            .send(Ok(Some(SearchParameters::new(40.0, -3.0, 10_000.0, Duration::from_secs(1)))))
            .await
            .unwrap();
        assert_eq!(h.flights_rx.recv().await.unwrap().icao24, "far-away");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_is_per_client_across_sessions() {
        let connector = MemoryConnector::new(vec![flight("123456")]);
        let coordinator = coordinator(&connector, SessionSettings::default());

        let mut first = start(&coordinator, "my-client", false);
        first.params_tx.send(Ok(Some(params(1)))).await.unwrap();
        assert!(first.flights_rx.recv().await.is_some());
        drop(first.params_tx);
        first.handle.await.unwrap();

        // Same client reconnecting inside the window: already delivered.
        let mut again = start(&coordinator, "my-client", false);
        again.params_tx.send(Ok(Some(params(1)))).await.unwrap();
        sleep(Duration::from_millis(2_500)).await;
        assert!(again.flights_rx.try_recv().is_err());

        // Another client sees it.
        let mut other = start(&coordinator, "other-client", false);
        other.params_tx.send(Ok(Some(params(1)))).await.unwrap();
        assert_eq!(other.flights_rx.recv().await.unwrap().icao24, "123456");
    }
}
