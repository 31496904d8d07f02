//! # Live-Query Scheduler
//!
//! A re-schedulable polling loop bound to one session.
//!
//! ## Workflow:
//! 1.  **Wait for configuration**: nothing happens until the first
//!     [`SearchParameters`] arrives on the configuration channel.
//! 2.  **React** to whichever event is ready first:
//!     -   *Timer fire*: bounding box, region query, dedup filter, emit. A failed
//!         query is logged and the tick skipped; the next fire retries.
//!     -   *New configuration*: replace the parameters and re-arm the timer. The
//!         next fire lands one new interval after the previous fire, or right
//!         away if that moment has passed. A tick already in progress finishes
//!         with the parameters it started with.
//!     -   *Cancellation*: stop at once, mid-query or mid-emit included.
//!
//! There is no result besides stopping: the join handle completing and the
//! result channel closing are the only observable ends.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::params::{ClientIdentity, SearchParameters};
use crate::dedup::DedupCache;
use crate::source::{FlightRecord, FlightSource};

/// Floor under any configured interval; `tokio::time::interval` rejects zero.
const SHORTEST_PERIOD: Duration = Duration::from_millis(1);

/// Ceiling on any configured interval; keeps timer deadlines representable.
const LONGEST_PERIOD: Duration = Duration::from_secs(24 * 3600);

/// Tuning shared by every scheduler in the process.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// How long a delivered flight stays suppressed for the same client.
    pub dedup_window: Duration,
    /// Poll intervals shorter than this (zero included) are raised to it.
    pub min_poll_interval: Duration,
    /// Result batches buffered between the scheduler and the send path.
    pub result_buffer: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(3600),
            min_poll_interval: Duration::from_secs(1),
            result_buffer: 16,
        }
    }
}

/// # Live-Query Scheduler
pub struct LiveQueryScheduler<S: FlightSource> {
    source: Arc<S>,
    dedup: Arc<DedupCache>,
    session_key: ClientIdentity,
    settings: SchedulerSettings,
}

impl<S: FlightSource> LiveQueryScheduler<S> {
    pub fn new(
        source: Arc<S>,
        dedup: Arc<DedupCache>,
        session_key: ClientIdentity,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            source,
            dedup,
            session_key,
            settings,
        }
    }

    /// Starts the loop on its own task.
    ///
    /// # Returns
    /// The receiving end of the result channel (one `Vec` per tick that found
    /// something new) and the task handle.
    pub fn spawn(
        self,
        config_rx: mpsc::Receiver<SearchParameters>,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<Vec<FlightRecord>>, JoinHandle<()>) {
        let (results_tx, results_rx) = mpsc::channel(self.settings.result_buffer.max(1));
        let handle = tokio::spawn(self.run(config_rx, results_tx, cancel));
        (results_rx, handle)
    }

    async fn run(
        self,
        mut config_rx: mpsc::Receiver<SearchParameters>,
        results_tx: mpsc::Sender<Vec<FlightRecord>>,
        cancel: CancellationToken,
    ) {
        let key = self.session_key.clone();

        let mut current = tokio::select! {
            received = config_rx.recv() => match received {
                Some(params) => params,
                None => {
                    log::info!("[{}] no search parameters received: finish get flights routine", key);
                    return;
                }
            },
            _ = cancel.cancelled() => {
                log::info!("[{}] stream closed before first search parameters", key);
                return;
            }
        };

        log::info!("[{}] polling {}", key, current);
        let mut period = self.period_for(&current);
        let mut last_fire = Instant::now();
        let mut timer = rearm(next_fire(last_fire, period), period);
        let mut config_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("[{}] stream closed: finish get flights routine", key);
                    break;
                }
                fired = timer.tick() => {
                    last_fire = fired;

                    let batch = tokio::select! {
                        batch = self.tick(&current) => batch,
                        _ = cancel.cancelled() => break,
                    };

                    if let Some(batch) = batch {
                        tokio::select! {
                            sent = results_tx.send(batch) => {
                                if sent.is_err() {
                                    log::debug!("[{}] result receiver gone: finish get flights routine", key);
                                    break;
                                }
                            }
                            _ = cancel.cancelled() => break,
                        }
                    }
                }
                received = config_rx.recv(), if config_open => {
                    match received {
                        Some(params) => {
                            current = params;
                            period = self.period_for(&current);
                            let next = next_fire(last_fire, period).max(Instant::now());
                            timer = rearm(next, period);
                            log::info!("[{}] search parameters updated: {}", key, current);
                        }
                        None => {
                            config_open = false;
                            log::debug!("[{}] configuration channel closed, keeping last parameters", key);
                        }
                    }
                }
            }
        }
    }

    /// One poll: query, filter, and hand back what is new (if anything).
    async fn tick(&self, params: &SearchParameters) -> Option<Vec<FlightRecord>> {
        let key = &self.session_key;
        let bbox = params.bounding_box();
        log::info!("[{}] search bounds: http://bboxfinder.com/#{}", key, bbox);

        let flights = match self.source.query_region(&bbox).await {
            Ok(flights) => flights,
            Err(e) => {
                log::error!("[{}] {}", key, e);
                return None;
            }
        };
        log::debug!("[{}] returned flights before dupe check: {:?}", key, flights);

        let window = self.settings.dedup_window;
        let fresh: Vec<FlightRecord> = flights
            .into_iter()
            .filter(|f| !self.dedup.exists(key.as_str(), &f.icao24, window))
            .collect();
        log::debug!("[{}] returned flights after dupe check: {:?}", key, fresh);

        if fresh.is_empty() {
            None
        } else {
            Some(fresh)
        }
    }

    fn period_for(&self, params: &SearchParameters) -> Duration {
        params
            .poll_interval
            .max(self.settings.min_poll_interval)
            .max(SHORTEST_PERIOD)
            .min(LONGEST_PERIOD)
    }
}

fn next_fire(last_fire: Instant, period: Duration) -> Instant {
    last_fire.checked_add(period).unwrap_or_else(Instant::now)
}

fn rearm(start: Instant, period: Duration) -> Interval {
    let mut timer = interval_at(start, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}
