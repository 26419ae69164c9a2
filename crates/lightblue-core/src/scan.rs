//! Scan controller
//!
//! Owns the single scanning flag. The radio refuses connections while it is
//! scanning, so every connect goes through [`ScanController::pause_for_connect`]
//! and [`ScanController::resume`].
//!
//! Each start bumps a generation counter. The deadline timer and a deferred
//! start both capture the generation they were armed under and do nothing if
//! it has moved on, so a stale timer can never stop a newer scan.
//!
//! Radio start and stop calls are serialized. A start that loses a race with
//! `stop` or a connect notices the moved generation once the radio answers
//! and stops the radio again before anyone else touches it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::radio::{Radio, RadioState};

/// Called once when a scan ends because its deadline passed
pub type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    /// A scan start is waiting on the radio
    Starting,
    Scanning,
    /// Scanning was stopped so a connect can proceed
    StoppingForConnect,
}

/// Scanning state captured before a connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "pass the snapshot back to ScanController::resume"]
pub struct ScanSnapshot {
    was_scanning: bool,
    holds_pause: bool,
}

impl ScanSnapshot {
    pub fn was_scanning(&self) -> bool {
        self.was_scanning
    }
}

#[derive(Debug)]
struct ScanStatus {
    state: ScanState,
    /// Connects currently holding scanning off
    paused_connects: usize,
}

struct ScanInner {
    radio: Arc<dyn Radio>,
    default_timeout: Duration,
    status: Mutex<ScanStatus>,
    generation: AtomicU64,
    deadline: Mutex<Option<JoinHandle<()>>>,
    deferred: Mutex<Option<JoinHandle<()>>>,
    readiness: watch::Sender<RadioState>,
    radio_calls: tokio::sync::Mutex<()>,
}

/// Cloneable handle onto the shared scanning state
#[derive(Clone)]
pub struct ScanController {
    inner: Arc<ScanInner>,
}

impl ScanController {
    pub fn new(radio: Arc<dyn Radio>, default_timeout: Duration) -> Self {
        let (readiness, _) = watch::channel(RadioState::Unknown);
        Self {
            inner: Arc::new(ScanInner {
                radio,
                default_timeout,
                status: Mutex::new(ScanStatus {
                    state: ScanState::Idle,
                    paused_connects: 0,
                }),
                generation: AtomicU64::new(0),
                deadline: Mutex::new(None),
                deferred: Mutex::new(None),
                readiness,
                radio_calls: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> ScanState {
        self.inner.status.lock().state
    }

    pub fn is_scanning(&self) -> bool {
        self.state() == ScanState::Scanning
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Feed an adapter state change from the radio event stream
    pub fn set_radio_state(&self, state: RadioState) {
        debug!("Radio state: {:?}", state);
        self.inner.readiness.send_replace(state);

        if !state.is_ready() {
            let mut status = self.inner.status.lock();
            if status.state == ScanState::Scanning {
                warn!("Radio went away while scanning");
                status.state = ScanState::Idle;
            }
        }
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn cancel_pending(&self) {
        if let Some(task) = self.inner.deadline.lock().take() {
            task.abort();
        }
        if let Some(task) = self.inner.deferred.lock().take() {
            task.abort();
        }
    }

    /// Start scanning and arm a deadline that stops it
    ///
    /// If the radio is not ready yet the start is deferred until the next
    /// time it reports ready. That happens at most once per call.
    pub async fn start(&self, timeout: Duration, on_timeout: Option<TimeoutCallback>) -> Result<()> {
        let generation = self.next_generation();
        self.cancel_pending();
        self.set_state_if(ScanState::Idle, ScanState::Starting);

        let radio_state = self.inner.radio.state().await;
        self.inner.readiness.send_replace(radio_state);

        if radio_state.is_ready() {
            self.begin_scan(generation).await?;
        } else {
            info!("Radio not ready ({:?}), deferring scan start", radio_state);
            self.set_state_if(ScanState::Starting, ScanState::Idle);
            let mut readiness = self.inner.readiness.subscribe();
            let controller = self.clone();
            let task = tokio::spawn(async move {
                if readiness.wait_for(|state| state.is_ready()).await.is_err() {
                    return;
                }
                if let Err(e) = controller.begin_scan(generation).await {
                    warn!("Deferred scan start failed: {}", e);
                }
            });
            *self.inner.deferred.lock() = Some(task);
        }

        info!("Setting scan timeout: {} seconds", timeout.as_secs());
        let controller = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if controller.generation() != generation {
                return;
            }
            info!("Scan timeout!");
            // Detach so stopping does not abort this task
            controller.inner.deadline.lock().take();
            if let Err(e) = controller.stop().await {
                warn!("Failed to stop scan at deadline: {}", e);
            }
            if let Some(callback) = on_timeout {
                callback();
            }
        });
        *self.inner.deadline.lock() = Some(task);

        Ok(())
    }

    fn set_state_if(&self, from: ScanState, to: ScanState) {
        let mut status = self.inner.status.lock();
        if status.state == from {
            status.state = to;
        }
    }

    async fn begin_scan(&self, generation: u64) -> Result<()> {
        let _radio = self.inner.radio_calls.lock().await;
        {
            let mut status = self.inner.status.lock();
            if self.generation() != generation {
                debug!("Scan start superseded before it began");
                if status.state == ScanState::Starting {
                    status.state = ScanState::Idle;
                }
                return Ok(());
            }
            match status.state {
                ScanState::Scanning => {
                    debug!("Already scanning");
                    return Ok(());
                }
                ScanState::StoppingForConnect => {
                    debug!("Connect in progress, scanning resumes after it");
                    return Ok(());
                }
                ScanState::Idle | ScanState::Starting => status.state = ScanState::Starting,
            }
        }

        info!("Starting to scan...");
        let started = self.inner.radio.start_scan().await;

        let superseded = {
            let mut status = self.inner.status.lock();
            let current = self.generation() == generation && status.state == ScanState::Starting;
            if status.state == ScanState::Starting {
                status.state = if current && started.is_ok() {
                    ScanState::Scanning
                } else {
                    ScanState::Idle
                };
            }
            if current {
                status.paused_connects = 0;
            }
            !current
        };
        started?;

        if superseded {
            info!("Scan start superseded, stopping radio");
            self.inner.radio.stop_scan().await?;
        }
        Ok(())
    }

    /// Stop scanning and cancel the deadline and any deferred start
    ///
    /// Returns once the radio is no longer scanning, including a start that
    /// was still in flight.
    pub async fn stop(&self) -> Result<()> {
        self.next_generation();
        self.cancel_pending();

        let previous = {
            let mut status = self.inner.status.lock();
            status.paused_connects = 0;
            std::mem::replace(&mut status.state, ScanState::Idle)
        };

        info!("No longer scanning...");
        // An aborted deferred start may have reached the radio
        let _radio = self.inner.radio_calls.lock().await;
        if matches!(previous, ScanState::Scanning | ScanState::Starting) {
            self.inner.radio.stop_scan().await?;
        }
        Ok(())
    }

    /// Take scanning out of the way of a connect
    ///
    /// A start still waiting on the radio counts as scanning. Overlapping
    /// connects share one pause; scanning resumes when the last of them
    /// hands its snapshot back. Returns once the radio is quiet.
    pub async fn pause_for_connect(&self) -> ScanSnapshot {
        let (snapshot, previous) = {
            let mut status = self.inner.status.lock();
            let previous = status.state;
            let snapshot = match previous {
                ScanState::Scanning | ScanState::Starting => {
                    status.state = ScanState::StoppingForConnect;
                    status.paused_connects = 1;
                    ScanSnapshot {
                        was_scanning: true,
                        holds_pause: true,
                    }
                }
                ScanState::StoppingForConnect => {
                    status.paused_connects += 1;
                    ScanSnapshot {
                        was_scanning: false,
                        holds_pause: true,
                    }
                }
                ScanState::Idle => ScanSnapshot {
                    was_scanning: false,
                    holds_pause: false,
                },
            };
            (snapshot, previous)
        };

        if snapshot.was_scanning || !snapshot.holds_pause {
            self.next_generation();
            self.cancel_pending();
        }

        let _radio = self.inner.radio_calls.lock().await;
        if matches!(previous, ScanState::Scanning | ScanState::Starting) {
            info!("Stopping scan for connect");
            if let Err(e) = self.inner.radio.stop_scan().await {
                warn!("Failed to stop scanning before connect: {}", e);
            }
        }
        snapshot
    }

    /// Restart scanning if it was running before the connect
    ///
    /// Scanning restarts with the default timeout and no timeout callback.
    /// An explicit stop during the connect wins.
    pub async fn resume(&self, snapshot: ScanSnapshot) {
        if !snapshot.holds_pause {
            return;
        }

        let restart = {
            let mut status = self.inner.status.lock();
            if status.state != ScanState::StoppingForConnect {
                false
            } else {
                status.paused_connects = status.paused_connects.saturating_sub(1);
                if status.paused_connects == 0 {
                    status.state = ScanState::Idle;
                    true
                } else {
                    false
                }
            }
        };

        if restart {
            info!("Resuming scan after connect");
            if let Err(e) = self.start(self.inner.default_timeout, None).await {
                warn!("Failed to resume scanning: {}", e);
            }
        }
    }
}

impl Drop for ScanInner {
    fn drop(&mut self) {
        if let Some(task) = self.deadline.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.deferred.get_mut().take() {
            task.abort();
        }
    }
}
