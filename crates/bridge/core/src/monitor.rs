//! Background monitor for reader and card state changes
//!
//! A single thread blocks in [`ResourceManager::wait_for_change`] across all
//! attached readers plus the reader list pseudo reader. The wait timeout is
//! the time left until the earliest pending deadline, so expiring requests
//! needs no extra timer. Other threads shorten a running wait with
//! [`ReaderMonitor::wake`].
//!
//! A wake that lands after the timeout was computed but before the wait
//! started cannot interrupt anything, and resource managers do not keep a
//! cancel for the next wait. Every wake therefore bumps an epoch that is
//! checked right before blocking, and no single wait is longer than
//! [`WAIT_SLICE`], which bounds how late such a wake can be noticed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, error, trace, warn};

use crate::error::{BridgeError, ScardError};
use crate::reader_state::{ChangeKind, ReaderStateSnapshot};
use crate::resource::{ResourceManager, WaitStatus};

/// Pause after a failed resource manager call
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Longest single wait on the resource manager
pub const WAIT_SLICE: Duration = Duration::from_secs(1);

/// Receiver of everything the monitor observes
pub trait ReaderChangeHandler: Send + Sync + 'static {
    /// Time until the next deadline, `None` to wait indefinitely
    fn next_timeout(&self) -> Option<Duration>;

    /// The wait timed out, deadlines up to `now` have passed
    fn on_timeout(&self, now: Instant);

    /// An entry of the wait set changed
    fn on_change(&self, state: &ReaderStateSnapshot, kind: ChangeKind);
}

/// Why the monitor is woken up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The earliest deadline changed; recompute the timeout
    Deadline,
    /// Re-enumerate readers from scratch so every reader reports its state
    Resync,
}

#[derive(Debug, Default)]
struct Flags {
    stop: AtomicBool,
    resync: AtomicBool,
    /// Bumped by every wake
    epoch: AtomicU64,
}

impl Flags {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn take_resync(&self) -> bool {
        self.resync.swap(false, Ordering::AcqRel)
    }
}

/// Handle to the monitor thread. Dropping it stops and joins the thread.
pub struct ReaderMonitor<R: ResourceManager> {
    resources: Arc<R>,
    flags: Arc<Flags>,
    /// Dropped on shutdown to cut short an error backoff
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: ResourceManager> fmt::Debug for ReaderMonitor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderMonitor")
            .field("running", &self.handle.is_some())
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl<R: ResourceManager> ReaderMonitor<R> {
    /// Start monitoring, reporting to `handler`
    pub fn spawn<H>(resources: Arc<R>, handler: Arc<H>) -> Result<Self, BridgeError>
    where
        H: ReaderChangeHandler,
    {
        let flags = Arc::new(Flags::default());
        let (stop_tx, stop_rx) = bounded(0);

        let worker = Worker {
            resources: Arc::clone(&resources),
            handler,
            flags: Arc::clone(&flags),
            stop_rx,
        };
        let handle = thread::Builder::new()
            .name("reader-monitor".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            resources,
            flags,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Interrupt the current wait. Never blocks; spurious wakes are harmless.
    pub fn wake(&self, reason: WakeReason) {
        trace!(?reason, "Waking reader monitor");
        if reason == WakeReason::Resync {
            self.flags.resync.store(true, Ordering::Release);
        }
        self.flags.bump();
        if let Err(e) = self.resources.cancel_wait() {
            warn!("Failed to interrupt reader wait: {}", e);
        }
    }
}

impl<R: ResourceManager> Drop for ReaderMonitor<R> {
    fn drop(&mut self) {
        self.flags.stop.store(true, Ordering::Release);
        self.flags.bump();
        self.stop_tx.take();
        if let Err(e) = self.resources.cancel_wait() {
            warn!("Failed to interrupt reader wait on shutdown: {}", e);
        }

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Reader monitor thread panicked");
            }
        }
        debug!("Reader monitor stopped");
    }
}

struct Worker<R, H> {
    resources: Arc<R>,
    handler: Arc<H>,
    flags: Arc<Flags>,
    stop_rx: Receiver<()>,
}

/// What to do after a wait returned
enum Next {
    /// Wait again on the same reader set
    Wait,
    /// Enumerate readers again
    Enumerate,
    /// Leave the loop
    Stop,
}

impl<R: ResourceManager, H: ReaderChangeHandler> Worker<R, H> {
    fn run(self) {
        debug!("Reader monitor started");
        // The pseudo reader keeps its state across enumerations so reader
        // list changes are seen relative to the previous pass.
        let mut pnp = ReaderStateSnapshot::pnp();

        while !self.flags.stopped() {
            self.flags.take_resync();

            let mut states = match self.enumerate(&pnp) {
                Ok(states) => states,
                Err(e) => {
                    warn!("Failed to list readers: {}", e);
                    self.handler.on_timeout(Instant::now());
                    if self.backoff() {
                        break;
                    }
                    continue;
                }
            };

            let next = self.wait_loop(&mut states);
            if let Some(first) = states.into_iter().next() {
                pnp = first;
            }
            if matches!(next, Next::Stop) {
                break;
            }
        }
        debug!("Reader monitor exiting");
    }

    fn enumerate(&self, pnp: &ReaderStateSnapshot) -> Result<Vec<ReaderStateSnapshot>, ScardError> {
        let readers = self.resources.list_readers()?;
        let mut states = Vec::with_capacity(readers.len() + 1);
        states.push(pnp.clone());
        // Readers are only tracked by name, so each starts unaware
        states.extend(readers.into_iter().map(ReaderStateSnapshot::unaware));
        trace!(readers = states.len() - 1, "Readers enumerated");
        Ok(states)
    }

    fn wait_loop(&self, states: &mut [ReaderStateSnapshot]) -> Next {
        loop {
            let epoch = self.flags.epoch();
            if self.flags.stopped() {
                return Next::Stop;
            }
            // A resync requested while no wait was in progress
            if self.flags.take_resync() {
                return Next::Enumerate;
            }

            let timeout = self
                .handler
                .next_timeout()
                .map_or(WAIT_SLICE, |timeout| timeout.min(WAIT_SLICE));
            // Woken while the timeout was being computed
            if self.flags.epoch() != epoch {
                continue;
            }
            trace!(?timeout, "Waiting for reader changes");
            let status = self.resources.wait_for_change(Some(timeout), states);

            if self.flags.stopped() {
                return Next::Stop;
            }

            let next = match status {
                Ok(WaitStatus::TimedOut) => {
                    self.handler.on_timeout(Instant::now());
                    Next::Wait
                }
                Ok(WaitStatus::Cancelled) => {
                    if self.flags.take_resync() {
                        Next::Enumerate
                    } else {
                        Next::Wait
                    }
                }
                Ok(WaitStatus::Changed) => {
                    if self.dispatch(states) {
                        Next::Enumerate
                    } else {
                        Next::Wait
                    }
                }
                Err(e) => {
                    warn!("Waiting for reader changes failed: {}", e);
                    // Deadlines must still be honoured while the resource manager misbehaves
                    self.handler.on_timeout(Instant::now());
                    if self.backoff() {
                        Next::Stop
                    } else {
                        Next::Enumerate
                    }
                }
            };

            match next {
                Next::Wait => continue,
                other => return other,
            }
        }
    }

    /// Report changed entries and adopt the new states as baseline. Returns
    /// whether the reader list changed.
    fn dispatch(&self, states: &mut [ReaderStateSnapshot]) -> bool {
        let mut list_changed = false;
        for state in states.iter_mut() {
            if state.changed() {
                let kind = state.change_kind();
                trace!(
                    reader = state.name(),
                    current = ?state.current(),
                    event = ?state.event(),
                    diff = ?state.diff(),
                    ?kind,
                    "Reader state changed"
                );
                self.handler.on_change(state, kind);
                list_changed |= kind == ChangeKind::DeviceList;
            }
            state.sync();
        }
        list_changed
    }

    /// Sleep after an error. Returns true if shutdown was requested meanwhile.
    fn backoff(&self) -> bool {
        match self.stop_rx.recv_timeout(ERROR_BACKOFF) {
            Err(RecvTimeoutError::Timeout) => self.flags.stopped(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}
