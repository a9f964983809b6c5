//! Cancellation and worker rendezvous.
//!
//! [`StopFlag`] is the cooperative cancellation token handed to every loop in a
//! run: trigger, writer workers, stream readers, gate and graph fetcher all
//! check it at the top of each iteration and exit promptly once it is raised.
//!
//! [`WorkerSync`] fans one "go" out to N writer threads and blocks the
//! dispatcher until every one of them has finished its unit of work:
//!
//! ```text
//! dispatcher                       worker k
//! ----------                       --------
//! awake = asleep = errors = 0
//! generation += 1; notify_all  ->  ++awake
//! run local work                   write its probes
//! poll every LOOP_MS/8        <-   ++asleep (and ++errors on failure); wait
//! until awake == asleep == N
//! ```

use crate::error::{AppResult, DaqError};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::trace;

/// Shared cancellation token.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// A flag that is not yet stopped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder to exit.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once stopped.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep up to `dur` in short slices, returning early once stopped.
    ///
    /// Returns `true` if the flag was raised.
    pub fn sleep(&self, dur: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(5);
        let mut left = dur;
        while !left.is_zero() {
            if self.is_stopped() {
                return true;
            }
            let step = left.min(SLICE);
            thread::sleep(step);
            left -= step;
        }
        self.is_stopped()
    }
}

#[derive(Debug, Default)]
struct SyncState {
    awake: usize,
    asleep: usize,
    errors: usize,
    generation: u64,
    killed: bool,
    first_error: Option<DaqError>,
}

/// Wake/sleep rendezvous between one dispatcher and N workers.
#[derive(Debug)]
pub struct WorkerSync {
    state: Mutex<SyncState>,
    wake: Condvar,
    poll: Duration,
}

impl WorkerSync {
    /// `poll` bounds how long the dispatcher sleeps between completion checks.
    pub fn new(poll: Duration) -> Self {
        Self {
            state: Mutex::new(SyncState::default()),
            wake: Condvar::new(),
            poll,
        }
    }

    /// Worker side: report the previous unit's outcome, sleep until the next
    /// dispatch, and return `false` once killed.
    ///
    /// `seen` holds the last generation this worker ran; start it at 0.
    pub fn wake(&self, last: AppResult<()>, seen: &mut u64) -> bool {
        let mut s = self.state.lock();
        if let Err(e) = last {
            s.errors += 1;
            if s.first_error.is_none() {
                s.first_error = Some(e);
            }
        }
        s.asleep += 1;

        while s.generation == *seen && !s.killed {
            self.wake.wait(&mut s);
        }
        if s.killed {
            return false;
        }
        *seen = s.generation;
        s.awake += 1;
        true
    }

    /// Block until `n` workers have checked in for the first time.
    pub fn wait_ready(&self, n: usize) {
        loop {
            if self.state.lock().asleep >= n {
                return;
            }
            thread::sleep(Duration::from_micros(10));
        }
    }

    /// Dispatcher side: start one cycle on `n` workers, run `local` on this
    /// thread meanwhile, and wait for every worker to finish.
    ///
    /// Fails with the local error if any, else with the first worker error.
    pub fn dispatch<F>(&self, n: usize, local: F) -> AppResult<()>
    where
        F: FnOnce() -> AppResult<()>,
    {
        {
            let mut s = self.state.lock();
            s.awake = 0;
            s.asleep = 0;
            s.errors = 0;
            s.first_error = None;
            s.generation += 1;
        }
        self.wake.notify_all();

        let local = local();

        loop {
            {
                let mut s = self.state.lock();
                if s.killed || (s.awake >= n && s.asleep >= n) {
                    trace!(n, errors = s.errors, "Worker cycle complete");
                    local?;
                    let errors = s.errors;
                    if errors > 0 {
                        return Err(s
                            .first_error
                            .take()
                            .unwrap_or_else(|| DaqError::Thread(format!("{} writer(s) failed", errors))));
                    }
                    return Ok(());
                }
            }
            thread::sleep(self.poll);
        }
    }

    /// Release every worker for good.
    pub fn kill(&self) {
        self.state.lock().killed = true;
        self.wake.notify_all();
    }

    /// Workers currently awake.
    pub fn awake_count(&self) -> usize {
        self.state.lock().awake
    }

    /// Workers currently asleep.
    pub fn asleep_count(&self) -> usize {
        self.state.lock().asleep
    }
}
