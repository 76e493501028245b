//! # Waiter
//!
//! Wraps the bus's multiplexed wait, classifying the result and keeping the wait error counter
//! used for log throttling. Wait errors are never fatal, the loop simply carries on with the next
//! cycle.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::time::Duration;

use log::{error, info, warn};

use comms_if::bus::{Bus, SubHandle, WaitOutcome};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Number of initial wait errors which are always logged.
pub const ALWAYS_LOGGED_ERRORS: u64 = 10;

/// After the initial errors, only every `ERROR_LOG_PERIOD`-th error is logged.
pub const ERROR_LOG_PERIOD: u64 = 50;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Waiter {
    timeout: Duration,

    /// Number of wait errors seen so far
    error_count: u64,

    /// Number of wait errors which were written to the log
    logged_error_count: u64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Waiter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            error_count: 0,
            logged_error_count: 0,
        }
    }

    /// Block on `handles` for up to the configured timeout.
    ///
    /// Ready indices outside `handles` are dropped with a warning, and a wake-up left with no
    /// indices is reported as a timeout. Wait errors are counted and logged subject to
    /// [`should_log_wait_error`].
    pub fn wait<B: Bus>(&mut self, bus: &mut B, handles: &[SubHandle]) -> WaitOutcome {
        match bus.wait(handles, self.timeout) {
            WaitOutcome::Ready(mut ready) => {
                let dropped = ready.retain_below(handles.len());
                if dropped > 0 {
                    warn!(
                        "Bus reported {} ready index(es) outside the {} registered handles",
                        dropped,
                        handles.len()
                    );
                }

                // Nothing left to dispatch, same as no data at all
                if ready.is_empty() {
                    return self.timed_out();
                }

                WaitOutcome::Ready(ready)
            }
            WaitOutcome::Timeout => self.timed_out(),
            WaitOutcome::Error(e) => {
                if should_log_wait_error(self.error_count) {
                    error!(
                        "Wait error {} (code {}, {} so far)",
                        e,
                        e.code(),
                        self.error_count + 1
                    );
                    self.logged_error_count += 1;
                }
                self.error_count += 1;
                WaitOutcome::Error(e)
            }
        }
    }

    fn timed_out(&self) -> WaitOutcome {
        info!("Got no data within {} ms", self.timeout.as_millis());
        WaitOutcome::Timeout
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn logged_error_count(&self) -> u64 {
        self.logged_error_count
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Whether the wait error seen when `error_count` errors have already happened should be logged.
pub fn should_log_wait_error(error_count: u64) -> bool {
    error_count < ALWAYS_LOGGED_ERRORS || error_count % ERROR_LOG_PERIOD == 0
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
