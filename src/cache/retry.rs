use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::store::{StoreError, StoreResult};

/// Cooperative cancellation flag shared by every retry loop.
///
/// Sleeps taken through the token end early once shutdown is triggered.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock() = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for `dur` unless shutdown is triggered first.
    ///
    /// Returns true if the sleep was cut short by shutdown.
    pub fn sleep(&self, dur: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + dur;
        let mut down = flag.lock();
        while !*down {
            if cvar.wait_until(&mut down, deadline).timed_out() {
                break;
            }
        }
        *down
    }
}

/// Fixed back-off retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// `None` retries until shutdown.
    pub max_attempts: Option<u32>,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn unbounded(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            delay,
        }
    }

    pub fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Retrying { attempt: u32, deadline: Instant },
    Aborted,
    Succeeded,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// The operation failed in a way retrying cannot fix.
    #[error("permanent failure: {0}")]
    Permanent(StoreError),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: StoreError },

    #[error("aborted by shutdown")]
    Aborted,
}

/// One run of a retried backend operation.
pub struct Retry<'a> {
    policy: RetryPolicy,
    shutdown: &'a ShutdownToken,
    state: RetryState,
}

impl<'a> Retry<'a> {
    pub fn new(policy: RetryPolicy, shutdown: &'a ShutdownToken) -> Self {
        Self {
            policy,
            shutdown,
            state: RetryState::Idle,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts or
    /// shutdown is triggered. The first attempt is always made.
    pub fn run<T>(
        &mut self,
        what: &str,
        mut op: impl FnMut(u32) -> StoreResult<T>,
    ) -> Result<T, RetryError> {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => {
                    self.state = RetryState::Succeeded;
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => {
                    self.state = RetryState::Aborted;
                    return Err(RetryError::Permanent(e));
                }
                Err(e) => {
                    if self.shutdown.is_triggered() {
                        self.state = RetryState::Aborted;
                        return Err(RetryError::Aborted);
                    }
                    if self.policy.max_attempts.is_some_and(|max| attempt >= max) {
                        self.state = RetryState::Aborted;
                        return Err(RetryError::Exhausted { attempts: attempt, last: e });
                    }
                    warn!(
                        what,
                        attempt,
                        error = %e,
                        delay_ms = self.policy.delay.as_millis() as u64,
                        "Backend operation failed, retrying"
                    );
                    self.state = RetryState::Retrying {
                        attempt,
                        deadline: Instant::now() + self.policy.delay,
                    };
                    if self.shutdown.sleep(self.policy.delay) {
                        self.state = RetryState::Aborted;
                        return Err(RetryError::Aborted);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
