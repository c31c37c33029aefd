//! Bounded retry-until-success polling.
//!
//! [`stabilize`] is the one place asynchronous readiness (process warm-up,
//! network reachability, cloud formation) is reconciled with synchronous
//! callers. It works for any boolean condition.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::errors::{HarnessError, HarnessResult};

/// Run the escalation hook every this many retries.
pub const ESCALATION_INTERVAL: u32 = 50;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Description used when stabilization times out.
pub enum FailureMessage {
    /// Rendered as `"<msg> failed after <secs> seconds having retried <n> times"`.
    Static(String),
    /// Called with the elapsed time and retry count.
    Formatter(Box<dyn Fn(Duration, u32) -> String + Send>),
}

impl FailureMessage {
    pub fn formatter<F>(f: F) -> Self
    where
        F: Fn(Duration, u32) -> String + Send + 'static,
    {
        Self::Formatter(Box::new(f))
    }

    pub fn render(&self, elapsed: Duration, retries: u32) -> String {
        match self {
            Self::Static(msg) => format!(
                "{msg} failed after {:.2} seconds having retried {retries} times",
                elapsed.as_secs_f64()
            ),
            Self::Formatter(f) => f(elapsed, retries),
        }
    }
}

impl fmt::Debug for FailureMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(msg) => f.debug_tuple("Static").field(msg).finish(),
            Self::Formatter(_) => f.write_str("Formatter(..)"),
        }
    }
}

impl From<&str> for FailureMessage {
    fn from(msg: &str) -> Self {
        Self::Static(msg.to_string())
    }
}

impl From<String> for FailureMessage {
    fn from(msg: String) -> Self {
        Self::Static(msg)
    }
}

/// Parameters of one stabilization wait.
#[derive(Debug)]
pub struct StabilizeRequest {
    pub on_failure: FailureMessage,
    pub timeout: Duration,
    pub retry_delay: Duration,
}

impl StabilizeRequest {
    pub fn new(on_failure: impl Into<FailureMessage>) -> Self {
        Self {
            on_failure: on_failure.into(),
            timeout: DEFAULT_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// What the predicate sees on each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub retries: u32,
    /// Overall timeout, for predicates that size their own network timeout.
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilizeOutcome {
    pub elapsed: Duration,
    pub retries: u32,
}

/// Poll `predicate` until it returns `Ok(true)` or the timeout elapses.
///
/// The predicate runs immediately, then after every `retry_delay`. Every
/// [`ESCALATION_INTERVAL`] retries `escalate` runs; an error from it (or from
/// the predicate) ends the wait at once. On timeout the error carries the
/// elapsed time and retry count.
pub fn stabilize<P, E>(
    request: StabilizeRequest,
    mut predicate: P,
    mut escalate: E,
) -> HarnessResult<StabilizeOutcome>
where
    P: FnMut(Attempt) -> HarnessResult<bool>,
    E: FnMut() -> HarnessResult<()>,
{
    let start = Instant::now();
    let mut retries = 0u32;

    loop {
        let attempt = Attempt {
            retries,
            timeout: request.timeout,
        };
        if predicate(attempt)? {
            let elapsed = start.elapsed();
            debug!(retries, elapsed_ms = elapsed.as_millis() as u64, "stabilized");
            return Ok(StabilizeOutcome { elapsed, retries });
        }

        let elapsed = start.elapsed();
        if elapsed >= request.timeout {
            let message = request.on_failure.render(elapsed, retries);
            warn!(retries, elapsed_ms = elapsed.as_millis() as u64, "{message}");
            return Err(HarnessError::Timeout {
                message,
                elapsed,
                retries,
            });
        }

        // The last sleep never overshoots the deadline.
        thread::sleep(request.retry_delay.min(request.timeout - elapsed));
        retries += 1;

        if retries % ESCALATION_INTERVAL == 0 {
            debug!(retries, "still not stable, checking for latent errors");
            escalate()?;
        }
    }
}

/// [`stabilize`] without an escalation hook.
pub fn stabilize_simple<P>(request: StabilizeRequest, predicate: P) -> HarnessResult<StabilizeOutcome>
where
    P: FnMut(Attempt) -> HarnessResult<bool>,
{
    stabilize(request, predicate, || Ok(()))
}
