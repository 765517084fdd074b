//! Per-endpoint circuit breakers.
//!
//! A circuit breaker guards operations against a single DICOM node.
//! Failures within a sliding window open the circuit,
//! after which calls fail fast until a reset timeout has elapsed;
//! the circuit then lets probe calls through (half-open)
//! and closes again once enough of them succeed in a row.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use snafu::{ensure, Backtrace, Snafu};
use tracing::{debug, warn};

/// The operational state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast until the reset timeout elapses.
    Open,
    /// Probe calls are let through;
    /// a failure re-opens the circuit.
    HalfOpen,
}

/// A rejected circuit breaker setting.
#[derive(Debug, Snafu)]
#[snafu(display("invalid circuit breaker setting `{}`", setting))]
pub struct InvalidConfigError {
    setting: &'static str,
    backtrace: Backtrace,
}

/// Validated circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    failure_window: Duration,
}

impl CircuitBreakerConfig {
    /// Create a configuration,
    /// rejecting zero thresholds and sub-second timings.
    pub fn new(
        failure_threshold: u32,
        success_threshold: u32,
        reset_timeout: Duration,
        failure_window: Duration,
    ) -> Result<Self, InvalidConfigError> {
        ensure!(
            failure_threshold >= 1,
            InvalidConfigSnafu {
                setting: "failure_threshold"
            }
        );
        ensure!(
            success_threshold >= 1,
            InvalidConfigSnafu {
                setting: "success_threshold"
            }
        );
        ensure!(
            reset_timeout >= Duration::from_secs(1),
            InvalidConfigSnafu {
                setting: "reset_timeout"
            }
        );
        ensure!(
            failure_window >= Duration::from_secs(1),
            InvalidConfigSnafu {
                setting: "failure_window"
            }
        );
        Ok(CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            reset_timeout,
            failure_window,
        })
    }

    /// A trigger-happy preset: trips after 3 failures in 30 seconds,
    /// retries after 15 seconds, closes after one success.
    pub fn aggressive() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(15),
            failure_window: Duration::from_secs(30),
        }
    }

    /// A tolerant preset: trips after 10 failures in 120 seconds,
    /// retries after 60 seconds, closes after three successes.
    pub fn conservative() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 10,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            failure_window: Duration::from_secs(120),
        }
    }

    #[cfg(test)]
    fn unchecked(
        failure_threshold: u32,
        success_threshold: u32,
        reset_timeout: Duration,
        failure_window: Duration,
    ) -> Self {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            reset_timeout,
            failure_window,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
        }
    }
}

/// A point-in-time snapshot of a breaker's counters and state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerStatistics {
    pub state: CircuitState,
    pub total_successes: u64,
    pub total_failures: u64,
    pub times_opened: u64,
    /// failures currently inside the sliding window
    pub recent_failures: usize,
    /// consecutive successes observed in the half-open state
    pub consecutive_successes: u32,
}

/// The outcome of a guarded operation.
#[derive(Debug, Snafu)]
pub enum ExecuteError<E>
where
    E: std::error::Error + 'static,
{
    #[snafu(display(
        "circuit open for {}:{}, retry after {:?}",
        host,
        port,
        retry_after
    ))]
    CircuitOpen {
        host: String,
        port: u16,
        retry_after: Duration,
        backtrace: Backtrace,
    },

    /// the guarded operation failed
    Operation { source: E },
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    recent_failures: VecDeque<Instant>,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    times_opened: u64,
}

impl Inner {
    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(&oldest) = self.recent_failures.front() {
            if now.duration_since(oldest) > window {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.times_opened += 1;
        self.consecutive_successes = 0;
    }
}

/// A circuit breaker guarding operations against one endpoint.
///
/// All bookkeeping happens behind a mutex;
/// the guarded operation itself runs without the lock held.
#[derive(Debug)]
pub struct CircuitBreaker {
    host: String,
    port: u16,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(host: impl Into<String>, port: u16, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            host: host.into(),
            port,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                recent_failures: VecDeque::new(),
                consecutive_successes: 0,
                opened_at: None,
                total_successes: 0,
                total_failures: 0,
                times_opened: 0,
            }),
        }
    }

    /// Run the given operation under this breaker.
    ///
    /// Fails fast with [`ExecuteError::CircuitOpen`]
    /// when the circuit is open and the retry time has not been reached;
    /// otherwise runs the operation and records its outcome.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        if let Some(retry_after) = self.try_acquire() {
            return CircuitOpenSnafu {
                host: self.host.clone(),
                port: self.port,
                retry_after,
            }
            .fail();
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(ExecuteError::Operation { source: e })
            }
        }
    }

    /// The current state,
    /// after applying window pruning and the open-to-half-open promotion.
    pub fn state(&self) -> CircuitState {
        self.try_acquire();
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// A snapshot of the breaker's counters.
    pub fn statistics(&self) -> CircuitBreakerStatistics {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.prune(self.config.failure_window, Instant::now());
        CircuitBreakerStatistics {
            state: inner.state,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            times_opened: inner.times_opened,
            recent_failures: inner.recent_failures.len(),
            consecutive_successes: inner.consecutive_successes,
        }
    }

    /// Trip the circuit open, regardless of the recorded failures.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        warn!(host = %self.host, port = self.port, "circuit breaker forced open");
        inner.open(Instant::now());
    }

    /// Close the circuit and clear the operational state.
    /// The lifetime counters are kept.
    pub fn force_closed(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        warn!(host = %self.host, port = self.port, "circuit breaker forced closed");
        inner.state = CircuitState::Closed;
        inner.recent_failures.clear();
        inner.consecutive_successes = 0;
        inner.opened_at = None;
    }

    /// Record a success against this breaker.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        inner.prune(self.config.failure_window, now);
        inner.total_successes += 1;
        if inner.state == CircuitState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                debug!(host = %self.host, port = self.port, "circuit breaker closed");
                inner.state = CircuitState::Closed;
                inner.recent_failures.clear();
                inner.consecutive_successes = 0;
                inner.opened_at = None;
            }
        }
    }

    /// Record a failure against this breaker.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        inner.prune(self.config.failure_window, now);
        inner.total_failures += 1;
        inner.recent_failures.push_back(now);
        match inner.state {
            CircuitState::Closed => {
                if inner.recent_failures.len() >= self.config.failure_threshold as usize {
                    warn!(
                        host = %self.host,
                        port = self.port,
                        failures = inner.recent_failures.len(),
                        "circuit breaker opened"
                    );
                    inner.open(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(host = %self.host, port = self.port, "circuit breaker re-opened");
                inner.open(now);
            }
            CircuitState::Open => {}
        }
    }

    /// Check whether a call may proceed.
    ///
    /// Returns the remaining wait time when the circuit stays open;
    /// promotes an expired open circuit to half-open.
    fn try_acquire(&self) -> Option<Duration> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        inner.prune(self.config.failure_window, now);
        if inner.state != CircuitState::Open {
            return None;
        }
        let opened_at = inner.opened_at?;
        let elapsed = now.duration_since(opened_at);
        if elapsed >= self.config.reset_timeout {
            debug!(host = %self.host, port = self.port, "circuit breaker half-open");
            inner.state = CircuitState::HalfOpen;
            inner.consecutive_successes = 0;
            None
        } else {
            Some(self.config.reset_timeout - elapsed)
        }
    }
}

/// A process-wide collection of circuit breakers,
/// one per `host:port` endpoint.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers share the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreakerRegistry {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Obtain the breaker for the given endpoint,
    /// creating it on first use.
    pub fn breaker_for(&self, host: &str, port: u16) -> Arc<CircuitBreaker> {
        let key = format!("{}:{}", host, port);
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(key)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(host, port, self.config.clone()))
            })
            .clone()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        CircuitBreakerRegistry::new(CircuitBreakerConfig::default())
    }
}
