//! Circuit breakers isolating the gateway from a slow or failing verifier.
//!
//! Each named dependency gets its own [`CircuitBreaker`]. Calls are bounded
//! by a concurrency limit and a timeout, and their outcomes are kept in a
//! rolling window. When enough calls in the window fail, the breaker opens
//! and fails fast until a cooldown elapses, then lets a few probes through.
//!
//! # State Machine
//!
//! ```text
//! ┌────────┐  error % >= threshold  ┌──────┐  sleep_window  ┌──────────┐
//! │ Closed │ ───(volume reached)──→ │ Open │ ───elapsed───→ │ HalfOpen │
//! └────────┘                        └──────┘ ←─probe fails─ └──────────┘
//!      ↑                                                         │
//!      └────────────────────── probe succeeds ───────────────────┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 100;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_ERROR_THRESHOLD_PERCENTAGE: u8 = 50;
pub const DEFAULT_REQUEST_VOLUME_THRESHOLD: u32 = 20;
pub const DEFAULT_SLEEP_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_ROLLING_WINDOW: Duration = Duration::from_secs(10);
pub const DEFAULT_HALF_OPEN_MAX_PROBES: u32 = 1;

/// Number of buckets the rolling window is divided into.
const WINDOW_BUCKETS: u32 = 10;

/// Why a call through a breaker did not produce a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// The breaker is open (or its half-open probes are all in use).
    #[error("circuit breaker is open")]
    Open,
    /// The concurrency limit was reached.
    #[error("circuit breaker rejected the call: too many concurrent requests")]
    Rejected,
    /// The call did not complete within the configured timeout.
    #[error("call timed out")]
    Timeout,
    /// The call completed with an error.
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BreakerConfigError {
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        field: &'static str,
        min: String,
        value: String,
    },
    #[error("{field} must be positive")]
    MustBePositive { field: &'static str },
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: u32,
        max: u32,
        value: u32,
    },
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; all requests pass through.
    Closed,
    /// Requests are rejected immediately until `until`.
    Open { until: Instant },
    /// A limited number of probe requests are allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open { .. } => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for one circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    max_concurrent_requests: usize,
    timeout: Duration,
    error_threshold_percentage: u8,
    request_volume_threshold: u32,
    sleep_window: Duration,
    rolling_window: Duration,
    half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            timeout: DEFAULT_TIMEOUT,
            error_threshold_percentage: DEFAULT_ERROR_THRESHOLD_PERCENTAGE,
            request_volume_threshold: DEFAULT_REQUEST_VOLUME_THRESHOLD,
            sleep_window: DEFAULT_SLEEP_WINDOW,
            rolling_window: DEFAULT_ROLLING_WINDOW,
            half_open_max_probes: DEFAULT_HALF_OPEN_MAX_PROBES,
        }
    }
}

#[bon::bon]
impl CircuitBreakerConfig {
    /// Creates a new circuit breaker configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerConfigError`] if a count or duration is zero, or if
    /// `error_threshold_percentage` is outside `1..=100`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_CONCURRENT_REQUESTS)] max_concurrent_requests: usize,
        #[builder(default = DEFAULT_TIMEOUT)] timeout: Duration,
        #[builder(default = DEFAULT_ERROR_THRESHOLD_PERCENTAGE)] error_threshold_percentage: u8,
        #[builder(default = DEFAULT_REQUEST_VOLUME_THRESHOLD)] request_volume_threshold: u32,
        #[builder(default = DEFAULT_SLEEP_WINDOW)] sleep_window: Duration,
        #[builder(default = DEFAULT_ROLLING_WINDOW)] rolling_window: Duration,
        #[builder(default = DEFAULT_HALF_OPEN_MAX_PROBES)] half_open_max_probes: u32,
    ) -> Result<Self, BreakerConfigError> {
        if max_concurrent_requests == 0 {
            return Err(BreakerConfigError::BelowMinimum {
                field: "max_concurrent_requests",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if timeout.is_zero() {
            return Err(BreakerConfigError::MustBePositive { field: "timeout" });
        }
        if !(1..=100).contains(&error_threshold_percentage) {
            return Err(BreakerConfigError::OutOfRange {
                field: "error_threshold_percentage",
                min: 1,
                max: 100,
                value: u32::from(error_threshold_percentage),
            });
        }
        if request_volume_threshold == 0 {
            return Err(BreakerConfigError::BelowMinimum {
                field: "request_volume_threshold",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if sleep_window.is_zero() {
            return Err(BreakerConfigError::MustBePositive { field: "sleep_window" });
        }
        if rolling_window < Duration::from_millis(u64::from(WINDOW_BUCKETS)) {
            return Err(BreakerConfigError::BelowMinimum {
                field: "rolling_window",
                min: format!("{WINDOW_BUCKETS}ms"),
                value: format!("{rolling_window:?}"),
            });
        }
        if half_open_max_probes == 0 {
            return Err(BreakerConfigError::BelowMinimum {
                field: "half_open_max_probes",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(Self {
            max_concurrent_requests,
            timeout,
            error_threshold_percentage,
            request_volume_threshold,
            sleep_window,
            rolling_window,
            half_open_max_probes,
        })
    }

    #[must_use]
    pub fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn error_threshold_percentage(&self) -> u8 {
        self.error_threshold_percentage
    }

    #[must_use]
    pub fn request_volume_threshold(&self) -> u32 {
        self.request_volume_threshold
    }

    #[must_use]
    pub fn sleep_window(&self) -> Duration {
        self.sleep_window
    }

    #[must_use]
    pub fn rolling_window(&self) -> Duration {
        self.rolling_window
    }

    #[must_use]
    pub fn half_open_max_probes(&self) -> u32 {
        self.half_open_max_probes
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    started: Instant,
    successes: u32,
    failures: u32,
}

/// Outcome counts over the last `rolling_window`, kept in fixed-width buckets.
#[derive(Debug)]
struct RollingWindow {
    buckets: VecDeque<Bucket>,
    span: Duration,
    bucket_width: Duration,
}

impl RollingWindow {
    fn new(span: Duration) -> Self {
        Self {
            buckets: VecDeque::with_capacity(WINDOW_BUCKETS as usize + 1),
            span,
            bucket_width: span / WINDOW_BUCKETS,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if now.duration_since(front.started) >= self.span {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, now: Instant, failed: bool) {
        self.prune(now);
        let needs_bucket = self
            .buckets
            .back()
            .is_none_or(|bucket| now.duration_since(bucket.started) >= self.bucket_width);
        if needs_bucket {
            self.buckets.push_back(Bucket {
                started: now,
                successes: 0,
                failures: 0,
            });
        }
        let Some(current) = self.buckets.back_mut() else {
            return;
        };
        if failed {
            current.failures += 1;
        } else {
            current.successes += 1;
        }
    }

    /// `(total, failures)` in the window.
    fn totals(&mut self, now: Instant) -> (u32, u32) {
        self.prune(now);
        self.buckets.iter().fold((0, 0), |(total, failures), b| {
            (total + b.successes + b.failures, failures + b.failures)
        })
    }

    fn reset(&mut self) {
        self.buckets.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// Internal mutable state protected by a mutex.
#[derive(Debug)]
struct Inner {
    state: CircuitState,
    window: RollingWindow,
    in_flight: usize,
    probes_in_flight: u32,

    // Metrics counters
    successes: u64,
    failures: u64,
    timeouts: u64,
    rejections: u64,
    short_circuits: u64,
    cancelled: u64,
    state_transitions: u64,
}

/// A snapshot of circuit breaker metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub in_flight: usize,
    pub successes: u64,
    /// Calls that completed with an inner error.
    pub failures: u64,
    pub timeouts: u64,
    /// Calls refused by the concurrency limit.
    pub rejections: u64,
    /// Calls refused because the breaker was open.
    pub short_circuits: u64,
    /// Calls dropped before completing.
    pub cancelled: u64,
    pub state_transitions: u64,
}

/// Thread-safe circuit breaker for one named dependency.
///
/// All state is behind a `parking_lot::Mutex` with very short critical
/// sections; the lock is never held across an await point.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: RollingWindow::new(config.rolling_window),
                in_flight: 0,
                probes_in_flight: 0,
                successes: 0,
                failures: 0,
                timeouts: 0,
                rejections: 0,
                short_circuits: 0,
                cancelled: 0,
                state_transitions: 0,
            }),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Runs `fut` under the breaker.
    ///
    /// If the returned future is dropped before `fut` finishes, the
    /// concurrency slot is released and the call is counted as cancelled
    /// rather than failed.
    pub async fn call<F, T, E>(&self, fut: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire()?;
        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(Ok(value)) => {
                permit.complete(Outcome::Success);
                Ok(value)
            }
            Ok(Err(err)) => {
                permit.complete(Outcome::Failure);
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                permit.complete(Outcome::Timeout);
                Err(BreakerError::Timeout)
            }
        }
    }

    /// Like [`call`](Self::call), but hands any breaker or call error to
    /// `fallback`, whose result is returned instead.
    pub async fn call_with_fallback<F, T, E, G>(&self, fut: F, fallback: G) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        G: FnOnce(BreakerError<E>) -> Result<T, BreakerError<E>>,
    {
        match self.call(fut).await {
            Ok(value) => Ok(value),
            Err(err) => fallback(err),
        }
    }

    /// Whether calls are currently being short-circuited. An open breaker
    /// whose sleep window has elapsed reports `false`.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.state(), CircuitState::Open { .. })
    }

    /// Returns the current state of the circuit breaker.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        // Read-only peek; the transition itself happens on the next call.
        match inner.state {
            CircuitState::Open { until } if Instant::now() >= until => CircuitState::HalfOpen,
            other => other,
        }
    }

    /// Forces the breaker open for one sleep window.
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        self.open(&mut inner, "manual");
    }

    /// Returns a snapshot of circuit breaker metrics.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: match inner.state {
                CircuitState::Open { until } if Instant::now() >= until => CircuitState::HalfOpen,
                other => other,
            },
            in_flight: inner.in_flight,
            successes: inner.successes,
            failures: inner.failures,
            timeouts: inner.timeouts,
            rejections: inner.rejections,
            short_circuits: inner.short_circuits,
            cancelled: inner.cancelled,
            state_transitions: inner.state_transitions,
        }
    }

    fn acquire<E>(&self) -> Result<Permit<'_>, BreakerError<E>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if let CircuitState::Open { until } = inner.state {
            if now < until {
                inner.short_circuits += 1;
                return Err(BreakerError::Open);
            }
            inner.state = CircuitState::HalfOpen;
            inner.probes_in_flight = 0;
            inner.state_transitions += 1;
            tracing::info!(
                breaker = %self.name,
                previous_state = "open",
                new_state = "half_open",
                "circuit breaker transitioning to half-open for probe requests",
            );
        }

        match inner.state {
            CircuitState::HalfOpen => {
                if inner.probes_in_flight >= self.config.half_open_max_probes {
                    inner.short_circuits += 1;
                    return Err(BreakerError::Open);
                }
                inner.probes_in_flight += 1;
                inner.in_flight += 1;
                Ok(Permit {
                    breaker: self,
                    probe: true,
                    completed: false,
                })
            }
            _ => {
                if inner.in_flight >= self.config.max_concurrent_requests {
                    inner.rejections += 1;
                    inner.window.record(now, true);
                    self.maybe_trip(&mut inner, now);
                    return Err(BreakerError::Rejected);
                }
                inner.in_flight += 1;
                Ok(Permit {
                    breaker: self,
                    probe: false,
                    completed: false,
                })
            }
        }
    }

    fn release(&self, inner: &mut Inner, probe: bool) {
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if probe {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    fn finish(&self, probe: bool, outcome: Outcome) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.release(&mut inner, probe);

        match outcome {
            Outcome::Success => inner.successes += 1,
            Outcome::Failure => inner.failures += 1,
            Outcome::Timeout => inner.timeouts += 1,
        }
        let failed = outcome != Outcome::Success;

        match inner.state {
            CircuitState::HalfOpen if probe => {
                if failed {
                    self.open(&mut inner, "probe failed");
                } else {
                    inner.state = CircuitState::Closed;
                    inner.window.reset();
                    inner.state_transitions += 1;
                    tracing::info!(
                        breaker = %self.name,
                        previous_state = "half_open",
                        new_state = "closed",
                        "circuit breaker closed after successful probe",
                    );
                }
            }
            CircuitState::Closed => {
                inner.window.record(now, failed);
                if failed {
                    self.maybe_trip(&mut inner, now);
                }
            }
            // Calls admitted before the breaker opened finish here; their
            // outcome no longer affects the state.
            _ => {}
        }
    }

    fn maybe_trip(&self, inner: &mut Inner, now: Instant) {
        if inner.state != CircuitState::Closed {
            return;
        }
        let (total, failures) = inner.window.totals(now);
        if total < self.config.request_volume_threshold {
            return;
        }
        let error_percentage = u64::from(failures) * 100 / u64::from(total);
        if error_percentage >= u64::from(self.config.error_threshold_percentage) {
            tracing::warn!(
                breaker = %self.name,
                window_requests = total,
                window_failures = failures,
                error_percentage,
                "error threshold reached",
            );
            self.open(inner, "error threshold reached");
        }
    }

    fn open(&self, inner: &mut Inner, reason: &'static str) {
        let until = Instant::now() + self.config.sleep_window;
        let previous = inner.state;
        inner.state = CircuitState::Open { until };
        inner.window.reset();
        inner.state_transitions += 1;
        tracing::warn!(
            breaker = %self.name,
            previous_state = %previous,
            new_state = "open",
            reason,
            sleep_window_ms = self.config.sleep_window.as_millis() as u64,
            "circuit breaker opened",
        );
    }
}

/// A concurrency slot held for the duration of one call.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    completed: bool,
}

impl Permit<'_> {
    fn complete(mut self, outcome: Outcome) {
        self.completed = true;
        self.breaker.finish(self.probe, outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut inner = self.breaker.inner.lock();
        self.breaker.release(&mut inner, self.probe);
        inner.cancelled += 1;
        tracing::debug!(breaker = %self.breaker.name, "call cancelled before completion");
    }
}

/// Registry holding one breaker per dependency name.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    default_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakers {
    /// Breakers created on first use get `default_config`.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Installs a fresh breaker for `name`, replacing any existing one.
    pub fn configure(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        self.breakers
            .write()
            .insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// The breaker for `name`, created with the default configuration if needed.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
        });
        Arc::clone(breaker)
    }

    /// Runs `fut` under the breaker for `name`, routing failures through `fallback`.
    pub async fn run<F, T, E, G>(&self, name: &str, fut: F, fallback: G) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        G: FnOnce(BreakerError<E>) -> Result<T, BreakerError<E>>,
    {
        let breaker = self.get(name);
        breaker.call_with_fallback(fut, fallback).await
    }
}
