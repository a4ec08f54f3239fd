//! Per-route circuit breaker.
//!
//! # States
//! - Closed: every call is permitted; outcomes feed a count-based sliding
//!   window. Once `minimum_calls` outcomes are present and the failure rate
//!   reaches the threshold the breaker opens.
//! - Open: every call is rejected until the cool-down elapses.
//! - Half-Open: exactly `half_open_trial_calls` permits are handed out. Any
//!   failed trial re-opens the breaker with a longer cool-down (capped); once
//!   every trial succeeds the breaker closes and the window is reset.
//!
//! # Concurrency
//! Permission checks and outcome recording are serialized on one mutex.
//! Every transition bumps an epoch and each [`CallPermit`] carries the epoch
//! it was issued in, so an outcome that arrives after a transition is
//! discarded instead of being counted against the new state.
use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    config::CircuitBreakerConfig,
    core::error::{GatewayError, GatewayResult},
    metrics,
};

/// Resolved breaker thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    /// Failure percentage (0, 100] at which a closed breaker opens.
    pub failure_rate_threshold: f64,
    /// Outcomes required in the window before the rate is evaluated.
    pub minimum_calls: u32,
    /// Number of most recent outcomes kept in the window.
    pub sliding_window_size: u32,
    /// Initial open-state cool-down.
    pub open_duration: Duration,
    /// Upper bound for the cool-down after repeated failed recoveries.
    pub max_open_duration: Duration,
    /// Cool-down growth factor applied on each Half-Open -> Open.
    pub open_backoff_multiplier: f64,
    /// Trial calls admitted while Half-Open.
    pub half_open_trial_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            minimum_calls: 20,
            sliding_window_size: 20,
            open_duration: Duration::from_secs(10),
            max_open_duration: Duration::from_secs(300),
            open_backoff_multiplier: 2.0,
            half_open_trial_calls: 3,
        }
    }
}

impl BreakerSettings {
    /// Resolve a configuration entry, parsing its humantime durations.
    pub fn from_config(config: &CircuitBreakerConfig) -> GatewayResult<Self> {
        let parse = |field: &str, value: &str| {
            humantime::parse_duration(value).map_err(|e| {
                GatewayError::Configuration(format!(
                    "circuit breaker {field} '{value}' is not a valid duration: {e}"
                ))
            })
        };
        Ok(Self {
            failure_rate_threshold: config.failure_rate_threshold,
            minimum_calls: config.minimum_calls,
            sliding_window_size: config.sliding_window_size,
            open_duration: parse("open_duration", &config.open_duration)?,
            max_open_duration: parse("max_open_duration", &config.max_open_duration)?,
            open_backoff_multiplier: config.open_backoff_multiplier,
            half_open_trial_calls: config.half_open_trial_calls,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn gauge_value(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Result of a permitted call, as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

/// Point-in-time view used by the status endpoint and tests.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub calls_in_window: usize,
    pub failures_in_window: u32,
    pub failure_rate: f64,
    pub open_remaining_ms: Option<u64>,
    pub current_open_duration_ms: u64,
    pub trials_issued: u32,
    pub trials_succeeded: u32,
    pub times_opened: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    epoch: u64,
    /// `true` marks a failure.
    window: VecDeque<bool>,
    failures: u32,
    open_until: Option<Instant>,
    current_open_duration: Duration,
    trials_issued: u32,
    trials_succeeded: u32,
    times_opened: u64,
}

impl Inner {
    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            f64::from(self.failures) * 100.0 / self.window.len() as f64
        }
    }

    fn clear_window(&mut self) {
        self.window.clear();
        self.failures = 0;
    }
}

/// State machine guarding calls for one route.
///
/// Clones are handles to the same state; a [`CallPermit`] keeps one so it can
/// be settled after the dispatcher has returned, once the response body ends.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let name = name.into();
        metrics::set_breaker_state(&name, BreakerState::Closed.gauge_value());
        let inner = Inner {
            state: BreakerState::Closed,
            epoch: 0,
            window: VecDeque::with_capacity(settings.sliding_window_size as usize),
            failures: 0,
            open_until: None,
            current_open_duration: settings.open_duration,
            trials_issued: 0,
            trials_succeeded: 0,
            times_opened: 0,
        };
        Self {
            shared: Arc::new(Shared {
                name,
                settings,
                inner: Mutex::new(inner),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.shared.settings
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The critical sections never panic midway; a poisoned lock still
        // holds consistent state.
        match self.shared.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Ask for permission to call upstream.
    pub fn try_acquire(&self) -> GatewayResult<CallPermit> {
        self.try_acquire_at(Instant::now())
    }

    /// [`try_acquire`](Self::try_acquire) against an explicit clock reading.
    pub fn try_acquire_at(&self, now: Instant) -> GatewayResult<CallPermit> {
        let mut inner = self.lock();

        if inner.state == BreakerState::Open {
            match inner.open_until {
                Some(until) if now >= until => self.transition(&mut inner, BreakerState::HalfOpen, now),
                _ => return Err(self.rejected()),
            }
        }

        match inner.state {
            BreakerState::Closed => Ok(CallPermit::new(self.clone(), inner.epoch, false)),
            BreakerState::HalfOpen if inner.trials_issued < self.shared.settings.half_open_trial_calls => {
                inner.trials_issued += 1;
                tracing::debug!(
                    route = %self.shared.name,
                    trial = inner.trials_issued,
                    of = self.shared.settings.half_open_trial_calls,
                    "Circuit breaker admitted half-open trial call"
                );
                Ok(CallPermit::new(self.clone(), inner.epoch, true))
            }
            _ => Err(self.rejected()),
        }
    }

    fn rejected(&self) -> GatewayError {
        GatewayError::BreakerOpen {
            route: self.shared.name.clone(),
        }
    }

    fn on_outcome(&self, epoch: u64, trial: bool, outcome: CallOutcome, now: Instant) {
        let mut inner = self.lock();
        if epoch != inner.epoch {
            tracing::trace!(route = %self.shared.name, "Discarding outcome from a previous breaker state");
            return;
        }

        match inner.state {
            BreakerState::Closed => {
                let failed = outcome == CallOutcome::Failure;
                inner.window.push_back(failed);
                if failed {
                    inner.failures += 1;
                }
                while inner.window.len() > self.shared.settings.sliding_window_size as usize {
                    if inner.window.pop_front() == Some(true) {
                        inner.failures -= 1;
                    }
                }
                if inner.window.len() >= self.shared.settings.minimum_calls as usize
                    && inner.failure_rate() >= self.shared.settings.failure_rate_threshold
                {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            BreakerState::HalfOpen if trial => match outcome {
                CallOutcome::Failure => {
                    inner.current_open_duration = grow_open_duration(
                        inner.current_open_duration,
                        self.shared.settings.open_backoff_multiplier,
                        self.shared.settings.max_open_duration,
                    );
                    self.transition(&mut inner, BreakerState::Open, now);
                }
                CallOutcome::Success => {
                    inner.trials_succeeded += 1;
                    if inner.trials_succeeded >= self.shared.settings.half_open_trial_calls {
                        inner.current_open_duration = self.shared.settings.open_duration;
                        self.transition(&mut inner, BreakerState::Closed, now);
                    }
                }
            },
            _ => {}
        }
    }

    fn on_abandoned(&self, epoch: u64, trial: bool) {
        if !trial {
            return;
        }
        let mut inner = self.lock();
        if inner.epoch == epoch && inner.state == BreakerState::HalfOpen {
            inner.trials_issued = inner.trials_issued.saturating_sub(1);
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.epoch += 1;
        inner.trials_issued = 0;
        inner.trials_succeeded = 0;

        match to {
            BreakerState::Open => {
                inner.open_until = Some(now + inner.current_open_duration);
                inner.times_opened += 1;
                tracing::warn!(
                    route = %self.shared.name,
                    %from,
                    failure_rate = inner.failure_rate(),
                    cool_down = ?inner.current_open_duration,
                    "Circuit breaker opened"
                );
                inner.clear_window();
            }
            BreakerState::HalfOpen => {
                inner.open_until = None;
                tracing::info!(route = %self.shared.name, %from, "Circuit breaker half-open");
            }
            BreakerState::Closed => {
                inner.open_until = None;
                inner.clear_window();
                tracing::info!(route = %self.shared.name, %from, "Circuit breaker closed");
            }
        }
        metrics::set_breaker_state(&self.shared.name, to.gauge_value());
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            calls_in_window: inner.window.len(),
            failures_in_window: inner.failures,
            failure_rate: inner.failure_rate(),
            open_remaining_ms: inner
                .open_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64),
            current_open_duration_ms: inner.current_open_duration.as_millis() as u64,
            trials_issued: inner.trials_issued,
            trials_succeeded: inner.trials_succeeded,
            times_opened: inner.times_opened,
        }
    }
}

/// Permission for one upstream call.
///
/// Report the result with [`record`](Self::record). A permit dropped without
/// a result (the request was cancelled) is released without affecting the
/// statistics; a half-open trial slot it held becomes available again.
#[must_use = "a permit must be settled with the call outcome"]
#[derive(Debug)]
pub struct CallPermit {
    breaker: CircuitBreaker,
    epoch: u64,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    fn new(breaker: CircuitBreaker, epoch: u64, trial: bool) -> Self {
        Self {
            breaker,
            epoch,
            trial,
            settled: false,
        }
    }

    /// Whether this permit is one of the Half-Open trial calls.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record(self, outcome: CallOutcome) {
        self.record_at(outcome, Instant::now());
    }

    pub fn record_at(mut self, outcome: CallOutcome, now: Instant) {
        self.settled = true;
        self.breaker.on_outcome(self.epoch, self.trial, outcome, now);
    }

    pub fn success(self) {
        self.record(CallOutcome::Success);
    }

    pub fn failure(self) {
        self.record(CallOutcome::Failure);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.epoch, self.trial);
        }
    }
}

/// Next Open cool-down after a failed trial, saturating at `max`.
fn grow_open_duration(current: Duration, multiplier: f64, max: Duration) -> Duration {
    Duration::try_from_secs_f64(current.as_secs_f64() * multiplier).map_or(max, |d| d.min(max))
}
