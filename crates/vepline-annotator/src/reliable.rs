use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use vepline_core::{AnnotationError, AnnotationRecord, AnnotationService, ProcessingMode};
use vepline_settings::{ModeBudget, ReliabilitySettings};

/// Largest rolling window the packed breaker state can hold.
pub const MAX_WINDOW: u32 = 32;

/// Configuration for [`ReliableAnnotator`].
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
    /// Number of most recent outcomes the breaker looks at.
    pub window: u32,
    pub failure_ratio: f64,
    pub cooldown: Duration,
    /// Hard limit on a single attempt.
    pub call_timeout: Duration,
    /// Retry budget overrides by mode. Breaker settings are never per mode.
    pub per_mode: HashMap<ProcessingMode, BudgetOverride>,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self::from(&ReliabilitySettings::default())
    }
}

impl From<&ReliabilitySettings> for ReliableConfig {
    fn from(s: &ReliabilitySettings) -> Self {
        let mut per_mode = HashMap::new();
        for (name, budget) in &s.per_mode {
            match ProcessingMode::parse(name) {
                Some(mode) => {
                    per_mode.insert(mode, BudgetOverride::from(budget));
                }
                None => warn!(mode = %name, "unknown mode in reliability.perMode, ignoring"),
            }
        }
        Self {
            max_retries: s.max_retries,
            backoff: s.backoff(),
            window: s.breaker_window,
            failure_ratio: s.breaker_failure_ratio,
            cooldown: s.breaker_cooldown(),
            call_timeout: s.call_timeout(),
            per_mode,
        }
    }
}

impl ReliableConfig {
    /// Effective budget for one call in `mode`.
    pub fn budget(&self, mode: ProcessingMode) -> RetryBudget {
        let o = self.per_mode.get(&mode).copied().unwrap_or_default();
        RetryBudget {
            max_retries: o.max_retries.unwrap_or(self.max_retries),
            backoff: o.backoff.unwrap_or(self.backoff),
            call_timeout: o.call_timeout.unwrap_or(self.call_timeout),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryBudget {
    pub max_retries: u32,
    pub backoff: Duration,
    pub call_timeout: Duration,
}

/// Unset fields inherit from [`ReliableConfig`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BudgetOverride {
    pub max_retries: Option<u32>,
    pub backoff: Option<Duration>,
    pub call_timeout: Option<Duration>,
}

impl From<&ModeBudget> for BudgetOverride {
    fn from(b: &ModeBudget) -> Self {
        Self {
            max_retries: b.max_retries,
            backoff: b.backoff_ms.map(Duration::from_millis),
            call_timeout: b.call_timeout_ms.map(Duration::from_millis),
        }
    }
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// How a call was let through the breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
    Closed,
    /// The single probe call allowed after the cool-down.
    Trial,
}

/// Failure-ratio circuit breaker over a rolling window of outcomes.
///
/// All state lives in atomics so concurrent calls never serialize on it.
/// The window is packed into one `u64`: the low 32 bits are a failure
/// bitmask (newest outcome in bit 0) and the high bits hold how many slots
/// are filled.
struct CircuitBreaker {
    window: u32,
    failure_ratio: f64,
    cooldown: Duration,
    state: AtomicU8,
    outcomes: AtomicU64,
    opened_at_ms: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    fn new(window: u32, failure_ratio: f64, cooldown: Duration) -> Self {
        Self {
            window: window.clamp(1, MAX_WINDOW),
            failure_ratio,
            cooldown,
            state: AtomicU8::new(CLOSED),
            outcomes: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn window_mask(&self) -> u64 {
        if self.window >= 32 {
            u32::MAX as u64
        } else {
            (1u64 << self.window) - 1
        }
    }

    /// `None` means the call must be short-circuited.
    fn admit(&self) -> Option<Admission> {
        match self.state.load(Ordering::Acquire) {
            CLOSED => Some(Admission::Closed),
            OPEN => {
                let since = self.now_ms().saturating_sub(self.opened_at_ms.load(Ordering::Acquire));
                if since < self.cooldown.as_millis() as u64 {
                    return None;
                }
                // Only one caller wins the transition and becomes the trial.
                self.state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .ok()
                    .map(|_| Admission::Trial)
            }
            _ => None,
        }
    }

    fn record(&self, admission: Admission, outcome: &Result<Vec<AnnotationRecord>, AnnotationError>) {
        let failed = matches!(outcome, Err(e) if e.counts_toward_breaker());

        if admission == Admission::Trial {
            if failed {
                self.trip("half-open trial failed");
            } else {
                self.outcomes.store(0, Ordering::Release);
                self.state.store(CLOSED, Ordering::Release);
                info!("circuit breaker closed after successful trial");
            }
            return;
        }

        // Caller-side errors say nothing about service health.
        if let Err(e) = outcome {
            if !e.counts_toward_breaker() {
                return;
            }
        }

        let mask = self.window_mask();
        let window = u64::from(self.window);
        let prev = self
            .outcomes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| {
                let filled = ((packed >> 32) + 1).min(window);
                let bits = (((packed & mask) << 1) | u64::from(failed)) & mask;
                Some((filled << 32) | bits)
            })
            .unwrap_or_default();
        let filled = ((prev >> 32) + 1).min(window);
        let bits = (((prev & mask) << 1) | u64::from(failed)) & mask;

        if failed && filled == window {
            let failures = bits.count_ones() as f64;
            if failures / window as f64 >= self.failure_ratio {
                self.trip("failure ratio reached");
            }
        }
    }

    fn trip(&self, reason: &'static str) {
        self.opened_at_ms.store(self.now_ms(), Ordering::Release);
        let prev = self.state.swap(OPEN, Ordering::AcqRel);
        self.outcomes.store(0, Ordering::Release);
        if prev != OPEN {
            warn!(
                reason,
                window = self.window,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "circuit breaker opened"
            );
        }
    }

    fn failures_in_window(&self) -> u32 {
        (self.outcomes.load(Ordering::Acquire) & self.window_mask()).count_ones()
    }

    fn state_name(&self) -> &'static str {
        match self.state.load(Ordering::Acquire) {
            CLOSED => "closed",
            OPEN => "open",
            _ => "half_open",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReliabilityStats {
    pub circuit_state: &'static str,
    pub total_retries: u64,
    pub failures_in_window: u32,
}

/// Wraps an [`AnnotationService`] with bounded retry, a circuit breaker,
/// and a per-attempt timeout.
///
/// - Retryable errors (transient, network, timeout) are retried up to
///   `max_retries` times with a fixed backoff
/// - Every attempt passes through the breaker; an open breaker returns
///   [`AnnotationError::ServiceUnavailable`] without calling the service
/// - Malformed-request and mapping errors are returned immediately
pub struct ReliableAnnotator {
    inner: Arc<dyn AnnotationService>,
    config: ReliableConfig,
    breaker: CircuitBreaker,
    total_retries: AtomicU64,
}

impl ReliableAnnotator {
    pub fn new(inner: Arc<dyn AnnotationService>, config: ReliableConfig) -> Self {
        let breaker = CircuitBreaker::new(config.window, config.failure_ratio, config.cooldown);
        Self {
            inner,
            config,
            breaker,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: Arc<dyn AnnotationService>) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn circuit_state_name(&self) -> &'static str {
        self.breaker.state_name()
    }

    pub fn stats(&self) -> ReliabilityStats {
        ReliabilityStats {
            circuit_state: self.breaker.state_name(),
            total_retries: self.total_retries(),
            failures_in_window: self.breaker.failures_in_window(),
        }
    }

    async fn attempt(
        &self,
        notations: &[String],
        mode: ProcessingMode,
        call_timeout: Duration,
    ) -> Result<Vec<AnnotationRecord>, AnnotationError> {
        match tokio::time::timeout(call_timeout, self.inner.annotate_for(notations, mode)).await {
            Ok(result) => result,
            Err(_) => Err(AnnotationError::Timeout(call_timeout)),
        }
    }

    async fn call(
        &self,
        notations: &[String],
        mode: ProcessingMode,
    ) -> Result<Vec<AnnotationRecord>, AnnotationError> {
        let budget = self.config.budget(mode);
        let mut attempt = 0u32;
        loop {
            let Some(admission) = self.breaker.admit() else {
                warn!(service = self.inner.name(), attempt, "circuit open, short-circuiting call");
                return Err(AnnotationError::ServiceUnavailable);
            };

            let outcome = self.attempt(notations, mode, budget.call_timeout).await;
            self.breaker.record(admission, &outcome);

            match outcome {
                Ok(records) => return Ok(records),
                Err(e) if e.is_retryable() && attempt < budget.max_retries => {
                    attempt += 1;
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        attempt,
                        max_retries = budget.max_retries,
                        mode = %mode,
                        delay_ms = budget.backoff.as_millis() as u64,
                        error_kind = e.error_kind(),
                        error = %e,
                        "retrying annotation call"
                    );
                    tokio::time::sleep(budget.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl AnnotationService for ReliableAnnotator {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn batch_limit(&self) -> usize {
        self.inner.batch_limit()
    }

    async fn annotate(&self, notations: &[String]) -> Result<Vec<AnnotationRecord>, AnnotationError> {
        self.call(notations, ProcessingMode::Standard).await
    }

    async fn annotate_for(
        &self,
        notations: &[String],
        mode: ProcessingMode,
    ) -> Result<Vec<AnnotationRecord>, AnnotationError> {
        self.call(notations, mode).await
    }

    async fn ping(&self) -> Result<(), AnnotationError> {
        self.inner.ping().await
    }
}
