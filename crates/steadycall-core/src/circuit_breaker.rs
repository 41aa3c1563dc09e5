use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::provider::{duration_ms, ProviderConfig};
use crate::ProviderId;

/// Runtime circuit state for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    trial_started_at: Option<Instant>,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            trial_started_at: None,
        }
    }
}

/// Thread-safe circuit breaker guarding one provider.
///
/// Outcomes are reported once per orchestration run, never once per retry.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider_id: ProviderId,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(provider_id: ProviderId, config: CircuitBreakerConfig) -> Self {
        Self {
            provider_id,
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Eligibility check. In `Open` this may advance to `HalfOpen` and grant
    /// the single trial call; while that trial is outstanding it answers false.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure_at
                    .is_some_and(|at| at.elapsed() > self.config.cooldown);

                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started_at = Some(Instant::now());
                    info!(provider = %self.provider_id, "circuit half-open; allowing one trial call");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // A trial whose outcome never arrived (e.g. the caller was
                // cancelled) is reissued after another cooldown.
                let abandoned = inner
                    .trial_started_at
                    .is_some_and(|at| at.elapsed() > self.config.cooldown);
                if abandoned {
                    inner.trial_started_at = Some(Instant::now());
                }
                abandoned
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(provider = %self.provider_id, "circuit closed after successful trial");
        }
        *inner = CircuitInner::default();
    }

    pub fn on_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        if inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold
        {
            if inner.state != CircuitState::Open {
                warn!(
                    provider = %self.provider_id,
                    consecutive_failures = inner.consecutive_failures,
                    cooldown_ms = duration_ms(self.config.cooldown),
                    "circuit opened"
                );
            }
            inner.state = CircuitState::Open;
            inner.last_failure_at = Some(Instant::now());
            inner.trial_started_at = None;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            provider_id: self.provider_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            cooldown_ms: duration_ms(self.config.cooldown),
            cooldown_remaining_ms: match (inner.state, inner.last_failure_at) {
                (CircuitState::Open, Some(at)) => {
                    Some(duration_ms(self.config.cooldown.saturating_sub(at.elapsed())))
                }
                _ => None,
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        // The guarded data is plain counters; a panic elsewhere cannot leave it torn.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Point-in-time view of a breaker for diagnostics output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub provider_id: ProviderId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_ms: Option<u64>,
}

/// Process-wide breaker memory, one breaker per provider.
///
/// Construct once at startup and share through `Arc` with every orchestrator.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<BTreeMap<ProviderId, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs<'a>(configs: impl IntoIterator<Item = &'a ProviderConfig>) -> Self {
        let registry = Self::new();
        for config in configs {
            registry.breaker_for(config);
        }
        registry
    }

    /// Returns the provider's breaker, creating it from `config` on first use.
    pub fn breaker_for(&self, config: &ProviderConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        breakers
            .entry(config.id.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(config.id.clone(), config.breaker_config()))
            })
            .clone()
    }

    pub fn get(&self, provider_id: &ProviderId) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(provider_id)
            .cloned()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .map(|breaker| breaker.snapshot())
            .collect()
    }
}
