//! Provider fallback with per-provider retry and process-wide circuit breakers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::BreakerRegistry;
use crate::deadline::Deadline;
use crate::failure::{AggregateError, CallError, ErrorKind, FailureRecord};
use crate::provider::{ProviderConfig, ProviderPreference};
use crate::retry::BackoffRetryExecutor;
use crate::ProviderId;

/// Pause between a failed provider and the next candidate unless configured otherwise.
pub const DEFAULT_INTER_PROVIDER_PAUSE: Duration = Duration::from_millis(250);

/// Boxed future returned by a single provider call.
pub type CallFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CallError>> + Send + 'a>>;

/// One logical operation handed to the orchestrator.
///
/// The payload is opaque to the resilience layer; only the preference and the
/// request id influence orchestration.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest<P> {
    id: Uuid,
    payload: P,
    preference: ProviderPreference,
    metadata: BTreeMap<String, String>,
}

impl<P> OperationRequest<P> {
    pub fn new(payload: P) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            preference: ProviderPreference::Auto,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_preference(mut self, preference: ProviderPreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_language(self, language: impl Into<String>) -> Self {
        self.with_metadata("language", language)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn preference(&self) -> &ProviderPreference {
        &self.preference
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn language(&self) -> Option<&str> {
        self.metadata.get("language").map(String::as_str)
    }
}

/// Caller-facing result: the payload plus the provider that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult<T> {
    pub payload: T,
    pub provider_id: ProviderId,
}

/// Successful orchestration run with the full diagnostic trail.
#[derive(Debug, Clone)]
pub struct OrchestrationSuccess<T> {
    pub data: T,
    pub selected_provider: ProviderId,
    pub provider_chain: Vec<ProviderId>,
    /// Failures absorbed before the winning provider answered.
    pub failures: Vec<FailureRecord>,
    /// Calls made against the winning provider.
    pub attempts: u32,
    pub latency_ms: u64,
}

impl<T> OrchestrationSuccess<T> {
    pub fn into_result(self) -> OperationResult<T> {
        OperationResult {
            payload: self.data,
            provider_id: self.selected_provider,
        }
    }
}

/// Tries enabled providers in priority order until one succeeds.
///
/// Each candidate gets its own bounded retry budget. Breaker state comes from a
/// shared [`BreakerRegistry`] so quarantine carries across runs.
#[derive(Debug, Clone)]
pub struct ProviderOrchestrator {
    providers: Vec<ProviderConfig>,
    breakers: Arc<BreakerRegistry>,
    inter_provider_pause: Duration,
}

impl ProviderOrchestrator {
    pub fn new(providers: Vec<ProviderConfig>, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            providers,
            breakers,
            inter_provider_pause: DEFAULT_INTER_PROVIDER_PAUSE,
        }
    }

    /// Pause between a failed provider and the next candidate.
    pub fn with_inter_provider_pause(mut self, pause: Duration) -> Self {
        self.inter_provider_pause = pause;
        self
    }

    pub fn providers(&self) -> &[ProviderConfig] {
        &self.providers
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Enabled providers in attempt order, the preferred one first.
    ///
    /// An unknown or disabled preference is ignored.
    pub fn candidate_chain(&self, preference: &ProviderPreference) -> Vec<&ProviderConfig> {
        let mut chain = dedupe_chain(self.providers.iter().filter(|config| config.enabled));

        if let Some(preferred) = preference.preferred() {
            match chain.iter().position(|config| &config.id == preferred) {
                Some(index) => {
                    let config = chain.remove(index);
                    chain.insert(0, config);
                }
                None => debug!(provider = %preferred, "preferred provider unavailable; using default order"),
            }
        }

        chain
    }

    /// Runs `invoke` against each candidate until one succeeds.
    ///
    /// Every candidate yields either the success or exactly one failure record.
    /// Breakers see one outcome per run, never one per retry.
    pub async fn run<'r, P, T, F>(
        &'r self,
        request: &'r OperationRequest<P>,
        deadline: &Deadline,
        mut invoke: F,
    ) -> Result<OrchestrationSuccess<T>, AggregateError>
    where
        F: FnMut(&'r ProviderConfig, &'r OperationRequest<P>) -> CallFuture<'r, T>,
    {
        let started = Instant::now();
        let request_id = request.id();
        let chain = self.candidate_chain(request.preference());

        if chain.is_empty() {
            let reason = if self.providers.is_empty() {
                String::from("no providers are configured")
            } else {
                format!(
                    "all {} configured provider(s) are disabled; check credentials",
                    self.providers.len()
                )
            };
            warn!(%request_id, "{reason}");
            return Err(AggregateError::NoCandidates { reason });
        }

        let executor = BackoffRetryExecutor::new(deadline.clone());
        let total = chain.len();
        let mut provider_chain = Vec::with_capacity(total);
        let mut failures = Vec::new();

        for (index, config) in chain.into_iter().enumerate() {
            if let Err(error) = deadline.check() {
                return Err(interrupted(error, failures));
            }

            provider_chain.push(config.id.clone());
            let breaker = self.breakers.breaker_for(config);

            if !breaker.can_execute() {
                info!(%request_id, provider = %config.id, "provider quarantined; skipping");
                failures.push(FailureRecord::new(
                    config.id.clone(),
                    &CallError::quarantined(&config.id),
                    0,
                ));
                continue;
            }

            debug!(%request_id, provider = %config.id, "calling provider");
            let outcome = executor
                .execute(|| invoke(config, request), &config.retry_policy())
                .await;

            match outcome {
                Ok(retried) => {
                    breaker.on_success();
                    let latency_ms = elapsed_ms(started);
                    info!(
                        %request_id,
                        provider = %config.id,
                        attempts = retried.attempts,
                        fallbacks = failures.len(),
                        latency_ms,
                        "operation succeeded"
                    );
                    return Ok(OrchestrationSuccess {
                        data: retried.value,
                        selected_provider: config.id.clone(),
                        provider_chain,
                        failures,
                        attempts: retried.attempts,
                        latency_ms,
                    });
                }
                Err(failure) if failure.error.kind() == ErrorKind::Cancelled => {
                    // The caller gave up; that says nothing about the provider.
                    let reason = failure.error.message().to_owned();
                    failures.push(FailureRecord::new(
                        config.id.clone(),
                        &failure.error,
                        failure.attempts,
                    ));
                    warn!(%request_id, provider = %config.id, %reason, "operation interrupted");
                    return Err(AggregateError::Interrupted { reason, failures });
                }
                Err(failure) => {
                    breaker.on_failure();
                    warn!(
                        %request_id,
                        provider = %config.id,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "provider failed; falling back"
                    );
                    failures.push(FailureRecord::new(
                        config.id.clone(),
                        &failure.error,
                        failure.attempts,
                    ));

                    let has_next = index + 1 < total;
                    if has_next && !self.inter_provider_pause.is_zero() {
                        if let Err(error) = deadline.sleep(self.inter_provider_pause).await {
                            return Err(interrupted(error, failures));
                        }
                    }
                }
            }
        }

        warn!(
            %request_id,
            tried = failures.len(),
            latency_ms = elapsed_ms(started),
            "all providers failed"
        );
        Err(AggregateError::Exhausted { failures })
    }
}

/// One concrete implementation of an operation, bound to a provider id.
pub trait OperationProvider<P, T>: Send + Sync {
    fn id(&self) -> &ProviderId;

    fn call<'a>(&'a self, request: &'a OperationRequest<P>) -> CallFuture<'a, T>;
}

/// Couples an orchestrator with the provider implementations it schedules.
pub struct Invoker<P, T> {
    orchestrator: ProviderOrchestrator,
    implementations: HashMap<ProviderId, Arc<dyn OperationProvider<P, T>>>,
}

impl<P, T> Invoker<P, T> {
    pub fn new(
        orchestrator: ProviderOrchestrator,
        implementations: Vec<Arc<dyn OperationProvider<P, T>>>,
    ) -> Self {
        let implementations = implementations
            .into_iter()
            .map(|implementation| (implementation.id().clone(), implementation))
            .collect();
        Self {
            orchestrator,
            implementations,
        }
    }

    pub fn orchestrator(&self) -> &ProviderOrchestrator {
        &self.orchestrator
    }

    pub async fn invoke(
        &self,
        request: &OperationRequest<P>,
        deadline: &Deadline,
    ) -> Result<OperationResult<T>, AggregateError> {
        self.invoke_detailed(request, deadline)
            .await
            .map(OrchestrationSuccess::into_result)
    }

    pub async fn invoke_detailed(
        &self,
        request: &OperationRequest<P>,
        deadline: &Deadline,
    ) -> Result<OrchestrationSuccess<T>, AggregateError> {
        self.orchestrator
            .run(request, deadline, |config, request| {
                match self.implementations.get(&config.id) {
                    Some(implementation) => implementation.call(request),
                    None => missing_implementation(&config.id),
                }
            })
            .await
    }
}

fn missing_implementation<'a, T>(provider: &ProviderId) -> CallFuture<'a, T> {
    let message = format!("no implementation registered for provider '{provider}'");
    Box::pin(async move { Err(CallError::internal(message)) })
}

fn interrupted(error: CallError, failures: Vec<FailureRecord>) -> AggregateError {
    AggregateError::Interrupted {
        reason: error.message().to_owned(),
        failures,
    }
}

fn dedupe_chain<'a>(chain: impl Iterator<Item = &'a ProviderConfig>) -> Vec<&'a ProviderConfig> {
    let mut seen = HashSet::new();
    chain.filter(|config| seen.insert(&config.id)).collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn provider(id: &str) -> ProviderConfig {
        ProviderConfig::new(ProviderId::parse(id).expect("valid id"), id)
            .with_retry(2, Duration::from_millis(10), Duration::from_millis(20))
            .with_breaker(2, Duration::from_secs(60))
    }

    fn orchestrator(providers: Vec<ProviderConfig>) -> ProviderOrchestrator {
        ProviderOrchestrator::new(providers, Arc::new(BreakerRegistry::new()))
    }

    #[test]
    fn candidate_chain_moves_enabled_preference_to_front() {
        let orchestrator = orchestrator(vec![provider("gemini"), provider("openai"), provider("groq")]);
        let preference = ProviderPreference::Preferred(ProviderId::parse("groq").expect("id"));

        let chain = orchestrator
            .candidate_chain(&preference)
            .into_iter()
            .map(|config| config.id.as_str())
            .collect::<Vec<_>>();

        assert_eq!(chain, vec!["groq", "gemini", "openai"]);
    }

    #[test]
    fn candidate_chain_skips_disabled_and_duplicate_entries() {
        let orchestrator = orchestrator(vec![
            provider("gemini").with_enabled(false),
            provider("openai"),
            provider("openai"),
        ]);
        let preference = ProviderPreference::Preferred(ProviderId::parse("gemini").expect("id"));

        let chain = orchestrator.candidate_chain(&preference);

        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].id.as_str(), "openai");
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_after_permanent_failure_without_retrying_it() {
        let orchestrator = orchestrator(vec![provider("gemini"), provider("openai")]);
        let request = OperationRequest::new("clip.wav");
        let calls = Mutex::new(Vec::new());

        let success = orchestrator
            .run(&request, &Deadline::none(), |config, _| {
                calls
                    .lock()
                    .expect("lock")
                    .push(config.id.as_str().to_owned());
                let id = config.id.clone();
                Box::pin(async move {
                    if id.as_str() == "gemini" {
                        Err(CallError::invalid_input("unsupported audio codec"))
                    } else {
                        Ok("hello")
                    }
                })
            })
            .await
            .expect("openai succeeds");

        assert_eq!(success.data, "hello");
        assert_eq!(success.selected_provider.as_str(), "openai");
        assert_eq!(success.failures.len(), 1);
        assert_eq!(success.failures[0].error_kind, ErrorKind::InvalidInput);
        assert_eq!(success.failures[0].attempts_made, 1);
        assert_eq!(*calls.lock().expect("lock"), vec!["gemini", "openai"]);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_records_one_failure_per_run_not_per_retry() {
        let orchestrator = orchestrator(vec![provider("gemini")]);
        let request = OperationRequest::new(());
        let calls = AtomicU32::new(0);

        let error = orchestrator
            .run(&request, &Deadline::none(), |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err::<(), _>(CallError::overloaded("503")) })
            })
            .await
            .expect_err("always overloaded");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(error.failures()[0].attempts_made, 2);
        let breaker = orchestrator
            .breakers()
            .get(&ProviderId::parse("gemini").expect("id"))
            .expect("breaker exists");
        assert_eq!(breaker.consecutive_failures(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_is_recorded_as_quarantined_without_calling() {
        let orchestrator = orchestrator(vec![provider("gemini"), provider("openai")]);
        let gemini = orchestrator
            .breakers()
            .breaker_for(&orchestrator.providers()[0]);
        gemini.on_failure();
        gemini.on_failure();
        let request = OperationRequest::new(());

        let success = orchestrator
            .run(&request, &Deadline::none(), |config, _| {
                assert_eq!(config.id.as_str(), "openai", "quarantined provider was called");
                Box::pin(async { Ok(7) })
            })
            .await
            .expect("openai succeeds");

        assert_eq!(success.data, 7);
        assert_eq!(success.failures[0].error_kind, ErrorKind::ProviderQuarantined);
        assert_eq!(success.failures[0].attempts_made, 0);
        assert_eq!(success.provider_chain.len(), 2);
    }

    #[tokio::test]
    async fn all_disabled_reports_no_candidates_without_calls() {
        let orchestrator = orchestrator(vec![
            provider("gemini").with_enabled(false),
            provider("openai").with_enabled(false),
        ]);
        let request = OperationRequest::new(());
        let calls = AtomicU32::new(0);

        let error = orchestrator
            .run(&request, &Deadline::none(), |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok::<(), CallError>(()) })
            })
            .await
            .expect_err("nothing enabled");

        assert!(matches!(error, AggregateError::NoCandidates { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn inter_provider_pause_only_follows_attempted_failures() {
        let orchestrator = orchestrator(vec![provider("gemini"), provider("openai")])
            .with_inter_provider_pause(Duration::from_secs(2));
        let request = OperationRequest::new(());
        let started = tokio::time::Instant::now();

        let error = orchestrator
            .run(&request, &Deadline::none(), |_, _| {
                Box::pin(async { Err::<(), _>(CallError::unauthorized("bad key")) })
            })
            .await
            .expect_err("both reject credentials");

        assert_eq!(error.failures().len(), 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_without_touching_breaker() {
        let orchestrator = orchestrator(vec![provider("gemini"), provider("openai")]);
        let request = OperationRequest::new(());
        let deadline = Deadline::after(Duration::from_millis(50));

        let error = orchestrator
            .run(&request, &deadline, |_, _| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<(), CallError>(())
                })
            })
            .await
            .expect_err("deadline hits during the first call");

        assert!(matches!(error, AggregateError::Interrupted { .. }));
        assert_eq!(error.failures().len(), 1);
        let breaker = orchestrator
            .breakers()
            .get(&ProviderId::parse("gemini").expect("id"))
            .expect("breaker exists");
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    struct Fixed {
        id: ProviderId,
        reply: Result<&'static str, CallError>,
    }

    impl OperationProvider<String, &'static str> for Fixed {
        fn id(&self) -> &ProviderId {
            &self.id
        }

        fn call<'a>(&'a self, _request: &'a OperationRequest<String>) -> CallFuture<'a, &'static str> {
            Box::pin(async move { self.reply.clone() })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn invoker_dispatches_to_registered_implementations() {
        let invoker: Invoker<String, &'static str> = Invoker::new(
            orchestrator(vec![provider("gemini"), provider("openai")]),
            vec![
                Arc::new(Fixed {
                    id: ProviderId::parse("gemini").expect("id"),
                    reply: Err(CallError::content_rejected("blocked by safety filter")),
                }),
                Arc::new(Fixed {
                    id: ProviderId::parse("openai").expect("id"),
                    reply: Ok("bonjour"),
                }),
            ],
        );
        let request = OperationRequest::new(String::from("clip.wav")).with_language("fr");

        let result = invoker
            .invoke(&request, &Deadline::none())
            .await
            .expect("openai answers");

        assert_eq!(result.payload, "bonjour");
        assert_eq!(result.provider_id.as_str(), "openai");
        assert_eq!(request.language(), Some("fr"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_implementation_is_an_internal_failure() {
        let invoker: Invoker<String, &'static str> =
            Invoker::new(orchestrator(vec![provider("groq")]), Vec::new());

        let error = invoker
            .invoke(&OperationRequest::new(String::new()), &Deadline::none())
            .await
            .expect_err("nothing registered");

        assert_eq!(error.failures()[0].error_kind, ErrorKind::Internal);
    }
}
