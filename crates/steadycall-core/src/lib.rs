//! # Steadycall Core
//!
//! Resilient multi-provider invocation: "perform operation X reliably despite
//! unreliable upstream providers."
//!
//! ## Overview
//!
//! - **Circuit breakers** that quarantine a provider after consecutive failed runs
//! - **Bounded retry** with capped exponential backoff for transient failures
//! - **Ordered fallback** across providers, with a caller-preferred provider first
//! - **Mirror resolution** across two families of public stream APIs
//! - **Strategy fallback** across argument sets for an external extraction tool
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`circuit_breaker`] | Per-provider breaker and process-wide registry |
//! | [`config`] | Provider catalog, mirrors, strategies, config file loading |
//! | [`deadline`] | Deadline and cancellation shared by every suspension point |
//! | [`error`] | Validation and configuration errors |
//! | [`failure`] | Failure taxonomy, failure records and the aggregate error |
//! | [`http_client`] | HTTP client abstraction |
//! | [`orchestrator`] | Provider fallback loop and invoker |
//! | [`provider`] | Provider identifiers and static policy |
//! | [`retry`] | Backoff retry executor |
//! | [`strategy`] | Extraction strategy selector and process runner |
//! | [`stream_resolver`] | Mirror-based stream resolution |
//! | [`transcription`] | HTTP speech-to-text providers |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use steadycall_core::{
//!     transcription_invoker, AudioClip, BreakerRegistry, Deadline, OperationRequest,
//!     ReqwestHttpClient, Settings,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load(None)?;
//!     let breakers = Arc::new(BreakerRegistry::from_configs(&settings.catalog.configs()));
//!     let invoker = transcription_invoker(&settings, Arc::new(ReqwestHttpClient::new()), breakers);
//!
//!     let clip = AudioClip::read("memo.m4a".as_ref()).await?;
//!     let result = invoker
//!         .invoke(&OperationRequest::new(clip).with_language("en"), &Deadline::none())
//!         .await?;
//!
//!     println!("{} (via {})", result.payload.text, result.provider_id);
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Provider failures are classified once, where they are translated into a
//! [`CallError`]. Callers only ever see a single synthesized error:
//!
//! ```rust
//! use steadycall_core::{AggregateError, ErrorKind};
//!
//! fn handle_error(error: &AggregateError) {
//!     match error.primary_failure().map(|record| record.error_kind) {
//!         Some(ErrorKind::Unauthorized) => {
//!             // Fix the credential
//!         }
//!         Some(kind) if kind.is_transient() => {
//!             // Try again later
//!         }
//!         _ => {}
//!     }
//! }
//! ```
//!
//! ## Security
//!
//! - API keys are read from environment variables only (never logged)
//! - Breaker state lives in memory and is never persisted

pub mod circuit_breaker;
pub mod config;
pub mod deadline;
pub mod error;
pub mod failure;
pub mod http_client;
pub mod orchestrator;
pub mod provider;
pub mod retry;
pub mod strategy;
pub mod stream_resolver;
pub mod transcription;

// Circuit breaker
pub use circuit_breaker::{
    BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};

// Configuration
pub use config::{
    ExtractorSettings, MirrorSettings, ProviderCatalog, ProviderEntry, ProviderOverride, Settings,
    CONFIG_ENV_VAR,
};

// Deadline
pub use deadline::Deadline;

// Error types
pub use error::{CoreError, ValidationError};
pub use failure::{AggregateError, CallError, ErrorKind, FailureRecord};

// HTTP client types
pub use http_client::{
    FilePart, HttpAuth, HttpBody, HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse,
    ReqwestHttpClient,
};

// Orchestration
pub use orchestrator::{
    CallFuture, Invoker, OperationProvider, OperationRequest, OperationResult,
    OrchestrationSuccess, ProviderOrchestrator, DEFAULT_INTER_PROVIDER_PAUSE,
};

// Providers
pub use provider::{ProviderConfig, ProviderId, ProviderPreference};

// Retry logic
pub use retry::{Backoff, BackoffRetryExecutor, Retried, RetryFailure, RetryPolicy};

// Extraction strategies
pub use strategy::{
    classify_stderr, CommandOutput, CommandRunner, ExtractionOutput, ExtractionStrategySelector,
    ExtractionTarget, Strategy, TokioCommandRunner,
};

// Stream resolution
pub use stream_resolver::{ApiFamily, Mirror, ResolveError, StreamCandidate, StreamResolver};

// Transcription
pub use transcription::{transcription_invoker, AudioClip, HttpTranscriber, Transcript};
