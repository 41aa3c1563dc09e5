mod extract;
mod providers;
mod resolve;
mod transcribe;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use steadycall_core::{BreakerRegistry, Deadline, HttpClient, ReqwestHttpClient, Settings};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cli::{Cli, Command};
use crate::error::CliError;
use crate::output::{Envelope, EnvelopeError, EnvelopeMeta};

pub struct CommandResult {
    /// Core request id when the command ran exactly one request.
    pub request_id: Option<String>,
    pub data: Value,
    pub warnings: Vec<String>,
    pub errors: Vec<EnvelopeError>,
    pub latency_ms: u64,
    pub source_chain: Vec<String>,
}

impl CommandResult {
    pub fn ok(data: Value, source_chain: Vec<String>) -> Self {
        Self {
            request_id: None,
            data,
            warnings: Vec::new(),
            errors: Vec::new(),
            latency_ms: 0,
            source_chain,
        }
    }

    /// No usable data; the errors explain why.
    pub fn failed(errors: Vec<EnvelopeError>, source_chain: Vec<String>) -> Self {
        Self {
            request_id: None,
            data: Value::Null,
            warnings: Vec::new(),
            errors,
            latency_ms: 0,
            source_chain,
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

/// Shared state every command draws from.
///
/// One context lives for the whole process, so every request a command runs
/// sees the same breaker registry.
pub struct Context {
    pub settings: Settings,
    pub breakers: Arc<BreakerRegistry>,
    pub http: Arc<dyn HttpClient>,
    pub deadline: Deadline,
}

impl Context {
    pub fn load(cli: &Cli, cancellation: CancellationToken) -> Result<Self, CliError> {
        let settings = Settings::load(cli.config.as_deref())?;
        let deadline =
            Deadline::after(Duration::from_millis(cli.timeout_ms)).with_cancellation(cancellation);
        debug!(
            providers = settings.catalog.entries().len(),
            timeout_ms = cli.timeout_ms,
            "settings loaded"
        );
        Ok(Self::new(settings, Arc::new(ReqwestHttpClient::new()), deadline))
    }

    pub fn new(settings: Settings, http: Arc<dyn HttpClient>, deadline: Deadline) -> Self {
        let breakers = Arc::new(BreakerRegistry::from_configs(&settings.catalog.configs()));
        Self {
            settings,
            breakers,
            http,
            deadline,
        }
    }
}

pub async fn run(cli: &Cli, cancellation: CancellationToken) -> Result<Envelope<Value>, CliError> {
    let context = Context::load(cli, cancellation)?;

    let command_result = match &cli.command {
        Command::Providers => providers::run(&context)?,
        Command::Transcribe(args) => transcribe::run(args, &context).await?,
        Command::Resolve(args) => resolve::run(args, &context).await?,
        Command::Extract(args) => extract::run(args, &context).await?,
    };

    let CommandResult {
        request_id,
        data,
        warnings,
        errors,
        latency_ms,
        source_chain,
    } = command_result;

    Ok(Envelope {
        meta: EnvelopeMeta::new(request_id, source_chain, latency_ms, warnings),
        data,
        errors,
    })
}

pub(crate) fn elapsed_ms(started: tokio::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
