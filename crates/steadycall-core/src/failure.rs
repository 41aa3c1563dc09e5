//! Failure taxonomy shared by every resilience component.
//!
//! Providers translate their native failures into a [`CallError`] carrying a
//! typed [`ErrorKind`] at the point of the call. Retry, breaker and fallback
//! decisions are structural matches on that kind, never text matching.
//!
//! | Kind | Class | Retried in place |
//! |------|-------|------------------|
//! | `RateLimited`, `Overloaded`, `Timeout`, `Network` | transient | yes |
//! | `InvalidInput`, `Unauthorized`, `NotFound`, `ContentRejected`, `Internal` | permanent for this request | no |
//! | `ProviderQuarantined` | breaker denied the attempt | no call made |
//! | `Cancelled` | deadline or caller cancellation | no |

use std::fmt::{Display, Formatter};

use serde::{Serialize, Serializer};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::ProviderId;

/// Typed classification attached to every failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Overloaded,
    Timeout,
    Network,
    InvalidInput,
    Unauthorized,
    NotFound,
    ContentRejected,
    Internal,
    ProviderQuarantined,
    Cancelled,
}

impl ErrorKind {
    /// Whether retrying the same call unchanged after a delay may succeed.
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Overloaded | Self::Timeout | Self::Network
        )
    }

    /// Whether the failure is about the target itself, so no other provider
    /// shape or argument set can fix it.
    pub const fn is_target_unavailable(self) -> bool {
        matches!(self, Self::NotFound | Self::ContentRejected)
    }

    pub const fn code(self) -> &'static str {
        match self {
            Self::RateLimited => "provider.rate_limited",
            Self::Overloaded => "provider.overloaded",
            Self::Timeout => "provider.timeout",
            Self::Network => "provider.network",
            Self::InvalidInput => "provider.invalid_input",
            Self::Unauthorized => "provider.unauthorized",
            Self::NotFound => "provider.not_found",
            Self::ContentRejected => "provider.content_rejected",
            Self::Internal => "provider.internal",
            Self::ProviderQuarantined => "provider.quarantined",
            Self::Cancelled => "provider.cancelled",
        }
    }

    const fn description(self) -> &'static str {
        match self {
            Self::RateLimited => "rate limited",
            Self::Overloaded => "overloaded",
            Self::Timeout => "timed out",
            Self::Network => "unreachable",
            Self::InvalidInput => "rejected the input",
            Self::Unauthorized => "rejected the credentials",
            Self::NotFound => "could not find the resource",
            Self::ContentRejected => "refused the content",
            Self::Internal => "failed unexpectedly",
            Self::ProviderQuarantined => "skipped after recent failures",
            Self::Cancelled => "was cancelled",
        }
    }

    /// Lower rank means more actionable for the caller.
    const fn specificity(self) -> u8 {
        match self {
            Self::ContentRejected | Self::NotFound | Self::InvalidInput => 0,
            Self::Unauthorized => 1,
            Self::RateLimited | Self::Overloaded => 2,
            Self::Timeout | Self::Network => 3,
            Self::Internal => 4,
            Self::Cancelled => 5,
            Self::ProviderQuarantined => 6,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Structured error returned by a single provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    kind: ErrorKind,
    message: String,
}

impl CallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overloaded, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn content_rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContentRejected, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn quarantined(provider: &ProviderId) -> Self {
        Self::new(
            ErrorKind::ProviderQuarantined,
            format!("circuit breaker for '{provider}' is open; skipping upstream call"),
        )
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }
}

impl Display for CallError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for CallError {}

/// One provider's outcome inside a failed (or partially failed) run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub provider_id: ProviderId,
    pub error_kind: ErrorKind,
    pub message: String,
    pub attempts_made: u32,
    #[serde(serialize_with = "serialize_rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl FailureRecord {
    pub fn new(provider_id: ProviderId, error: &CallError, attempts_made: u32) -> Self {
        Self {
            provider_id,
            error_kind: error.kind(),
            message: error.message().to_owned(),
            attempts_made,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    fn summary_line(&self) -> String {
        if self.error_kind == ErrorKind::ProviderQuarantined {
            return format!("{}: {}", self.provider_id, self.error_kind.description());
        }
        format!(
            "{}: {} after {} attempt(s): {}",
            self.provider_id,
            self.error_kind.description(),
            self.attempts_made,
            self.message
        )
    }
}

fn serialize_rfc3339<S>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let formatted = value
        .format(&Rfc3339)
        .map_err(|error| serde::ser::Error::custom(error.to_string()))?;
    serializer.serialize_str(&formatted)
}

/// Single caller-facing error summarizing every candidate's failure.
#[derive(Debug, Clone, Error)]
pub enum AggregateError {
    #[error("no providers are available: {reason}")]
    NoCandidates { reason: String },

    #[error("{}", summarize(failures))]
    Exhausted { failures: Vec<FailureRecord> },

    #[error("operation interrupted ({}) after {} failed candidate(s)", reason, failures.len())]
    Interrupted {
        reason: String,
        failures: Vec<FailureRecord>,
    },
}

impl AggregateError {
    pub fn failures(&self) -> &[FailureRecord] {
        match self {
            Self::NoCandidates { .. } => &[],
            Self::Exhausted { failures } | Self::Interrupted { failures, .. } => failures,
        }
    }

    /// The record judged most actionable for the caller; ties keep attempt order.
    pub fn primary_failure(&self) -> Option<&FailureRecord> {
        primary_failure(self.failures())
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::NoCandidates { .. } => "orchestrator.no_candidates",
            Self::Exhausted { .. } => "orchestrator.exhausted",
            Self::Interrupted { .. } => "orchestrator.interrupted",
        }
    }
}

fn primary_failure(failures: &[FailureRecord]) -> Option<&FailureRecord> {
    failures
        .iter()
        .enumerate()
        .min_by_key(|(index, record)| (record.error_kind.specificity(), *index))
        .map(|(_, record)| record)
}

fn summarize(failures: &[FailureRecord]) -> String {
    let Some(primary) = primary_failure(failures) else {
        return String::from("all candidates failed");
    };

    let headline = match primary.error_kind {
        ErrorKind::InvalidInput | ErrorKind::NotFound | ErrorKind::ContentRejected => format!(
            "the request cannot be completed: {}; retrying will not help",
            primary.message
        ),
        ErrorKind::Unauthorized => format!(
            "'{}' rejected the configured credentials; fix the credential before retrying",
            primary.provider_id
        ),
        ErrorKind::RateLimited | ErrorKind::Overloaded => {
            String::from("every provider is busy or rate limited right now; try again shortly")
        }
        ErrorKind::Timeout | ErrorKind::Network => String::from(
            "no provider could be reached; check connectivity and try again shortly",
        ),
        ErrorKind::Internal => String::from("every provider failed unexpectedly"),
        ErrorKind::Cancelled => String::from("the operation was cancelled"),
        ErrorKind::ProviderQuarantined => String::from(
            "every provider was skipped after recent failures; try again in a little while",
        ),
    };

    let details = failures
        .iter()
        .map(FailureRecord::summary_line)
        .collect::<Vec<_>>()
        .join("; ");

    format!("{headline} [tried {}: {details}]", failures.len())
}
