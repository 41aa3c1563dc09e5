use std::io::{self, Write};

use serde::Serialize;
use steadycall_core::{AggregateError, FailureRecord, ResolveError};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::CliError;

pub const SCHEMA_VERSION: &str = "v1.0.0";

/// Canonical response wrapper written to stdout for every command.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T> {
    pub meta: EnvelopeMeta,
    pub data: T,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<EnvelopeError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeMeta {
    pub request_id: String,
    pub schema_version: String,
    pub generated_at: String,
    pub source_chain: Vec<String>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl EnvelopeMeta {
    /// Commands that ran a single core request pass its id; otherwise a fresh one is minted.
    pub fn new(
        request_id: Option<String>,
        source_chain: Vec<String>,
        latency_ms: u64,
        warnings: Vec<String>,
    ) -> Self {
        let generated_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"));
        Self {
            request_id: request_id.unwrap_or_else(|| Uuid::new_v4().hyphenated().to_string()),
            schema_version: SCHEMA_VERSION.to_owned(),
            generated_at,
            source_chain,
            latency_ms,
            warnings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvelopeError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl EnvelopeError {
    pub fn from_record(record: &FailureRecord) -> Self {
        Self {
            code: record.error_kind.code().to_owned(),
            message: record.message.clone(),
            retryable: record.error_kind.is_transient(),
            source: Some(record.provider_id.to_string()),
        }
    }

    /// The synthesized error first, then one entry per failed candidate.
    pub fn from_aggregate(error: &AggregateError) -> Vec<Self> {
        let retryable = error
            .primary_failure()
            .is_some_and(|record| record.error_kind.is_transient());
        let mut errors = vec![Self {
            code: error.code().to_owned(),
            message: error.to_string(),
            retryable,
            source: None,
        }];
        errors.extend(error.failures().iter().map(Self::from_record));
        errors
    }

    pub fn from_resolve(error: &ResolveError) -> Vec<Self> {
        vec![Self {
            code: error.code().to_owned(),
            message: error.to_string(),
            retryable: !matches!(error, ResolveError::InvalidResource(_)),
            source: None,
        }]
    }
}

pub fn render<T: Serialize>(envelope: &Envelope<T>, pretty: bool) -> Result<(), CliError> {
    let payload = if pretty {
        serde_json::to_string_pretty(envelope)?
    } else {
        serde_json::to_string(envelope)?
    };

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{payload}")?;
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use steadycall_core::{CallError, ProviderId};

    #[test]
    fn meta_carries_fresh_request_id_and_rfc3339_timestamp() {
        let meta = EnvelopeMeta::new(None, vec![String::from("gemini")], 12, Vec::new());

        assert!(Uuid::parse_str(&meta.request_id).is_ok());
        assert!(OffsetDateTime::parse(&meta.generated_at, &Rfc3339).is_ok());
        assert_eq!(meta.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn meta_keeps_the_request_id_it_is_given() {
        let request_id = Uuid::new_v4().to_string();

        let meta = EnvelopeMeta::new(Some(request_id.clone()), Vec::new(), 0, Vec::new());

        assert_eq!(meta.request_id, request_id);
    }

    #[test]
    fn empty_errors_and_warnings_are_omitted() {
        let envelope = Envelope {
            meta: EnvelopeMeta::new(None, Vec::new(), 0, Vec::new()),
            data: Value::Null,
            errors: Vec::new(),
        };

        let json = serde_json::to_value(&envelope).expect("serializes");
        assert!(json.get("errors").is_none());
        assert!(json["meta"].get("warnings").is_none());
    }

    #[test]
    fn aggregate_error_expands_into_per_candidate_entries() {
        let failures = vec![
            FailureRecord::new(
                ProviderId::parse("gemini").expect("valid id"),
                &CallError::rate_limited("quota exceeded"),
                3,
            ),
            FailureRecord::new(
                ProviderId::parse("groq").expect("valid id"),
                &CallError::unauthorized("bad key"),
                1,
            ),
        ];
        let error = AggregateError::Exhausted { failures };

        let errors = EnvelopeError::from_aggregate(&error);

        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].code, "orchestrator.exhausted");
        assert!(!errors[0].retryable);
        assert_eq!(errors[1].source.as_deref(), Some("gemini"));
        assert!(errors[1].retryable);
        assert_eq!(errors[2].source.as_deref(), Some("groq"));
    }
}
