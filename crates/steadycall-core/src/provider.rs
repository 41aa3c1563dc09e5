//! Provider identity and static per-provider policy.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryPolicy;
use crate::ValidationError;

/// Canonical provider identifier used in logs, failure records and results.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderId(String);

impl ProviderId {
    pub fn parse(value: impl AsRef<str>) -> Result<Self, ValidationError> {
        let value = value.as_ref().trim();
        if value.is_empty() {
            return Err(ValidationError::EmptyProviderId);
        }

        let valid = value.chars().all(|ch| {
            ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '-' | '_' | '/')
        });
        if !valid {
            return Err(ValidationError::InvalidProviderId {
                value: value.to_owned(),
            });
        }

        Ok(Self(value.to_owned()))
    }

    /// Lowercases `value` and replaces unsupported characters with `-`.
    pub fn sanitized(value: &str) -> Self {
        let cleaned = value
            .trim()
            .chars()
            .map(|ch| {
                let ch = ch.to_ascii_lowercase();
                if ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '-' | '_' | '/') {
                    ch
                } else {
                    '-'
                }
            })
            .collect::<String>();

        if cleaned.is_empty() {
            Self(String::from("unknown"))
        } else {
            Self(cleaned)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProviderId {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for ProviderId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ProviderId> for String {
    fn from(value: ProviderId) -> Self {
        value.0
    }
}

/// Caller-side provider hint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProviderPreference {
    /// Use the static default priority order.
    #[default]
    Auto,
    /// Move this provider to the front of the order when it is enabled.
    Preferred(ProviderId),
}

impl ProviderPreference {
    pub fn preferred(&self) -> Option<&ProviderId> {
        match self {
            Self::Auto => None,
            Self::Preferred(id) => Some(id),
        }
    }
}

impl FromStr for ProviderPreference {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        ProviderId::parse(trimmed.to_ascii_lowercase()).map(Self::Preferred)
    }
}

/// Static description of one candidate provider.
///
/// Built once at process start and never mutated afterwards. `enabled` is
/// derived from whether the provider's credential was present at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub id: ProviderId,
    pub display_name: String,
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl ProviderConfig {
    /// Creates an enabled provider with the stock retry and breaker settings.
    pub fn new(id: ProviderId, display_name: impl Into<String>) -> Self {
        let breaker = CircuitBreakerConfig::default();
        Self {
            id,
            display_name: display_name.into(),
            enabled: true,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            failure_threshold: breaker.failure_threshold,
            cooldown: breaker.cooldown,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_breaker(mut self, failure_threshold: u32, cooldown: Duration) -> Self {
        self.failure_threshold = failure_threshold;
        self.cooldown = cooldown;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_retries, self.base_delay, self.max_delay)
    }

    pub fn base_delay_ms(&self) -> u64 {
        duration_ms(self.base_delay)
    }

    pub fn max_delay_ms(&self) -> u64 {
        duration_ms(self.max_delay)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: self.cooldown,
        }
    }

    /// Checks the bounds every provider option must satisfy.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let provider = self.id.to_string();
        if self.base_delay.is_zero() {
            return Err(ValidationError::ZeroBaseDelay { provider });
        }
        if self.max_delay < self.base_delay {
            return Err(ValidationError::MaxDelayBelowBase {
                provider,
                base_ms: duration_ms(self.base_delay),
                max_ms: duration_ms(self.max_delay),
            });
        }
        if self.failure_threshold == 0 {
            return Err(ValidationError::ZeroFailureThreshold { provider });
        }
        if self.cooldown.is_zero() {
            return Err(ValidationError::ZeroCooldown { provider });
        }
        Ok(())
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}
