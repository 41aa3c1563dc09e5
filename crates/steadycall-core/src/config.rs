//! Process-start configuration: provider catalog, mirrors and extraction strategies.
//!
//! Credentials are read from environment variables exactly once, when the
//! catalog is resolved. A provider is enabled only when it has both a
//! credential and an endpoint.
//!
//! | Provider | Credential env var | Default endpoint |
//! |----------|--------------------|------------------|
//! | `gemini` | `GEMINI_API_KEY` | none, set `endpoint` in the config file |
//! | `openai` | `OPENAI_API_KEY` | `https://api.openai.com/v1/audio/transcriptions` |
//! | `groq` | `GROQ_API_KEY` | `https://api.groq.com/openai/v1/audio/transcriptions` |
//!
//! A JSON file named by `--config` or `STEADYCALL_CONFIG` may override any of
//! the above, add providers, and replace mirror or strategy lists.

use std::collections::HashSet;
use std::env;
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::http_client::HttpAuth;
use crate::provider::{ProviderConfig, ProviderPreference};
use crate::stream_resolver::{ApiFamily, Mirror};
use crate::strategy::Strategy;
use crate::{CoreError, ProviderId, ValidationError};

pub const CONFIG_ENV_VAR: &str = "STEADYCALL_CONFIG";

const DEFAULT_PIPED_MIRRORS: &[&str] = &[
    "https://pipedapi.kavin.rocks",
    "https://pipedapi.adminforge.de",
    "https://api.piped.private.coffee",
];

const DEFAULT_INVIDIOUS_MIRRORS: &[&str] = &[
    "https://inv.nadeko.net",
    "https://invidious.nerdvpn.de",
    "https://yewtu.be",
];

/// One catalog entry: policy plus how to reach and authenticate the provider.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderEntry {
    pub config: ProviderConfig,
    pub endpoint: String,
    pub model: String,
    pub credential_env: String,
    credential: Option<String>,
}

impl ProviderEntry {
    fn builtin(
        id: &str,
        display_name: &str,
        endpoint: &str,
        model: &str,
        credential_env: &str,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            config: ProviderConfig::new(ProviderId::parse(id)?, display_name),
            endpoint: endpoint.to_owned(),
            model: model.to_owned(),
            credential_env: credential_env.to_owned(),
            credential: None,
        })
    }

    pub fn id(&self) -> &ProviderId {
        &self.config.id
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    pub fn has_endpoint(&self) -> bool {
        !self.endpoint.trim().is_empty()
    }

    pub fn auth(&self) -> HttpAuth {
        self.credential
            .clone()
            .map_or(HttpAuth::None, HttpAuth::BearerToken)
    }

    /// Attaches a credential directly, bypassing the environment.
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self.config.enabled = true;
        self
    }
}

impl Debug for ProviderEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("config", &self.config)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("credential_env", &self.credential_env)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Ordered, validated provider catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCatalog {
    entries: Vec<ProviderEntry>,
}

impl ProviderCatalog {
    /// Built-in providers in default priority order, all disabled until resolved.
    pub fn builtin() -> Result<Self, ValidationError> {
        let gemini = ProviderEntry::builtin(
            "gemini",
            "Google Gemini",
            "",
            "gemini-2.0-flash",
            "GEMINI_API_KEY",
        )?;
        let openai = ProviderEntry::builtin(
            "openai",
            "OpenAI Whisper",
            "https://api.openai.com/v1/audio/transcriptions",
            "whisper-1",
            "OPENAI_API_KEY",
        )?;
        let groq = ProviderEntry::builtin(
            "groq",
            "Groq Whisper",
            "https://api.groq.com/openai/v1/audio/transcriptions",
            "whisper-large-v3",
            "GROQ_API_KEY",
        )?;

        // Free-tier quota exhausts quickly, so quarantine sooner and for longer.
        let gemini = ProviderEntry {
            config: gemini
                .config
                .with_retry(2, Duration::from_secs(1), Duration::from_secs(8))
                .with_breaker(2, Duration::from_secs(120)),
            ..gemini
        };

        Ok(Self {
            entries: vec![gemini, openai, groq],
        })
    }

    /// Built-in catalog resolved against the process environment.
    pub fn from_env() -> Result<Self, ValidationError> {
        Self::resolve(&[], |name| env::var(name).ok())
    }

    /// Applies file overrides, then reads each credential through `lookup` once.
    pub fn resolve(
        overrides: &[ProviderOverride],
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ValidationError> {
        let mut catalog = Self::builtin()?;
        for entry in overrides {
            catalog.apply(entry)?;
        }

        for entry in &mut catalog.entries {
            entry.credential = lookup(&entry.credential_env)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty());
            entry.config.enabled =
                entry.config.enabled && entry.credential.is_some() && entry.has_endpoint();
        }

        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_entries(entries: Vec<ProviderEntry>) -> Result<Self, ValidationError> {
        let catalog = Self { entries };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn entries(&self) -> &[ProviderEntry] {
        &self.entries
    }

    pub fn get(&self, id: &ProviderId) -> Option<&ProviderEntry> {
        self.entries.iter().find(|entry| entry.id() == id)
    }

    pub fn configs(&self) -> Vec<ProviderConfig> {
        self.entries.iter().map(|entry| entry.config.clone()).collect()
    }

    /// Parses a caller preference, rejecting ids the catalog does not know.
    pub fn parse_preference(&self, value: &str) -> Result<ProviderPreference, ValidationError> {
        let preference = value.parse::<ProviderPreference>()?;
        if let Some(id) = preference.preferred() {
            if self.get(id).is_none() {
                return Err(ValidationError::UnknownProvider {
                    value: id.to_string(),
                    known: self
                        .entries
                        .iter()
                        .map(|entry| entry.id().as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        }
        Ok(preference)
    }

    fn apply(&mut self, patch: &ProviderOverride) -> Result<(), ValidationError> {
        let id = ProviderId::parse(&patch.id)?;
        let index = match self.entries.iter().position(|entry| entry.id() == &id) {
            Some(index) => index,
            None => {
                let credential_env = format!(
                    "{}_API_KEY",
                    id.as_str().to_ascii_uppercase().replace(['-', '/'], "_")
                );
                self.entries.push(ProviderEntry {
                    config: ProviderConfig::new(id.clone(), id.as_str()),
                    endpoint: String::new(),
                    model: String::new(),
                    credential_env,
                    credential: None,
                });
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[index];
        let config = &mut entry.config;
        if let Some(display_name) = &patch.display_name {
            config.display_name = display_name.clone();
        }
        if let Some(enabled) = patch.enabled {
            config.enabled = enabled;
        }
        if let Some(max_retries) = patch.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(ms) = patch.base_delay_ms {
            config.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = patch.max_delay_ms {
            config.max_delay = Duration::from_millis(ms);
        }
        if let Some(threshold) = patch.failure_threshold {
            config.failure_threshold = threshold;
        }
        if let Some(ms) = patch.cooldown_ms {
            config.cooldown = Duration::from_millis(ms);
        }
        if let Some(endpoint) = &patch.endpoint {
            entry.endpoint = endpoint.clone();
        }
        if let Some(model) = &patch.model {
            entry.model = model.clone();
        }
        if let Some(credential_env) = &patch.credential_env {
            entry.credential_env = credential_env.clone();
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.id()) {
                return Err(ValidationError::DuplicateProvider {
                    id: entry.id().to_string(),
                });
            }
            entry.config.validate()?;
            if entry.config.enabled && !is_http_url(&entry.endpoint) {
                return Err(ValidationError::InvalidEndpoint {
                    provider: entry.id().to_string(),
                    value: entry.endpoint.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Per-provider fields accepted in the config file. Absent fields keep the
/// built-in value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderOverride {
    pub id: String,
    pub display_name: Option<String>,
    pub enabled: Option<bool>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub credential_env: Option<String>,
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub cooldown_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    providers: Vec<ProviderOverride>,
    inter_provider_pause_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    #[serde(default)]
    mirrors: MirrorFileConfig,
    #[serde(default)]
    extractor: ExtractorFileConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MirrorFileConfig {
    piped: Option<Vec<String>>,
    invidious: Option<Vec<String>>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExtractorFileConfig {
    program: Option<String>,
    timeout_ms: Option<u64>,
    cookies_from_browser: Option<String>,
    strategies: Option<Vec<Strategy>>,
}

/// Mirror lists for stream resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSettings {
    pub piped: Vec<Mirror>,
    pub invidious: Vec<Mirror>,
    pub request_timeout: Duration,
}

/// Extraction tool and its ordered strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorSettings {
    pub program: String,
    pub timeout_per_strategy: Duration,
    pub strategies: Vec<Strategy>,
}

/// Everything loaded at process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub catalog: ProviderCatalog,
    pub inter_provider_pause: Duration,
    pub request_timeout: Duration,
    pub mirrors: MirrorSettings,
    pub extractor: ExtractorSettings,
}

impl Settings {
    /// Loads `path`, else the file named by `STEADYCALL_CONFIG`, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));

        let raw = match &path {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|source| {
                CoreError::FileRead {
                    path: path.display().to_string(),
                    source,
                }
            })?),
            None => None,
        };

        Self::from_json(raw.as_deref(), |name| env::var(name).ok())
    }

    pub fn from_json(
        raw: Option<&str>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CoreError> {
        let file = match raw {
            Some(raw) => serde_json::from_str::<FileConfig>(raw)?,
            None => FileConfig::default(),
        };

        let catalog = ProviderCatalog::resolve(&file.providers, lookup)?;

        let piped = mirrors(file.mirrors.piped, DEFAULT_PIPED_MIRRORS, ApiFamily::Piped)?;
        let invidious = mirrors(
            file.mirrors.invidious,
            DEFAULT_INVIDIOUS_MIRRORS,
            ApiFamily::Invidious,
        )?;

        let strategies = match file.extractor.strategies {
            Some(strategies) if strategies.is_empty() => {
                return Err(ValidationError::EmptyStrategyList.into())
            }
            Some(strategies) => strategies,
            None => Strategy::ytdlp_defaults(file.extractor.cookies_from_browser.as_deref()),
        };

        Ok(Self {
            catalog,
            inter_provider_pause: Duration::from_millis(file.inter_provider_pause_ms.unwrap_or(250)),
            request_timeout: Duration::from_millis(file.request_timeout_ms.unwrap_or(120_000)),
            mirrors: MirrorSettings {
                piped,
                invidious,
                request_timeout: Duration::from_millis(file.mirrors.timeout_ms.unwrap_or(8_000)),
            },
            extractor: ExtractorSettings {
                program: file
                    .extractor
                    .program
                    .unwrap_or_else(|| String::from("yt-dlp")),
                timeout_per_strategy: Duration::from_millis(
                    file.extractor.timeout_ms.unwrap_or(600_000),
                ),
                strategies,
            },
        })
    }
}

fn mirrors(
    configured: Option<Vec<String>>,
    defaults: &[&str],
    family: ApiFamily,
) -> Result<Vec<Mirror>, ValidationError> {
    match configured {
        Some(urls) => urls.iter().map(|url| Mirror::new(url, family)).collect(),
        None => defaults.iter().map(|url| Mirror::new(url, family)).collect(),
    }
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("https://") || value.starts_with("http://")
}
