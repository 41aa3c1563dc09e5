//! CLI argument definitions for Steadycall.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `providers` | Show the provider catalog and breaker state |
//! | `transcribe` | Transcribe an audio file with provider fallback |
//! | `resolve` | Resolve a playable audio stream through public mirrors |
//! | `extract` | Download media with ordered yt-dlp strategies |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--config` | `$STEADYCALL_CONFIG` | JSON config file |
//! | `--timeout-ms` | `120000` | Overall deadline for the command |
//! | `--pretty` | `false` | Pretty-print JSON output |
//! | `--log-level` | `warn` | Log level when `RUST_LOG` is unset |
//!
//! # Examples
//!
//! ```bash
//! steadycall providers --pretty
//! steadycall transcribe memo.m4a --provider groq --language en
//! steadycall transcribe part1.m4a part2.m4a part3.m4a
//! steadycall resolve dQw4w9WgXcQ
//! steadycall extract https://youtu.be/dQw4w9WgXcQ --output talk.m4a
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Steadycall - reliable calls to unreliable providers
#[derive(Debug, Parser)]
#[command(
    name = "steadycall",
    author,
    version,
    about = "Reliable calls to unreliable providers",
    long_about = "Steadycall runs speech-to-text, stream resolution and media extraction \
through a resilience layer:\n\
\n\
  • Per-provider circuit breakers\n\
  • Bounded retry with exponential backoff\n\
  • Ordered fallback across providers, mirrors and strategies\n\
\n\
Use 'steadycall <command> --help' for command-specific help."
)]
pub struct Cli {
    /// JSON config file overriding the built-in catalog, mirrors and strategies.
    /// Falls back to `$STEADYCALL_CONFIG`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Overall deadline for the command in milliseconds.
    #[arg(long, global = true, default_value_t = 120_000)]
    pub timeout_ms: u64,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Log level used when `RUST_LOG` is not set. Logs go to stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Available CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// List configured providers, their policy and breaker state.
    Providers,

    /// Transcribe one or more audio files.
    ///
    /// Providers are tried in catalog order (or the preferred one first);
    /// transient failures are retried, persistent ones fall through. Files
    /// run in order and share breaker state, so a provider that keeps
    /// failing is skipped for the files after it.
    ///
    /// # Examples
    ///
    ///   steadycall transcribe memo.m4a
    ///   steadycall transcribe memo.m4a --provider openai --language de
    ///   steadycall transcribe part1.m4a part2.m4a
    Transcribe(TranscribeArgs),

    /// Resolve a playable audio stream for a video id.
    ///
    /// # Examples
    ///
    ///   steadycall resolve dQw4w9WgXcQ
    Resolve(ResolveArgs),

    /// Download media with ordered yt-dlp strategies.
    ///
    /// # Examples
    ///
    ///   steadycall extract https://youtu.be/dQw4w9WgXcQ --output talk.m4a
    ///   steadycall extract https://youtu.be/dQw4w9WgXcQ --output talk.m4a --strategy android
    Extract(ExtractArgs),
}

/// Arguments for the `transcribe` command.
#[derive(Debug, Args)]
pub struct TranscribeArgs {
    /// Audio files to transcribe, in order.
    #[arg(required = true, num_args = 1..)]
    pub audio_files: Vec<PathBuf>,

    /// Preferred provider id, or `auto` for catalog order.
    #[arg(long, default_value = "auto")]
    pub provider: String,

    /// Spoken language hint (ISO-639-1, e.g. `en`).
    #[arg(long)]
    pub language: Option<String>,
}

/// Arguments for the `resolve` command.
#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// Video id understood by the mirrors.
    pub resource_id: String,
}

/// Arguments for the `extract` command.
#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// Media page URL.
    pub url: String,

    /// Where the downloaded file should be written.
    #[arg(long, short)]
    pub output: PathBuf,

    /// Restrict to the named strategies, in the order given.
    #[arg(long = "strategy")]
    pub strategies: Vec<String>,
}
