//! Ordered invocation strategies against one external extraction tool.

use std::future::Future;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::deadline::Deadline;
use crate::failure::{AggregateError, CallError, ErrorKind, FailureRecord};
use crate::provider::duration_ms;
use crate::{ProviderId, ValidationError};

/// One named argument set for the extraction tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawStrategy")]
pub struct Strategy {
    name: String,
    args: Vec<String>,
}

#[derive(Deserialize)]
struct RawStrategy {
    name: String,
    #[serde(default)]
    args: Vec<String>,
}

impl TryFrom<RawStrategy> for Strategy {
    type Error = ValidationError;

    fn try_from(raw: RawStrategy) -> Result<Self, Self::Error> {
        Self::new(raw.name, raw.args)
    }
}

impl Strategy {
    /// Names follow provider-id rules so each strategy can label a failure record.
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyStrategyName);
        }
        ProviderId::parse(&name)?;
        Ok(Self { name, args })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// yt-dlp fallbacks, from the broadest client mix to a plain audio grab.
    ///
    /// Cookie strategies are only included when a browser to borrow cookies
    /// from is configured.
    pub fn ytdlp_defaults(cookies_from_browser: Option<&str>) -> Vec<Self> {
        let common = |format: &str| -> Vec<String> {
            [
                "-f",
                format,
                "--no-playlist",
                "--no-update",
                "--socket-timeout",
                "30",
                "--force-ipv4",
            ]
            .into_iter()
            .map(String::from)
            .collect()
        };
        let with_client = |format: &str, client: &str| -> Vec<String> {
            let mut args = common(format);
            args.push(String::from("--extractor-args"));
            args.push(format!("youtube:player_client={client}"));
            args
        };

        let mut strategies = vec![Self {
            name: String::from("multi-client"),
            args: with_client("bestaudio/best", "web,web_safari,ios"),
        }];

        if let Some(browser) = cookies_from_browser {
            let mut args = with_client("bestaudio/best", "web,web_safari");
            args.push(String::from("--cookies-from-browser"));
            args.push(browser.to_owned());
            strategies.push(Self {
                name: String::from("cookies"),
                args,
            });
        }

        for client in ["android", "tv", "web"] {
            strategies.push(Self {
                name: client.to_owned(),
                args: with_client("bestaudio/best", client),
            });
        }

        strategies.push(Self {
            name: String::from("audio-only"),
            args: common("140/bestaudio[ext=m4a]/bestaudio"),
        });

        strategies
    }
}

/// Captured result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Process execution seam.
///
/// Implementations translate spawn errors and timeouts into [`CallError`];
/// a non-zero exit is reported through [`CommandOutput`].
pub trait CommandRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<CommandOutput, CallError>> + Send + 'a>>;
}

/// Runs commands with `tokio::process`, killing the child on timeout or drop.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

impl CommandRunner for TokioCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<CommandOutput, CallError>> + Send + 'a>> {
        Box::pin(async move {
            let mut child = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| match e.kind() {
                    IoErrorKind::NotFound => {
                        CallError::internal(format!("'{program}' is not installed or not on PATH"))
                    }
                    _ => CallError::internal(format!("failed to start '{program}': {e}")),
                })?;

            let mut stdout_pipe = child
                .stdout
                .take()
                .ok_or_else(|| CallError::internal(format!("failed to capture stdout from '{program}'")))?;
            let mut stderr_pipe = child
                .stderr
                .take()
                .ok_or_else(|| CallError::internal(format!("failed to capture stderr from '{program}'")))?;

            let stdout_task = tokio::spawn(async move {
                let mut buf = Vec::new();
                stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
            });
            let stderr_task = tokio::spawn(async move {
                let mut buf = Vec::new();
                stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
            });

            let status = match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status
                    .map_err(|e| CallError::internal(format!("failed to wait for '{program}': {e}")))?,
                Err(_) => {
                    let _ = child.kill().await;
                    stdout_task.abort();
                    stderr_task.abort();
                    return Err(CallError::timeout(format!(
                        "'{program}' timed out after {}ms",
                        duration_ms(timeout)
                    )));
                }
            };

            let stdout = collect_pipe(stdout_task, "stdout").await?;
            let stderr = collect_pipe(stderr_task, "stderr").await?;

            Ok(CommandOutput {
                success: status.success(),
                exit_code: status.code(),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        })
    }
}

async fn collect_pipe(
    task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
    name: &str,
) -> Result<Vec<u8>, CallError> {
    task.await
        .map_err(|e| CallError::internal(format!("{name} reader failed: {e}")))?
        .map_err(|e| CallError::internal(format!("failed to read {name}: {e}")))
}

/// Maps extraction-tool diagnostics onto the shared failure taxonomy.
///
/// Target-level conditions (removed, private, geo-blocked) are shared by every
/// strategy; access problems such as bot checks may clear with another client.
pub fn classify_stderr(stderr: &str) -> ErrorKind {
    let lower = stderr.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

    if has(&[
        "video unavailable",
        "video has been removed",
        "no longer available",
        "video is unavailable",
        "http error 404",
        "does not exist",
    ]) {
        ErrorKind::NotFound
    } else if has(&[
        "private video",
        "video is private",
        "not available in your country",
        "blocked in your country",
        "copyright",
        "drm protected",
    ]) {
        ErrorKind::ContentRejected
    } else if has(&["unsupported url", "is not a valid url"]) {
        ErrorKind::InvalidInput
    } else if has(&["http error 429", "too many requests", "rate limit"]) {
        ErrorKind::RateLimited
    } else if has(&[
        "sign in to confirm",
        "age-restricted",
        "http error 403",
        "forbidden",
        "po token",
        "captcha",
    ]) {
        ErrorKind::Unauthorized
    } else if has(&["timed out", "timeout"]) {
        ErrorKind::Timeout
    } else if has(&[
        "unable to download webpage",
        "connection reset",
        "connection refused",
        "name or service not known",
        "network is unreachable",
    ]) {
        ErrorKind::Network
    } else if has(&["http error 5"]) {
        ErrorKind::Overloaded
    } else {
        ErrorKind::Internal
    }
}

/// What to extract and where the artifact should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionTarget {
    pub url: String,
    pub output_path: PathBuf,
}

impl ExtractionTarget {
    pub fn new(url: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            output_path: output_path.into(),
        }
    }
}

/// Successful extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionOutput {
    pub strategy: String,
    pub artifact_path: PathBuf,
    /// Strategies invoked, including the winner.
    pub strategies_tried: usize,
    #[serde(skip)]
    pub stdout: String,
}

/// Tries each strategy once, in order, until the tool succeeds.
pub struct ExtractionStrategySelector {
    program: String,
    tool_id: ProviderId,
    runner: Arc<dyn CommandRunner>,
    timeout_per_strategy: Duration,
}

impl ExtractionStrategySelector {
    pub fn new(program: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        let program = program.into();
        let tool_id = tool_id(&program);
        Self {
            program,
            tool_id,
            runner,
            timeout_per_strategy: Duration::from_secs(600),
        }
    }

    pub fn with_timeout_per_strategy(mut self, timeout: Duration) -> Self {
        self.timeout_per_strategy = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub async fn attempt(
        &self,
        target: &ExtractionTarget,
        strategies: &[Strategy],
        deadline: &Deadline,
    ) -> Result<ExtractionOutput, AggregateError> {
        if strategies.is_empty() {
            return Err(AggregateError::NoCandidates {
                reason: ValidationError::EmptyStrategyList.to_string(),
            });
        }

        let preexisting = tokio::fs::try_exists(&target.output_path)
            .await
            .unwrap_or(false);
        if preexisting {
            debug!(
                path = %target.output_path.display(),
                "output already exists; failed strategies leave it in place"
            );
        }
        let mut failures = Vec::new();

        for (index, strategy) in strategies.iter().enumerate() {
            let record_id = self.record_id(strategy);
            let args = invocation_args(strategy, target);
            debug!(strategy = strategy.name(), attempt = index + 1, "running extraction strategy");

            let timeout = deadline
                .remaining()
                .map_or(self.timeout_per_strategy, |left| left.min(self.timeout_per_strategy));
            let outcome = deadline
                .run(self.runner.run(&self.program, &args, timeout))
                .await
                .and_then(|output| {
                    if output.success {
                        Ok(output)
                    } else {
                        Err(failed_run(&output))
                    }
                });

            match outcome {
                Ok(output) => {
                    info!(
                        strategy = strategy.name(),
                        failed_before = failures.len(),
                        "extraction succeeded"
                    );
                    return Ok(ExtractionOutput {
                        strategy: strategy.name().to_owned(),
                        artifact_path: target.output_path.clone(),
                        strategies_tried: index + 1,
                        stdout: output.stdout,
                    });
                }
                Err(error) => {
                    discard_partial_artifacts(&target.output_path, preexisting).await;
                    failures.push(FailureRecord::new(record_id, &error, 1));

                    if error.kind() == ErrorKind::Cancelled {
                        return Err(AggregateError::Interrupted {
                            reason: error.message().to_owned(),
                            failures,
                        });
                    }
                    if stops_all_strategies(error.kind()) {
                        warn!(
                            strategy = strategy.name(),
                            error = %error,
                            "target itself is unavailable; skipping remaining strategies"
                        );
                        return Err(AggregateError::Exhausted { failures });
                    }
                    warn!(strategy = strategy.name(), error = %error, "strategy failed");
                }
            }
        }

        Err(AggregateError::Exhausted { failures })
    }

    fn record_id(&self, strategy: &Strategy) -> ProviderId {
        ProviderId::sanitized(&format!("{}/{}", self.tool_id, strategy.name()))
    }
}

fn stops_all_strategies(kind: ErrorKind) -> bool {
    kind.is_target_unavailable() || kind == ErrorKind::InvalidInput
}

fn invocation_args(strategy: &Strategy, target: &ExtractionTarget) -> Vec<String> {
    let mut args = strategy.args().to_vec();
    args.push(String::from("-o"));
    args.push(target.output_path.to_string_lossy().into_owned());
    args.push(target.url.clone());
    args
}

fn failed_run(output: &CommandOutput) -> CallError {
    let kind = classify_stderr(&output.stderr);
    let detail = output
        .stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("no diagnostics")
        .trim();
    let status = output
        .exit_code
        .map_or_else(|| String::from("signal"), |code| code.to_string());
    CallError::new(kind, format!("exit {status}: {detail}"))
}

/// Removes the tool's in-progress companions, and the artifact itself unless
/// it was there before the run started.
async fn discard_partial_artifacts(output_path: &Path, keep_artifact: bool) {
    let mut candidates = Vec::with_capacity(3);
    if !keep_artifact {
        candidates.push(output_path.to_path_buf());
    }
    for suffix in ["part", "ytdl"] {
        let mut name = output_path.as_os_str().to_owned();
        name.push(".");
        name.push(suffix);
        candidates.push(PathBuf::from(name));
    }

    for path in candidates {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "discarded partial artifact"),
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to discard partial artifact"),
        }
    }
}

fn tool_id(program: &str) -> ProviderId {
    let stem = Path::new(program)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    ProviderId::sanitized(&stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedRunner {
        replies: Mutex<Vec<CommandOutput>>,
        seen: Mutex<Vec<Vec<String>>>,
        artifact: Option<PathBuf>,
    }

    impl ScriptedRunner {
        fn new(replies: Vec<CommandOutput>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().rev().collect()),
                seen: Mutex::new(Vec::new()),
                artifact: None,
            }
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run<'a>(
            &'a self,
            _program: &'a str,
            args: &'a [String],
            _timeout: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<CommandOutput, CallError>> + Send + 'a>> {
            Box::pin(async move {
                self.seen.lock().expect("lock").push(args.to_vec());
                if let Some(path) = &self.artifact {
                    std::fs::write(path, b"partial").expect("write partial");
                }
                self.replies
                    .lock()
                    .expect("lock")
                    .pop()
                    .ok_or_else(|| CallError::internal("no scripted reply"))
            })
        }
    }

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            success: false,
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_owned(),
        }
    }

    fn succeeded() -> CommandOutput {
        CommandOutput {
            success: true,
            exit_code: Some(0),
            stdout: String::from("[download] 100%"),
            stderr: String::new(),
        }
    }

    fn strategies(names: &[&str]) -> Vec<Strategy> {
        names
            .iter()
            .map(|name| Strategy::new(*name, vec![format!("--{name}")]).expect("valid strategy"))
            .collect()
    }

    #[test]
    fn stderr_classification_separates_target_and_access_failures() {
        assert_eq!(classify_stderr("ERROR: [youtube] abc: Video unavailable"), ErrorKind::NotFound);
        assert_eq!(classify_stderr("ERROR: Private video. Sign in if you've been granted access"), ErrorKind::ContentRejected);
        assert_eq!(classify_stderr("ERROR: Sign in to confirm you're not a bot"), ErrorKind::Unauthorized);
        assert_eq!(classify_stderr("HTTP Error 429: Too Many Requests"), ErrorKind::RateLimited);
        assert_eq!(classify_stderr("ERROR: Unsupported URL: https://example.test"), ErrorKind::InvalidInput);
        assert_eq!(classify_stderr("something odd happened"), ErrorKind::Internal);
    }

    #[test]
    fn default_strategies_include_cookies_only_when_configured() {
        let without = Strategy::ytdlp_defaults(None);
        let with = Strategy::ytdlp_defaults(Some("firefox"));

        assert!(without.iter().all(|strategy| strategy.name() != "cookies"));
        assert_eq!(with.len(), without.len() + 1);
        assert_eq!(with[1].name(), "cookies");
        assert!(with[1].args().iter().any(|arg| arg == "firefox"));
        assert_eq!(without.first().map(Strategy::name), Some("multi-client"));
        assert_eq!(without.last().map(Strategy::name), Some("audio-only"));
    }

    #[test]
    fn strategy_names_must_be_usable_as_record_ids() {
        assert_eq!(Strategy::new("", Vec::new()), Err(ValidationError::EmptyStrategyName));
        assert!(Strategy::new("Web Client", Vec::new()).is_err());
    }

    #[tokio::test]
    async fn third_strategy_wins_after_two_failures() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            failed("ERROR: Sign in to confirm you're not a bot"),
            failed("ERROR: HTTP Error 403: Forbidden"),
            succeeded(),
        ]));
        let selector = ExtractionStrategySelector::new("yt-dlp", runner.clone());
        let dir = tempfile::tempdir().expect("tempdir");
        let target = ExtractionTarget::new(
            "https://www.youtube.com/watch?v=abc",
            dir.path().join("out.m4a"),
        );

        let output = selector
            .attempt(&target, &strategies(&["s1", "s2", "s3"]), &Deadline::none())
            .await
            .expect("s3 succeeds");

        assert_eq!(output.strategy, "s3");
        assert_eq!(output.strategies_tried, 3);
        let seen = runner.seen.lock().expect("lock");
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2][0], "--s3");
        assert_eq!(seen[2].last().map(String::as_str), Some("https://www.youtube.com/watch?v=abc"));
    }

    #[tokio::test]
    async fn unavailable_target_short_circuits_remaining_strategies() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            failed("ERROR: [youtube] abc: Video unavailable. This video has been removed"),
            succeeded(),
        ]));
        let selector = ExtractionStrategySelector::new("/usr/local/bin/yt-dlp", runner.clone());
        let dir = tempfile::tempdir().expect("tempdir");
        let target = ExtractionTarget::new("https://youtu.be/abc", dir.path().join("out.m4a"));

        let error = selector
            .attempt(&target, &strategies(&["s1", "s2"]), &Deadline::none())
            .await
            .expect_err("target is gone");

        assert_eq!(runner.seen.lock().expect("lock").len(), 1);
        assert_eq!(error.failures().len(), 1);
        assert_eq!(error.failures()[0].provider_id.as_str(), "yt-dlp/s1");
        assert_eq!(error.failures()[0].error_kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn failed_strategy_discards_partial_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output_path = dir.path().join("clip.m4a");
        let mut runner = ScriptedRunner::new(vec![failed("ERROR: HTTP Error 403: Forbidden")]);
        runner.artifact = Some(output_path.clone());
        let selector = ExtractionStrategySelector::new("yt-dlp", Arc::new(runner));
        let target = ExtractionTarget::new("https://youtu.be/abc", &output_path);

        let error = selector
            .attempt(&target, &strategies(&["s1"]), &Deadline::none())
            .await
            .expect_err("only strategy fails");

        assert!(matches!(error, AggregateError::Exhausted { .. }));
        assert!(!output_path.exists(), "partial artifact should be removed");
    }

    #[tokio::test]
    async fn failed_strategy_leaves_existing_output_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output_path = dir.path().join("talk.m4a");
        std::fs::write(&output_path, b"earlier download").expect("seed output");
        let part_path = dir.path().join("talk.m4a.part");
        std::fs::write(&part_path, b"half").expect("seed part");
        let selector = ExtractionStrategySelector::new(
            "yt-dlp",
            Arc::new(ScriptedRunner::new(vec![failed("ERROR: unable to download webpage")])),
        );
        let target = ExtractionTarget::new("https://youtu.be/abc", &output_path);

        selector
            .attempt(&target, &strategies(&["s1"]), &Deadline::none())
            .await
            .expect_err("only strategy fails");

        assert_eq!(std::fs::read(&output_path).expect("still there"), b"earlier download");
        assert!(!part_path.exists(), "companion files are still cleaned up");
    }

    #[tokio::test]
    async fn empty_strategy_list_is_rejected() {
        let selector = ExtractionStrategySelector::new("yt-dlp", Arc::new(ScriptedRunner::new(Vec::new())));
        let target = ExtractionTarget::new("https://youtu.be/abc", "/tmp/out.m4a");

        let error = selector
            .attempt(&target, &[], &Deadline::none())
            .await
            .expect_err("nothing to try");

        assert!(matches!(error, AggregateError::NoCandidates { .. }));
    }
}
