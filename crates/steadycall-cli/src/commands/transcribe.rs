use std::sync::Arc;

use serde_json::{json, Value};
use steadycall_core::{transcription_invoker, AudioClip, OperationRequest};
use tokio::time::Instant;
use tracing::warn;

use crate::cli::TranscribeArgs;
use crate::commands::{elapsed_ms, CommandResult, Context};
use crate::error::CliError;
use crate::output::EnvelopeError;

/// Transcribes each file in order through one invoker, so a provider that
/// keeps failing is quarantined for the files that follow.
pub async fn run(args: &TranscribeArgs, context: &Context) -> Result<CommandResult, CliError> {
    let preference = context.settings.catalog.parse_preference(&args.provider)?;

    // Unreadable input is a usage problem; fail before any provider is called.
    let mut clips = Vec::with_capacity(args.audio_files.len());
    for path in &args.audio_files {
        clips.push((path.display().to_string(), AudioClip::read(path).await?));
    }

    let invoker = transcription_invoker(
        &context.settings,
        Arc::clone(&context.http),
        Arc::clone(&context.breakers),
    );
    let candidates = invoker
        .orchestrator()
        .candidate_chain(&preference)
        .into_iter()
        .map(|config| config.id.to_string())
        .collect::<Vec<_>>();

    let total = clips.len();
    let started = Instant::now();
    let mut items = Vec::with_capacity(total);
    let mut request_ids = Vec::with_capacity(total);
    let mut source_chain = Vec::new();
    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    for (index, (label, clip)) in clips.into_iter().enumerate() {
        if context.deadline.check().is_err() {
            warn!(remaining = total - index, "deadline reached; skipping remaining files");
            warnings.push(format!(
                "{} file(s) not attempted: deadline reached or interrupted",
                total - index
            ));
            break;
        }

        let mut request = OperationRequest::new(clip).with_preference(preference.clone());
        if let Some(language) = &args.language {
            request = request.with_language(language.as_str());
        }
        let request_id = request.id().to_string();

        match invoker.invoke_detailed(&request, &context.deadline).await {
            Ok(success) => {
                extend_chain(
                    &mut source_chain,
                    success.provider_chain.iter().map(ToString::to_string),
                );
                // Absorbed failures are informational once a provider answered.
                for failure in &success.failures {
                    warnings.push(format!(
                        "{label}: {} failed with {} after {} attempt(s): {}",
                        failure.provider_id,
                        failure.error_kind,
                        failure.attempts_made,
                        failure.message
                    ));
                }
                items.push(json!({
                    "request_id": request_id,
                    "audio_file": label,
                    "status": "ok",
                    "provider_id": success.selected_provider,
                    "text": success.data.text,
                    "language": success.data.language,
                    "attempts": success.attempts,
                }));
            }
            Err(error) => {
                extend_chain(&mut source_chain, candidates.iter().cloned());
                errors.extend(EnvelopeError::from_aggregate(&error));
                items.push(json!({
                    "request_id": request_id,
                    "audio_file": label,
                    "status": "failed",
                    "error": error.code(),
                }));
            }
        }
        request_ids.push(request_id);
    }

    let request_id = match request_ids.as_slice() {
        [only] => Some(only.clone()),
        _ => None,
    };

    Ok(CommandResult {
        request_id,
        data: Value::Array(items),
        warnings,
        errors,
        latency_ms: elapsed_ms(started),
        source_chain,
    })
}

fn extend_chain(chain: &mut Vec<String>, ids: impl Iterator<Item = String>) {
    for id in ids {
        if !chain.contains(&id) {
            chain.push(id);
        }
    }
}
