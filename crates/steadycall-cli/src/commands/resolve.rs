use std::sync::Arc;

use serde_json::json;
use steadycall_core::{ResolveError, StreamResolver};
use tokio::time::Instant;

use crate::cli::ResolveArgs;
use crate::commands::{elapsed_ms, CommandResult, Context};
use crate::error::CliError;
use crate::output::EnvelopeError;

pub async fn run(args: &ResolveArgs, context: &Context) -> Result<CommandResult, CliError> {
    let mirrors = &context.settings.mirrors;
    let resolver = StreamResolver::new(
        Arc::clone(&context.http),
        mirrors.piped.clone(),
        mirrors.invidious.clone(),
    )
    .with_request_timeout(mirrors.request_timeout);

    let started = Instant::now();
    match resolver.resolve(&args.resource_id, &context.deadline).await {
        Ok(candidate) => {
            let source_chain = vec![candidate.mirror_url.clone()];
            Ok(CommandResult::ok(json!(candidate), source_chain).with_latency(elapsed_ms(started)))
        }
        Err(ResolveError::InvalidResource(error)) => Err(error.into()),
        Err(error) => {
            let tried = match &error {
                ResolveError::NotFound { mirrors_tried, .. }
                | ResolveError::Interrupted { mirrors_tried, .. } => mirrors_tried.clone(),
                ResolveError::InvalidResource(_) => Vec::new(),
            };
            Ok(CommandResult::failed(EnvelopeError::from_resolve(&error), tried)
                .with_latency(elapsed_ms(started)))
        }
    }
}
