use std::sync::Arc;

use serde_json::json;
use steadycall_core::{
    ExtractionStrategySelector, ExtractionTarget, Strategy, TokioCommandRunner, ValidationError,
};
use tokio::time::Instant;

use crate::cli::ExtractArgs;
use crate::commands::{elapsed_ms, CommandResult, Context};
use crate::error::CliError;
use crate::output::EnvelopeError;

pub async fn run(args: &ExtractArgs, context: &Context) -> Result<CommandResult, CliError> {
    let extractor = &context.settings.extractor;
    let strategies = select_strategies(&extractor.strategies, &args.strategies)?;

    let selector = ExtractionStrategySelector::new(
        extractor.program.clone(),
        Arc::new(TokioCommandRunner),
    )
    .with_timeout_per_strategy(extractor.timeout_per_strategy);
    let target = ExtractionTarget::new(args.url.clone(), args.output.clone());

    let source_chain = strategies
        .iter()
        .map(|strategy| format!("{}/{}", extractor.program, strategy.name()))
        .collect::<Vec<_>>();

    let started = Instant::now();
    match selector.attempt(&target, &strategies, &context.deadline).await {
        Ok(output) => Ok(CommandResult::ok(
            json!(output),
            source_chain[..output.strategies_tried].to_vec(),
        )
        .with_latency(elapsed_ms(started))),
        Err(error) => Ok(
            CommandResult::failed(EnvelopeError::from_aggregate(&error), source_chain)
                .with_latency(elapsed_ms(started)),
        ),
    }
}

/// Keeps the configured order unless names are given, in which case their order wins.
fn select_strategies(
    configured: &[Strategy],
    names: &[String],
) -> Result<Vec<Strategy>, ValidationError> {
    if names.is_empty() {
        return Ok(configured.to_vec());
    }

    names
        .iter()
        .map(|name| {
            configured
                .iter()
                .find(|strategy| strategy.name() == name)
                .cloned()
                .ok_or_else(|| ValidationError::UnknownStrategy {
                    value: name.clone(),
                    known: configured
                        .iter()
                        .map(|strategy| strategy.name().to_owned())
                        .collect::<Vec<_>>()
                        .join(", "),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_strategies_follow_requested_order() {
        let configured = Strategy::ytdlp_defaults(None);

        let selected = select_strategies(&configured, &[String::from("tv"), String::from("android")])
            .expect("known strategies");

        let names = selected.iter().map(Strategy::name).collect::<Vec<_>>();
        assert_eq!(names, vec!["tv", "android"]);
    }

    #[test]
    fn unknown_strategy_name_is_rejected() {
        let configured = Strategy::ytdlp_defaults(None);

        let error = select_strategies(&configured, &[String::from("carrier-pigeon")])
            .expect_err("unknown strategy");

        assert!(error.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn no_names_keeps_configured_order() {
        let configured = Strategy::ytdlp_defaults(Some("firefox"));

        let selected = select_strategies(&configured, &[]).expect("defaults");

        assert_eq!(selected, configured);
    }
}
