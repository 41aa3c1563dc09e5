use serde_json::json;

use crate::commands::{CommandResult, Context};
use crate::error::CliError;

pub fn run(context: &Context) -> Result<CommandResult, CliError> {
    let catalog = &context.settings.catalog;
    let providers = catalog
        .entries()
        .iter()
        .map(|entry| {
            let config = &entry.config;
            let breaker = context.breakers.breaker_for(config).snapshot();
            json!({
                "id": config.id,
                "display_name": config.display_name,
                "enabled": config.enabled,
                "credential_env": entry.credential_env,
                "credential_present": entry.has_credential(),
                "endpoint": entry.endpoint,
                "model": entry.model,
                "retry": {
                    "max_retries": config.max_retries,
                    "base_delay_ms": config.base_delay_ms(),
                    "max_delay_ms": config.max_delay_ms(),
                },
                "breaker": breaker,
            })
        })
        .collect::<Vec<_>>();

    let mirrors = &context.settings.mirrors;
    let data = json!({
        "providers": providers,
        "mirrors": {
            "piped": mirrors.piped.iter().map(|mirror| mirror.url.as_str()).collect::<Vec<_>>(),
            "invidious": mirrors.invidious.iter().map(|mirror| mirror.url.as_str()).collect::<Vec<_>>(),
        },
        "extractor": {
            "program": context.settings.extractor.program,
            "strategies": context
                .settings
                .extractor
                .strategies
                .iter()
                .map(|strategy| strategy.name())
                .collect::<Vec<_>>(),
        },
    });

    let source_chain = catalog
        .entries()
        .iter()
        .map(|entry| entry.id().to_string())
        .collect();
    let mut result = CommandResult::ok(data, source_chain);

    let missing = catalog
        .entries()
        .iter()
        .filter(|entry| !entry.has_credential())
        .map(|entry| entry.credential_env.as_str())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        result = result.with_warning(format!(
            "providers without credentials are disabled; set {}",
            missing.join(", ")
        ));
    }

    let unrouted = catalog
        .entries()
        .iter()
        .filter(|entry| entry.has_credential() && !entry.has_endpoint())
        .map(|entry| entry.id().as_str())
        .collect::<Vec<_>>();
    if !unrouted.is_empty() {
        result = result.with_warning(format!(
            "providers with a credential but no endpoint are disabled: {}",
            unrouted.join(", ")
        ));
    }

    Ok(result)
}
