//! `skein models` — Show the model catalog and provider availability.

use std::sync::Arc;

use serde::Serialize;

use skein_core::providers::{ProviderDispatcher, ProviderRegistry, ProviderVariant};

use super::truncate;

#[derive(Serialize)]
struct ProviderRow {
    provider: String,
    variant: ProviderVariant,
    models: Vec<String>,
    status: String,
}

/// List every configured provider with the model names it claims.
pub fn list(config: Option<&str>, json: bool) -> Result<(), String> {
    super::load_dotenv();
    let env = super::load_env_config(config)?;
    let registry = Arc::new(ProviderRegistry::builtin());
    let dispatcher = ProviderDispatcher::from_env(&env, registry.clone());

    let rows: Vec<ProviderRow> = dispatcher
        .providers()
        .iter()
        .map(|p| {
            let models = match registry.family_by_provider(p.name()) {
                Some(family) => family
                    .exact
                    .iter()
                    .cloned()
                    .chain(family.prefixes.iter().map(|prefix| format!("{}*", prefix)))
                    .collect(),
                None if p.accepts_any_model() => vec!["(any unclaimed name)".to_string()],
                None => vec!["(loaded models)".to_string()],
            };
            let status = match p.variant() {
                ProviderVariant::CliAgent if p.is_available() => "installed",
                ProviderVariant::CliAgent => "not found",
                ProviderVariant::HostedApi if env.api_key(p.name()).is_some() => "key set",
                ProviderVariant::HostedApi => "no key",
                ProviderVariant::LocalServer if p.accepts_any_model() => "catch-all",
                ProviderVariant::LocalServer => "local",
            };
            ProviderRow {
                provider: p.name().to_string(),
                variant: p.variant(),
                models,
                status: status.to_string(),
            }
        })
        .collect();

    if json {
        let out = serde_json::to_string_pretty(&rows).map_err(|e| e.to_string())?;
        println!("{}", out);
        return Ok(());
    }

    println!("┌──────────────┬──────────────┬────────────────────────────────────────┬───────────┐");
    println!("│ Provider     │ Variant      │ Models                                 │ Status    │");
    println!("├──────────────┼──────────────┼────────────────────────────────────────┼───────────┤");
    for row in &rows {
        println!(
            "│ {:<12} │ {:<12} │ {:<38} │ {:<9} │",
            truncate(&row.provider, 12),
            row.variant.as_str(),
            truncate(&row.models.join(", "), 38),
            row.status
        );
    }
    println!("└──────────────┴──────────────┴────────────────────────────────────────┴───────────┘");
    Ok(())
}
