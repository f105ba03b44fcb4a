// Orca agentic task orchestrator
// Main entry point for the orca binary

use clap::Parser;
use orca_engine::cli::{Cli, Command, EndpointAction, SecretAction, ToolAction};
use orca_engine::config::Config;
use orca_engine::handlers::{
    handle_doctor, handle_endpoints_sleep, handle_endpoints_status, handle_endpoints_wake,
    handle_run, handle_secrets_delete, handle_secrets_set, handle_serve, handle_tools_list,
    handle_tools_search, OutputFormat,
};
use orca_engine::telemetry::init_telemetry_with_level;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log beats the config file; RUST_LOG beats both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);

    tracing::info!(
        "Orca v{} ({} - {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT_HASH"),
        env!("BUILD_TIMESTAMP")
    );

    match cli.command {
        Command::Serve => handle_serve(config, format).await,

        Command::Run {
            title,
            description,
            model,
            priority,
            timeout,
        } => {
            handle_run(
                config,
                title,
                description,
                model,
                priority,
                Duration::from_secs(timeout),
                format,
            )
            .await
        }

        Command::Endpoints { action } => match action {
            EndpointAction::Status { key } => handle_endpoints_status(&config, key, format).await,
            EndpointAction::Wake { key, timeout } => {
                handle_endpoints_wake(&config, key, Duration::from_secs(timeout), format).await
            }
            EndpointAction::Sleep { key } => handle_endpoints_sleep(&config, key, format).await,
        },

        Command::Tools { action } => match action {
            ToolAction::List { backend } => handle_tools_list(&config, backend, format).await,
            ToolAction::Search { query } => handle_tools_search(&config, query, format).await,
        },

        Command::Doctor => handle_doctor(&config, format).await,

        Command::Secrets { action } => match action {
            SecretAction::Set { name } => handle_secrets_set(&config, name, format),
            SecretAction::Delete { name } => handle_secrets_delete(&config, name, format),
        },
    }
}
