//! Command handlers for CLI operations
//!
//! - serve: run the engine until SIGINT/SIGTERM
//! - run: create a task, run it to completion and print the outcome
//! - endpoints status|wake|sleep: endpoint control surface
//! - tools list|search: tool catalog queries
//! - doctor: probe endpoints and tool backends
//! - secrets set|delete: keyring management

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use sdk::harmony::ToolSpec;

use crate::config::Config;
use crate::daemon::Orca;
use crate::harmony::HarmonyClient;
use crate::lifecycle::{EndpointStatus, LifecycleManager};
use crate::orchestrator::{InMemoryQueue, Priority, TaskStatus};
use crate::secrets::{SecretCache, SecretManager};
use crate::tools::ToolOrchestrator;

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn secret_cache(config: &Config) -> SecretCache {
    SecretCache::new(Arc::new(SecretManager::new(&config.core.keyring_service)))
}

fn lifecycle_manager(config: &Config) -> Result<LifecycleManager> {
    LifecycleManager::from_config(config, &secret_cache(config))
        .context("Failed to set up endpoint providers")
}

/// Run the engine in the foreground
pub async fn handle_serve(config: Config, format: OutputFormat) -> Result<()> {
    let queue_key = config.orchestrator.task_queue.clone();
    let mut orca = Orca::init(config)
        .await
        .context("Failed to initialize engine")?;
    orca.start_queue_consumer(Arc::new(InMemoryQueue::new()), queue_key);

    let _signal = Orca::setup_signal_handler(orca.shutdown_flag());
    match format {
        OutputFormat::Text => println!(
            "Orca serving {} endpoint(s) with {} tool(s). Press Ctrl-C to stop.",
            orca.lifecycle().keys().len(),
            orca.tools().catalog_size()
        ),
        OutputFormat::Json => print_json(&json!({
            "status": "serving",
            "endpoints": orca.lifecycle().keys(),
            "tools": orca.tools().catalog_size(),
        }))?,
    }

    orca.wait_for_shutdown().await;
    let report = orca.shutdown().await;

    match format {
        OutputFormat::Text => println!(
            "Orca stopped ({} task(s) drained, {} cancelled).",
            report.drained, report.cancelled
        ),
        OutputFormat::Json => print_json(&json!({
            "status": "stopped",
            "drained": report.drained,
            "cancelled": report.cancelled,
        }))?,
    }
    Ok(())
}

/// Create a task, run it and print the result
pub async fn handle_run(
    config: Config,
    title: String,
    description: String,
    model: String,
    priority: String,
    timeout: Duration,
    format: OutputFormat,
) -> Result<()> {
    let priority: Priority = priority.parse()?;
    let mut orca = Orca::init(config)
        .await
        .context("Failed to initialize engine")?;
    let orchestrator = orca.orchestrator().clone();

    let task_id = orchestrator
        .create_task(&title, &description, &model, priority)
        .await
        .context("Failed to create task")?;
    orchestrator
        .start_task(&task_id)
        .await
        .context("Failed to start task")?;

    if format == OutputFormat::Text {
        println!("Task {} running on '{}'", task_id, model);
    }

    let waited = orchestrator.wait_for_task(&task_id, timeout).await;
    if waited.is_err() {
        orchestrator.stop_task(&task_id).ok();
    }
    orca.shutdown().await;
    let task = waited.context("Task did not finish")?;

    match format {
        OutputFormat::Text => {
            match task.status {
                TaskStatus::Completed => {
                    println!();
                    println!("{}", task.result.as_deref().unwrap_or_default());
                    println!();
                    println!("✓ Task completed");
                }
                TaskStatus::Failed => {
                    let reason = task
                        .error
                        .as_ref()
                        .map(|e| format!("{} ({})", e.message, e.kind))
                        .unwrap_or_default();
                    println!("✗ Task failed: {}", reason);
                }
                status => println!("Task {}", status),
            }
            println!("  Iterations: {}", task.iterations);
        }
        OutputFormat::Json => print_json(&serde_json::to_value(&task)?)?,
    }

    if task.status == TaskStatus::Failed {
        return Err(anyhow!("task {} failed", task.id));
    }
    Ok(())
}

fn print_endpoints(statuses: &[EndpointStatus], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("{:<10} {:<10} {:<10} {:<25} URL", "KEY", "STATE", "PROVIDER", "LAST USED");
            for status in statuses {
                let last_used = status
                    .last_used
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<10} {:<10} {:<10} {:<25} {}",
                    status.key, status.state, status.provider, last_used, status.base_url
                );
            }
        }
        OutputFormat::Json => print_json(&serde_json::to_value(statuses)?)?,
    }
    Ok(())
}

/// Show endpoint lifecycle state
pub async fn handle_endpoints_status(
    config: &Config,
    key: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let manager = lifecycle_manager(config)?;
    let keys = match key {
        Some(key) => vec![key],
        None => manager.keys(),
    };

    let mut statuses = Vec::with_capacity(keys.len());
    for key in &keys {
        manager.refresh_state(key).await?;
        statuses.push(manager.status(key)?);
    }
    print_endpoints(&statuses, format)
}

/// Wake an endpoint and wait until it is Running
pub async fn handle_endpoints_wake(
    config: &Config,
    key: String,
    timeout: Duration,
    format: OutputFormat,
) -> Result<()> {
    let manager = lifecycle_manager(config)?;
    if format == OutputFormat::Text {
        println!("Waking '{}' (up to {}s)...", key, timeout.as_secs());
    }
    manager
        .ensure_running(&key, timeout)
        .await
        .with_context(|| format!("Failed to wake endpoint '{}'", key))?;
    print_endpoints(&[manager.status(&key)?], format)
}

/// Put an endpoint to sleep
pub async fn handle_endpoints_sleep(config: &Config, key: String, format: OutputFormat) -> Result<()> {
    let manager = lifecycle_manager(config)?;
    manager.refresh_state(&key).await?;
    manager
        .sleep(&key)
        .await
        .with_context(|| format!("Failed to put endpoint '{}' to sleep", key))?;
    print_endpoints(&[manager.status(&key)?], format)
}

fn print_tools(tools: &[ToolSpec], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            if tools.is_empty() {
                println!("No tools found.");
            }
            for tool in tools {
                println!("{:<30} [{}] {}", tool.name, tool.backend, tool.description);
            }
        }
        OutputFormat::Json => print_json(&serde_json::to_value(tools)?)?,
    }
    Ok(())
}

async fn load_tools(config: &Config) -> Result<ToolOrchestrator> {
    ToolOrchestrator::from_config(config, &secret_cache(config))
        .await
        .context("Failed to load tool catalog")
}

/// List the tool catalog
pub async fn handle_tools_list(
    config: &Config,
    backend: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let tools = load_tools(config).await?;
    let specs = match backend {
        Some(id) => tools.get_tools_by_client(&id)?,
        None => tools.get_all_tools(),
    };
    print_tools(&specs, format)
}

/// Rank tools by relevance to `query`
pub async fn handle_tools_search(config: &Config, query: String, format: OutputFormat) -> Result<()> {
    let tools = load_tools(config).await?;
    print_tools(&tools.search_tools(&query), format)
}

/// Probe endpoints and tool backends
pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let mut issues = Vec::new();
    let mut checks: Vec<(String, String)> = Vec::new();

    // Config is already validated when loaded
    checks.push(("Configuration".to_string(), "Valid".to_string()));

    let secrets = secret_cache(config);

    for endpoint in &config.endpoints {
        if let Some(name) = &endpoint.api_key_env {
            match secrets.get(name) {
                Ok(Some(_)) => {
                    checks.push((format!("{} credentials", endpoint.key), "Configured".to_string()))
                }
                Ok(None) => {
                    checks.push((format!("{} credentials", endpoint.key), "Missing".to_string()));
                    issues.push(format!(
                        "Endpoint '{}' expects secret '{}'. Set the env var or run 'orca secrets set {}'.",
                        endpoint.key, name, name
                    ));
                }
                Err(e) => {
                    checks.push((format!("{} credentials", endpoint.key), "Error".to_string()));
                    issues.push(format!("Cannot read secret '{}': {}", name, e));
                }
            }
        }
    }

    match HarmonyClient::from_config(config, &secrets) {
        Ok(client) => {
            for endpoint in &config.endpoints {
                let label = format!("{} model server", endpoint.key);
                if client.probe(&endpoint.key).await.unwrap_or(false) {
                    checks.push((label, "Reachable".to_string()));
                } else {
                    checks.push((label, "Not reachable".to_string()));
                    issues.push(format!(
                        "Endpoint '{}' ({}) is not answering. It may be asleep; try 'orca endpoints wake {}'.",
                        endpoint.key, endpoint.base_url, endpoint.key
                    ));
                }
            }
        }
        Err(e) => issues.push(format!("Cannot build model client: {}", e)),
    }

    match LifecycleManager::from_config(config, &secrets) {
        Ok(manager) => {
            for key in manager.keys() {
                let label = format!("{} control plane", key);
                match manager.is_available(&key).await {
                    Ok(true) => checks.push((label, "Ready".to_string())),
                    Ok(false) => checks.push((label, "Not ready".to_string())),
                    Err(e) => {
                        checks.push((label, "Error".to_string()));
                        issues.push(format!("Control plane for '{}' failed: {}", key, e));
                    }
                }
            }
        }
        Err(e) => issues.push(format!("Cannot build endpoint providers: {}", e)),
    }

    match ToolOrchestrator::from_config(config, &secrets).await {
        Ok(tools) => {
            checks.push(("Tool catalog".to_string(), format!("{} tool(s)", tools.catalog_size())));
            for backend in tools.get_client_status().await {
                let label = format!("Tool backend {}", backend.id);
                if backend.reachable {
                    checks.push((label, format!("Reachable ({} tools)", backend.tools)));
                } else {
                    checks.push((label, "Not reachable".to_string()));
                    issues.push(format!("Tool backend '{}' is not reachable", backend.id));
                }
            }
        }
        Err(e) => {
            checks.push(("Tool catalog".to_string(), "Error".to_string()));
            issues.push(format!("Cannot load tool catalog: {}", e));
        }
    }

    match format {
        OutputFormat::Text => {
            println!("Orca System Diagnostics");
            println!("============================");
            println!();

            println!("System Checks:");
            for (check, status) in &checks {
                println!("  {:<28} {}", format!("{}:", check), status);
            }

            println!();

            if issues.is_empty() {
                println!("✓ All checks passed!");
            } else {
                println!("⚠ Issues found:");
                println!();
                for (i, issue) in issues.iter().enumerate() {
                    println!("  {}. {}", i + 1, issue);
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "checks": checks.iter().map(|(name, status)| {
                    json!({
                        "name": name,
                        "status": status
                    })
                }).collect::<Vec<_>>(),
                "issues": issues,
                "healthy": issues.is_empty()
            });
            print_json(&output)?;
        }
    }

    Ok(())
}

/// Store a secret in the keyring
pub fn handle_secrets_set(config: &Config, name: String, format: OutputFormat) -> Result<()> {
    let manager = SecretManager::new(&config.core.keyring_service);
    let value = manager.prompt_for_secret(&name)?;
    manager
        .set_secret(&name, value.trim())
        .with_context(|| format!("Failed to store secret '{}'", name))?;

    match format {
        OutputFormat::Text => println!("✓ Secret '{}' stored", name),
        OutputFormat::Json => print_json(&json!({ "name": name, "stored": true }))?,
    }
    Ok(())
}

/// Remove a secret from the keyring
pub fn handle_secrets_delete(config: &Config, name: String, format: OutputFormat) -> Result<()> {
    let manager = SecretManager::new(&config.core.keyring_service);
    manager
        .delete_secret(&name)
        .with_context(|| format!("Failed to delete secret '{}'", name))?;

    match format {
        OutputFormat::Text => println!("✓ Secret '{}' deleted", name),
        OutputFormat::Json => print_json(&json!({ "name": name, "deleted": true }))?,
    }
    Ok(())
}
