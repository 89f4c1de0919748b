//! CLI command implementations

use crate::config;
use crate::output::{format_bytes, print_json, print_resource_summary, print_resource_table};
use crate::progress::FetchProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use console::style;
use rescache_core::{CompletionOutcome, Registry, Resource};
use rescache_types::{CacheSettings, ResourceInfo, ResourceStatus};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

// ============================================================================
// Fetch Commands
// ============================================================================

#[derive(Serialize)]
struct FetchResult {
    #[serde(flatten)]
    resource: ResourceInfo,
    outcome: &'static str,
    error: Option<String>,
}

impl FetchResult {
    fn new(resource: ResourceInfo, outcome: &CompletionOutcome) -> Self {
        let (label, error) = match outcome {
            CompletionOutcome::Downloaded => ("downloaded", None),
            CompletionOutcome::Failed(e) => ("failed", Some(e.to_string())),
            CompletionOutcome::Cancelled => ("cancelled", None),
        };
        Self {
            resource,
            outcome: label,
            error,
        }
    }
}

pub async fn fetch(
    registry: &Registry,
    urls: Vec<String>,
    force: bool,
    format: OutputFormat,
) -> Result<()> {
    let mut resources: Vec<Resource> = Vec::new();
    for url in &urls {
        let resource = registry.resource_for(url.as_str())?;
        if !resources.contains(&resource) {
            resources.push(resource);
        }
    }

    let mut events = registry.subscribe();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut progress = FetchProgress::new();
    let show_bars = format == OutputFormat::Human;

    for resource in &resources {
        if force && resource.status() == ResourceStatus::Downloaded {
            registry.remove(resource.key())?;
        }

        let url = resource.key().to_string();
        if show_bars {
            progress.add(&url);
            if resource.status() == ResourceStatus::Downloaded {
                progress.cached(&url);
            }
        }

        let tx = done_tx.clone();
        resource.add_completion_handler(move |info, outcome| {
            let _ = tx.send(FetchResult::new(info.clone(), outcome));
        });
        registry.download(resource.key())?;
    }
    drop(done_tx);

    let mut results = Vec::with_capacity(resources.len());
    let mut events_open = true;
    while results.len() < resources.len() {
        tokio::select! {
            done = done_rx.recv() => match done {
                Some(result) => results.push(result),
                None => break,
            },
            event = events.recv(), if events_open => match event {
                Ok(event) if show_bars => progress.handle_event(&event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Progress display skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => events_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                for resource in &resources {
                    resource.cancel();
                }
            }
        }
    }
    progress.clear();

    let failed = results.iter().filter(|r| r.outcome != "downloaded").count();
    match format {
        OutputFormat::Json => print_json(&results)?,
        OutputFormat::Table => {
            let infos: Vec<ResourceInfo> = results.iter().map(|r| r.resource.clone()).collect();
            print_resource_table(&infos);
        }
        OutputFormat::Human => {
            for result in &results {
                match &result.error {
                    None if result.outcome == "downloaded" => println!(
                        "{} {} ({})",
                        style("✓").green().bold(),
                        style(&result.resource.url).cyan(),
                        format_bytes(result.resource.downloaded_length)
                    ),
                    None => println!(
                        "{} {} {}",
                        style("○").dim(),
                        result.resource.url,
                        result.outcome
                    ),
                    Some(error) => println!(
                        "{} {}: {}",
                        style("✗").red().bold(),
                        result.resource.url,
                        style(error).red()
                    ),
                }
            }
        }
    }

    if failed > 0 {
        return Err(anyhow!("{} of {} fetches did not complete", failed, resources.len()));
    }
    Ok(())
}

pub async fn get(registry: &Registry, url: &str, output: Option<PathBuf>) -> Result<()> {
    let data = registry.data(url).await?;

    match output {
        Some(path) => {
            tokio::fs::write(&path, &data)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!(
                "{} Wrote {} to {}",
                style("✓").green().bold(),
                format_bytes(data.len() as u64),
                path.display()
            );
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
    }

    Ok(())
}

pub async fn seed(registry: &Registry, url: &str, file: PathBuf, format: OutputFormat) -> Result<()> {
    let data = tokio::fs::read(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let length = data.len() as u64;
    registry.set_data(url, Bytes::from(data)).await?;

    let info = registry.resource_for(url)?.info();
    match format {
        OutputFormat::Json => print_json(&info)?,
        _ => println!(
            "{} Seeded {} ({})",
            style("✓").green().bold(),
            style(&info.url).cyan(),
            format_bytes(length)
        ),
    }
    Ok(())
}

pub fn remove(registry: &Registry, url: &str, format: OutputFormat) -> Result<()> {
    let known = registry.get(url).is_some();
    registry.remove(url)?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "url": url, "removed": known }))?,
        _ if known => println!("{} Removed {}", style("✓").green().bold(), url),
        _ => println!("{} {} was not cached", style("·").dim(), url),
    }
    Ok(())
}

// ============================================================================
// Inspection Commands
// ============================================================================

fn parse_status(filter: &str) -> Result<ResourceStatus> {
    let normalized = filter.trim().to_lowercase().replace([' ', '-'], "_");
    serde_json::from_value(serde_json::Value::String(normalized))
        .map_err(|_| anyhow!("Unknown status: {}", filter))
}

pub fn list(
    registry: &Registry,
    status_filter: Option<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let status = status_filter.as_deref().map(parse_status).transpose()?;
    let resources: Vec<ResourceInfo> = registry
        .resources()
        .into_iter()
        .filter(|r| status.map_or(true, |s| r.status == s))
        .collect();

    match format {
        OutputFormat::Json => print_json(&resources)?,
        OutputFormat::Table => print_resource_table(&resources),
        OutputFormat::Human => {
            if resources.is_empty() {
                println!("{}", style("No resources found").dim());
                return Ok(());
            }

            for resource in &resources {
                print_resource_summary(resource, show_all);
            }
            println!();
            println!("{} resource(s) total", style(resources.len()).bold());
        }
    }

    Ok(())
}

pub fn info(registry: &Registry, url: &str, format: OutputFormat) -> Result<()> {
    let resource = registry
        .get(url)
        .ok_or_else(|| anyhow!("Unknown resource: {}", url))?;
    let info = resource.info();

    match format {
        OutputFormat::Json => print_json(&info)?,
        OutputFormat::Table => print_resource_table(std::slice::from_ref(&info)),
        OutputFormat::Human => print_resource_summary(&info, true),
    }
    Ok(())
}

pub fn sweep(registry: &Registry, format: OutputFormat) -> Result<()> {
    let evicted = registry.sweep_expired();

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "evicted": evicted }))?,
        _ => println!("{} Evicted {} expired resource(s)", style("✓").green().bold(), evicted),
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    settings_path: &Path,
    action: Option<&ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = config::load_settings(settings_path).await?;

            match format {
                OutputFormat::Json => {
                    let mut shown = settings.clone();
                    if shown.encryption_key.is_some() {
                        shown.encryption_key = Some("(set)".to_string());
                    }
                    print_json(&shown)?;
                }
                _ => {
                    println!("rescache configuration ({}):", settings_path.display());
                    println!();
                    for key in config::KEYS {
                        println!("  {}: {}", key, config::get_key(&settings, key)?);
                    }
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = config::load_settings(settings_path).await?;
            println!("{}", config::get_key(&settings, key)?);
        }

        Some(ConfigAction::Set { key, value }) => {
            let mut settings = config::load_settings(settings_path).await?;
            config::set_key(&mut settings, key, value)?;
            config::save_settings(settings_path, &settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset { yes }) => {
            use dialoguer::Confirm;

            let confirmed = *yes
                || Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                config::save_settings(settings_path, &CacheSettings::default()).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}
