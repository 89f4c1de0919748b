//! Output formatting utilities

use console::style;
use rescache_types::{ResourceInfo, ResourceStatus};
use serde::Serialize;
use std::time::Duration;
use tabled::{Table, Tabled};

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Expected length, `?` when unknown
pub fn format_length(length: i64) -> String {
    if length < 0 {
        "?".to_string()
    } else {
        format_bytes(length as u64)
    }
}

pub fn format_period(period: Duration) -> String {
    let seconds = period.as_secs();
    if seconds == 0 {
        return "never".to_string();
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

pub fn print_resource_summary(resource: &ResourceInfo, detailed: bool) {
    let status_icon = match resource.status {
        ResourceStatus::Downloaded => style("✓").green(),
        ResourceStatus::InProgress => style("↓").cyan(),
        ResourceStatus::NotDownloaded if resource.last_error.is_some() => style("✗").red(),
        ResourceStatus::NotDownloaded => style("·").dim(),
    };

    println!(
        "{} {} {} [{}]",
        status_icon,
        style(&resource.url).bold(),
        style(format_length(resource.expected_length)).dim(),
        style(resource.status).dim()
    );

    if detailed {
        if let Some(ref content_type) = resource.content_type {
            println!("    Type: {}", content_type);
        }
        if resource.status == ResourceStatus::InProgress {
            println!("    Progress: {:.1}%", resource.progress * 100.0);
        }
        if let Some(loaded) = resource.loaded_date {
            println!("    Loaded: {}", loaded.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        if let Some(accessed) = resource.last_access_date {
            println!("    Last access: {}", accessed.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        println!("    Expires after: {}", format_period(resource.expiration_period));
        if let Some(ref error) = resource.last_error {
            println!("    Error: {}", style(error).red());
        }
        println!();
    }
}

#[derive(Tabled)]
struct ResourceRow {
    url: String,
    status: String,
    size: String,
    #[tabled(rename = "type")]
    content_type: String,
    expires: String,
}

pub fn print_resource_table(resources: &[ResourceInfo]) {
    let rows: Vec<ResourceRow> = resources
        .iter()
        .map(|r| ResourceRow {
            url: truncate(&r.url, 60),
            status: r.status.to_string(),
            size: format_length(r.expected_length),
            content_type: r.content_type.clone().unwrap_or_else(|| "-".to_string()),
            expires: format_period(r.expiration_period),
        })
        .collect();

    println!("{}", Table::new(rows));
}
