//! Progress bars for `rescache fetch`, driven by the registry's event stream

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rescache_types::{ResourceEvent, ResourceStatus};
use std::collections::HashMap;

/// One bar per fetched URL
pub struct FetchProgress {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {bytes} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

impl FetchProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Create a bar for `url`, keyed by its normalized form
    pub fn add(&mut self, url: &str) {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(spinner_style());
        pb.set_message(url.to_string());
        self.bars.insert(url.to_string(), pb);
    }

    /// Update a bar from an event
    pub fn handle_event(&self, event: &ResourceEvent) {
        let Some(pb) = event.url().and_then(|url| self.bars.get(url)) else {
            return;
        };

        match event {
            ResourceEvent::Progress {
                downloaded,
                expected,
                ..
            } => {
                if let Some(total) = expected {
                    if pb.length() != Some(*total) {
                        pb.set_style(bar_style());
                        pb.set_length(*total);
                    }
                }
                pb.set_position(*downloaded);
            }

            ResourceEvent::StatusChanged {
                status: ResourceStatus::InProgress,
                ..
            } => pb.enable_steady_tick(std::time::Duration::from_millis(120)),

            ResourceEvent::Completed { url, error: None } => {
                pb.finish_with_message(format!("{} {}", style("✓").green().bold(), url));
            }

            ResourceEvent::Completed {
                url,
                error: Some(error),
            } => {
                pb.abandon_with_message(format!(
                    "{} {}: {}",
                    style("✗").red().bold(),
                    url,
                    error
                ));
            }

            ResourceEvent::Cancelled { url } => {
                pb.abandon_with_message(format!("{} {} cancelled", style("○").dim(), url));
            }

            _ => {}
        }
    }

    /// Finish a bar for a resource that needed no transfer
    pub fn cached(&self, url: &str) {
        if let Some(pb) = self.bars.get(url) {
            pb.finish_with_message(format!("{} {} (cached)", style("✓").green().bold(), url));
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            if !pb.is_finished() {
                pb.finish_and_clear();
            }
        }
    }
}

impl Default for FetchProgress {
    fn default() -> Self {
        Self::new()
    }
}
