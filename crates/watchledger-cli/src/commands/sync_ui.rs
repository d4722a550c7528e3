use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::sync::Arc;
use watch_sync_core::engine::{PageProgress, ProgressCallback};
use watch_sync_core::SyncReport;

/// Page-level progress for one sync run.
///
/// Draws a bar when attached to a terminal and falls back to structured
/// log lines otherwise.
pub struct SyncUI {
    bar: ProgressBar,
    interactive: bool,
}

impl SyncUI {
    pub fn new(label: &str, quiet: bool) -> Self {
        let interactive = is_interactive() && !quiet;
        let bar = if interactive {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(spinner_style());
        bar.set_message(format!("{}: starting", label));

        if !interactive {
            tracing::debug!(
                operation = "ui_init",
                mode = "non_interactive",
                "Progress bars disabled, using structured logging"
            );
        }

        Self { bar, interactive }
    }

    pub fn callback(&self) -> ProgressCallback {
        let bar = self.bar.clone();
        let interactive = self.interactive;
        Arc::new(move |progress: &PageProgress| {
            if !interactive {
                tracing::info!(
                    operation = "progress",
                    mode = %progress.mode,
                    page = progress.page,
                    page_count = ?progress.page_count,
                    fetched = progress.events_fetched,
                    "Page loaded"
                );
                return;
            }
            match progress.page_count {
                Some(count) if count > 0 => {
                    if bar.length() != Some(u64::from(count)) {
                        bar.set_style(bar_style());
                        bar.set_length(u64::from(count));
                    }
                    bar.set_position(u64::from(progress.page.min(count)));
                }
                _ => bar.tick(),
            }
            let total = progress
                .item_count
                .map(|n| format!(" of {}", n))
                .unwrap_or_default();
            bar.set_message(format!("{}: {} items{}", progress.mode, progress.events_fetched, total));
        })
    }

    pub fn finish(&self, report: &SyncReport) {
        if self.interactive {
            self.bar.finish_and_clear();
        }
        tracing::debug!(mode = %report.mode, pages = report.pages, "Progress finished");
    }

    pub fn abandon(&self) {
        if self.interactive {
            self.bar.abandon();
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] page {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
}

pub fn is_interactive() -> bool {
    std::io::stdout().is_terminal() && std::io::stderr().is_terminal()
}
