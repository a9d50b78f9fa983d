//! Progress bars for download runs, driven by registry progress events.

use std::time::Duration;

use dashmap::DashMap;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use kdownload_core::{DownloadKey, ProgressEvent, SessionState};

const BAR_TEMPLATE: &str =
    "{spinner} {msg:30!} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const SPINNER_TEMPLATE: &str = "{spinner} {msg:30!} {bytes} ({bytes_per_sec})";

/// One bar per download key.
pub(crate) struct ProgressBars {
    multi: MultiProgress,
    bars: DashMap<DownloadKey, ProgressBar>,
}

impl ProgressBars {
    /// Creates bars drawn to stderr, or hidden ones when `visible` is false.
    pub(crate) fn new(visible: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: DashMap::new(),
        }
    }

    /// Adds a bar labelled `label` for `key`. A key that already has a bar keeps it.
    pub(crate) fn register(&self, key: &DownloadKey, label: &str) {
        self.bars.entry(key.clone()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new_spinner());
            bar.set_style(spinner_style());
            bar.set_message(label.to_string());
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        });
    }

    /// Drops the bar for `key` without leaving it on screen.
    pub(crate) fn remove(&self, key: &DownloadKey) {
        if let Some((_, bar)) = self.bars.remove(key) {
            bar.finish_and_clear();
        }
    }

    /// Applies one progress event to its bar.
    pub(crate) fn update(&self, event: &ProgressEvent) {
        let Some(bar) = self.bars.get(&event.key) else {
            return;
        };

        if let Some(total) = event.total_bytes
            && bar.length() != Some(total)
        {
            bar.set_length(total);
            bar.set_style(bar_style());
        }
        bar.set_position(event.bytes_received);

        match event.state {
            SessionState::Completed => bar.finish(),
            SessionState::Failed | SessionState::Cancelled => {
                bar.abandon_with_message(format!("{} ({})", bar.message(), event.state));
            }
            _ => {}
        }
    }

    /// Clears every bar from the terminal.
    pub(crate) fn clear(&self) {
        if let Err(e) = self.multi.clear() {
            tracing::debug!(error = %e, "could not clear progress bars");
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template(SPINNER_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
