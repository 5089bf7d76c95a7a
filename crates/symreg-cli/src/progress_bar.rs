use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use symreg_registration::{ProgressCallback, ProgressInfo};

/// One bar per resolution level.
#[derive(Default)]
pub struct BarProgressCallback {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarProgressCallback {
    pub fn new() -> Self {
        Self::default()
    }

    fn style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-")
    }

    fn finish(&self) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(bar) = guard.take() {
                bar.finish();
            }
        }
    }
}

impl ProgressCallback for BarProgressCallback {
    fn on_progress(&self, info: &ProgressInfo) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(bar) = guard.as_ref() {
                bar.set_position(info.iteration as u64);
                bar.set_message(format!("cost {:.6}", info.cost));
            }
        }
    }

    fn on_level(&self, stage: &'static str, level: usize, total_levels: usize, iterations: usize) {
        self.finish();
        let bar = ProgressBar::new(iterations as u64);
        bar.set_style(Self::style());
        bar.set_prefix(format!("{stage} {}/{}", level + 1, total_levels));
        if let Ok(mut guard) = self.bar.lock() {
            *guard = Some(bar);
        }
    }

    fn on_complete(&self, info: &ProgressInfo) {
        self.finish();
        tracing::info!(
            "{} registration finished in {:.2}s, cost {:.6}",
            info.stage,
            info.elapsed.as_secs_f64(),
            info.cost
        );
    }

    fn on_error(&self, error: &str) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(bar) = guard.take() {
                bar.abandon_with_message(error.to_string());
            }
        }
    }
}
