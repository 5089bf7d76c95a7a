//! Progress tracking and callbacks for registration stages.
//!
//! Engines report per-iteration progress through a [`ProgressTracker`];
//! callbacks decide what to do with it (log, record, draw a bar).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Progress information for one registration iteration.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Stage name (`rigid`, `affine`, `syn`).
    pub stage: &'static str,
    /// Zero-based resolution level.
    pub level: usize,
    /// Number of levels in the stage.
    pub total_levels: usize,
    /// Current iteration number within the level.
    pub iteration: usize,
    /// Iteration cap for the level (if known).
    pub total_iterations: Option<usize>,
    /// Current cost value.
    pub cost: f64,
    /// Current step size in mm.
    pub step: f64,
    /// Time elapsed since the stage started.
    pub elapsed: Duration,
}

impl ProgressInfo {
    /// Calculate progress percentage within the level.
    pub fn progress_percent(&self) -> Option<f64> {
        self.total_iterations
            .filter(|&total| total > 0)
            .map(|total| (self.iteration as f64 / total as f64) * 100.0)
    }
}

/// Progress callback trait for monitoring registration progress.
pub trait ProgressCallback: Send + Sync {
    /// Called at each iteration with progress information.
    fn on_progress(&self, info: &ProgressInfo);

    /// Called when a stage starts.
    fn on_start(&self, _stage: &'static str) {}

    /// Called when a resolution level starts.
    fn on_level(&self, _stage: &'static str, _level: usize, _total_levels: usize, _iterations: usize) {}

    /// Called when a stage completes.
    fn on_complete(&self, _info: &ProgressInfo) {}

    /// Called when a stage fails.
    fn on_error(&self, _error: &str) {}
}

/// Console progress callback that logs to tracing.
#[derive(Debug, Clone)]
pub struct ConsoleProgressCallback {
    /// Log interval (iterations).
    pub log_interval: usize,
}

impl Default for ConsoleProgressCallback {
    fn default() -> Self {
        Self { log_interval: 50 }
    }
}

impl ConsoleProgressCallback {
    /// Create a new console progress callback.
    pub fn new(log_interval: usize) -> Self {
        Self {
            log_interval: log_interval.max(1),
        }
    }
}

impl ProgressCallback for ConsoleProgressCallback {
    fn on_progress(&self, info: &ProgressInfo) {
        if info.iteration % self.log_interval == 0 || info.total_iterations == Some(info.iteration) {
            tracing::debug!(
                "{} level {}/{} iter {}/{} ({:.1}%) | cost: {:.6} | step: {:.3e}",
                info.stage,
                info.level + 1,
                info.total_levels,
                info.iteration,
                info.total_iterations.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string()),
                info.progress_percent().unwrap_or(0.0),
                info.cost,
                info.step,
            );
        }
    }

    fn on_start(&self, stage: &'static str) {
        tracing::info!("{} registration started", stage);
    }

    fn on_level(&self, stage: &'static str, level: usize, total_levels: usize, iterations: usize) {
        tracing::info!(
            "{}: starting level {}/{} ({} iterations)",
            stage,
            level + 1,
            total_levels,
            iterations
        );
    }

    fn on_complete(&self, info: &ProgressInfo) {
        tracing::info!(
            "{} registration completed in {:.2}s with final cost: {:.6}",
            info.stage,
            info.elapsed.as_secs_f64(),
            info.cost
        );
    }

    fn on_error(&self, error: &str) {
        tracing::error!("Registration failed: {}", error);
    }
}

/// History callback that records all progress information.
#[derive(Debug, Clone, Default)]
pub struct HistoryCallback {
    history: Arc<Mutex<Vec<ProgressInfo>>>,
}

impl HistoryCallback {
    /// Create a new history callback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the recorded history.
    pub fn get_history(&self) -> Vec<ProgressInfo> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Clear the history.
    pub fn clear(&self) {
        if let Ok(mut h) = self.history.lock() {
            h.clear();
        }
    }
}

impl ProgressCallback for HistoryCallback {
    fn on_progress(&self, info: &ProgressInfo) {
        if let Ok(mut h) = self.history.lock() {
            h.push(info.clone());
        }
    }
}

/// Progress tracker that fans out to multiple callbacks.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    callbacks: Vec<Arc<dyn ProgressCallback>>,
    start_time: Option<Instant>,
    stage: &'static str,
    level: usize,
    total_levels: usize,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("callbacks", &self.callbacks.len())
            .field("start_time", &self.start_time)
            .field("stage", &self.stage)
            .field("level", &self.level)
            .field("total_levels", &self.total_levels)
            .finish()
    }
}

impl ProgressTracker {
    /// Create a new progress tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback.
    pub fn add_callback(&mut self, callback: Arc<dyn ProgressCallback>) {
        self.callbacks.push(callback);
    }

    /// Builder form of [`add_callback`](Self::add_callback).
    pub fn with_callback(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.add_callback(callback);
        self
    }

    /// Start tracking a stage.
    pub fn start(&mut self, stage: &'static str, total_levels: usize) {
        self.start_time = Some(Instant::now());
        self.stage = stage;
        self.level = 0;
        self.total_levels = total_levels;
        for callback in &self.callbacks {
            callback.on_start(stage);
        }
    }

    /// Enter a resolution level.
    pub fn level(&mut self, level: usize, iterations: usize) {
        self.level = level;
        for callback in &self.callbacks {
            callback.on_level(self.stage, level, self.total_levels, iterations);
        }
    }

    /// Report one iteration.
    pub fn update(&self, iteration: usize, total_iterations: Option<usize>, cost: f64, step: f64) {
        let info = self.info(iteration, total_iterations, cost, step);
        for callback in &self.callbacks {
            callback.on_progress(&info);
        }
    }

    /// Complete tracking.
    pub fn complete(&self, final_cost: f64) {
        let info = self.info(0, None, final_cost, 0.0);
        for callback in &self.callbacks {
            callback.on_complete(&info);
        }
    }

    /// Report error.
    pub fn error(&self, error: &str) {
        for callback in &self.callbacks {
            callback.on_error(error);
        }
    }

    fn info(&self, iteration: usize, total_iterations: Option<usize>, cost: f64, step: f64) -> ProgressInfo {
        ProgressInfo {
            stage: self.stage,
            level: self.level,
            total_levels: self.total_levels,
            iteration,
            total_iterations,
            cost,
            step,
            elapsed: self.start_time.map(|t| t.elapsed()).unwrap_or(Duration::ZERO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percent() {
        let info = ProgressInfo {
            stage: "rigid",
            level: 0,
            total_levels: 3,
            iteration: 10,
            total_iterations: Some(100),
            cost: 0.5,
            step: 1.0,
            elapsed: Duration::from_secs(1),
        };
        assert_eq!(info.progress_percent(), Some(10.0));
    }

    #[test]
    fn test_history_through_tracker() {
        let history = Arc::new(HistoryCallback::new());
        let mut tracker = ProgressTracker::new()
            .with_callback(history.clone())
            .with_callback(Arc::new(ConsoleProgressCallback::new(1)));
        tracker.start("affine", 2);
        tracker.level(1, 10);
        tracker.update(1, Some(10), 0.5, 1.0);
        tracker.update(2, Some(10), 0.4, 1.2);
        tracker.complete(0.4);

        let recorded = history.get_history();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].stage, "affine");
        assert_eq!(recorded[1].level, 1);
        assert_eq!(recorded[1].iteration, 2);

        history.clear();
        assert!(history.get_history().is_empty());
    }
}
