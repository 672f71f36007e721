//! Progress tracking for long-running build phases.
//!
//! A `ProgressStack` is created by the caller and handed to each phase by
//! reference. Entering a phase pushes a frame and returns a `PhaseGuard`;
//! dropping the guard pops it. Workers report through the guard from any
//! thread. Reporting never blocks: contributions are summed in an atomic and
//! whichever thread wins the publish gate flushes the total to the bar.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;

/// Create a styled progress bar for a counted phase.
pub fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Create a spinner for indeterminate progress.
pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// Helper to display a temporary spinner during an operation.
pub fn with_spinner<F, T>(message: &str, operation: F) -> T
where
    F: FnOnce() -> T,
{
    let spinner = create_spinner(message);
    let result = operation();
    spinner.finish_and_clear();
    result
}

/// Explicit stack of nested progress phases.
pub struct ProgressStack {
    multi: Option<MultiProgress>,
    frames: Mutex<Vec<String>>,
}

impl ProgressStack {
    /// Stack that draws bars to stderr.
    pub fn new() -> Self {
        Self {
            multi: Some(MultiProgress::with_draw_target(ProgressDrawTarget::stderr())),
            frames: Mutex::new(Vec::new()),
        }
    }

    /// Stack that tracks phases but draws nothing.
    pub fn disabled() -> Self {
        Self {
            multi: None,
            frames: Mutex::new(Vec::new()),
        }
    }

    /// Enters a phase with `total` units of work (zero for a spinner).
    pub fn push(&self, name: &str, total: u64) -> PhaseGuard<'_> {
        self.frames.lock().push(name.to_string());
        let bar = self.multi.as_ref().map(|multi| {
            let bar = if total == 0 {
                create_spinner(name)
            } else {
                create_progress_bar(total, name)
            };
            multi.add(bar)
        });
        PhaseGuard {
            stack: self,
            bar,
            pending: AtomicU64::new(0),
            publishing: AtomicBool::new(false),
            reported: AtomicU64::new(0),
        }
    }

    /// Number of phases currently entered.
    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    /// Name of the innermost phase.
    pub fn current(&self) -> Option<String> {
        self.frames.lock().last().cloned()
    }
}

impl Default for ProgressStack {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Scoped handle to one phase; pops the phase on drop.
pub struct PhaseGuard<'a> {
    stack: &'a ProgressStack,
    bar: Option<ProgressBar>,
    pending: AtomicU64,
    publishing: AtomicBool,
    reported: AtomicU64,
}

impl PhaseGuard<'_> {
    /// Records `delta` completed units from any thread.
    ///
    /// Only the thread that wins the gate publishes. A losing thread leaves
    /// its contribution in `pending` for the next publisher.
    pub fn report(&self, delta: u64) {
        self.pending.fetch_add(delta, Ordering::Relaxed);
        if self.publishing.swap(true, Ordering::Acquire) {
            return;
        }
        let batch = self.pending.swap(0, Ordering::Relaxed);
        self.reported.fetch_add(batch, Ordering::Relaxed);
        if let Some(bar) = &self.bar {
            bar.inc(batch);
        }
        self.publishing.store(false, Ordering::Release);
    }

    /// Units published so far plus units still pending.
    pub fn completed(&self) -> u64 {
        self.reported.load(Ordering::Relaxed) + self.pending.load(Ordering::Relaxed)
    }

    pub fn set_message(&self, message: &str) {
        if let Some(bar) = &self.bar {
            bar.set_message(message.to_string());
        }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        let rest = self.pending.swap(0, Ordering::Relaxed);
        self.reported.fetch_add(rest, Ordering::Relaxed);
        if let Some(bar) = self.bar.take() {
            bar.inc(rest);
            bar.finish_and_clear();
        }
        self.stack.frames.lock().pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_pop_on_drop() {
        let stack = ProgressStack::disabled();
        {
            let _outer = stack.push("build", 3);
            assert_eq!(stack.depth(), 1);
            {
                let _inner = stack.push("prune", 10);
                assert_eq!(stack.current().as_deref(), Some("prune"));
            }
            assert_eq!(stack.current().as_deref(), Some("build"));
        }
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_concurrent_reports_are_not_lost() {
        let stack = ProgressStack::disabled();
        let phase = stack.push("assign", 8000);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        phase.report(1);
                    }
                });
            }
        });
        assert_eq!(phase.completed(), 8000);
    }
}
