//! Progress reporting for dispatch calls.
//!
//! The engine reports through the [`ProgressSink`] trait and only ever from
//! the coordinating thread: workers signal completions, the coordinator turns
//! them into [`ProgressSink::advance`] calls. [`ProgressScope`] guarantees a
//! single terminal transition however the call ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Receiver of progress from the engine.
pub trait ProgressSink {
    /// Start a new call of `total` units. A sink reused across calls forgets
    /// the previous call, including its terminal state.
    fn set_total(&mut self, total: usize);

    /// Record `n` more completed units.
    fn advance(&mut self, n: usize, message: &str);

    /// Terminal transition on success.
    fn mark_complete(&mut self);

    /// Terminal transition on failure.
    fn mark_failed(&mut self, reason: &str);

    /// Terminal transition when a cancellation request stopped the call.
    fn mark_cancelled(&mut self) {
        self.mark_failed("cancelled");
    }

    /// Whether the owner asked for the work to stop.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn set_total(&mut self, _total: usize) {}
    fn advance(&mut self, _n: usize, _message: &str) {}
    fn mark_complete(&mut self) {}
    fn mark_failed(&mut self, _reason: &str) {}
}

/// Where a tracked task stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// Still accepting progress.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped by a cancellation request.
    Cancelled,
}

/// Snapshot of a tracked task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressState {
    /// Units the task will complete.
    pub total_units: usize,
    /// Units completed so far. Never decreases.
    pub completed_units: usize,
    /// Most recent message.
    pub message: String,
    /// Terminal state, or `Running`.
    pub terminal: TerminalState,
}

/// A progress update event.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    /// A task has started.
    Started {
        total_units: usize,
    },
    /// Units have been completed.
    Advanced {
        completed_units: usize,
        total_units: usize,
        message: String,
        percent: f32,
        estimated_remaining_ms: Option<u64>,
    },
    /// The task completed.
    Completed {
        total_duration_ms: u64,
        completed_units: usize,
    },
    /// The task failed.
    Failed {
        completed_units: usize,
        message: String,
    },
    /// The task was cancelled.
    Cancelled,
}

/// Callback type for progress updates.
pub type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Requests cancellation of a [`ProgressTracker`] from another thread.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Ask the tracked work to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Tracks progress, forwards events to an optional callback, and carries a
/// cancellation flag.
pub struct ProgressTracker {
    state: ProgressState,
    cancelled: Arc<AtomicBool>,
    start_time: Option<Instant>,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    /// Create a tracker. The total is set by the engine when a call starts.
    pub fn new() -> Self {
        Self {
            state: ProgressState {
                total_units: 0,
                completed_units: 0,
                message: String::new(),
                terminal: TerminalState::Running,
            },
            cancelled: Arc::new(AtomicBool::new(false)),
            start_time: None,
            callback: None,
        }
    }

    /// Set a callback for progress updates.
    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Token for requesting cancellation from elsewhere.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken(Arc::clone(&self.cancelled))
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Current state.
    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// Whether the task reached `Completed`.
    pub fn is_complete(&self) -> bool {
        self.state.terminal == TerminalState::Completed
    }

    /// Current progress percentage.
    pub fn progress_percent(&self) -> f32 {
        if self.state.total_units == 0 {
            return 100.0;
        }
        (self.state.completed_units as f32 / self.state.total_units as f32) * 100.0
    }

    /// Estimate remaining time in milliseconds from the average time per unit.
    pub fn estimated_remaining_ms(&self) -> Option<u64> {
        let start = self.start_time?;
        if self.state.completed_units == 0 {
            return None;
        }
        let elapsed = start.elapsed().as_millis() as u64;
        let per_unit = elapsed / self.state.completed_units as u64;
        let remaining = self.state.total_units.saturating_sub(self.state.completed_units);
        Some(per_unit * remaining as u64)
    }

    fn is_running(&self) -> bool {
        self.state.terminal == TerminalState::Running
    }

    fn elapsed_ms(&self) -> u64 {
        self.start_time
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    fn send_update(&self, update: ProgressUpdate) {
        if let Some(ref callback) = self.callback {
            callback(update);
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressTracker {
    fn set_total(&mut self, total: usize) {
        self.state = ProgressState {
            total_units: total,
            completed_units: 0,
            message: String::new(),
            terminal: TerminalState::Running,
        };
        self.start_time = Some(Instant::now());
        self.send_update(ProgressUpdate::Started { total_units: total });
    }

    fn advance(&mut self, n: usize, message: &str) {
        if !self.is_running() {
            return;
        }
        self.state.completed_units += n;
        if !message.is_empty() {
            self.state.message = message.to_string();
        }
        self.send_update(ProgressUpdate::Advanced {
            completed_units: self.state.completed_units,
            total_units: self.state.total_units,
            message: self.state.message.clone(),
            percent: self.progress_percent(),
            estimated_remaining_ms: self.estimated_remaining_ms(),
        });
    }

    fn mark_complete(&mut self) {
        if !self.is_running() {
            return;
        }
        self.state.terminal = TerminalState::Completed;
        self.send_update(ProgressUpdate::Completed {
            total_duration_ms: self.elapsed_ms(),
            completed_units: self.state.completed_units,
        });
    }

    fn mark_failed(&mut self, reason: &str) {
        if !self.is_running() {
            return;
        }
        self.state.terminal = TerminalState::Failed;
        self.state.message = reason.to_string();
        self.send_update(ProgressUpdate::Failed {
            completed_units: self.state.completed_units,
            message: reason.to_string(),
        });
    }

    fn mark_cancelled(&mut self) {
        if !self.is_running() {
            return;
        }
        self.state.terminal = TerminalState::Cancelled;
        self.send_update(ProgressUpdate::Cancelled);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Scoped use of a [`ProgressSink`] for one dispatch call.
///
/// Exactly one terminal transition happens: [`complete`](Self::complete),
/// [`fail`](Self::fail), [`cancel`](Self::cancel), or `mark_failed` from
/// `Drop` when the scope is abandoned (early return or unwinding).
pub struct ProgressScope<'a> {
    sink: &'a mut dyn ProgressSink,
    message: String,
    finished: bool,
}

impl<'a> ProgressScope<'a> {
    /// Start a scope of `total` units labelled `message`.
    pub fn begin(sink: &'a mut dyn ProgressSink, total: usize, message: &str) -> Self {
        sink.set_total(total);
        sink.advance(0, message);
        Self {
            sink,
            message: message.to_string(),
            finished: false,
        }
    }

    /// Label passed with every [`step`](Self::step).
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Record one completed unit under the scope's label.
    pub fn step(&mut self) {
        self.sink.advance(1, &self.message);
    }

    /// Record `n` completed units.
    pub fn advance(&mut self, n: usize, message: &str) {
        self.sink.advance(n, message);
    }

    /// Whether the sink's owner asked for the work to stop.
    pub fn is_cancelled(&self) -> bool {
        self.sink.is_cancelled()
    }

    /// Finish because of a cancellation request.
    pub fn cancel(mut self) {
        self.finished = true;
        self.sink.mark_cancelled();
    }

    /// Finish successfully.
    pub fn complete(mut self) {
        self.finished = true;
        self.sink.mark_complete();
    }

    /// Finish with an error.
    pub fn fail(mut self, reason: &str) {
        self.finished = true;
        self.sink.mark_failed(reason);
    }
}

impl Drop for ProgressScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.sink.mark_failed("abandoned before completion");
        }
    }
}
