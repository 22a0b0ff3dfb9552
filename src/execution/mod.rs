//! Execution: planning, dispatch strategies, progress and the engine.

pub mod dispatch;
pub mod engine;
pub mod planner;
pub mod progress;

pub use dispatch::{CopyFn, Forwarding, InPlaceFn, PairedFn, Secondary, Strategy};
pub use engine::Engine;
pub use planner::{partition, ChunkPlanner, ExecutionPlan, PlanReason, StrategyKind, WorkUnit};
pub use progress::{
    CancelToken, NullProgress, ProgressCallback, ProgressScope, ProgressSink, ProgressTracker,
    ProgressUpdate, TerminalState,
};
