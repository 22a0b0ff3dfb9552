//! # Stackpar - Parallel Processing for Image Stacks
//!
//! Stackpar applies per-plane transforms to 3-D image stacks (tomographic
//! projections and sinograms) on a pool of worker threads.
//!
//! ## Features
//!
//! - **Three dispatch strategies**: copy, in-place on one array, and paired in-place on two arrays
//! - **Shared memory staging**: named POSIX segments with exactly-once release
//! - **Planning**: small workloads and single-core requests stay on the calling thread
//! - **Progress**: one update per finished plane, cancellation before scheduling
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stackpar::prelude::*;
//! use std::sync::Arc;
//!
//! let config = EngineConfig::default().with_env_overrides()?;
//! let engine = Engine::new(config, HostInfo::detect(), Arc::new(SystemMemory));
//!
//! let stack = ImageStack::zeros(StackShape::new(100, 512, 512))?;
//! let gain = 1.5f32;
//! let scale = move |plane: &mut [f32], _: PlaneShape| -> anyhow::Result<()> {
//!     plane.iter_mut().for_each(|v| *v *= gain);
//!     Ok(())
//! };
//!
//! let mut progress = ProgressTracker::new();
//! let stack = engine.execute(stack, Strategy::in_place(&scale), &mut progress)?;
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: shapes, stacks, size estimation, host facts, config and errors
//! - [`memory`]: shared segments and the memory-checked allocator
//! - [`execution`]: planner, dispatch strategies, progress and the engine

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod core;
pub mod execution;
pub mod memory;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use stackpar::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::config::EngineConfig;
    pub use crate::core::error::{StackError, StackResult};
    pub use crate::core::host::{FixedMemory, HostInfo, MemoryProbe, SystemMemory};
    pub use crate::core::size::{fits_in_memory, full_size_kb, required_bytes};
    pub use crate::core::stack::{ImageStack, PlaneShape, StackShape};

    // Shared memory
    pub use crate::memory::{SegmentHandle, SharedArray, SharedBufferManager};

    // Execution
    pub use crate::execution::dispatch::{Forwarding, Secondary, Strategy};
    pub use crate::execution::engine::Engine;
    pub use crate::execution::planner::{ChunkPlanner, ExecutionPlan, StrategyKind};
    pub use crate::execution::progress::{
        NullProgress, ProgressSink, ProgressTracker, ProgressUpdate,
    };
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
