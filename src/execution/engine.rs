//! The engine: one entry point that validates, plans, stages and dispatches.
//!
//! ```rust,ignore
//! use stackpar::prelude::*;
//!
//! let engine = Engine::new(EngineConfig::default(), HostInfo::detect(), Arc::new(SystemMemory));
//! let double = |plane: &mut [f32], _: PlaneShape| -> anyhow::Result<()> {
//!     plane.iter_mut().for_each(|v| *v *= 2.0);
//!     Ok(())
//! };
//! let stack = engine.execute(stack, Strategy::in_place(&double), &mut NullProgress)?;
//! ```

use crate::core::config::EngineConfig;
use crate::core::error::{StackError, StackResult};
use crate::core::host::{HostInfo, MemoryProbe};
use crate::core::stack::ImageStack;
use crate::execution::dispatch::{self, Strategy};
use crate::execution::planner::{ChunkPlanner, ExecutionPlan, StrategyKind};
use crate::execution::progress::{ProgressScope, ProgressSink};
use crate::memory::SharedBufferManager;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;

/// Runs transforms over image stacks.
pub struct Engine {
    config: EngineConfig,
    host: HostInfo,
    planner: ChunkPlanner,
    manager: SharedBufferManager,
}

impl Engine {
    /// Create an engine. `host` and `probe` are queried by the engine, never
    /// detected on its own.
    pub fn new(config: EngineConfig, host: HostInfo, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            planner: ChunkPlanner::new(host.logical_cores),
            manager: SharedBufferManager::new(probe),
            config,
            host,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Host the engine plans for.
    pub fn host(&self) -> HostInfo {
        self.host
    }

    /// Manager owning the segments this engine stages into. Callers may
    /// allocate shared stacks through it as well.
    pub fn manager(&self) -> &SharedBufferManager {
        &self.manager
    }

    /// The plan [`execute`](Self::execute) would use for `workload` indices.
    pub fn plan_for(&self, workload: usize, kind: StrategyKind) -> ExecutionPlan {
        self.planner.plan(
            workload,
            self.config.cores,
            self.config.chunk_size,
            self.config.force_sequential,
            kind,
        )
    }

    /// Apply `strategy` to every plane of `stack` and return the result.
    ///
    /// In-place and paired strategies return the same stack, mutated. Copy
    /// returns a new heap-backed stack. On error the input is dropped; callers
    /// that need to retry should keep a copy.
    pub fn execute(
        &self,
        stack: ImageStack,
        strategy: Strategy<'_>,
        progress: &mut dyn ProgressSink,
    ) -> StackResult<ImageStack> {
        let plan = self.plan_for(stack.num_planes(), strategy.kind());
        self.execute_with_plan(stack, strategy, plan, progress)
    }

    /// Like [`execute`](Self::execute), with an explicit plan.
    pub fn execute_with_plan(
        &self,
        stack: ImageStack,
        strategy: Strategy<'_>,
        plan: ExecutionPlan,
        progress: &mut dyn ProgressSink,
    ) -> StackResult<ImageStack> {
        let label = plan.task_label(&self.config.task_name);
        let mut scope = ProgressScope::begin(progress, stack.num_planes(), &label);

        if let Err(e) = strategy.validate(stack.shape()) {
            warn!("{}: rejected stack {}: {}", label, stack.shape(), e);
            scope.fail(&e.to_string());
            return Err(e);
        }

        if scope.is_cancelled() {
            info!("Cancellation requested, nothing scheduled");
            scope.cancel();
            return Err(StackError::Cancelled);
        }

        info!(
            "{}: {:?} over stack {} ({})",
            label,
            plan.strategy_kind,
            stack.shape(),
            if plan.is_parallel { "parallel" } else { "sequential" }
        );

        let start = Instant::now();
        let result = self.run(&plan, stack, &strategy, &mut scope);

        match &result {
            Ok(output) => {
                info!("{}: finished {} in {:?}", label, output.shape(), start.elapsed());
                scope.complete();
            }
            Err(e) => {
                warn!("{}: failed after {:?}: {}", label, start.elapsed(), e);
                scope.fail(&e.to_string());
            }
        }
        result
    }

    fn run(
        &self,
        plan: &ExecutionPlan,
        mut stack: ImageStack,
        strategy: &Strategy<'_>,
        scope: &mut ProgressScope<'_>,
    ) -> StackResult<ImageStack> {
        match *strategy {
            Strategy::Copy {
                transform,
                output_plane,
            } => dispatch::copy(plan, &stack, transform, output_plane, scope),
            Strategy::InPlace { transform } => {
                self.with_staging(plan, &mut stack, |target| {
                    dispatch::in_place(plan, target, transform, scope)
                })?;
                Ok(stack)
            }
            Strategy::Paired {
                secondary,
                forwarding,
                transform,
            } => {
                self.with_staging(plan, &mut stack, |target| {
                    dispatch::paired(plan, target, secondary, forwarding, transform, scope)
                })?;
                Ok(stack)
            }
        }
    }

    /// Run `f` on a shared copy of a heap-backed `stack` when the plan is
    /// parallel, copying the result back on success. The staged segment is
    /// released on every path.
    fn with_staging<F>(&self, plan: &ExecutionPlan, stack: &mut ImageStack, f: F) -> StackResult<()>
    where
        F: FnOnce(&mut ImageStack) -> StackResult<()>,
    {
        if !plan.is_parallel || stack.is_shared() {
            return f(stack);
        }

        let mut staged = self.manager.allocate_stack(stack.shape())?;
        staged.as_mut_slice().copy_from_slice(stack.as_slice());
        debug!("Staged {} into {:?}", stack.shape(), staged.segment_name());

        let outcome = f(&mut staged);
        if outcome.is_ok() {
            stack.as_mut_slice().copy_from_slice(staged.as_slice());
        }
        drop(staged);
        outcome
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("host", &self.host)
            .field("manager", &self.manager)
            .finish()
    }
}
