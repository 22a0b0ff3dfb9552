//! Execution planning: worker count, chunk size, and whether to go parallel.

use log::info;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Workloads of this many units or fewer run sequentially; starting a pool
/// costs more than it saves.
pub const SMALL_WORKLOAD_THRESHOLD: usize = 10;

/// Default number of indices per unit of work.
///
/// Larger chunks mean fewer round trips to the coordinator, but every chunk
/// a worker holds is memory in flight, and stacks processed here have planes
/// of many megabytes. One plane per unit keeps the peak lowest.
pub const DEFAULT_CHUNK_SIZE: usize = 1;

/// The three dispatch shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Workers return transformed copies that the coordinator stores by index.
    Copy,
    /// Workers mutate disjoint slices of one shared array.
    InPlaceSingle,
    /// Workers mutate a shared primary array using data from a secondary array.
    PairedTwoArray,
}

/// Why a plan is sequential or parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanReason {
    /// The synchronous-only signal was set.
    SyncSignal,
    /// One core was requested.
    SingleCore,
    /// The workload is at or below [`SMALL_WORKLOAD_THRESHOLD`].
    SmallWorkload,
    /// Parallel execution.
    Parallel,
}

/// How one dispatch call will run. Immutable once made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Worker threads; 1 when sequential.
    pub worker_count: usize,
    /// Indices per unit of work.
    pub chunk_size: usize,
    /// Dispatch shape.
    pub strategy_kind: StrategyKind,
    /// Whether a pool is used at all.
    pub is_parallel: bool,
    /// Which rule decided.
    pub reason: PlanReason,
}

impl ExecutionPlan {
    /// A sequential plan.
    pub fn sequential(strategy_kind: StrategyKind, reason: PlanReason) -> Self {
        Self {
            worker_count: 1,
            chunk_size: DEFAULT_CHUNK_SIZE,
            strategy_kind,
            is_parallel: false,
            reason,
        }
    }

    /// A parallel plan with explicit parameters. Zero values are raised to 1.
    pub fn parallel(strategy_kind: StrategyKind, worker_count: usize, chunk_size: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
            chunk_size: chunk_size.max(1),
            strategy_kind,
            is_parallel: true,
            reason: PlanReason::Parallel,
        }
    }

    /// Task label in the form `"{name} {cores}c {chunksize}chs"`.
    pub fn task_label(&self, name: &str) -> String {
        format!("{} {}c {}chs", name, self.worker_count, self.chunk_size)
    }
}

/// Decides between sequential and parallel execution.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    logical_cores: usize,
}

impl ChunkPlanner {
    /// Create a planner for a machine with `logical_cores` cores.
    pub fn new(logical_cores: usize) -> Self {
        Self {
            logical_cores: logical_cores.max(1),
        }
    }

    /// Plan a call over `workload_size` indices.
    ///
    /// Rules, first match wins: sync signal, one core requested, small
    /// workload, otherwise parallel. A requested value of zero counts as
    /// unset.
    pub fn plan(
        &self,
        workload_size: usize,
        requested_cores: Option<usize>,
        requested_chunksize: Option<usize>,
        sync_signal: bool,
        strategy_kind: StrategyKind,
    ) -> ExecutionPlan {
        let requested_cores = requested_cores.filter(|&c| c > 0);
        let requested_chunksize = requested_chunksize.filter(|&c| c > 0);

        if sync_signal {
            info!("Synchronous execution requested. Running sequentially on 1 core");
            return ExecutionPlan::sequential(strategy_kind, PlanReason::SyncSignal);
        }

        if requested_cores == Some(1) {
            info!("1 core specified. Running sequentially on 1 core");
            return ExecutionPlan::sequential(strategy_kind, PlanReason::SingleCore);
        }

        if workload_size <= SMALL_WORKLOAD_THRESHOLD {
            info!(
                "Workload of {} is at most {}. Running sequentially on 1 core",
                workload_size, SMALL_WORKLOAD_THRESHOLD
            );
            return ExecutionPlan::sequential(strategy_kind, PlanReason::SmallWorkload);
        }

        let worker_count = requested_cores.unwrap_or(self.logical_cores);
        let chunk_size = requested_chunksize.unwrap_or(DEFAULT_CHUNK_SIZE);
        info!("Running in parallel on {} cores, chunk size {}", worker_count, chunk_size);
        ExecutionPlan::parallel(strategy_kind, worker_count, chunk_size)
    }
}

/// A contiguous range of indices handed to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    /// Indices covered by this unit.
    pub range: Range<usize>,
}

impl WorkUnit {
    /// Number of indices in the unit.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Whether the unit covers no indices.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Split `0..workload` into consecutive units of `chunk_size` indices (the
/// last may be shorter). Every index appears in exactly one unit.
pub fn partition(workload: usize, chunk_size: usize) -> Vec<WorkUnit> {
    let chunk_size = chunk_size.max(1);
    (0..workload)
        .step_by(chunk_size)
        .map(|start| WorkUnit {
            range: start..(start + chunk_size).min(workload),
        })
        .collect()
}
