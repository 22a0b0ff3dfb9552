//! Dispatch strategies.
//!
//! Every strategy splits the planes of a stack into [`WorkUnit`]s and runs a
//! transform over each index, either on the calling thread or on a worker
//! pool built for the call. Workers never touch progress: each finished index
//! is sent back over a channel and the coordinating thread advances the
//! [`ProgressScope`] and stores results.
//!
//! - [`copy`]: workers return new planes, the coordinator stores them by index
//! - [`in_place`]: workers mutate disjoint slices of the stack
//! - [`paired`]: like `in_place`, with read access to a second stack
//!
//! In-place workers receive slices carved out of the stack with
//! `split_at_mut` along the partition, so two workers can never address the
//! same plane and no lock is needed.

use crate::core::error::{StackError, StackResult};
use crate::core::stack::{ImageStack, PlaneShape, StackShape};
use crate::execution::planner::{partition, ExecutionPlan, StrategyKind, WorkUnit};
use crate::execution::progress::ProgressScope;
use anyhow::anyhow;
use crossbeam::channel::{self, Sender};
use log::{debug, info};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Transform for [`Strategy::Copy`]: reads a plane, returns the new plane.
pub type CopyFn<'f> = dyn Fn(&[f32], PlaneShape) -> anyhow::Result<Vec<f32>> + Sync + 'f;

/// Transform for [`Strategy::InPlace`]: mutates a plane.
pub type InPlaceFn<'f> = dyn Fn(&mut [f32], PlaneShape) -> anyhow::Result<()> + Sync + 'f;

/// Transform for [`Strategy::Paired`]: mutates a primary plane using secondary data.
pub type PairedFn<'f> = dyn Fn(&mut [f32], Secondary<'_>, PlaneShape) -> anyhow::Result<()> + Sync + 'f;

/// How the secondary stack of a paired dispatch reaches the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarding {
    /// Every index sees the whole secondary stack (e.g. a single flat field).
    Broadcast,
    /// Index `i` sees plane `i` of the secondary stack.
    PerIndex,
}

/// Secondary data handed to a [`PairedFn`].
#[derive(Debug, Clone, Copy)]
pub enum Secondary<'a> {
    /// The whole secondary stack.
    Whole(&'a ImageStack),
    /// The secondary plane matching the primary index.
    Plane(&'a [f32]),
}

impl<'a> Secondary<'a> {
    /// The secondary elements: the whole stack or the single plane.
    pub fn as_slice(&self) -> &'a [f32] {
        match *self {
            Secondary::Whole(stack) => stack.as_slice(),
            Secondary::Plane(plane) => plane,
        }
    }
}

/// A transform together with the dispatch shape it needs.
pub enum Strategy<'a> {
    /// Workers return copies; output planes may have another shape.
    Copy {
        /// The transform.
        transform: &'a CopyFn<'a>,
        /// Shape of the returned planes, when it differs from the input.
        output_plane: Option<PlaneShape>,
    },
    /// Workers mutate their planes of the stack.
    InPlace {
        /// The transform.
        transform: &'a InPlaceFn<'a>,
    },
    /// Workers mutate their planes using a second stack.
    Paired {
        /// Read-only second stack.
        secondary: &'a ImageStack,
        /// Whole-stack broadcast or per-index planes.
        forwarding: Forwarding,
        /// The transform.
        transform: &'a PairedFn<'a>,
    },
}

impl<'a> Strategy<'a> {
    /// Copy dispatch keeping the plane shape.
    pub fn copy(transform: &'a CopyFn<'a>) -> Self {
        Strategy::Copy {
            transform,
            output_plane: None,
        }
    }

    /// Copy dispatch producing planes of `output_plane`.
    pub fn copy_reshaped(transform: &'a CopyFn<'a>, output_plane: PlaneShape) -> Self {
        Strategy::Copy {
            transform,
            output_plane: Some(output_plane),
        }
    }

    /// In-place single-array dispatch.
    pub fn in_place(transform: &'a InPlaceFn<'a>) -> Self {
        Strategy::InPlace { transform }
    }

    /// Paired two-array dispatch.
    pub fn paired(secondary: &'a ImageStack, forwarding: Forwarding, transform: &'a PairedFn<'a>) -> Self {
        Strategy::Paired {
            secondary,
            forwarding,
            transform,
        }
    }

    /// Which dispatch shape this is.
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Copy { .. } => StrategyKind::Copy,
            Strategy::InPlace { .. } => StrategyKind::InPlaceSingle,
            Strategy::Paired { .. } => StrategyKind::PairedTwoArray,
        }
    }

    /// Check that a primary stack of `primary` can be processed.
    pub fn validate(&self, primary: StackShape) -> StackResult<()> {
        if primary.is_empty() {
            return Err(StackError::Shape(format!("cannot process empty stack {}", primary)));
        }

        match self {
            Strategy::Copy {
                output_plane: Some(plane),
                ..
            } if plane.is_empty() => Err(StackError::Shape(format!(
                "output plane shape {} is empty",
                plane
            ))),
            Strategy::Paired { secondary, .. } if secondary.is_empty() => Err(StackError::Shape(
                format!("secondary stack {} is empty", secondary.shape()),
            )),
            Strategy::Paired {
                secondary,
                forwarding: Forwarding::PerIndex,
                ..
            } if secondary.shape() != primary => Err(StackError::Shape(format!(
                "per-index forwarding needs matching shapes, primary {} secondary {}",
                primary,
                secondary.shape()
            ))),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for Strategy<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Copy { output_plane, .. } => f
                .debug_struct("Copy")
                .field("output_plane", output_plane)
                .finish_non_exhaustive(),
            Strategy::InPlace { .. } => f.debug_struct("InPlace").finish_non_exhaustive(),
            Strategy::Paired {
                secondary,
                forwarding,
                ..
            } => f
                .debug_struct("Paired")
                .field("secondary", &secondary.shape())
                .field("forwarding", forwarding)
                .finish_non_exhaustive(),
        }
    }
}

/// Run a copy dispatch. Returns a new stack holding the transformed planes
/// in input order.
pub fn copy(
    plan: &ExecutionPlan,
    input: &ImageStack,
    transform: &CopyFn<'_>,
    output_plane: Option<PlaneShape>,
    progress: &mut ProgressScope<'_>,
) -> StackResult<ImageStack> {
    let in_plane = input.plane_shape();
    let out_plane = output_plane.unwrap_or(in_plane);
    let mut output = ImageStack::zeros(input.shape().with_plane(out_plane))?;

    let jobs = partition(input.num_planes(), plan.chunk_size)
        .into_iter()
        .map(|unit| Job { unit, payload: () })
        .collect();

    let work = |index: usize, _pos: usize, _payload: &mut ()| transform(input.plane(index), in_plane);

    execute_units(plan, jobs, &work, progress, |index, plane: Vec<f32>| {
        if plane.len() != out_plane.len() {
            return Err(anyhow!(
                "transform returned {} elements for a {} plane",
                plane.len(),
                out_plane
            ));
        }
        output.plane_mut(index).copy_from_slice(&plane);
        Ok(())
    })?;

    Ok(output)
}

/// Run an in-place dispatch over every plane of `stack`.
pub fn in_place(
    plan: &ExecutionPlan,
    stack: &mut ImageStack,
    transform: &InPlaceFn<'_>,
    progress: &mut ProgressScope<'_>,
) -> StackResult<()> {
    let plane = stack.plane_shape();
    let jobs = split_units(stack, plan.chunk_size);

    let work = |_index: usize, pos: usize, chunk: &mut &mut [f32]| {
        transform(plane_at(chunk, pos, plane.len()), plane)
    };

    execute_units(plan, jobs, &work, progress, |_, ()| Ok(()))
}

/// Run a paired dispatch: planes of `primary` are mutated using `secondary`.
pub fn paired(
    plan: &ExecutionPlan,
    primary: &mut ImageStack,
    secondary: &ImageStack,
    forwarding: Forwarding,
    transform: &PairedFn<'_>,
    progress: &mut ProgressScope<'_>,
) -> StackResult<()> {
    if forwarding == Forwarding::PerIndex && secondary.shape() != primary.shape() {
        return Err(StackError::Shape(format!(
            "per-index forwarding needs matching shapes, primary {} secondary {}",
            primary.shape(),
            secondary.shape()
        )));
    }

    let plane = primary.plane_shape();
    let jobs = split_units(primary, plan.chunk_size);

    let work = |index: usize, pos: usize, chunk: &mut &mut [f32]| {
        let second = match forwarding {
            Forwarding::Broadcast => Secondary::Whole(secondary),
            Forwarding::PerIndex => Secondary::Plane(secondary.plane(index)),
        };
        transform(plane_at(chunk, pos, plane.len()), second, plane)
    };

    execute_units(plan, jobs, &work, progress, |_, ()| Ok(()))
}

/// One unit of work plus whatever the worker needs to own for it.
struct Job<P> {
    unit: WorkUnit,
    payload: P,
}

/// What a worker reports back for one index.
enum Completion<R> {
    Done { index: usize, output: R },
    Failed { index: usize, error: anyhow::Error },
}

/// The lowest failing index and how many failed in total.
#[derive(Default)]
struct Failures {
    first: Option<(usize, anyhow::Error)>,
    count: usize,
}

impl Failures {
    fn record(&mut self, index: usize, error: anyhow::Error) {
        self.count += 1;
        let lower = self.first.as_ref().map_or(true, |(first, _)| index < *first);
        if lower {
            self.first = Some((index, error));
        }
    }

    fn into_result(self) -> StackResult<()> {
        match self.first {
            None => Ok(()),
            Some((index, source)) => Err(StackError::WorkerFailure {
                index,
                failed_units: self.count,
                source,
            }),
        }
    }
}

/// Carve `stack` into one mutable chunk per work unit.
fn split_units(stack: &mut ImageStack, chunk_size: usize) -> Vec<Job<&mut [f32]>> {
    let plane_len = stack.shape().plane_len();
    let units = partition(stack.num_planes(), chunk_size);
    let mut rest = stack.as_mut_slice();
    let mut jobs = Vec::with_capacity(units.len());

    for unit in units {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(unit.len() * plane_len);
        rest = tail;
        jobs.push(Job { unit, payload: head });
    }
    debug_assert!(rest.is_empty());
    jobs
}

fn plane_at<'c>(chunk: &'c mut [f32], pos: usize, plane_len: usize) -> &'c mut [f32] {
    &mut chunk[pos * plane_len..(pos + 1) * plane_len]
}

/// Run every index of every job, sequentially or on a pool as the plan says.
///
/// `work(index, position_in_unit, payload)` runs on a worker; `on_done` runs
/// on the calling thread for every successful index.
fn execute_units<P, R, W, H>(
    plan: &ExecutionPlan,
    jobs: Vec<Job<P>>,
    work: &W,
    progress: &mut ProgressScope<'_>,
    on_done: H,
) -> StackResult<()>
where
    P: Send,
    R: Send,
    W: Fn(usize, usize, &mut P) -> anyhow::Result<R> + Sync,
    H: FnMut(usize, R) -> anyhow::Result<()>,
{
    if plan.is_parallel {
        run_pool(plan, jobs, work, progress, on_done)
    } else {
        run_sequential(jobs, work, progress, on_done)
    }
}

fn run_sequential<P, R, W, H>(
    jobs: Vec<Job<P>>,
    work: &W,
    progress: &mut ProgressScope<'_>,
    mut on_done: H,
) -> StackResult<()>
where
    W: Fn(usize, usize, &mut P) -> anyhow::Result<R>,
    H: FnMut(usize, R) -> anyhow::Result<()>,
{
    for Job { unit, mut payload } in jobs {
        for (pos, index) in unit.range.enumerate() {
            let outcome = match run_guarded(index, || work(index, pos, &mut payload)) {
                Completion::Done { index, output } => on_done(index, output),
                Completion::Failed { error, .. } => Err(error),
            };
            if let Err(source) = outcome {
                return Err(StackError::WorkerFailure {
                    index,
                    failed_units: 1,
                    source,
                });
            }
            progress.step();
        }
    }
    Ok(())
}

fn run_pool<P, R, W, H>(
    plan: &ExecutionPlan,
    jobs: Vec<Job<P>>,
    work: &W,
    progress: &mut ProgressScope<'_>,
    mut on_done: H,
) -> StackResult<()>
where
    P: Send,
    R: Send,
    W: Fn(usize, usize, &mut P) -> anyhow::Result<R> + Sync,
    H: FnMut(usize, R) -> anyhow::Result<()>,
{
    let (tx, rx) = channel::unbounded::<Completion<R>>();
    let halt = AtomicBool::new(false);
    let mut failures = Failures::default();
    let mut completed = 0usize;

    info!(
        "Dispatching {} unit(s) on {} worker(s), chunk size {}",
        jobs.len(),
        plan.worker_count,
        plan.chunk_size
    );

    let exited = AtomicUsize::new(0);

    // The scope returns only after every spawned unit has finished, so the
    // pool is drained on every path, including failures.
    with_joined_pool(plan.worker_count, &exited, |pool| {
        pool.in_place_scope(|scope| {
            for job in jobs {
                let tx = tx.clone();
                let halt = &halt;
                scope.spawn(move |_| run_job(job, work, &tx, halt));
            }
            drop(tx);

            for completion in rx.iter() {
                match completion {
                    Completion::Done { index, output } => match on_done(index, output) {
                        Ok(()) => {
                            completed += 1;
                            progress.step();
                        }
                        Err(error) => {
                            halt.store(true, Ordering::Relaxed);
                            failures.record(index, error);
                        }
                    },
                    Completion::Failed { index, error } => failures.record(index, error),
                }
            }
        })
    })?;

    debug!(
        "Pool drained: {} completed, {} failed, {} worker(s) joined",
        completed,
        failures.count,
        exited.load(Ordering::Relaxed)
    );
    failures.into_result()
}

fn run_job<P, R, W>(job: Job<P>, work: &W, tx: &Sender<Completion<R>>, halt: &AtomicBool)
where
    W: Fn(usize, usize, &mut P) -> anyhow::Result<R>,
{
    let Job { unit, mut payload } = job;
    for (pos, index) in unit.range.enumerate() {
        // After a failure the remaining indices are not worth computing.
        if halt.load(Ordering::Relaxed) {
            return;
        }
        let completion = run_guarded(index, || work(index, pos, &mut payload));
        if matches!(completion, Completion::Failed { .. }) {
            halt.store(true, Ordering::Relaxed);
        }
        // The coordinator only hangs up after every sender is gone.
        let _ = tx.send(completion);
    }
}

/// Build a pool of `workers` threads, run `f` on it, and return only after
/// every worker thread has exited. Each exiting worker bumps `exited`.
fn with_joined_pool<T>(
    workers: usize,
    exited: &AtomicUsize,
    f: impl FnOnce(&ThreadPool) -> T,
) -> StackResult<T> {
    ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("stackpar-worker-{}", i))
        .build_scoped(
            |thread| {
                thread.run();
                exited.fetch_add(1, Ordering::Relaxed);
            },
            f,
        )
        .map_err(|e| StackError::Pool(e.to_string()))
}

/// Run one transform call, turning errors and panics into a completion.
fn run_guarded<R>(index: usize, f: impl FnOnce() -> anyhow::Result<R>) -> Completion<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(output)) => Completion::Done { index, output },
        Ok(Err(error)) => Completion::Failed { index, error },
        Err(payload) => Completion::Failed {
            index,
            error: anyhow!("transform panicked: {}", panic_message(payload.as_ref())),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
