//! End-to-end tests for the engine: planning, staging, dispatch and cleanup.

use parking_lot::Mutex;
use stackpar::execution::progress::TerminalState;
use stackpar::prelude::*;
use std::sync::Arc;

fn engine_with(config: EngineConfig, probe: Arc<dyn MemoryProbe>) -> Engine {
    Engine::new(config, HostInfo::with_cores(4), probe)
}

fn engine(config: EngineConfig) -> Engine {
    engine_with(config, Arc::new(FixedMemory::unlimited()))
}

fn ramp(shape: StackShape) -> ImageStack {
    ImageStack::from_vec(shape, (0..shape.len()).map(|i| i as f32 * 0.5).collect()).unwrap()
}

fn double(plane: &mut [f32], _: PlaneShape) -> anyhow::Result<()> {
    plane.iter_mut().for_each(|v| *v *= 2.0);
    Ok(())
}

fn doubled(plane: &[f32], _: PlaneShape) -> anyhow::Result<Vec<f32>> {
    Ok(plane.iter().map(|v| v * 2.0).collect())
}

#[test]
fn times_two_agrees_across_strategies() {
    let shape = StackShape::new(3, 4, 4);
    let engine = engine(EngineConfig::default());

    let sequential = engine
        .execute(ramp(shape), Strategy::in_place(&double), &mut NullProgress)
        .unwrap();
    assert_eq!(engine.plan_for(3, StrategyKind::InPlaceSingle).worker_count, 1);

    let copy = engine
        .execute_with_plan(
            ramp(shape),
            Strategy::copy(&doubled),
            ExecutionPlan::parallel(StrategyKind::Copy, 2, 1),
            &mut NullProgress,
        )
        .unwrap();

    let in_place = engine
        .execute_with_plan(
            ramp(shape),
            Strategy::in_place(&double),
            ExecutionPlan::parallel(StrategyKind::InPlaceSingle, 3, 1),
            &mut NullProgress,
        )
        .unwrap();

    let expected: Vec<f32> = ramp(shape).as_slice().iter().map(|v| v * 2.0).collect();
    assert_eq!(sequential.as_slice(), expected.as_slice());
    assert_eq!(copy.as_slice(), expected.as_slice());
    assert_eq!(in_place.as_slice(), expected.as_slice());
    assert_eq!(engine.manager().live_count(), 0);
}

#[test]
fn out_of_memory_leaves_no_segment() {
    let manager = SharedBufferManager::new(Arc::new(FixedMemory::new(0)));

    match manager.allocate::<f32>(&[3, 4, 4]) {
        Err(StackError::OutOfMemory { required, available }) => {
            assert_eq!(required, 192);
            assert_eq!(available, 0);
        }
        other => panic!("expected OutOfMemory, got {:?}", other.map(|a| a.len())),
    }
    assert_eq!(manager.live_count(), 0);
}

#[test]
fn failure_mid_stack_cleans_up() {
    let engine = engine(EngineConfig::default());
    let shape = StackShape::new(5, 2, 2);
    let stack = ImageStack::from_vec(
        shape,
        (0..shape.n).flat_map(|i| std::iter::repeat(i as f32).take(4)).collect(),
    )
    .unwrap();
    let fail_on_two = |plane: &mut [f32], _: PlaneShape| -> anyhow::Result<()> {
        if plane[0] == 2.0 {
            anyhow::bail!("detector glitch in plane 2");
        }
        Ok(())
    };

    let mut tracker = ProgressTracker::new();
    let result = engine.execute_with_plan(
        stack,
        Strategy::in_place(&fail_on_two),
        ExecutionPlan::parallel(StrategyKind::InPlaceSingle, 2, 1),
        &mut tracker,
    );

    let error = result.unwrap_err();
    assert_eq!(error.failed_index(), Some(2));
    assert!(error.to_string().contains("detector glitch"));
    assert_eq!(engine.manager().live_count(), 0);
    assert!(!tracker.is_complete());
    assert_eq!(tracker.state().terminal, TerminalState::Failed);
    assert!(tracker.state().completed_units < 5);
}

#[test]
fn reused_tracker_reports_second_failure() {
    let engine = engine(EngineConfig::new().with_cores(2));
    let mut tracker = ProgressTracker::new();

    engine
        .execute(ramp(StackShape::new(3, 2, 2)), Strategy::in_place(&double), &mut tracker)
        .unwrap();
    assert!(tracker.is_complete());
    assert_eq!(tracker.state().total_units, 3);
    assert_eq!(tracker.state().completed_units, 3);

    let always_fail = |_: &mut [f32], _: PlaneShape| -> anyhow::Result<()> { anyhow::bail!("saturated detector") };
    let result = engine.execute_with_plan(
        ramp(StackShape::new(5, 2, 2)),
        Strategy::in_place(&always_fail),
        ExecutionPlan::parallel(StrategyKind::InPlaceSingle, 2, 1),
        &mut tracker,
    );

    assert!(result.is_err());
    assert!(!tracker.is_complete());
    assert_eq!(tracker.state().terminal, TerminalState::Failed);
    assert_eq!(tracker.state().total_units, 5);
    assert_eq!(tracker.state().completed_units, 0);
    assert_eq!(engine.manager().live_count(), 0);
}

#[test]
fn flat_and_dark_correction() {
    let shape = StackShape::new(12, 2, 2);
    let engine = engine(EngineConfig::new().with_cores(3));
    assert!(engine.plan_for(shape.n, StrategyKind::PairedTwoArray).is_parallel);

    let sample = ImageStack::from_vec(shape, vec![10.0; shape.len()]).unwrap();
    let dark = ImageStack::from_vec(
        shape,
        (0..shape.n).flat_map(|i| std::iter::repeat(i as f32 * 0.5).take(4)).collect(),
    )
    .unwrap();
    let subtract = |plane: &mut [f32], dark: Secondary<'_>, _: PlaneShape| -> anyhow::Result<()> {
        for (v, d) in plane.iter_mut().zip(dark.as_slice()) {
            *v -= d;
        }
        Ok(())
    };

    let sample = engine
        .execute(
            sample,
            Strategy::paired(&dark, Forwarding::PerIndex, &subtract),
            &mut NullProgress,
        )
        .unwrap();
    assert_eq!(sample.plane(0), &[10.0; 4]);
    assert_eq!(sample.plane(4), &[8.0; 4]);

    let flat = ImageStack::from_vec(StackShape::new(1, 2, 2), vec![2.0, 4.0, 5.0, 8.0]).unwrap();
    let normalise = |plane: &mut [f32], flat: Secondary<'_>, shape: PlaneShape| -> anyhow::Result<()> {
        let flat = flat.as_slice();
        anyhow::ensure!(flat.len() == shape.len(), "flat field must be a single plane");
        for (v, f) in plane.iter_mut().zip(flat) {
            *v /= f;
        }
        Ok(())
    };

    let sample = engine
        .execute(
            sample,
            Strategy::paired(&flat, Forwarding::Broadcast, &normalise),
            &mut NullProgress,
        )
        .unwrap();
    assert_eq!(sample.plane(4), &[4.0, 2.0, 1.6, 1.0]);
    assert_eq!(engine.manager().live_count(), 0);
}

#[test]
fn per_index_forwarding_rejects_mismatch() {
    let engine = engine(EngineConfig::default());
    let primary = ramp(StackShape::new(12, 2, 2));
    let secondary = ramp(StackShape::new(12, 2, 3));
    let noop = |_: &mut [f32], _: Secondary<'_>, _: PlaneShape| -> anyhow::Result<()> { Ok(()) };

    let mut tracker = ProgressTracker::new();
    let result = engine.execute(
        primary,
        Strategy::paired(&secondary, Forwarding::PerIndex, &noop),
        &mut tracker,
    );
    assert!(matches!(result, Err(StackError::Shape(_))));
    assert_eq!(tracker.state().terminal, TerminalState::Failed);
    assert_eq!(engine.manager().live_count(), 0);
}

#[test]
fn copy_may_change_plane_shape() {
    let engine = engine(EngineConfig::new().with_cores(2));
    let shape = StackShape::new(16, 4, 4);
    let rebin = |plane: &[f32], shape: PlaneShape| -> anyhow::Result<Vec<f32>> {
        let mut out = Vec::with_capacity(shape.len() / 4);
        for r in (0..shape.height).step_by(2) {
            for c in (0..shape.width).step_by(2) {
                let at = |rr: usize, cc: usize| plane[rr * shape.width + cc];
                out.push((at(r, c) + at(r, c + 1) + at(r + 1, c) + at(r + 1, c + 1)) / 4.0);
            }
        }
        Ok(out)
    };

    let output = engine
        .execute(
            ImageStack::from_vec(shape, vec![1.0; shape.len()]).unwrap(),
            Strategy::copy_reshaped(&rebin, PlaneShape::new(2, 2)),
            &mut NullProgress,
        )
        .unwrap();
    assert_eq!(output.shape(), StackShape::new(16, 2, 2));
    assert!(output.as_slice().iter().all(|&v| v == 1.0));
}

#[test]
fn progress_reports_each_plane_once() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let mut tracker = ProgressTracker::new().with_callback(Box::new(move |update: ProgressUpdate| {
        sink.lock().push(update);
    }));

    let engine = engine(EngineConfig::new().with_cores(3).with_task_name("Gaussian"));
    engine
        .execute(ramp(StackShape::new(20, 2, 2)), Strategy::in_place(&double), &mut tracker)
        .unwrap();

    let events = events.lock();
    assert!(matches!(events.first(), Some(ProgressUpdate::Started { total_units: 20 })));
    assert!(matches!(events.last(), Some(ProgressUpdate::Completed { completed_units: 20, .. })));
    let advanced: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            ProgressUpdate::Advanced { completed_units, .. } => Some(*completed_units),
            _ => None,
        })
        .collect();
    assert_eq!(advanced, (0..=20).collect::<Vec<_>>());
    assert!(events.iter().all(|e| match e {
        ProgressUpdate::Advanced { message, .. } => message == "Gaussian 3c 1chs",
        _ => true,
    }));
    assert_eq!(tracker.state().message, "Gaussian 3c 1chs");
}

#[test]
fn cancelled_before_scheduling() {
    let engine = engine(EngineConfig::default());
    let mut tracker = ProgressTracker::new();
    let token = tracker.cancel_token();
    std::thread::spawn(move || token.cancel()).join().unwrap();

    let calls = std::sync::atomic::AtomicUsize::new(0);
    let counting = |_: &mut [f32], _: PlaneShape| -> anyhow::Result<()> {
        calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    };

    let result = engine.execute(ramp(StackShape::new(20, 2, 2)), Strategy::in_place(&counting), &mut tracker);
    assert!(matches!(result, Err(StackError::Cancelled)));
    assert_eq!(calls.load(std::sync::atomic::Ordering::Relaxed), 0);
    assert_eq!(tracker.state().terminal, TerminalState::Cancelled);
}

#[test]
fn sync_signal_forces_sequential() {
    let config = EngineConfig::default()
        .with_overrides(|key| (key == "STACKPAR_SYNC").then(|| "1".to_string()))
        .unwrap();
    let engine = engine(config);

    let plan = engine.plan_for(1000, StrategyKind::Copy);
    assert!(!plan.is_parallel);
    assert_eq!(plan.reason, stackpar::execution::PlanReason::SyncSignal);

    let output = engine
        .execute(ramp(StackShape::new(30, 2, 2)), Strategy::copy(&doubled), &mut NullProgress)
        .unwrap();
    assert_eq!(output.plane(1), &[4.0, 5.0, 6.0, 7.0]);
}

#[test]
fn shared_stack_visible_to_attached_view() {
    let engine = engine(EngineConfig::new().with_cores(2));
    let stack = engine.manager().allocate_stack(StackShape::new(12, 2, 2)).unwrap();
    let name = stack.segment_name().unwrap().to_string();
    let handle = SegmentHandle {
        name: name.clone(),
        byte_len: 12 * 4 * std::mem::size_of::<f32>(),
    };

    let fill = |plane: &mut [f32], _: PlaneShape| -> anyhow::Result<()> {
        plane.fill(3.0);
        Ok(())
    };
    let stack = engine.execute(stack, Strategy::in_place(&fill), &mut NullProgress).unwrap();

    let view = SharedArray::<f32>::attach(&handle).unwrap();
    assert_eq!(view.as_slice(), stack.as_slice());
    drop(view);

    assert_eq!(engine.manager().live_segments(), vec![name]);
    drop(stack);
    assert_eq!(engine.manager().live_count(), 0);
}
