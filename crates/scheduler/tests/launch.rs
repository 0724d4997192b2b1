//! End-to-end launches on the software device.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use warpspawn_scheduler::kernels::CoverageKernel;
use warpspawn_scheduler::{
    spawn_threads, DeviceCapacity, Dim3, KernelInvocation, LaunchPlan, SimtDevice, SoftDevice,
    ThreadContext,
};

fn device(cores: u32, warps: u32, lanes: u32) -> SoftDevice {
    SoftDevice::new(DeviceCapacity::new(cores, warps, lanes).unwrap())
}

#[test]
fn grouped_launch_covers_every_thread_once() {
    let mut dev = device(4, 4, 4);
    let grid = Dim3::new(5, 3, 2);
    let block = Dim3::new(3, 2, 1);
    let kernel = CoverageKernel::new(grid, block);
    let report = dev.launch(grid, block, &kernel).unwrap();
    assert!(kernel.summary().is_exact());
    assert_eq!(report.invocations, 30 * 6);
}

#[test]
fn flat_launch_covers_every_task_once() {
    let mut dev = device(3, 2, 4);
    let grid = Dim3::new(7, 11, 3);
    let kernel = CoverageKernel::new(grid, Dim3::ONE);
    let report = dev.launch(grid, Dim3::ONE, &kernel).unwrap();
    assert!(kernel.summary().is_exact());
    assert_eq!(report.mode, "flat");
    assert_eq!(report.invocations, 231);
}

#[test]
fn single_task_runs_on_core_zero_lane_zero() {
    let mut dev = device(4, 4, 4);
    let seen = Mutex::new(Vec::new());
    let kernel = |ctx: &ThreadContext| seen.lock().unwrap().push(*ctx);
    let report = dev.launch(Dim3::ONE, Dim3::ONE, &kernel).unwrap();

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.len(), 1);
    let ctx = seen[0];
    assert_eq!((ctx.core_id, ctx.warp_id, ctx.lane_id), (0, 0, 0));
    assert_eq!(ctx.block_idx, Dim3::ORIGIN);
    assert_eq!(ctx.thread_idx, Dim3::ORIGIN);
    assert_eq!(report.active_cores, 1);
    assert_eq!(report.warps_activated, 0);
}

#[test]
fn oversized_group_is_rejected_without_side_effects() {
    let mut dev = device(4, 4, 4);
    let calls = AtomicU64::new(0);
    let kernel = |_: &ThreadContext| {
        calls.fetch_add(1, Ordering::SeqCst);
    };
    let err = dev.launch(Dim3::new(2, 1, 1), Dim3::new(4, 4, 2), &kernel).unwrap_err();
    assert!(err.is_capacity_exceeded());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let metrics = dev.metrics();
    assert_eq!(metrics.rejected, 1);
    assert_eq!(metrics.warps_activated, 0);
    assert_eq!(metrics.invocations, 0);
    for core in 0..4 {
        assert_eq!(dev.scratch(core).unwrap().publish_count(), 0);
    }
}

#[test]
fn unit_block_matches_flat_task_ids() {
    // The same grid launched with block (1,1,1) must visit the same block_idx
    // set whether described with one dimension or three.
    let mut dev = device(2, 2, 4);
    let collect = |dev: &mut SoftDevice, grid: Dim3| {
        let ids = Mutex::new(Vec::new());
        let kernel = |ctx: &ThreadContext| ids.lock().unwrap().push(ctx.group_index());
        dev.launch(grid, Dim3::ONE, &kernel).unwrap();
        let mut ids = ids.into_inner().unwrap();
        ids.sort_unstable();
        ids
    };
    let flat = collect(&mut dev, Dim3::new(24, 1, 1));
    let shaped = collect(&mut dev, Dim3::new(4, 3, 2));
    assert_eq!(flat, (0..24).collect::<Vec<_>>());
    assert_eq!(flat, shaped);
}

#[test]
fn coordinates_decode_against_grid_and_block() {
    let mut dev = device(2, 4, 4);
    let grid = Dim3::new(3, 2, 2);
    let block = Dim3::new(2, 3, 1);
    let seen = Mutex::new(Vec::new());
    let kernel = |ctx: &ThreadContext| {
        assert!(grid.contains(ctx.block_idx));
        assert!(block.contains(ctx.thread_idx));
        seen.lock()
            .unwrap()
            .push((ctx.block_idx, ctx.thread_idx, ctx.global_index()));
    };
    dev.launch(grid, block, &kernel).unwrap();

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.len(), 72);
    for (b, t, global) in seen {
        let group = b.x as u64 + b.y as u64 * 3 + b.z as u64 * 6;
        let thread = t.x as u64 + t.y as u64 * 2;
        assert_eq!(global, group * 6 + thread);
    }
}

#[test]
fn invocation_count_is_exact_across_shapes() {
    let mut dev = device(3, 4, 4);
    let shapes = [
        (Dim3::new(1, 1, 1), Dim3::new(16, 1, 1)),
        (Dim3::new(13, 1, 1), Dim3::new(5, 1, 1)),
        (Dim3::new(2, 2, 2), Dim3::new(2, 2, 2)),
        (Dim3::new(100, 1, 1), Dim3::ONE),
        (Dim3::new(0, 1, 1), Dim3::ONE),
    ];
    for (grid, block) in shapes {
        let calls = AtomicU64::new(0);
        let kernel = |_: &ThreadContext| {
            calls.fetch_add(1, Ordering::Relaxed);
        };
        let report = dev.launch(grid, block, &kernel).unwrap();
        let expected = grid.volume() * block.volume();
        assert_eq!(calls.load(Ordering::Relaxed), expected, "grid {grid} block {block}");
        assert_eq!(report.invocations, expected);
    }
}

#[test]
fn per_core_counts_are_balanced() {
    let mut dev = device(4, 2, 2);
    let per_core: Vec<AtomicU64> = (0..4).map(|_| AtomicU64::new(0)).collect();
    let kernel = |ctx: &ThreadContext| {
        per_core[ctx.core_id as usize].fetch_add(1, Ordering::Relaxed);
    };
    dev.launch(Dim3::new(103, 1, 1), Dim3::ONE, &kernel).unwrap();
    let counts: Vec<u64> = per_core.iter().map(|c| c.load(Ordering::Relaxed)).collect();
    assert_eq!(counts, vec![26, 26, 26, 25]);
}

#[test]
fn report_matches_plan() {
    let mut dev = device(4, 4, 4);
    let grid = Dim3::new(9, 1, 1);
    let block = Dim3::new(8, 1, 1);
    let plan = LaunchPlan::new(grid, block, SimtDevice::capacity(&dev)).unwrap();
    let report = dev.launch(grid, block, &|_: &ThreadContext| {}).unwrap();
    assert_eq!(report.active_cores, plan.active_cores);
    assert_eq!(report.invocations, plan.expected_invocations());
    let planned_warps: u64 = plan
        .assignments()
        .iter()
        .map(|p| p.active_warps().saturating_sub(1) as u64)
        .sum();
    assert_eq!(report.warps_activated, planned_warps);
}

#[test]
fn zero_extent_block_runs_one_task_per_group() {
    let mut dev = device(2, 2, 2);
    let grid = Dim3::new(5, 1, 1);
    let block = Dim3::new(0, 1, 1);
    let plan = LaunchPlan::new(grid, block, SimtDevice::capacity(&dev)).unwrap();
    let kernel = CoverageKernel::new(grid, block);
    let report = dev.launch(grid, block, &kernel).unwrap();
    assert_eq!(report.mode, "flat");
    assert_eq!(report.invocations, 5);
    assert_eq!(report.invocations, plan.expected_invocations());
    assert!(kernel.summary().is_exact());
}

#[test]
fn kernels_see_the_warps_a_group_spans() {
    let mut dev = device(2, 4, 4);
    let collect = |dev: &mut SoftDevice, grid: Dim3, block: Dim3| {
        let seen = Mutex::new(BTreeSet::new());
        let kernel = |ctx: &ThreadContext| {
            seen.lock().unwrap().insert((ctx.local_group_id, ctx.warps_per_group));
        };
        dev.launch(grid, block, &kernel).unwrap();
        seen.into_inner().unwrap().into_iter().collect::<Vec<_>>()
    };

    // 6 lanes over 4-lane warps: 2 warps per group, 2 groups resident per core.
    let grouped = collect(&mut dev, Dim3::new(5, 1, 1), Dim3::new(3, 2, 1));
    assert_eq!(grouped, vec![(0, 2), (1, 2)]);

    let flat = collect(&mut dev, Dim3::new(9, 1, 1), Dim3::ONE);
    assert_eq!(flat, vec![(0, 0)]);
}

struct Scale {
    factor: u64,
    out: Vec<AtomicU64>,
}

fn scale_kernel(ctx: &ThreadContext, arg: &Scale) {
    let i = ctx.block_idx.x as usize;
    arg.out[i].store(i as u64 * arg.factor, Ordering::Relaxed);
}

#[test]
fn classic_entry_point_with_callback_and_argument() {
    let mut dev = device(2, 2, 2);
    let arg = Scale {
        factor: 3,
        out: (0..10).map(|_| AtomicU64::new(0)).collect(),
    };
    let kernel = KernelInvocation::new(scale_kernel, &arg);
    spawn_threads(&mut dev, 1, Some(&[10][..]), None, &kernel).unwrap();
    let out: Vec<u64> = arg.out.iter().map(|v| v.load(Ordering::Relaxed)).collect();
    assert_eq!(out, (0..10).map(|i| i * 3).collect::<Vec<_>>());
}

#[test]
#[should_panic(expected = "kernel failure")]
fn kernel_panic_propagates_to_caller() {
    let mut dev = device(2, 2, 2);
    let kernel = |ctx: &ThreadContext| {
        if ctx.block_idx.x == 5 {
            panic!("kernel failure");
        }
    };
    let _ = dev.launch(Dim3::new(12, 1, 1), Dim3::ONE, &kernel);
}
