//! Warp entry routines.
//!
//! Each activated warp reads its core's plan, works out from its own warp
//! id which work items it owns and invokes the kernel once per active lane
//! per item. The range arithmetic lives in [`GroupedWarpRange`] and
//! [`FlatWarpRange`] so it can be checked without running anything.

use serde::Serialize;
use tracing::trace;
use warpspawn_core::Dim3;

use crate::device::Warp;
use crate::dispatch::{CorePlan, FlatCorePlan, GroupedCorePlan};
use crate::kernel::{Kernel, ThreadContext};
use crate::lanes::ThreadMask;

/// Launch-wide values every stub needs besides its core plan.
pub struct LaunchArgs<'a, K: Kernel + ?Sized> {
    pub grid: Dim3,
    pub block: Dim3,
    pub kernel: &'a K,
}

/// Iteration range of one warp in grouped mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupedWarpRange {
    /// Which of the resident groups this warp belongs to.
    pub local_group_id: u32,
    /// Position of this warp within its group.
    pub group_warp_id: u32,
    pub lane_mask: ThreadMask,
    pub start_group: u64,
    pub iterations: u64,
    pub stride: u64,
}

impl GroupedWarpRange {
    pub fn new(plan: &GroupedCorePlan, warp_id: u32, lanes_per_warp: u32) -> Self {
        let local_group_id = warp_id / plan.warps_per_group;
        let group_warp_id = warp_id % plan.warps_per_group;
        let lane_mask = if group_warp_id == plan.warps_per_group - 1 {
            plan.remaining_mask
        } else {
            ThreadMask::first(lanes_per_warp)
        };
        Self {
            local_group_id,
            group_warp_id,
            lane_mask,
            start_group: plan.group_offset + local_group_id as u64,
            iterations: plan.warp_batches + u64::from(warp_id < plan.remaining_warps),
            stride: plan.groups_per_batch as u64,
        }
    }

    /// Group ids this warp visits, in order.
    pub fn groups(&self) -> impl Iterator<Item = u64> {
        let (start, stride) = (self.start_group, self.stride);
        (0..self.iterations).map(move |i| start + i * stride)
    }

    /// Linear in-group thread index of `lane`.
    pub fn thread_index(&self, lane: u32, lanes_per_warp: u32) -> u64 {
        self.group_warp_id as u64 * lanes_per_warp as u64 + lane as u64
    }
}

/// Iteration range of one warp in flat mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatWarpRange {
    /// Task handled by lane 0 on the first iteration.
    pub start_task: u64,
    pub iterations: u64,
    pub stride: u64,
}

impl FlatWarpRange {
    pub fn new(plan: &FlatCorePlan, warp_id: u32, lanes_per_warp: u32) -> Self {
        let lanes = lanes_per_warp as u64;
        let start_warp = warp_id as u64 * plan.warp_batches
            + (warp_id as u64).min(plan.remaining_warps as u64);
        Self {
            start_task: plan.task_offset + start_warp * lanes,
            iterations: plan.warp_batches + u64::from(warp_id < plan.remaining_warps),
            stride: lanes,
        }
    }

    /// Tasks `lane` visits, in order.
    pub fn tasks(&self, lane: u32) -> impl Iterator<Item = u64> {
        let (start, stride) = (self.start_task + lane as u64, self.stride);
        (0..self.iterations).map(move |i| start + i * stride)
    }
}

/// One (warp, lane) execution of the kernel on a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WorkItem {
    pub warp_id: u32,
    pub lane_id: u32,
    /// Group id (task id in flat mode).
    pub group: u64,
    /// Linear in-group thread index; 0 in flat mode.
    pub thread: u64,
}

/// Exact, ordered list of work items one warp executes for a core plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarpAssignment {
    pub warp_id: u32,
    pub items: Vec<WorkItem>,
}

impl WarpAssignment {
    /// Work of warp `warp_id` under `plan`. In flat mode warp 0 also lists
    /// the partial remainder after its batched share. Warps outside the
    /// plan get an empty list.
    pub fn for_warp(plan: &CorePlan, warp_id: u32, lanes_per_warp: u32) -> Self {
        let mut items = Vec::new();
        match plan {
            CorePlan::Grouped(p) if warp_id < p.active_warps => {
                let range = GroupedWarpRange::new(p, warp_id, lanes_per_warp);
                for group in range.groups() {
                    for lane in range.lane_mask.lanes() {
                        items.push(WorkItem {
                            warp_id,
                            lane_id: lane,
                            group,
                            thread: range.thread_index(lane, lanes_per_warp),
                        });
                    }
                }
            }
            CorePlan::Grouped(_) => {}
            CorePlan::Flat(p) => {
                if warp_id < p.active_warps {
                    let range = FlatWarpRange::new(p, warp_id, lanes_per_warp);
                    for i in 0..range.iterations {
                        for lane in 0..lanes_per_warp {
                            items.push(WorkItem {
                                warp_id,
                                lane_id: lane,
                                group: range.start_task + i * range.stride + lane as u64,
                                thread: 0,
                            });
                        }
                    }
                }
                if warp_id == 0 {
                    items.extend((0..p.remainder_tasks).map(|lane| WorkItem {
                        warp_id: 0,
                        lane_id: lane,
                        group: p.remainder_offset + lane as u64,
                        thread: 0,
                    }));
                }
            }
        }
        Self { warp_id, items }
    }
}

/// Every work item core `plan` executes, warp by warp.
pub fn core_work_items(plan: &CorePlan, lanes_per_warp: u32) -> Vec<WorkItem> {
    // Warp 0 may carry the flat remainder even when no full warp exists.
    let warps = plan.active_warps().max(1);
    (0..warps)
        .flat_map(|w| WarpAssignment::for_warp(plan, w, lanes_per_warp).items)
        .collect()
}

/// Narrow the warp after its range is exhausted: the initiator keeps lane 0
/// for the final wait, every other warp retires.
fn finish(warp: &mut Warp) {
    if warp.warp_id() == 0 {
        warp.activate_one();
    } else {
        warp.deactivate();
    }
}

/// Grouped-mode entry point.
pub fn grouped_stub<K: Kernel + ?Sized>(warp: &mut Warp, plan: &GroupedCorePlan, args: &LaunchArgs<'_, K>) {
    let lanes = warp.lanes_per_warp();
    let range = GroupedWarpRange::new(plan, warp.warp_id(), lanes);
    warp.set_active_lanes(range.lane_mask);
    trace!(core = warp.core_id(), warp = warp.warp_id(), ?range, "grouped warp");

    for group in range.groups() {
        let block_idx = args.grid.decode(group);
        let mut calls = 0;
        let view: &Warp = warp;
        view.for_each_lane(|lane| {
            let ctx = ThreadContext {
                block_idx,
                thread_idx: args.block.decode(range.thread_index(lane, lanes)),
                grid_dim: args.grid,
                block_dim: args.block,
                core_id: view.core_id(),
                warp_id: view.warp_id(),
                lane_id: lane,
                local_group_id: range.local_group_id,
                warps_per_group: plan.warps_per_group,
            };
            args.kernel.invoke(&ctx);
            calls += 1;
        });
        warp.record_invocations(calls);
    }

    finish(warp);
}

/// Flat-mode entry point for activated warps.
pub fn flat_stub<K: Kernel + ?Sized>(warp: &mut Warp, plan: &FlatCorePlan, args: &LaunchArgs<'_, K>) {
    warp.activate_all();
    run_flat(warp, plan, args);
    finish(warp);
}

/// Flat-mode body, also run directly by the initiator with its mask
/// already widened.
pub fn run_flat<K: Kernel + ?Sized>(warp: &mut Warp, plan: &FlatCorePlan, args: &LaunchArgs<'_, K>) {
    let range = FlatWarpRange::new(plan, warp.warp_id(), warp.lanes_per_warp());
    trace!(core = warp.core_id(), warp = warp.warp_id(), ?range, "flat warp");

    for i in 0..range.iterations {
        let base = range.start_task + i * range.stride;
        let mut calls = 0;
        let view: &Warp = warp;
        view.for_each_lane(|lane| {
            invoke_task(view, args, base + lane as u64, lane);
            calls += 1;
        });
        warp.record_invocations(calls);
    }
}

/// Partial-warp remainder: each active lane runs exactly one task.
pub fn remainder_stub<K: Kernel + ?Sized>(warp: &mut Warp, plan: &FlatCorePlan, args: &LaunchArgs<'_, K>) {
    let mut calls = 0;
    let view: &Warp = warp;
    view.for_each_lane(|lane| {
        invoke_task(view, args, plan.remainder_offset + lane as u64, lane);
        calls += 1;
    });
    warp.record_invocations(calls);
}

fn invoke_task<K: Kernel + ?Sized>(warp: &Warp, args: &LaunchArgs<'_, K>, task: u64, lane: u32) {
    let ctx = ThreadContext {
        block_idx: args.grid.decode(task),
        thread_idx: Dim3::ORIGIN,
        grid_dim: args.grid,
        block_dim: args.block,
        core_id: warp.core_id(),
        warp_id: warp.warp_id(),
        lane_id: lane,
        local_group_id: 0,
        warps_per_group: 0,
    };
    args.kernel.invoke(&ctx);
}
