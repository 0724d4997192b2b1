//! Per-core dispatch.
//!
//! Every core runs the same code. [`LaunchPlan::assign`] is the pure half:
//! given a core id it returns either nothing (the core sits the launch out)
//! or the core's [`CorePlan`]. [`dispatch_core`] is the execution half: it
//! publishes the plan into the core's scratch slot, activates the warps,
//! runs the initiator's own share and waits for every warp to retire.

use serde::Serialize;
use tracing::debug;
use warpspawn_core::{DeviceCapacity, SpawnError};

use crate::channel::ScratchChannel;
use crate::device::{with_core, CoreActivity, Warp};
use crate::kernel::Kernel;
use crate::lanes::ThreadMask;
use crate::planner::{balanced_share, GroupLayout, LaunchMode, LaunchPlan};
use crate::stub::{self, LaunchArgs};

/// Grouped-mode assignment for one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupedCorePlan {
    pub core_id: u32,
    /// First group id this core owns.
    pub group_offset: u64,
    /// Number of consecutive groups this core owns.
    pub group_count: u64,
    pub warps_per_group: u32,
    /// Groups resident at once; the stride between a warp's iterations.
    pub groups_per_batch: u32,
    /// Warps activated on this core, initiator included.
    pub active_warps: u32,
    /// Iterations every activated warp performs.
    pub warp_batches: u64,
    /// Warps `0..remaining_warps` perform one extra iteration.
    pub remaining_warps: u32,
    /// Lane mask for the last warp of each group.
    pub remaining_mask: ThreadMask,
}

/// Flat-mode assignment for one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlatCorePlan {
    pub core_id: u32,
    /// First task id this core owns.
    pub task_offset: u64,
    /// Number of consecutive tasks this core owns.
    pub task_count: u64,
    /// Full warps activated on this core, initiator included. Zero when
    /// the core owns less than one warp of tasks.
    pub active_warps: u32,
    /// Warp-widths of tasks every activated warp processes.
    pub warp_batches: u64,
    /// Warps `0..remaining_warps` process one extra warp-width.
    pub remaining_warps: u32,
    /// First task of the partial warp run by the initiator alone.
    pub remainder_offset: u64,
    /// Tasks in the partial warp (less than one warp width).
    pub remainder_tasks: u32,
}

/// What one participating core does during a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CorePlan {
    Grouped(GroupedCorePlan),
    Flat(FlatCorePlan),
}

impl CorePlan {
    pub fn core_id(&self) -> u32 {
        match self {
            CorePlan::Grouped(p) => p.core_id,
            CorePlan::Flat(p) => p.core_id,
        }
    }

    /// Groups (or tasks) owned by this core.
    pub fn local_count(&self) -> u64 {
        match self {
            CorePlan::Grouped(p) => p.group_count,
            CorePlan::Flat(p) => p.task_count,
        }
    }

    pub fn local_offset(&self) -> u64 {
        match self {
            CorePlan::Grouped(p) => p.group_offset,
            CorePlan::Flat(p) => p.task_offset,
        }
    }

    /// Warps started for the batched share, initiator included.
    pub fn active_warps(&self) -> u32 {
        match self {
            CorePlan::Grouped(p) => p.active_warps,
            CorePlan::Flat(p) => p.active_warps,
        }
    }
}

impl LaunchPlan {
    /// Assignment for core `core_id`, or `None` when the core does not
    /// take part in this launch.
    pub fn assign(&self, core_id: u32) -> Option<CorePlan> {
        if !self.participates(core_id) {
            return None;
        }
        let (offset, count) =
            balanced_share(self.total_work(), self.active_cores as u64, core_id as u64);

        let plan = match self.mode {
            LaunchMode::Grouped(layout) => {
                CorePlan::Grouped(grouped_core_plan(core_id, offset, count, layout, &self.capacity))
            }
            LaunchMode::Flat => {
                CorePlan::Flat(flat_core_plan(core_id, offset, count, &self.capacity))
            }
        };
        Some(plan)
    }

    /// Every participating core's assignment, in core order.
    pub fn assignments(&self) -> Vec<CorePlan> {
        use rayon::prelude::*;
        (0..self.active_cores)
            .into_par_iter()
            .filter_map(|core_id| self.assign(core_id))
            .collect()
    }
}

fn grouped_core_plan(
    core_id: u32,
    group_offset: u64,
    group_count: u64,
    layout: GroupLayout,
    capacity: &DeviceCapacity,
) -> GroupedCorePlan {
    let warps_per_core = capacity.warps_per_core as u64;
    let warps_per_group = layout.warps_per_group as u64;
    let total_warps = group_count * warps_per_group;

    let (active_warps, warp_batches, remaining_warps) = if total_warps > warps_per_core {
        let batch = layout.groups_per_batch as u64 * warps_per_group;
        (batch, total_warps / batch, total_warps % batch)
    } else {
        (total_warps, 1, 0)
    };

    GroupedCorePlan {
        core_id,
        group_offset,
        group_count,
        warps_per_group: layout.warps_per_group,
        groups_per_batch: layout.groups_per_batch,
        active_warps: active_warps as u32,
        warp_batches,
        remaining_warps: remaining_warps as u32,
        remaining_mask: layout.remaining_mask,
    }
}

fn flat_core_plan(
    core_id: u32,
    task_offset: u64,
    task_count: u64,
    capacity: &DeviceCapacity,
) -> FlatCorePlan {
    let lanes = capacity.lanes_per_warp as u64;
    let warps_per_core = capacity.warps_per_core as u64;
    let full_warps = task_count / lanes;
    let remainder_tasks = task_count % lanes;

    let (active_warps, warp_batches, remaining_warps) = if full_warps > warps_per_core {
        (warps_per_core, full_warps / warps_per_core, full_warps % warps_per_core)
    } else {
        (full_warps, 1, 0)
    };

    FlatCorePlan {
        core_id,
        task_offset,
        task_count,
        active_warps: active_warps as u32,
        warp_batches,
        remaining_warps: remaining_warps as u32,
        remainder_offset: task_offset + (task_count - remainder_tasks),
        remainder_tasks: remainder_tasks as u32,
    }
}

/// Run core `core_id`'s share of a launch on the calling thread, which acts
/// as the core's warp 0. Returns once every warp it activated has retired.
///
/// A core outside the plan's active set returns immediately and leaves its
/// scratch slot untouched. The slot is retired even when a warp fails to
/// start.
pub fn dispatch_core<K>(
    plan: &LaunchPlan,
    core_id: u32,
    channel: &mut ScratchChannel<CorePlan>,
    kernel: &K,
) -> Result<CoreActivity, SpawnError>
where
    K: Kernel + ?Sized,
{
    let Some(core_plan) = plan.assign(core_id) else {
        return Ok(CoreActivity::default());
    };
    debug!(core = core_id, plan = ?core_plan, "core plan");

    let args = LaunchArgs {
        grid: plan.grid,
        block: plan.block,
        kernel,
    };
    let record = channel.publish(core_plan);

    let (initiator_calls, mut activity) = match record {
        CorePlan::Grouped(p) => {
            let entry = |warp: &mut Warp| stub::grouped_stub(warp, p, &args);
            with_core(core_id, plan.capacity, |spawner| {
                spawner.activate(p.active_warps, &entry)?;
                let mut initiator = spawner.initiator();
                stub::grouped_stub(&mut initiator, p, &args);
                spawner.wait_all();
                Ok::<_, SpawnError>(initiator.invocations())
            })
        }
        CorePlan::Flat(p) => {
            let entry = |warp: &mut Warp| stub::flat_stub(warp, p, &args);
            with_core(core_id, plan.capacity, |spawner| {
                let mut initiator = spawner.initiator();
                if p.active_warps >= 1 {
                    spawner.activate(p.active_warps, &entry)?;
                    initiator.activate_all();
                    stub::run_flat(&mut initiator, p, &args);
                    initiator.activate_one();
                }
                if p.remainder_tasks != 0 {
                    initiator.set_active_lanes(ThreadMask::first(p.remainder_tasks));
                    stub::remainder_stub(&mut initiator, p, &args);
                    initiator.activate_one();
                }
                spawner.wait_all();
                Ok::<_, SpawnError>(initiator.invocations())
            })
        }
    };

    channel.retire();
    activity.invocations += initiator_calls?;
    debug!(
        core = core_id,
        warps = activity.warps_activated,
        invocations = activity.invocations,
        "core retired"
    );
    Ok(activity)
}
