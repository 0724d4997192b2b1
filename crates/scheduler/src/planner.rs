//! Launch planning: validates a launch against the device capacity and
//! derives the global scheduling quantities every core works from.
//!
//! The plan depends only on the grid shape, the group shape and the
//! device capacity, never on what the kernel does.

use serde::Serialize;
use tracing::warn;
use warpspawn_core::{DeviceCapacity, Dim3, SpawnError};

use crate::lanes::ThreadMask;

/// How groups are laid out over warps in grouped mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupLayout {
    /// Warps needed to host one group.
    pub warps_per_group: u32,
    /// Lane mask of the last warp of each group. Full when the group size is
    /// a multiple of the warp width.
    pub remaining_mask: ThreadMask,
    /// Whole groups a core can keep resident at the same time.
    pub groups_per_batch: u32,
}

/// Execution mode chosen from the group size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchMode {
    /// Groups of more than one lane, possibly spanning several warps.
    Grouped(GroupLayout),
    /// Independent single-lane tasks.
    Flat,
}

impl LaunchMode {
    pub fn name(&self) -> &'static str {
        match self {
            LaunchMode::Grouped(_) => "grouped",
            LaunchMode::Flat => "flat",
        }
    }
}

/// Validated, device-wide plan for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaunchPlan {
    pub grid: Dim3,
    pub block: Dim3,
    pub capacity: DeviceCapacity,
    /// Number of groups in the grid; the task count in flat mode.
    pub num_groups: u64,
    /// Lanes per group; at most 1 in flat mode.
    pub group_size: u64,
    pub mode: LaunchMode,
    /// Cores the work would need if the device were unbounded.
    pub needed_cores: u64,
    /// Cores that take part. Cores at or above this id stay idle.
    pub active_cores: u32,
}

impl LaunchPlan {
    /// Plan a launch of `grid` groups of `block` lanes each.
    ///
    /// Fails only when one group does not fit on a single core.
    pub fn new(grid: Dim3, block: Dim3, capacity: DeviceCapacity) -> Result<Self, SpawnError> {
        let num_groups = grid.volume();
        let group_size = block.volume();
        let lanes_per_core = capacity.lanes_per_core();

        if group_size > lanes_per_core {
            warn!(
                group_size,
                lanes_per_core, "launch rejected: group does not fit on one core"
            );
            return Err(SpawnError::CapacityExceeded {
                group_size,
                lanes_per_core,
            });
        }

        let lanes = capacity.lanes_per_warp as u64;
        let warps_per_core = capacity.warps_per_core as u64;

        let (mode, needed_cores) = if group_size > 1 {
            let remainder = (group_size % lanes) as u32;
            let warps_per_group = div_ceil(group_size, lanes) as u32;
            let remaining_mask = if remainder != 0 {
                ThreadMask::first(remainder)
            } else {
                ThreadMask(capacity.full_mask())
            };
            let needed_warps = num_groups * warps_per_group as u64;
            let layout = GroupLayout {
                warps_per_group,
                remaining_mask,
                groups_per_batch: capacity.warps_per_core / warps_per_group,
            };
            (LaunchMode::Grouped(layout), div_ceil(needed_warps, warps_per_core))
        } else {
            (LaunchMode::Flat, div_ceil(num_groups, lanes_per_core))
        };

        let active_cores = needed_cores.min(capacity.cores as u64) as u32;

        Ok(Self {
            grid,
            block,
            capacity,
            num_groups,
            group_size,
            mode,
            needed_cores,
            active_cores,
        })
    }

    pub fn is_grouped(&self) -> bool {
        matches!(self.mode, LaunchMode::Grouped(_))
    }

    /// Units distributed across cores: groups, or tasks in flat mode.
    pub fn total_work(&self) -> u64 {
        self.num_groups
    }

    /// Kernel invocations a complete launch performs. Flat mode runs one
    /// per task, including when a zero block extent empties every group.
    pub fn expected_invocations(&self) -> u64 {
        match self.mode {
            LaunchMode::Grouped(_) => self.num_groups * self.group_size,
            LaunchMode::Flat => self.num_groups,
        }
    }

    /// Warps one group spans; 0 in flat mode.
    pub fn warps_per_group(&self) -> u32 {
        match self.mode {
            LaunchMode::Grouped(layout) => layout.warps_per_group,
            LaunchMode::Flat => 0,
        }
    }

    /// Whether core `core_id` takes part in this launch.
    pub fn participates(&self, core_id: u32) -> bool {
        core_id < self.active_cores
    }
}

/// Balanced share of `total` units for member `index` of `parts`:
/// returns `(offset, count)`. Lower indices receive the extra unit.
pub fn balanced_share(total: u64, parts: u64, index: u64) -> (u64, u64) {
    debug_assert!(parts > 0 && index < parts);
    let base = total / parts;
    let extra = total % parts;
    let count = base + u64::from(index < extra);
    let offset = index * base + index.min(extra);
    (offset, count)
}

pub(crate) fn div_ceil(n: u64, d: u64) -> u64 {
    n.div_ceil(d)
}
