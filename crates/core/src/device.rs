use serde::{Deserialize, Serialize};

use crate::error::SpawnError;

/// Widest warp a `u32` thread mask can describe.
pub const MAX_LANES_PER_WARP: u32 = 32;

/// Fixed execution capacity of a SIMT device, as reported by its
/// capability query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapacity {
    pub cores: u32,
    pub warps_per_core: u32,
    pub lanes_per_warp: u32,
}

impl DeviceCapacity {
    pub fn new(cores: u32, warps_per_core: u32, lanes_per_warp: u32) -> Result<Self, SpawnError> {
        if cores == 0 || warps_per_core == 0 || lanes_per_warp == 0 {
            return Err(SpawnError::InvalidCapacity(format!(
                "cores={cores}, warps_per_core={warps_per_core}, lanes_per_warp={lanes_per_warp} (all must be non-zero)"
            )));
        }
        if lanes_per_warp > MAX_LANES_PER_WARP {
            return Err(SpawnError::InvalidCapacity(format!(
                "lanes_per_warp={lanes_per_warp} exceeds {MAX_LANES_PER_WARP}"
            )));
        }
        Ok(Self {
            cores,
            warps_per_core,
            lanes_per_warp,
        })
    }

    /// Largest group a single core can host.
    pub fn lanes_per_core(&self) -> u64 {
        self.warps_per_core as u64 * self.lanes_per_warp as u64
    }

    /// Thread mask with every lane of a warp set.
    pub fn full_mask(&self) -> u32 {
        lane_mask(self.lanes_per_warp)
    }
}

/// Mask with the low `count` lanes set.
pub fn lane_mask(count: u32) -> u32 {
    if count >= 32 {
        u32::MAX
    } else {
        (1u32 << count) - 1
    }
}
