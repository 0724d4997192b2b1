pub mod channel;
pub mod conform;
pub mod device;
pub mod dispatch;
pub mod kernel;
pub mod kernels;
pub mod lanes;
pub mod launch;
pub mod metrics;
pub mod planner;
pub mod stub;

pub use channel::ScratchChannel;
pub use device::{with_core, CoreActivity, SoftDevice, Warp, WarpSpawner};
pub use dispatch::{dispatch_core, CorePlan, FlatCorePlan, GroupedCorePlan};
pub use kernel::{Kernel, KernelInvocation, ThreadContext};
pub use lanes::{DivergenceToken, ThreadMask};
pub use launch::{spawn_threads, CoreOutcome, LaunchReport, SimtDevice};
pub use metrics::LaunchMetrics;
pub use planner::{balanced_share, GroupLayout, LaunchMode, LaunchPlan};
pub use stub::{core_work_items, WarpAssignment, WorkItem};
pub use warpspawn_core::{DeviceCapacity, DeviceConfig, Dim3, SpawnError};
