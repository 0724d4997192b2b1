//! Synchronous launch entry points.

use std::panic;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;
use warpspawn_core::{DeviceCapacity, Dim3, SpawnError};

use crate::device::{CoreActivity, SoftDevice};
use crate::dispatch::dispatch_core;
use crate::kernel::Kernel;
use crate::planner::LaunchPlan;

/// What one core did during a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoreOutcome {
    pub core_id: u32,
    pub warps_activated: u64,
    pub invocations: u64,
}

/// Summary of one completed launch.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub launch_id: Uuid,
    pub mode: &'static str,
    pub grid: Dim3,
    pub block: Dim3,
    pub active_cores: u32,
    pub warps_activated: u64,
    pub invocations: u64,
    /// Participating cores only, in core order.
    pub cores: Vec<CoreOutcome>,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
}

/// A device able to run kernel launches.
pub trait SimtDevice {
    /// Capability query, read fresh at every launch.
    fn capacity(&self) -> DeviceCapacity;

    /// Run `kernel` over `grid` groups of `block` lanes and return once every
    /// invocation has completed.
    fn launch<K: Kernel + ?Sized>(
        &mut self,
        grid: Dim3,
        block: Dim3,
        kernel: &K,
    ) -> Result<LaunchReport, SpawnError>;
}

impl SimtDevice for SoftDevice {
    fn capacity(&self) -> DeviceCapacity {
        SoftDevice::capacity(self)
    }

    fn launch<K: Kernel + ?Sized>(
        &mut self,
        grid: Dim3,
        block: Dim3,
        kernel: &K,
    ) -> Result<LaunchReport, SpawnError> {
        SoftDevice::launch(self, grid, block, kernel)
    }
}

impl SoftDevice {
    /// Launch `kernel` on every core and block until all of them retire.
    ///
    /// Fails with [`SpawnError::CapacityExceeded`] before any warp starts
    /// when one group does not fit on a core, and with
    /// [`SpawnError::ThreadStart`] when the host cannot start a core or warp
    /// thread. A panic inside the kernel is re-raised on the calling thread.
    pub fn launch<K: Kernel + ?Sized>(
        &mut self,
        grid: Dim3,
        block: Dim3,
        kernel: &K,
    ) -> Result<LaunchReport, SpawnError> {
        let plan = match LaunchPlan::new(grid, block, self.capacity()) {
            Ok(plan) => plan,
            Err(e) => {
                if let Ok(mut metrics) = self.metrics.write() {
                    metrics.record_rejection();
                }
                return Err(e);
            }
        };

        let launch_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        info!(
            %launch_id,
            mode = plan.mode.name(),
            %grid,
            %block,
            active_cores = plan.active_cores,
            "launch started"
        );

        // Idle cores sit the launch out without a thread of their own.
        let shared_plan = &plan;
        let started: Vec<Result<(u32, CoreActivity), SpawnError>> = thread::scope(|s| {
            let handles: Vec<_> = self
                .scratch
                .iter_mut()
                .take(plan.active_cores as usize)
                .enumerate()
                .map(|(core_id, channel)| {
                    let core_id = core_id as u32;
                    thread::Builder::new()
                        .name(format!("core{core_id}"))
                        .spawn_scoped(s, move || {
                            dispatch_core(shared_plan, core_id, channel, kernel).map(|a| (core_id, a))
                        })
                        .map_err(|source| SpawnError::ThreadStart {
                            what: format!("core {core_id}"),
                            source,
                        })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h?.join() {
                    Ok(outcome) => outcome,
                    Err(payload) => panic::resume_unwind(payload),
                })
                .collect()
        });
        let activities = started.into_iter().collect::<Result<Vec<_>, _>>()?;

        let cores: Vec<CoreOutcome> = activities
            .into_iter()
            .map(|(core_id, a)| CoreOutcome {
                core_id,
                warps_activated: a.warps_activated,
                invocations: a.invocations,
            })
            .collect();
        let duration = start.elapsed();

        let report = LaunchReport {
            launch_id,
            mode: plan.mode.name(),
            grid,
            block,
            active_cores: plan.active_cores,
            warps_activated: cores.iter().map(|c| c.warps_activated).sum(),
            invocations: cores.iter().map(|c| c.invocations).sum(),
            cores,
            duration,
            started_at,
        };

        if let Ok(mut metrics) = self.metrics.write() {
            let per_core: Vec<(u32, u64, u64)> = report
                .cores
                .iter()
                .map(|c| (c.core_id, c.warps_activated, c.invocations))
                .collect();
            metrics.record_launch(report.mode, &per_core, duration);
        }

        info!(
            %launch_id,
            invocations = report.invocations,
            warps = report.warps_activated,
            duration_ms = duration.as_millis() as u64,
            "launch finished"
        );
        Ok(report)
    }

    /// Launch with the classic "dimension count plus optional extents"
    /// convention. Missing extents default to 1.
    pub fn spawn_threads<K: Kernel + ?Sized>(
        &mut self,
        dimension: usize,
        grid_dim: Option<&[u32]>,
        block_dim: Option<&[u32]>,
        kernel: &K,
    ) -> Result<LaunchReport, SpawnError> {
        spawn_threads(self, dimension, grid_dim, block_dim, kernel)
    }
}

/// Generic form of [`SoftDevice::spawn_threads`].
pub fn spawn_threads<D, K>(
    device: &mut D,
    dimension: usize,
    grid_dim: Option<&[u32]>,
    block_dim: Option<&[u32]>,
    kernel: &K,
) -> Result<LaunchReport, SpawnError>
where
    D: SimtDevice,
    K: Kernel + ?Sized,
{
    let grid = Dim3::from_extent(dimension, grid_dim);
    let block = Dim3::from_extent(dimension, block_dim);
    device.launch(grid, block, kernel)
}
