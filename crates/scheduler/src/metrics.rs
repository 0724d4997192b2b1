use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Device-wide launch counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LaunchMetrics {
    /// Launches that ran to completion.
    pub launches: u64,
    /// Launches refused before any warp was activated.
    pub rejected: u64,
    /// Completed launches by mode name.
    pub launches_by_mode: HashMap<String, u64>,
    /// Warps started by activation, initiators excluded.
    pub warps_activated: u64,
    /// Kernel invocations across all launches.
    pub invocations: u64,
    /// Kernel invocations per core id.
    pub invocations_per_core: HashMap<u32, u64>,
    /// Average wall-clock duration of a completed launch.
    pub avg_launch_duration: Duration,
    pub last_launch: Option<DateTime<Utc>>,
}

impl LaunchMetrics {
    /// Record a completed launch.
    pub fn record_launch(&mut self, mode: &str, per_core: &[(u32, u64, u64)], duration: Duration) {
        self.launches += 1;
        *self.launches_by_mode.entry(mode.to_string()).or_default() += 1;
        for &(core_id, warps, invocations) in per_core {
            self.warps_activated += warps;
            self.invocations += invocations;
            *self.invocations_per_core.entry(core_id).or_default() += invocations;
        }
        self.last_launch = Some(Utc::now());

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        self.avg_launch_duration = if self.launches == 1 {
            duration
        } else {
            let prev_nanos = self.avg_launch_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / self.launches as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }

    /// Record a launch refused at planning time.
    pub fn record_rejection(&mut self) {
        self.rejected += 1;
    }
}
