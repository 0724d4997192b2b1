//! Software SIMT device: cores, resident warp slots and the warp
//! activation primitive, modelled on OS threads.
//!
//! Every core runs on its own thread. Inside a core, warp 0 is the thread
//! that entered the core; [`WarpSpawner::activate`] starts warps `1..count`
//! on scoped threads and [`WarpSpawner::wait_all`] blocks until they have
//! all retired. Lanes of a warp run in lockstep on the warp's thread, in
//! ascending lane order.

use std::panic;
use std::sync::{Arc, RwLock};
use std::thread::{self, Scope, ScopedJoinHandle};

use tracing::debug;
use warpspawn_core::{DeviceCapacity, DeviceConfig, SpawnError};

use crate::channel::ScratchChannel;
use crate::dispatch::CorePlan;
use crate::lanes::{BarrierTable, DivergenceStack, DivergenceToken, ThreadMask};
use crate::metrics::LaunchMetrics;

/// One warp's execution state as seen by code running on it.
#[derive(Debug)]
pub struct Warp {
    core_id: u32,
    warp_id: u32,
    lanes_per_warp: u32,
    mask: ThreadMask,
    divergence: DivergenceStack,
    barriers: Arc<BarrierTable>,
    invocations: u64,
}

impl Warp {
    /// A freshly activated warp: only lane 0 is active.
    pub(crate) fn activated(
        core_id: u32,
        warp_id: u32,
        lanes_per_warp: u32,
        barriers: Arc<BarrierTable>,
    ) -> Self {
        Self {
            core_id,
            warp_id,
            lanes_per_warp,
            mask: ThreadMask::LANE0,
            divergence: DivergenceStack::default(),
            barriers,
            invocations: 0,
        }
    }

    pub fn core_id(&self) -> u32 {
        self.core_id
    }

    /// Position of this warp within its core.
    pub fn warp_id(&self) -> u32 {
        self.warp_id
    }

    pub fn lanes_per_warp(&self) -> u32 {
        self.lanes_per_warp
    }

    pub fn active_lanes(&self) -> ThreadMask {
        self.mask
    }

    pub fn is_active(&self) -> bool {
        !self.mask.is_empty()
    }

    /// Replace the thread mask. Lanes the warp does not have are dropped.
    pub fn set_active_lanes(&mut self, mask: ThreadMask) {
        self.mask = mask.clamp(self.lanes_per_warp);
    }

    pub fn activate_all(&mut self) {
        self.mask = ThreadMask::first(self.lanes_per_warp);
    }

    /// Narrow to lane 0 only.
    pub fn activate_one(&mut self) {
        self.mask = ThreadMask::LANE0;
    }

    /// Disable every lane; the warp retires.
    pub fn deactivate(&mut self) {
        self.mask = ThreadMask::NONE;
    }

    /// Narrow to the active lanes satisfying `cond`. The returned token
    /// must be passed to [`Warp::join`].
    pub fn split(&mut self, cond: impl Fn(u32) -> bool) -> DivergenceToken {
        let token = self.divergence.split(self.mask, cond);
        self.mask = token.taken();
        token
    }

    /// Switch to the lanes that did not take the split.
    pub fn otherwise(&mut self, token: &DivergenceToken) {
        self.mask = token.not_taken();
    }

    /// Restore the mask active before the matching split.
    pub fn join(&mut self, token: DivergenceToken) {
        self.mask = self.divergence.join(token);
    }

    /// Predicate the warp without a reconvergence point. When no active
    /// lane satisfies `cond` the mask becomes `fallback`.
    pub fn predicate(&mut self, cond: impl Fn(u32) -> bool, fallback: ThreadMask) {
        let narrowed = self.mask.filter(cond);
        self.mask = if narrowed.is_empty() {
            fallback.clamp(self.lanes_per_warp)
        } else {
            narrowed
        };
    }

    /// Block until `expected` warps of this core reach barrier `id`.
    pub fn barrier(&self, id: u32, expected: u32) {
        self.barriers.wait(id, expected);
    }

    /// Run `f` for every active lane, in lane order.
    pub fn for_each_lane(&self, mut f: impl FnMut(u32)) {
        for lane in self.mask.lanes() {
            f(lane);
        }
    }

    /// Run `f` one lane at a time: while `f` runs for a lane, that lane is
    /// the only active one.
    pub fn serial(&mut self, mut f: impl FnMut(&Warp, u32)) {
        let saved = self.mask;
        for lane in saved.lanes() {
            self.mask = ThreadMask::lane(lane);
            f(self, lane);
        }
        self.mask = saved;
    }

    pub(crate) fn record_invocations(&mut self, n: u64) {
        self.invocations += n;
    }

    /// Kernel invocations this warp has performed.
    pub fn invocations(&self) -> u64 {
        self.invocations
    }
}

/// Totals for one core's activation scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreActivity {
    /// Warps started by `activate` (the initiator is not counted).
    pub warps_activated: u64,
    /// Invocations performed by activated warps that have retired.
    pub invocations: u64,
}

/// Warp activation handle for one core. Lives for one activation scope.
pub struct WarpSpawner<'scope, 'env> {
    scope: &'scope Scope<'scope, 'env>,
    core_id: u32,
    capacity: DeviceCapacity,
    barriers: Arc<BarrierTable>,
    running: Vec<ScopedJoinHandle<'scope, u64>>,
    activity: CoreActivity,
}

impl<'scope, 'env> WarpSpawner<'scope, 'env> {
    /// The calling context's own warp (warp 0), with only lane 0 active.
    pub fn initiator(&self) -> Warp {
        Warp::activated(
            self.core_id,
            0,
            self.capacity.lanes_per_warp,
            Arc::clone(&self.barriers),
        )
    }

    /// Start warps `1..count` at `entry`. Warp 0 is the caller, which runs
    /// its own share inline. `count` is capped at the resident warp limit.
    ///
    /// Call [`WarpSpawner::wait_all`] before activating again. When a warp
    /// cannot be started the warps already running still complete, but this
    /// core's barriers are broken so none of them waits for the missing one.
    pub fn activate<F>(&mut self, count: u32, entry: &'env F) -> Result<(), SpawnError>
    where
        F: Fn(&mut Warp) + Sync,
    {
        debug_assert!(self.running.is_empty(), "activate while warps are still running");
        let count = count.min(self.capacity.warps_per_core);
        debug!(core = self.core_id, warps = count, "activating warps");
        for warp_id in 1..count {
            let mut warp = Warp::activated(
                self.core_id,
                warp_id,
                self.capacity.lanes_per_warp,
                Arc::clone(&self.barriers),
            );
            let spawned = thread::Builder::new()
                .name(format!("core{}-warp{}", self.core_id, warp_id))
                .spawn_scoped(self.scope, move || {
                    entry(&mut warp);
                    warp.invocations()
                });
            match spawned {
                Ok(handle) => {
                    self.running.push(handle);
                    self.activity.warps_activated += 1;
                }
                Err(source) => {
                    self.barriers.break_all();
                    return Err(SpawnError::ThreadStart {
                        what: format!("warp {warp_id} on core {}", self.core_id),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    /// Activate no new warps, but block until every warp previously
    /// activated on this core has completed. A panic in any warp is
    /// re-raised here.
    pub fn wait_all(&mut self) {
        for handle in self.running.drain(..) {
            match handle.join() {
                Ok(invocations) => self.activity.invocations += invocations,
                Err(payload) => panic::resume_unwind(payload),
            }
        }
    }

    pub fn activity(&self) -> CoreActivity {
        self.activity
    }
}

/// Run `body` as warp 0 of core `core_id`. Every warp it activates has
/// completed by the time this returns.
pub fn with_core<'env, R>(
    core_id: u32,
    capacity: DeviceCapacity,
    body: impl for<'scope> FnOnce(&mut WarpSpawner<'scope, 'env>) -> R,
) -> (R, CoreActivity) {
    thread::scope(|scope| {
        let mut spawner = WarpSpawner {
            scope,
            core_id,
            capacity,
            barriers: Arc::new(BarrierTable::new()),
            running: Vec::new(),
            activity: CoreActivity::default(),
        };
        let out = body(&mut spawner);
        spawner.wait_all();
        (out, spawner.activity())
    })
}

/// A SIMT device with a fixed capacity and one scratch slot per core.
pub struct SoftDevice {
    capacity: DeviceCapacity,
    pub(crate) scratch: Vec<ScratchChannel<CorePlan>>,
    pub(crate) metrics: Arc<RwLock<LaunchMetrics>>,
}

impl SoftDevice {
    pub fn new(capacity: DeviceCapacity) -> Self {
        Self {
            capacity,
            scratch: (0..capacity.cores).map(|_| ScratchChannel::new()).collect(),
            metrics: Arc::new(RwLock::new(LaunchMetrics::default())),
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self, SpawnError> {
        Ok(Self::new(config.capacity()?))
    }

    /// Capability query: core count, resident warps per core, lanes per warp.
    pub fn capacity(&self) -> DeviceCapacity {
        self.capacity
    }

    /// Scratch slot of core `core_id`.
    pub fn scratch(&self, core_id: u32) -> Option<&ScratchChannel<CorePlan>> {
        self.scratch.get(core_id as usize)
    }

    /// Get a snapshot of the current launch metrics.
    pub fn metrics(&self) -> LaunchMetrics {
        match self.metrics.read() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Run `body` directly on core `core_id` as its warp 0, outside of any
    /// launch. Used for lane-control level programs.
    pub fn run_on_core<'env, R>(
        &mut self,
        core_id: u32,
        body: impl for<'scope> FnOnce(&mut WarpSpawner<'scope, 'env>) -> R,
    ) -> (R, CoreActivity) {
        assert!(core_id < self.capacity.cores, "core {core_id} does not exist");
        with_core(core_id, self.capacity, body)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn cap() -> DeviceCapacity {
        DeviceCapacity::new(2, 4, 4).unwrap()
    }

    #[test]
    fn activated_warp_starts_with_lane_zero() {
        let w = Warp::activated(0, 3, 4, Arc::new(BarrierTable::new()));
        assert_eq!(w.active_lanes(), ThreadMask::LANE0);
        assert_eq!(w.warp_id(), 3);
    }

    #[test]
    fn set_active_lanes_clamps_to_width() {
        let mut w = Warp::activated(0, 0, 4, Arc::new(BarrierTable::new()));
        w.set_active_lanes(ThreadMask(u32::MAX));
        assert_eq!(w.active_lanes(), ThreadMask(0b1111));
        w.deactivate();
        assert!(!w.is_active());
    }

    #[test]
    fn predicate_falls_back_when_no_lane_matches() {
        let mut w = Warp::activated(0, 0, 4, Arc::new(BarrierTable::new()));
        w.activate_all();
        w.predicate(|l| l == 0, ThreadMask::LANE0);
        assert_eq!(w.active_lanes(), ThreadMask::LANE0);
        w.activate_all();
        w.predicate(|l| l > 10, ThreadMask(0b10));
        assert_eq!(w.active_lanes(), ThreadMask(0b10));
    }

    #[test]
    fn serial_runs_one_lane_at_a_time() {
        let mut w = Warp::activated(0, 0, 4, Arc::new(BarrierTable::new()));
        w.set_active_lanes(ThreadMask(0b1011));
        let mut seen = Vec::new();
        w.serial(|warp, lane| {
            assert_eq!(warp.active_lanes(), ThreadMask::lane(lane));
            seen.push(lane);
        });
        assert_eq!(seen, vec![0, 1, 3]);
        assert_eq!(w.active_lanes(), ThreadMask(0b1011));
    }

    #[test]
    fn activate_runs_every_warp_once() {
        let hits: Vec<AtomicU32> = (0..4).map(|_| AtomicU32::new(0)).collect();
        let entry = |warp: &mut Warp| {
            hits[warp.warp_id() as usize].fetch_add(1, Ordering::SeqCst);
        };
        let ((), activity) = with_core(0, cap(), |spawner| {
            spawner.activate(4, &entry).unwrap();
            entry(&mut spawner.initiator());
            spawner.wait_all();
        });
        assert!(hits.iter().all(|h| h.load(Ordering::SeqCst) == 1));
        assert_eq!(activity.warps_activated, 3);
    }

    #[test]
    fn activate_caps_at_resident_warps() {
        let started = AtomicU32::new(0);
        let entry = |_: &mut Warp| {
            started.fetch_add(1, Ordering::SeqCst);
        };
        let (_, activity) = with_core(1, cap(), |spawner| spawner.activate(99, &entry).unwrap());
        assert_eq!(activity.warps_activated, 3);
        assert_eq!(started.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn wait_all_counts_retired_invocations() {
        let entry = |warp: &mut Warp| warp.record_invocations(5);
        let (_, activity) = with_core(0, cap(), |spawner| {
            spawner.activate(3, &entry).unwrap();
            spawner.wait_all();
        });
        assert_eq!(activity.invocations, 10);
    }

    #[test]
    #[should_panic(expected = "warp failure")]
    fn warp_panic_reaches_initiator() {
        let entry = |_: &mut Warp| panic!("warp failure");
        with_core(0, cap(), |spawner| {
            spawner.activate(2, &entry).unwrap();
            spawner.wait_all();
        });
    }

    #[test]
    fn device_from_config_takes_its_capacity() {
        let config = DeviceConfig::from_toml("[device]\ncores = 3\nlanes_per_warp = 8\n").unwrap();
        let device = SoftDevice::from_config(&config).unwrap();
        assert_eq!(device.capacity().cores, 3);
        assert_eq!(device.capacity().lanes_per_warp, 8);
        assert!(device.scratch(2).is_some());

        let mut bad = config.clone();
        bad.device.cores = 0;
        assert!(SoftDevice::from_config(&bad).is_err());
    }

    #[test]
    fn device_has_one_slot_per_core() {
        let device = SoftDevice::new(cap());
        assert!(device.scratch(1).is_some());
        assert!(device.scratch(2).is_none());
        assert!(!device.scratch(0).unwrap().is_occupied());
    }
}
