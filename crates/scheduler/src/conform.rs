//! Lane-control conformance checks.
//!
//! Each check drives one primitive on core 0 of a [`SoftDevice`] and writes
//! `65 + i` into slot `i` of a shared buffer for every slot it is expected
//! to reach. A check passes when every slot holds its reference value.

use std::cell::Cell;
use std::sync::atomic::{AtomicI32, Ordering};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use warpspawn_core::{Dim3, SpawnError};

use crate::device::{SoftDevice, Warp};
use crate::kernel::{KernelInvocation, ThreadContext};
use crate::lanes::ThreadMask;

const REF_BASE: i32 = 65;
const MAX_SLOTS: u32 = 8;

#[derive(Error, Debug)]
pub enum ConformError {
    #[error("launch failed: {0}")]
    Spawn(#[from] SpawnError),

    #[error("{failed} of {total} conformance checks failed")]
    Failed { failed: usize, total: usize },
}

/// A slot that does not hold its reference value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub index: usize,
    pub value: i32,
    pub expected: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub name: &'static str,
    pub mismatches: Vec<Mismatch>,
}

impl CheckOutcome {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Shared result buffer written concurrently by lanes and warps.
struct CheckBuffer(Vec<AtomicI32>);

impl CheckBuffer {
    fn new(len: u32) -> Self {
        Self((0..len).map(|_| AtomicI32::new(0)).collect())
    }

    fn store(&self, index: u32, value: i32) {
        self.0[index as usize].store(value, Ordering::SeqCst);
    }

    fn expect_ref(&self, name: &'static str, size: u32) -> CheckOutcome {
        let mismatches = self.0[..size as usize]
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let value = slot.load(Ordering::SeqCst);
                let expected = REF_BASE + index as i32;
                (value != expected).then_some(Mismatch {
                    index,
                    value,
                    expected,
                })
            })
            .collect();
        CheckOutcome { name, mismatches }
    }
}

fn ref_value(i: u32) -> i32 {
    REF_BASE + i as i32
}

fn lanes_under_test(device: &SoftDevice) -> u32 {
    device.capacity().lanes_per_warp.min(MAX_SLOTS)
}

fn warps_under_test(device: &SoftDevice) -> u32 {
    device.capacity().warps_per_core.min(MAX_SLOTS)
}

/// Warp-spawn kernels end by keeping lane 0 on the initiator only.
fn retire(warp: &mut Warp) {
    if warp.warp_id() == 0 {
        warp.activate_one();
    } else {
        warp.deactivate();
    }
}

/// The initiator fills a shared buffer and reads it back.
pub fn check_global_memory(device: &mut SoftDevice) -> CheckOutcome {
    let buf = CheckBuffer::new(MAX_SLOTS);
    device.run_on_core(0, |spawner| {
        let warp = spawner.initiator();
        warp.for_each_lane(|_| {
            for i in 0..MAX_SLOTS {
                buf.store(i, ref_value(i));
            }
        });
    });
    buf.expect_ref("global_mem", MAX_SLOTS)
}

/// Every lane writes its slot of core-local scratch, then every lane reads
/// its slot back into the result buffer.
pub fn check_local_memory(device: &mut SoftDevice) -> CheckOutcome {
    let n = lanes_under_test(device);
    let local = CheckBuffer::new(n);
    let buf = CheckBuffer::new(n);
    device.run_on_core(0, |spawner| {
        let mut warp = spawner.initiator();
        warp.set_active_lanes(ThreadMask::first(n));
        warp.for_each_lane(|tid| local.store(tid, ref_value(tid)));
        warp.for_each_lane(|tid| buf.store(tid, local.0[tid as usize].load(Ordering::SeqCst)));
        warp.activate_one();
    });
    buf.expect_ref("local_mem", n)
}

/// Widen the mask, write one slot per lane, narrow back.
pub fn check_tmc(device: &mut SoftDevice) -> CheckOutcome {
    let n = lanes_under_test(device);
    let buf = CheckBuffer::new(n);
    device.run_on_core(0, |spawner| {
        let mut warp = spawner.initiator();
        warp.set_active_lanes(ThreadMask::first(n));
        warp.for_each_lane(|tid| buf.store(tid, ref_value(tid)));
        warp.activate_one();
    });
    buf.expect_ref("tmc", n)
}

/// Predicate on `tid == 0`: only lane 0 overwrites its slot.
pub fn check_pred(device: &mut SoftDevice) -> CheckOutcome {
    let n = lanes_under_test(device);
    let buf = CheckBuffer::new(n);
    for i in 1..n {
        buf.store(i, ref_value(i));
    }
    device.run_on_core(0, |spawner| {
        let mut warp = spawner.initiator();
        warp.set_active_lanes(ThreadMask::first(n));
        warp.predicate(|tid| tid == 0, ThreadMask::LANE0);
        warp.for_each_lane(|tid| buf.store(tid, REF_BASE));
        warp.activate_one();
    });
    buf.expect_ref("pred", n)
}

/// Every spawned warp writes its own slot.
pub fn check_wspawn(device: &mut SoftDevice) -> Result<CheckOutcome, ConformError> {
    let n = warps_under_test(device);
    let buf = CheckBuffer::new(n);
    let entry = |warp: &mut Warp| {
        buf.store(warp.warp_id(), ref_value(warp.warp_id()));
        retire(warp);
    };
    let (started, _) = device.run_on_core(0, |spawner| {
        spawner.activate(n, &entry)?;
        entry(&mut spawner.initiator());
        spawner.wait_all();
        Ok::<_, SpawnError>(())
    });
    started?;
    Ok(buf.expect_ref("wspawn", n))
}

/// Two levels of nested split/join; each lane lands on a distinct path.
pub fn check_divergence(device: &mut SoftDevice) -> CheckOutcome {
    let n = lanes_under_test(device).min(4);
    let buf = CheckBuffer::new(n);
    device.run_on_core(0, |spawner| {
        let mut warp = spawner.initiator();
        warp.set_active_lanes(ThreadMask::first(n));

        let outer = warp.split(|tid| tid < 2);
        {
            let inner = warp.split(|tid| tid < 1);
            warp.for_each_lane(|tid| buf.store(tid, 65));
            warp.otherwise(&inner);
            warp.for_each_lane(|tid| buf.store(tid, 66));
            warp.join(inner);

            let never = warp.split(|_| false);
            warp.for_each_lane(|tid| buf.store(tid, 67));
            warp.join(never);
        }
        warp.otherwise(&outer);
        {
            let inner = warp.split(|tid| tid < 3);
            warp.for_each_lane(|tid| buf.store(tid, 67));
            warp.otherwise(&inner);
            warp.for_each_lane(|tid| buf.store(tid, 68));
            warp.join(inner);
        }
        warp.join(outer);
        warp.activate_one();
    });
    buf.expect_ref("divergence", n)
}

/// Serial execution sees exactly one active lane per call.
pub fn check_serial(device: &mut SoftDevice) -> CheckOutcome {
    let n = lanes_under_test(device);
    let buf = CheckBuffer::new(n);
    device.run_on_core(0, |spawner| {
        let mut warp = spawner.initiator();
        warp.set_active_lanes(ThreadMask::first(n));
        warp.serial(|w, tid| {
            if w.active_lanes() == ThreadMask::lane(tid) {
                buf.store(tid, ref_value(tid));
            }
        });
        warp.activate_one();
    });
    buf.expect_ref("serial", n)
}

/// Select each lane in turn and read the mask back.
pub fn check_tmask(device: &mut SoftDevice) -> CheckOutcome {
    let n = lanes_under_test(device);
    let buf = CheckBuffer::new(n);
    device.run_on_core(0, |spawner| {
        let mut warp = spawner.initiator();
        warp.activate_all();
        for tid in 0..n {
            warp.set_active_lanes(ThreadMask::lane(tid));
            let current = warp.active_lanes();
            warp.for_each_lane(|lane| {
                let value = if current == ThreadMask::lane(lane) { ref_value(lane) } else { 0 };
                buf.store(lane, value);
            });
        }
        warp.activate_one();
    });
    buf.expect_ref("tmask", n)
}

/// Warps of uneven length meet at one barrier; each checks afterwards that
/// every other warp has already written its slot.
pub fn check_barrier(device: &mut SoftDevice) -> Result<CheckOutcome, ConformError> {
    let n = warps_under_test(device);
    let buf = CheckBuffer::new(n);
    let late = CheckBuffer::new(n);
    let entry = |warp: &mut Warp| {
        let wid = warp.warp_id();
        let mut stall = 0u64;
        for i in 0..=(wid as u64 * 256) {
            stall = std::hint::black_box(stall + i);
        }
        buf.store(wid, ref_value(wid));
        warp.barrier(0, n);
        let all_arrived = (0..n).all(|w| buf.0[w as usize].load(Ordering::SeqCst) == ref_value(w));
        late.store(wid, if all_arrived { ref_value(wid) } else { 0 });
        retire(warp);
    };
    let (started, _) = device.run_on_core(0, |spawner| {
        spawner.activate(n, &entry)?;
        entry(&mut spawner.initiator());
        spawner.wait_all();
        Ok::<_, SpawnError>(())
    });
    started?;
    let mut outcome = buf.expect_ref("barrier", n);
    outcome.mismatches.extend(late.expect_ref("barrier", n).mismatches);
    Ok(outcome)
}

thread_local! {
    static WARP_LOCAL: Cell<u32> = const { Cell::new(u32::MAX) };
}

/// Each warp keeps its own copy of a warp-local variable.
pub fn check_warp_local(device: &mut SoftDevice) -> Result<CheckOutcome, ConformError> {
    let n = warps_under_test(device);
    let buf = CheckBuffer::new(n);
    let entry = |warp: &mut Warp| {
        let wid = warp.warp_id();
        WARP_LOCAL.with(|v| v.set(wid));
        let seen = WARP_LOCAL.with(Cell::get);
        buf.store(wid, ref_value(seen));
        retire(warp);
    };
    let (started, _) = device.run_on_core(0, |spawner| {
        spawner.activate(n, &entry)?;
        entry(&mut spawner.initiator());
        spawner.wait_all();
        Ok::<_, SpawnError>(())
    });
    started?;
    Ok(buf.expect_ref("warp_local", n))
}

struct CopyArgs<'a> {
    src: &'a [AtomicI32],
    dst: &'a [AtomicI32],
}

fn copy_kernel(ctx: &ThreadContext, arg: &CopyArgs<'_>) {
    let i = ctx.block_idx.x as usize;
    arg.dst[i].store(arg.src[i].load(Ordering::SeqCst), Ordering::SeqCst);
}

/// A one-dimensional flat launch copies a buffer element by element.
pub fn check_spawn_tasks(device: &mut SoftDevice) -> Result<CheckOutcome, ConformError> {
    let n = MAX_SLOTS;
    let src = CheckBuffer::new(n);
    for i in 0..n {
        src.store(i, ref_value(i));
    }
    let dst = CheckBuffer::new(n);
    let args = CopyArgs {
        src: &src.0,
        dst: &dst.0,
    };
    let kernel = KernelInvocation::new(copy_kernel, &args);
    device.launch(Dim3::new(n, 1, 1), Dim3::ONE, &kernel)?;
    Ok(dst.expect_ref("spawn_tasks", n))
}

/// Run every check in order.
pub fn run_all(device: &mut SoftDevice) -> Result<Vec<CheckOutcome>, ConformError> {
    let outcomes = vec![
        check_global_memory(device),
        check_local_memory(device),
        check_tmc(device),
        check_pred(device),
        check_wspawn(device)?,
        check_divergence(device),
        check_serial(device),
        check_tmask(device),
        check_barrier(device)?,
        check_warp_local(device)?,
        check_spawn_tasks(device)?,
    ];

    for outcome in &outcomes {
        if outcome.passed() {
            info!(check = outcome.name, "passed");
        } else {
            warn!(check = outcome.name, errors = outcome.mismatches.len(), "failed");
        }
    }
    Ok(outcomes)
}

/// Turn a set of outcomes into an error when any check failed.
pub fn ensure_passed(outcomes: &[CheckOutcome]) -> Result<(), ConformError> {
    let failed = outcomes.iter().filter(|o| !o.passed()).count();
    if failed == 0 {
        Ok(())
    } else {
        Err(ConformError::Failed {
            failed,
            total: outcomes.len(),
        })
    }
}
