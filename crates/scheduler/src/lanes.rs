//! Lane-control primitives: thread masks, structured divergence and
//! per-core warp barriers.
//!
//! The scheduler itself only uses full activation, single-lane narrowing and
//! partial-remainder masks. Kernel bodies use split/join and barriers.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Condvar, Mutex, PoisonError};

use serde::Serialize;
use warpspawn_core::lane_mask;

/// Bitset of active lanes within a warp. Bit `i` set means lane `i` executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct ThreadMask(pub u32);

impl ThreadMask {
    pub const NONE: ThreadMask = ThreadMask(0);
    /// Only lane 0, the state a freshly activated warp starts in.
    pub const LANE0: ThreadMask = ThreadMask(1);

    /// The low `count` lanes.
    pub fn first(count: u32) -> Self {
        Self(lane_mask(count))
    }

    pub fn lane(lane: u32) -> Self {
        Self(1 << lane)
    }

    pub fn contains(&self, lane: u32) -> bool {
        lane < 32 && self.0 & (1 << lane) != 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Restrict to the lanes a warp of `lanes_per_warp` physically has.
    pub fn clamp(self, lanes_per_warp: u32) -> Self {
        Self(self.0 & lane_mask(lanes_per_warp))
    }

    /// Active lane ids in ascending order.
    pub fn lanes(&self) -> impl Iterator<Item = u32> {
        let bits = self.0;
        (0..32u32).filter(move |l| bits & (1 << l) != 0)
    }

    /// Subset of this mask whose lanes satisfy `cond`.
    pub fn filter(&self, cond: impl Fn(u32) -> bool) -> Self {
        Self(self.lanes().filter(|&l| cond(l)).fold(0, |m, l| m | (1 << l)))
    }
}

impl fmt::Display for ThreadMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#b}", self.0)
    }
}

/// Divergence point returned by a split. Consumed by exactly one join, which
/// restores the mask active before the split.
#[derive(Debug)]
#[must_use = "a split must be closed by a join"]
pub struct DivergenceToken {
    pub(crate) restore: ThreadMask,
    pub(crate) taken: ThreadMask,
    pub(crate) depth: usize,
}

impl DivergenceToken {
    /// Lanes that take the branch.
    pub fn taken(&self) -> ThreadMask {
        self.taken
    }

    /// Lanes that skip the branch.
    pub fn not_taken(&self) -> ThreadMask {
        ThreadMask(self.restore.0 & !self.taken.0)
    }
}

/// Split/join bookkeeping for one warp. Splits must nest strictly.
#[derive(Debug, Default)]
pub struct DivergenceStack {
    depth: usize,
}

impl DivergenceStack {
    /// Narrow `current` to the lanes satisfying `cond`.
    pub fn split(&mut self, current: ThreadMask, cond: impl Fn(u32) -> bool) -> DivergenceToken {
        self.depth += 1;
        DivergenceToken {
            restore: current,
            taken: current.filter(cond),
            depth: self.depth,
        }
    }

    /// Close the innermost split and return the mask to restore.
    pub fn join(&mut self, token: DivergenceToken) -> ThreadMask {
        assert_eq!(
            token.depth, self.depth,
            "join out of order: token depth {} at stack depth {}",
            token.depth, self.depth
        );
        self.depth -= 1;
        token.restore
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

#[derive(Debug, Default)]
struct BarrierSlot {
    arrived: u32,
    generation: u64,
}

#[derive(Debug, Default)]
struct BarrierState {
    slots: HashMap<u32, BarrierSlot>,
    broken: bool,
}

/// Named warp barriers shared by every warp of one core.
///
/// `wait(id, expected)` blocks until `expected` warps have arrived at `id`,
/// then releases them all. A barrier id can be reused once released.
/// After [`BarrierTable::break_all`] no wait blocks again.
#[derive(Debug, Default)]
pub struct BarrierTable {
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl BarrierTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(&self, id: u32, expected: u32) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.broken {
            return;
        }
        let slot = state.slots.entry(id).or_default();
        slot.arrived += 1;
        if slot.arrived >= expected {
            slot.arrived = 0;
            slot.generation += 1;
            self.released.notify_all();
            return;
        }
        let generation = slot.generation;
        while !state.broken && state.slots.get(&id).map(|s| s.generation) == Some(generation) {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Release every waiter and turn later waits into no-ops. Used when a
    /// warp that others are waiting for will never arrive.
    pub fn break_all(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.broken = true;
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn mask_basics() {
        let m = ThreadMask::first(3);
        assert_eq!(m.0, 0b111);
        assert_eq!(m.count(), 3);
        assert!(m.contains(2));
        assert!(!m.contains(3));
        assert_eq!(m.lanes().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(ThreadMask(u32::MAX).clamp(4), ThreadMask::first(4));
        assert_eq!(ThreadMask::lane(5).0, 32);
    }

    #[test]
    fn filter_keeps_only_active_lanes() {
        let m = ThreadMask(0b1010);
        assert_eq!(m.filter(|_| true), m);
        assert_eq!(m.filter(|l| l > 1), ThreadMask(0b1000));
    }

    #[test]
    fn split_join_nesting_restores_masks() {
        let mut stack = DivergenceStack::default();
        let full = ThreadMask::first(4);

        let outer = stack.split(full, |l| l < 2);
        assert_eq!(outer.taken(), ThreadMask(0b0011));
        assert_eq!(outer.not_taken(), ThreadMask(0b1100));

        let inner = stack.split(outer.taken(), |l| l < 1);
        assert_eq!(inner.taken(), ThreadMask(0b0001));
        assert_eq!(stack.depth(), 2);

        assert_eq!(stack.join(inner), ThreadMask(0b0011));
        assert_eq!(stack.join(outer), full);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    #[should_panic(expected = "join out of order")]
    fn join_out_of_order_panics() {
        let mut stack = DivergenceStack::default();
        let outer = stack.split(ThreadMask::first(4), |l| l < 2);
        let _inner = stack.split(ThreadMask::first(2), |l| l < 1);
        stack.join(outer);
    }

    #[test]
    fn barrier_releases_all_waiters_and_is_reusable() {
        let table = Arc::new(BarrierTable::new());
        let passed = Arc::new(AtomicU32::new(0));

        for round in 1..=2u32 {
            std::thread::scope(|s| {
                for _ in 0..4 {
                    let table = Arc::clone(&table);
                    let passed = Arc::clone(&passed);
                    s.spawn(move || {
                        table.wait(7, 4);
                        passed.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });
            assert_eq!(passed.load(Ordering::SeqCst), 4 * round);
        }
    }

    #[test]
    fn broken_barrier_releases_waiters() {
        let table = BarrierTable::new();
        std::thread::scope(|s| {
            let waiters: Vec<_> = (0..2).map(|_| s.spawn(|| table.wait(3, 5))).collect();
            while table.state.lock().unwrap().slots.get(&3).map_or(0, |s| s.arrived) < 2 {
                std::thread::yield_now();
            }
            table.break_all();
            for w in waiters {
                w.join().unwrap();
            }
        });
        // Later waits fall straight through.
        table.wait(3, 5);
    }

    #[test]
    fn barrier_of_one_never_blocks() {
        let table = BarrierTable::new();
        table.wait(0, 1);
        table.wait(0, 1);
    }
}
