use serde::Serialize;
use warpspawn_core::Dim3;

/// Per-lane execution context handed to the kernel on every invocation.
///
/// Built immediately before the call and dropped after it; nothing here
/// survives into the next iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreadContext {
    /// Coordinate of the group (block) this lane is working on.
    pub block_idx: Dim3,
    /// Coordinate of this lane within its group. Origin in flat mode.
    pub thread_idx: Dim3,
    pub grid_dim: Dim3,
    pub block_dim: Dim3,
    pub core_id: u32,
    pub warp_id: u32,
    pub lane_id: u32,
    /// Index of the group among those resident on this core at once.
    pub local_group_id: u32,
    /// Warps one group spans; 0 in flat mode. Together with
    /// `local_group_id` this names the group's barrier and its arrival count.
    pub warps_per_group: u32,
}

impl ThreadContext {
    /// Linear index of `block_idx` within the grid.
    pub fn group_index(&self) -> u64 {
        self.grid_dim.linearize(self.block_idx)
    }

    /// Linear index of `thread_idx` within the group.
    pub fn thread_index(&self) -> u64 {
        self.block_dim.linearize(self.thread_idx)
    }

    /// Globally unique linear id of this (group, thread) pair. A block with
    /// a zero extent runs as flat tasks, so it counts as one lane wide.
    pub fn global_index(&self) -> u64 {
        self.group_index() * self.block_dim.volume().max(1) + self.thread_index()
    }
}

/// A kernel body executed once per lane per assigned work item.
///
/// Shared by reference across every core and warp of a launch.
pub trait Kernel: Sync {
    fn invoke(&self, ctx: &ThreadContext);
}

impl<F> Kernel for F
where
    F: Fn(&ThreadContext) + Sync,
{
    fn invoke(&self, ctx: &ThreadContext) {
        self(ctx)
    }
}

/// Callback plus opaque argument, the classic launch ABI.
///
/// The argument is borrowed for the whole launch and is never copied.
pub struct KernelInvocation<'a, A: Sync> {
    pub callback: fn(&ThreadContext, &A),
    pub arg: &'a A,
}

impl<'a, A: Sync> KernelInvocation<'a, A> {
    pub fn new(callback: fn(&ThreadContext, &A), arg: &'a A) -> Self {
        Self { callback, arg }
    }
}

impl<A: Sync> Kernel for KernelInvocation<'_, A> {
    fn invoke(&self, ctx: &ThreadContext) {
        (self.callback)(ctx, self.arg)
    }
}
