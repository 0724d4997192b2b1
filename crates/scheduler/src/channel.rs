//! Single-slot per-core hand-off from the initiating warp to the warps it
//! activates.
//!
//! The writer publishes a record and receives a shared reference that it
//! passes straight into the activation primitive. Publishing takes
//! `&mut self`, so the slot cannot be overwritten while any activated warp
//! still borrows the previous record: the borrow ends only after the
//! initiator's activation-wait returns.

/// One core's scratch slot.
#[derive(Debug)]
pub struct ScratchChannel<T> {
    slot: Option<T>,
    publishes: u64,
}

impl<T> Default for ScratchChannel<T> {
    fn default() -> Self {
        Self {
            slot: None,
            publishes: 0,
        }
    }
}

impl<T> ScratchChannel<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `record` into the slot and return the read-only view that
    /// activated warps consume. Any retired record still in the slot is
    /// replaced.
    pub fn publish(&mut self, record: T) -> &T {
        self.publishes += 1;
        self.slot.insert(record)
    }

    /// Clear the slot once every reader has completed.
    pub fn retire(&mut self) -> Option<T> {
        self.slot.take()
    }

    pub fn is_occupied(&self) -> bool {
        self.slot.is_some()
    }

    /// Number of records ever written to this slot.
    pub fn publish_count(&self) -> u64 {
        self.publishes
    }
}
