//! Deferred memory-hazard tracking. A write does not emit a barrier; it
//! records the barrier classes future readers of the resource must wait on.
//! The barrier is emitted immediately before the next read, which batches
//! synchronization cost instead of paying it after every producing command.

use std::collections::HashMap;

use super::driver::types::{BarrierBits, ResourceId};
use super::driver::Driver;

#[derive(Default)]
pub struct HazardTracker {
    pending: HashMap<ResourceId, BarrierBits>,
    // Write-accessed resources of the command being committed. Drained at
    // the end of every draw/dispatch; never persists across commands.
    written: Vec<(ResourceId, BarrierBits)>,
}

impl HazardTracker {
    /// Emit the barrier a read of `res` requires, if any is pending.
    /// Classes covered by the emitted barrier stop being pending.
    pub fn flush_for_read<D: Driver>(
        &mut self,
        driver: &mut D,
        res: ResourceId,
        needed: BarrierBits,
    ) {
        if let Some(bits) = self.pending.get_mut(&res) {
            let hit = *bits & needed;
            if !hit.is_empty() {
                driver.memory_barrier(hit);
                bits.remove(hit);
            }
            if bits.is_empty() {
                self.pending.remove(&res);
            }
        }
    }

    /// Record that the command being committed writes `res`. The barriers
    /// become pending only once the command is issued (`commit_writes`).
    pub fn note_write(&mut self, res: ResourceId, barriers: BarrierBits) {
        if !barriers.is_empty() {
            self.written.push((res, barriers));
        }
    }

    /// Called after the draw/dispatch was issued: convert the written set
    /// into pending barriers attached to each resource.
    pub fn commit_writes(&mut self) {
        for (res, bits) in self.written.drain(..) {
            *self.pending.entry(res).or_insert(BarrierBits::empty()) |= bits;
        }
    }

    pub fn pending_for(&self, res: ResourceId) -> BarrierBits {
        self.pending.get(&res).copied().unwrap_or_default()
    }

    pub fn has_written(&self) -> bool {
        !self.written.is_empty()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.written.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::driver::{RecordedOp, RecordingDriver};
    use crate::gpu::structs::Buffer;
    use crate::utils::Handle;

    #[test]
    fn write_defers_barrier_until_next_read() {
        let mut drv = RecordingDriver::default();
        let mut tracker = HazardTracker::default();
        let buf = ResourceId::Buffer(Handle::<Buffer>::new(1, 0));

        tracker.note_write(buf, BarrierBits::ALL_BUFFER_READS);
        tracker.commit_writes();
        // Nothing reaches the driver until something reads the buffer.
        assert_eq!(drv.count_ops(|op| matches!(op, RecordedOp::MemoryBarrier(_))), 0);

        tracker.flush_for_read(&mut drv, buf, BarrierBits::UNIFORM);
        assert_eq!(
            drv.ops(),
            &[RecordedOp::MemoryBarrier(BarrierBits::UNIFORM)]
        );

        // The uniform class is consumed; a second uniform read is silent.
        tracker.flush_for_read(&mut drv, buf, BarrierBits::UNIFORM);
        assert_eq!(drv.count_ops(|op| matches!(op, RecordedOp::MemoryBarrier(_))), 1);

        // Other classes are still pending.
        tracker.flush_for_read(&mut drv, buf, BarrierBits::INDEX);
        assert_eq!(drv.count_ops(|op| matches!(op, RecordedOp::MemoryBarrier(_))), 2);
    }

    #[test]
    fn written_set_is_per_command() {
        let mut tracker = HazardTracker::default();
        let buf = ResourceId::Buffer(Handle::<Buffer>::new(2, 0));
        tracker.note_write(buf, BarrierBits::STORAGE);
        assert!(tracker.has_written());
        tracker.commit_writes();
        assert!(!tracker.has_written());
        assert_eq!(tracker.pending_for(buf), BarrierBits::STORAGE);
    }
}
