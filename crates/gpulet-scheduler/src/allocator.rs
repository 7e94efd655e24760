//! GPU device ledger

use gpulet_core::{DeviceSlot, GpuDevice, GpuletError, GpuletResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exclusive-reservation ledger over the host's schedulable GPU devices.
///
/// The ledger is authoritative during normal operation; the hardware probe is
/// consulted only at startup and on explicit reconciliation. All access goes
/// through the scheduler's state lock.
pub struct GpuAllocator {
    /// Slots ordered by device index
    slots: Vec<DeviceSlot>,
}

impl GpuAllocator {
    /// Build the ledger from probed inventory.
    ///
    /// Devices the probe saw as occupied by outside work are excluded: they
    /// are not schedulable and never enter the ledger.
    pub fn new(devices: Vec<GpuDevice>) -> Self {
        let mut allocator = Self { slots: Vec::new() };
        allocator.reconcile(devices);
        allocator
    }

    /// Number of schedulable devices
    pub fn total(&self) -> usize {
        self.slots.len()
    }

    /// Number of free devices
    pub fn available(&self) -> usize {
        self.slots.iter().filter(|s| !s.busy).count()
    }

    /// Snapshot of the ledger, ordered by device index
    pub fn snapshot(&self) -> Vec<DeviceSlot> {
        self.slots.clone()
    }

    /// Indices currently reserved, ordered by device index
    pub fn busy_indices(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|s| s.busy)
            .map(|s| s.index)
            .collect()
    }

    /// Reserve `count` devices for `owner`.
    ///
    /// The preferred indices are taken verbatim when they exactly cover the
    /// request and all of them are free; otherwise the lowest-indexed free
    /// devices are taken. Scarcity returns the backpressure error and leaves
    /// the ledger untouched.
    pub fn try_reserve(
        &mut self,
        count: u32,
        preferred: &[u32],
        owner: Uuid,
    ) -> GpuletResult<Vec<u32>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let available = self.available() as u32;
        if available < count {
            return Err(GpuletError::InsufficientGpus {
                requested: count,
                available,
            });
        }

        let chosen: Vec<u32> = if count as usize == preferred.len()
            && preferred.iter().all(|index| self.is_free(*index))
        {
            preferred.to_vec()
        } else {
            self.slots
                .iter()
                .filter(|s| !s.busy)
                .map(|s| s.index)
                .take(count as usize)
                .collect()
        };

        for index in &chosen {
            self.mark(*index, true, Some(owner));
        }
        debug!(owner = %owner, devices = ?chosen, "Reserved devices");
        Ok(chosen)
    }

    /// Release previously reserved devices.
    ///
    /// Releasing an index that is unknown or not busy means the ledger and
    /// the caller disagree about who holds what. That is corruption, not a
    /// recoverable condition; nothing is modified and the caller must stop
    /// scheduling.
    pub fn release(&mut self, indices: &[u32]) -> GpuletResult<()> {
        for index in indices {
            match self.slots.iter().find(|s| s.index == *index) {
                Some(slot) if slot.busy => {}
                Some(_) => {
                    return Err(GpuletError::LedgerCorrupted(format!(
                        "release of device {index} which is not reserved"
                    )));
                }
                None => {
                    return Err(GpuletError::LedgerCorrupted(format!(
                        "release of unknown device {index}"
                    )));
                }
            }
        }
        for index in indices {
            self.mark(*index, false, None);
        }
        debug!(devices = ?indices, "Released devices");
        Ok(())
    }

    /// Replace the inventory from a fresh probe, preserving live reservations.
    ///
    /// Reserved indices stay in the ledger even when the probe no longer
    /// reports them; devices the probe saw busy are excluded, idle ones join
    /// as free slots.
    pub fn reconcile(&mut self, devices: Vec<GpuDevice>) {
        let mut slots: Vec<DeviceSlot> = Vec::new();
        for slot in &self.slots {
            if slot.busy {
                if !devices.iter().any(|d| d.index == slot.index) {
                    warn!(
                        index = slot.index,
                        "Reserved device missing from probe, keeping reservation"
                    );
                }
                slots.push(slot.clone());
            }
        }
        for device in devices {
            if slots.iter().any(|s| s.index == device.index) {
                continue;
            }
            if device.busy {
                warn!(
                    index = device.index,
                    "Device busy at probe time, excluding from inventory"
                );
                continue;
            }
            slots.push(DeviceSlot::free(device.index));
        }
        slots.sort_by_key(|s| s.index);
        info!(devices = slots.len(), "GPU inventory reconciled");
        self.slots = slots;
    }

    fn is_free(&self, index: u32) -> bool {
        self.slots.iter().any(|s| s.index == index && !s.busy)
    }

    fn mark(&mut self, index: u32, busy: bool, owner: Option<Uuid>) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.index == index) {
            slot.busy = busy;
            slot.owner_task = owner;
        }
    }
}
