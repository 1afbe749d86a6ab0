use std::collections::BTreeMap;
use std::time::Instant;

use crate::scheduler::component::ComponentKey;
use crate::scheduler::queue::ComponentQueue;

/// Execution slot state tracking
#[derive(Debug, Clone)]
pub struct SlotState {
    pub id: u64,
    pub running: Option<ComponentKey>,
    pub reserved_memory_mb: u64,
    pub last_released: Instant,
}

impl SlotState {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            running: None,
            reserved_memory_mb: 0,
            last_released: Instant::now(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.running.is_none()
    }
}

/// A component placed on a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub key: ComponentKey,
    pub slot: u64,
    pub attempt: u32,
}

/// Assigns idle components to execution slots within a memory budget
#[derive(Debug)]
pub struct SlotAssigner {
    slots: BTreeMap<u64, SlotState>,
    memory_mb: u64,
}

impl SlotAssigner {
    pub fn new(slots: usize, memory_mb: u64) -> Self {
        Self {
            slots: (1..=slots as u64).map(|id| (id, SlotState::new(id))).collect(),
            memory_mb,
        }
    }

    /// Memory not reserved by running components
    pub fn free_memory_mb(&self) -> u64 {
        let reserved: u64 = self.slots.values().map(|s| s.reserved_memory_mb).sum();
        self.memory_mb.saturating_sub(reserved)
    }

    /// Get free slot IDs
    pub fn free_slots(&self) -> Vec<u64> {
        self.slots
            .values()
            .filter(|s| s.is_free())
            .map(|s| s.id)
            .collect()
    }

    /// Assign the next idle component to the free slot that has been idle longest.
    pub fn assign_next(&mut self, queue: &mut ComponentQueue) -> Option<Assignment> {
        let slot_id = self
            .slots
            .values()
            .filter(|s| s.is_free())
            .min_by_key(|s| s.last_released)
            .map(|s| s.id)?;

        let key = queue.next_idle(self.free_memory_mb())?;
        let memory_mb = queue.map_entry(&key.map)?.template.request.memory_mb;
        let attempt = queue.assign(&key, slot_id)?;

        if let Some(slot) = self.slots.get_mut(&slot_id) {
            slot.running = Some(key);
            slot.reserved_memory_mb = memory_mb;
        }
        tracing::debug!(component = %key, slot = slot_id, attempt, "Component assigned");

        Some(Assignment {
            key,
            slot: slot_id,
            attempt,
        })
    }

    /// Free a slot once its component process has exited
    pub fn release(&mut self, slot_id: u64) {
        if let Some(slot) = self.slots.get_mut(&slot_id) {
            slot.running = None;
            slot.reserved_memory_mb = 0;
            slot.last_released = Instant::now();
        }
    }

    /// Components currently occupying a slot
    pub fn running(&self) -> Vec<ComponentKey> {
        self.slots.values().filter_map(|s| s.running).collect()
    }
}
