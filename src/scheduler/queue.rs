use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::scheduler::action::{process_effect, transition, JobAction, ProcessEffect};
use crate::scheduler::component::{
    Component, ComponentHold, ComponentKey, ComponentStatus, MapId, StatusCounts,
};

const DEFAULT_MAX_COMPONENTS: usize = 10_000;

/// Resource requests shared by every component of a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    pub memory_mb: u64,
    pub disk_kb: u64,
}

/// How every component of a map is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapTemplate {
    pub command: String,
    pub env: BTreeMap<String, String>,
    pub request: ResourceRequest,
}

/// Queue-side state of one submitted map.
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub id: MapId,
    pub submitted_at: DateTime<Utc>,
    pub template: MapTemplate,
    pub components: Vec<Component>,
}

/// A signal the engine must deliver to a live component process after an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActEffect {
    pub key: ComponentKey,
    pub attempt: u32,
    pub effect: ProcessEffect,
}

/// Tracks the status of every component of every live map.
#[derive(Debug)]
pub struct ComponentQueue {
    maps: HashMap<MapId, MapEntry>,
    max_components: usize,
}

impl Default for ComponentQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_COMPONENTS)
    }

    pub fn with_capacity(max_components: usize) -> Self {
        Self {
            maps: HashMap::new(),
            max_components,
        }
    }

    /// Add a new map with one idle component per argument list.
    /// Returns false if the queue would exceed its capacity.
    pub fn add_map(&mut self, id: MapId, template: MapTemplate, args: Vec<Vec<String>>) -> bool {
        let components = args
            .into_iter()
            .enumerate()
            .map(|(index, args)| Component::new(index, args))
            .collect();
        self.insert_map(MapEntry {
            id,
            submitted_at: Utc::now(),
            template,
            components,
        })
    }

    /// Insert a prepared map entry, e.g. one recovered from disk.
    pub fn insert_map(&mut self, entry: MapEntry) -> bool {
        if self.len() + entry.components.len() > self.max_components {
            return false;
        }
        self.maps.insert(entry.id, entry);
        true
    }

    pub fn contains_map(&self, id: &MapId) -> bool {
        self.maps.contains_key(id)
    }

    pub fn map_entry(&self, id: &MapId) -> Option<&MapEntry> {
        self.maps.get(id)
    }

    /// Get a component by key
    pub fn get(&self, key: &ComponentKey) -> Option<&Component> {
        self.maps
            .get(&key.map)
            .and_then(|entry| entry.components.get(key.component))
    }

    fn get_mut(&mut self, key: &ComponentKey) -> Option<&mut Component> {
        self.maps
            .get_mut(&key.map)
            .and_then(|entry| entry.components.get_mut(key.component))
    }

    pub fn statuses(&self, id: &MapId) -> Option<Vec<ComponentStatus>> {
        self.maps
            .get(id)
            .map(|entry| entry.components.iter().map(|c| c.status).collect())
    }

    pub fn status_counts(&self, id: &MapId) -> StatusCounts {
        self.maps
            .get(id)
            .map(|entry| entry.components.iter().map(|c| c.status).collect())
            .unwrap_or_default()
    }

    /// Holds of the map's held components, by component index.
    pub fn holds(&self, id: &MapId) -> BTreeMap<usize, ComponentHold> {
        self.maps
            .get(id)
            .map(|entry| {
                entry
                    .components
                    .iter()
                    .filter(|c| c.status == ComponentStatus::Held)
                    .filter_map(|c| c.hold.clone().map(|hold| (c.index, hold)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True if any component of the map has not finished.
    pub fn is_active(&self, id: &MapId) -> bool {
        self.maps
            .get(id)
            .map(|entry| entry.components.iter().any(|c| !c.status.is_finished()))
            .unwrap_or(false)
    }

    /// Apply `action` to every component of the map.
    /// Returns the process signals required for components that have a live process.
    pub fn act(&mut self, id: &MapId, action: JobAction) -> Vec<ActEffect> {
        let Some(entry) = self.maps.get_mut(id) else {
            return Vec::new();
        };

        let mut effects = Vec::new();
        for component in entry.components.iter_mut() {
            let Some(next) = transition(component.status, action) else {
                continue;
            };

            let effect = process_effect(component.status, next);
            if effect != ProcessEffect::None {
                effects.push(ActEffect {
                    key: ComponentKey {
                        map: *id,
                        component: component.index,
                    },
                    attempt: component.attempt,
                    effect,
                });
            }

            match next {
                ComponentStatus::Held => component.hold = Some(ComponentHold::by_user()),
                ComponentStatus::Idle => component.hold = None,
                _ => {}
            }
            if !next.has_process() {
                component.slot = None;
            }
            component.status = next;
        }
        effects
    }

    /// Find the oldest idle component whose memory request fits in `free_memory_mb`.
    pub fn next_idle(&self, free_memory_mb: u64) -> Option<ComponentKey> {
        let mut entries: Vec<&MapEntry> = self
            .maps
            .values()
            .filter(|entry| entry.template.request.memory_mb <= free_memory_mb)
            .collect();
        entries.sort_by_key(|entry| (entry.submitted_at, entry.id));

        entries.into_iter().find_map(|entry| {
            entry
                .components
                .iter()
                .find(|c| c.status == ComponentStatus::Idle)
                .map(|c| ComponentKey {
                    map: entry.id,
                    component: c.index,
                })
        })
    }

    /// Mark an idle component as running on `slot`. Returns the new attempt number.
    pub fn assign(&mut self, key: &ComponentKey, slot: u64) -> Option<u32> {
        let component = self.get_mut(key)?;
        if component.status != ComponentStatus::Idle {
            return None;
        }
        component.status = ComponentStatus::Running;
        component.slot = Some(slot);
        component.attempt += 1;
        component.started_at = Some(Utc::now());
        Some(component.attempt)
    }

    /// True if `attempt` is still the component's live execution.
    pub fn is_live(&self, key: &ComponentKey, attempt: u32) -> bool {
        self.get(key)
            .map(|c| c.attempt == attempt && c.status.has_process())
            .unwrap_or(false)
    }

    /// Record the outcome of a finished execution. Stale attempts are ignored.
    pub fn record_result(
        &mut self,
        key: &ComponentKey,
        attempt: u32,
        status: ComponentStatus,
        exit_code: Option<i32>,
        runtime: Duration,
    ) -> bool {
        if !self.is_live(key, attempt) {
            return false;
        }
        let Some(component) = self.get_mut(key) else {
            return false;
        };
        component.status = status;
        component.exit_code = exit_code;
        component.runtime += runtime;
        component.slot = None;
        component.finished_at = Some(Utc::now());
        true
    }

    /// Hold a component whose process could not be started.
    pub fn record_start_failure(&mut self, key: &ComponentKey, attempt: u32, hold: ComponentHold) -> bool {
        if !self.is_live(key, attempt) {
            return false;
        }
        let Some(component) = self.get_mut(key) else {
            return false;
        };
        component.status = ComponentStatus::Held;
        component.hold = Some(hold);
        component.slot = None;
        true
    }

    /// Change the map's resource requests. Components that are already running keep
    /// the resources they were started with.
    pub fn edit_request(&mut self, id: &MapId, memory_mb: Option<u64>, disk_kb: Option<u64>) -> bool {
        let Some(entry) = self.maps.get_mut(id) else {
            return false;
        };
        if let Some(memory_mb) = memory_mb {
            entry.template.request.memory_mb = memory_mb;
        }
        if let Some(disk_kb) = disk_kb {
            entry.template.request.disk_kb = disk_kb;
        }
        true
    }

    /// Put finished components back in the idle state. Returns how many were reset.
    pub fn resubmit(&mut self, id: &MapId, components: &[usize]) -> usize {
        let Some(entry) = self.maps.get_mut(id) else {
            return 0;
        };
        let mut count = 0;
        for index in components {
            if let Some(component) = entry.components.get_mut(*index) {
                if component.status.is_finished() {
                    component.reset();
                    count += 1;
                }
            }
        }
        count
    }

    pub fn remove_map(&mut self, id: &MapId) -> Option<MapEntry> {
        self.maps.remove(id)
    }

    /// Accumulated execution time of each component.
    pub fn runtimes(&self, id: &MapId) -> Vec<Duration> {
        self.maps
            .get(id)
            .map(|entry| entry.components.iter().map(|c| c.runtime).collect())
            .unwrap_or_default()
    }

    /// Total number of components across all maps
    pub fn len(&self) -> usize {
        self.maps.values().map(|entry| entry.components.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Returns true if the queue is at capacity
    pub fn is_full(&self) -> bool {
        self.len() >= self.max_components
    }
}
