use std::collections::BTreeMap;
use std::ops::Index;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hold code for components held through [`JobAction::Hold`](super::JobAction::Hold).
pub const HOLD_CODE_USER: i32 = 1;

/// Hold code for components whose process could not be started.
pub const HOLD_CODE_START_FAILED: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Unmaterialized,
    Idle,
    Running,
    Suspended,
    Held,
    Completed,
    Errored,
    Removed,
}

impl ComponentStatus {
    /// Statuses shown in map status summaries, in display order.
    pub fn display_statuses() -> &'static [ComponentStatus] {
        &[
            ComponentStatus::Idle,
            ComponentStatus::Running,
            ComponentStatus::Held,
            ComponentStatus::Suspended,
            ComponentStatus::Completed,
            ComponentStatus::Errored,
        ]
    }

    /// Completed and errored components have finished executing.
    pub fn is_finished(self) -> bool {
        matches!(self, ComponentStatus::Completed | ComponentStatus::Errored)
    }

    /// A component with a live process (possibly stopped).
    pub fn has_process(self) -> bool {
        matches!(self, ComponentStatus::Running | ComponentStatus::Suspended)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ComponentStatus::Unmaterialized => "unmaterialized",
            ComponentStatus::Idle => "idle",
            ComponentStatus::Running => "running",
            ComponentStatus::Suspended => "suspended",
            ComponentStatus::Held => "held",
            ComponentStatus::Completed => "completed",
            ComponentStatus::Errored => "errored",
            ComponentStatus::Removed => "removed",
        }
    }
}

impl std::fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ComponentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unmaterialized" => Ok(ComponentStatus::Unmaterialized),
            "idle" => Ok(ComponentStatus::Idle),
            "running" => Ok(ComponentStatus::Running),
            "suspended" => Ok(ComponentStatus::Suspended),
            "held" => Ok(ComponentStatus::Held),
            "completed" => Ok(ComponentStatus::Completed),
            "errored" => Ok(ComponentStatus::Errored),
            "removed" => Ok(ComponentStatus::Removed),
            other => Err(format!("unknown component status: {}", other)),
        }
    }
}

/// Why a component is held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHold {
    pub code: i32,
    pub reason: String,
}

impl ComponentHold {
    pub fn by_user() -> Self {
        Self {
            code: HOLD_CODE_USER,
            reason: "held by user".to_string(),
        }
    }

    pub fn start_failed(error: impl std::fmt::Display) -> Self {
        Self {
            code: HOLD_CODE_START_FAILED,
            reason: format!("failed to start component process: {}", error),
        }
    }
}

impl std::fmt::Display for ComponentHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.reason)
    }
}

/// Identifies a submitted map independently of its (mutable) tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MapId(pub Uuid);

impl MapId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MapId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl std::str::FromStr for MapId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(MapId)
    }
}

/// A single component of a map, addressed by map and index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentKey {
    pub map: MapId,
    pub component: usize,
}

impl std::fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.map, self.component)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub index: usize,
    pub args: Vec<String>,
    pub status: ComponentStatus,
    pub hold: Option<ComponentHold>,
    pub slot: Option<u64>,
    /// Incremented on every assignment; results from older attempts are stale.
    pub attempt: u32,
    pub exit_code: Option<i32>,
    pub runtime: Duration,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Component {
    pub fn new(index: usize, args: Vec<String>) -> Self {
        Self {
            index,
            args,
            status: ComponentStatus::Idle,
            hold: None,
            slot: None,
            attempt: 0,
            exit_code: None,
            runtime: Duration::ZERO,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Reconstruct a component that already finished in an earlier engine run.
    pub fn recovered(index: usize, args: Vec<String>, status: ComponentStatus) -> Self {
        let mut component = Self::new(index, args);
        component.status = status;
        component
    }

    /// Return to the idle state with no trace of previous execution.
    pub fn reset(&mut self) {
        self.status = ComponentStatus::Idle;
        self.hold = None;
        self.slot = None;
        self.exit_code = None;
        self.runtime = Duration::ZERO;
        self.submitted_at = Utc::now();
        self.started_at = None;
        self.finished_at = None;
    }
}

/// Number of components in each status. Statuses with no components count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts(BTreeMap<ComponentStatus, usize>);

impl StatusCounts {
    pub fn get(&self, status: ComponentStatus) -> usize {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ComponentStatus, usize)> + '_ {
        self.0.iter().map(|(status, count)| (*status, *count))
    }
}

impl FromIterator<ComponentStatus> for StatusCounts {
    fn from_iter<I: IntoIterator<Item = ComponentStatus>>(iter: I) -> Self {
        let mut counts = BTreeMap::new();
        for status in iter {
            *counts.entry(status).or_insert(0) += 1;
        }
        Self(counts)
    }
}

impl Index<ComponentStatus> for StatusCounts {
    type Output = usize;

    fn index(&self, status: ComponentStatus) -> &usize {
        self.0.get(&status).unwrap_or(&0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_counts_default_to_zero() {
        let counts: StatusCounts = [ComponentStatus::Held, ComponentStatus::Held]
            .into_iter()
            .collect();
        assert_eq!(counts[ComponentStatus::Held], 2);
        assert_eq!(counts[ComponentStatus::Running], 0);
        assert_eq!(counts.get(ComponentStatus::Idle), 0);
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn status_round_trips_through_display() {
        for status in ComponentStatus::display_statuses() {
            let parsed: ComponentStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, *status);
        }
        assert!("bogus".parse::<ComponentStatus>().is_err());
    }

    #[test]
    fn hold_display_includes_code() {
        assert_eq!(ComponentHold::by_user().to_string(), "[1] held by user");
    }

    #[test]
    fn reset_clears_execution_state() {
        let mut component = Component::new(3, vec!["x".to_string()]);
        component.status = ComponentStatus::Errored;
        component.exit_code = Some(2);
        component.runtime = Duration::from_secs(4);
        component.reset();
        assert_eq!(component.status, ComponentStatus::Idle);
        assert!(component.exit_code.is_none());
        assert_eq!(component.runtime, Duration::ZERO);
    }
}
