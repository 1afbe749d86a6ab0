use serde::{Deserialize, Serialize};

use crate::scheduler::component::ComponentStatus;

/// Control operations that apply to every component of a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Hold,
    Release,
    Suspend,
    Continue,
    Vacate,
    Remove,
}

impl std::fmt::Display for JobAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobAction::Hold => write!(f, "hold"),
            JobAction::Release => write!(f, "release"),
            JobAction::Suspend => write!(f, "suspend"),
            JobAction::Continue => write!(f, "continue"),
            JobAction::Vacate => write!(f, "vacate"),
            JobAction::Remove => write!(f, "remove"),
        }
    }
}

impl std::str::FromStr for JobAction {
    type Err = String;

    /// Accepts the user-facing verbs as well: pause/resume map to suspend/continue.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hold" => Ok(JobAction::Hold),
            "release" => Ok(JobAction::Release),
            "suspend" | "pause" => Ok(JobAction::Suspend),
            "continue" | "resume" => Ok(JobAction::Continue),
            "vacate" => Ok(JobAction::Vacate),
            "remove" => Ok(JobAction::Remove),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

/// What happens to a component's process when its status changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEffect {
    None,
    Kill,
    Stop,
    Continue,
}

/// The status a component moves to under `action`, or `None` if the action does not apply.
pub fn transition(status: ComponentStatus, action: JobAction) -> Option<ComponentStatus> {
    use ComponentStatus::*;

    match (action, status) {
        (JobAction::Hold, Unmaterialized | Idle | Running | Suspended) => Some(Held),
        (JobAction::Release, Held) => Some(Idle),
        (JobAction::Suspend, Running) => Some(Suspended),
        (JobAction::Continue, Suspended) => Some(Running),
        (JobAction::Vacate, Running | Suspended) => Some(Idle),
        (JobAction::Remove, Unmaterialized | Idle | Running | Suspended | Held) => Some(Removed),
        _ => None,
    }
}

/// The signal a live process needs when its component goes from `from` to `to`.
pub fn process_effect(from: ComponentStatus, to: ComponentStatus) -> ProcessEffect {
    use ComponentStatus::*;

    match (from, to) {
        (Running, Suspended) => ProcessEffect::Stop,
        (Suspended, Running) => ProcessEffect::Continue,
        (Running | Suspended, _) => ProcessEffect::Kill,
        _ => ProcessEffect::None,
    }
}
