use std::time::Duration;

use thiserror::Error;

use crate::scheduler::ComponentHold;

#[derive(Error, Debug)]
pub enum MapError {
    #[error("Map {0} has been removed")]
    MapWasRemoved(String),

    #[error("Tag not found: {0}")]
    TagNotFound(String),

    #[error("Tag already exists: {0}")]
    TagAlreadyExists(String),

    #[error("Invalid tag {tag:?}: {reason}")]
    InvalidTag { tag: String, reason: String },

    #[error("Cannot retag map: {0}")]
    CannotRetagMap(String),

    #[error("Cannot rerun components: {0}")]
    CannotRerunComponents(String),

    #[error("Component {component} of map {tag} is held: {hold}")]
    ComponentHeld {
        tag: String,
        component: usize,
        hold: ComponentHold,
    },

    #[error("Component {component} of map {tag} encountered an error while executing. Error report:\n{report}")]
    ComponentError {
        tag: String,
        component: usize,
        report: String,
    },

    #[error("Tried to load component {component} of map {tag} as an error, but it succeeded")]
    ExpectedError { tag: String, component: usize },

    #[error("Output for component {component} of map {tag} not found")]
    OutputNotFound { tag: String, component: usize },

    #[error("Component {component} is out of range, map {tag} only has {len} components")]
    ComponentOutOfRange {
        tag: String,
        component: usize,
        len: usize,
    },

    #[error("Timed out after {0:?} while waiting for {1}")]
    Timeout(Duration, String),

    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    #[error("Cannot submit a map with no inputs")]
    EmptyMap,

    #[error("Component queue is at capacity")]
    QueueFull,

    #[error("Engine has been shut down")]
    EngineStopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MapError>;
