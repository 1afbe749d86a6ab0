pub mod action;
pub mod assigner;
pub mod component;
pub mod queue;

pub use action::{JobAction, ProcessEffect};
pub use assigner::{Assignment, SlotAssigner};
pub use component::{
    Component, ComponentHold, ComponentKey, ComponentStatus, MapId, StatusCounts,
    HOLD_CODE_START_FAILED, HOLD_CODE_USER,
};
pub use queue::{ActEffect, ComponentQueue, MapEntry, MapTemplate, ResourceRequest};
