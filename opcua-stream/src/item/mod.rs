//! Monitored item state and reconciliation.

mod set;
mod state;

pub use set::{ItemChanges, LinkChanges, MonitoredItemSet};
pub use state::{ItemError, ItemStatus, LinkDelta, MonitoredItemState};
