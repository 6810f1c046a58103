//! Publish request pipeline
//!
//! Keeps publish requests outstanding for the created subscriptions of a
//! session, routes responses to their subscriptions and acknowledges
//! received messages with later requests.

mod acks;
mod pump;

pub use acks::AckTracker;
pub use pump::{is_terminal, PublishLoop, PublishOutcome};
