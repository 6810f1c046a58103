//! Subscription state: lifecycle, monitored items and notification intake.

mod items;
mod keep_alive;
mod messages;
mod state;

pub use keep_alive::KeepAliveTimer;
pub use state::{adjust_counts, AdjustedCounts, SubscriptionState, UNKNOWN_INTERVAL_LIFETIME_COUNT};
