//! Configuration types for the opcua-stream crate
//!
//! Two structures control the engine: [`SubscriptionConfig`] is the desired
//! configuration of one subscription and travels with the desired state,
//! [`PublishConfig`] holds the session-wide timing of the publish pipeline.

use opcua_api::TimestampsToReturn;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, StreamError};

/// Desired configuration of a subscription
///
/// Counter values are requests. The server revises them on create and
/// modify; the revised values are kept separately on the subscription state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Requested publishing interval
    /// Default: 1 second
    pub publishing_interval: Duration,

    /// Publishing intervals without notifications before the server sends a keep-alive
    /// Default: 10
    pub keep_alive_count: u32,

    /// Publishing intervals without a publish request before the server drops the subscription
    /// Default: 2400
    pub lifetime_count: u32,

    /// Upper bound of notifications per publish response, 0 for no limit
    /// Default: 0
    pub max_notifications_per_publish: u32,

    /// Relative priority among the session's subscriptions
    /// Default: 0
    pub priority: u8,

    /// Whether the server should send notifications at all
    /// Default: true
    pub publishing_enabled: bool,

    /// Shortest lifetime the client accepts, used to floor the lifetime count
    /// Default: 10 seconds
    pub min_lifetime_interval: Duration,

    /// Number of processed notification messages kept for inspection
    /// Default: 10
    pub max_message_count: usize,

    /// Timestamps requested for monitored items
    /// Default: Both
    pub timestamps_to_return: TimestampsToReturn,

    /// Skip the per-item value and event queues
    /// Default: false
    pub disable_item_cache: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            publishing_interval: Duration::from_secs(1),
            keep_alive_count: 10,
            lifetime_count: 2400,
            max_notifications_per_publish: 0,
            priority: 0,
            publishing_enabled: true,
            min_lifetime_interval: Duration::from_secs(10),
            max_message_count: 10,
            timestamps_to_return: TimestampsToReturn::Both,
            disable_item_cache: false,
        }
    }
}

impl SubscriptionConfig {
    /// Create a new SubscriptionConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for fast-changing process values
    pub fn fast_sampling() -> Self {
        Self {
            publishing_interval: Duration::from_millis(100),
            keep_alive_count: 50,
            lifetime_count: 1500,
            ..Default::default()
        }
    }

    /// Configuration for slow links where fewer, larger publish responses are preferred
    pub fn low_bandwidth() -> Self {
        Self {
            publishing_interval: Duration::from_secs(10),
            keep_alive_count: 5,
            lifetime_count: 100,
            max_notifications_per_publish: 1000,
            ..Default::default()
        }
    }

    /// True if both configurations request the same server-side subscription
    ///
    /// Publishing mode and client-side settings are not compared; they never
    /// need a modify request.
    pub fn is_same_as(&self, other: &SubscriptionConfig) -> bool {
        self.publishing_interval == other.publishing_interval
            && self.keep_alive_count == other.keep_alive_count
            && self.lifetime_count == other.lifetime_count
            && self.max_notifications_per_publish == other.max_notifications_per_publish
            && self.priority == other.priority
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        if self.max_message_count == 0 {
            return Err(StreamError::Configuration(
                "Max message count must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_publishing_interval(mut self, interval: Duration) -> Self {
        self.publishing_interval = interval;
        self
    }

    pub fn with_keep_alive_count(mut self, count: u32) -> Self {
        self.keep_alive_count = count;
        self
    }

    pub fn with_lifetime_count(mut self, count: u32) -> Self {
        self.lifetime_count = count;
        self
    }

    pub fn with_max_notifications_per_publish(mut self, max: u32) -> Self {
        self.max_notifications_per_publish = max;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_publishing_enabled(mut self, enabled: bool) -> Self {
        self.publishing_enabled = enabled;
        self
    }

    pub fn with_min_lifetime_interval(mut self, interval: Duration) -> Self {
        self.min_lifetime_interval = interval;
        self
    }

    pub fn with_max_message_count(mut self, count: usize) -> Self {
        self.max_message_count = count;
        self
    }

    pub fn with_timestamps_to_return(mut self, timestamps: TimestampsToReturn) -> Self {
        self.timestamps_to_return = timestamps;
        self
    }

    pub fn with_item_cache_disabled(mut self, disabled: bool) -> Self {
        self.disable_item_cache = disabled;
        self
    }
}

/// Session-wide timing of the publish pipeline
#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Upper bound for a single publish or republish round-trip
    /// Default: 60 seconds
    pub operation_timeout: Duration,

    /// Age of an unfilled sequence gap before a republish is requested
    /// Default: 10 seconds
    pub republish_timeout: Duration,

    /// Slack added to the keep-alive window before publishing counts as stopped
    /// Default: 500 milliseconds
    pub keep_alive_grace: Duration,

    /// Pause after a transient publish failure before the next request
    /// Default: 1 second
    pub retry_delay: Duration,

    /// Capacity of the consumer event channel
    /// Default: 1000
    pub event_buffer_size: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(60),
            republish_timeout: Duration::from_secs(10),
            keep_alive_grace: Duration::from_millis(500),
            retry_delay: Duration::from_secs(1),
            event_buffer_size: 1000,
        }
    }
}

impl PublishConfig {
    /// Create a new PublishConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration that asks for lost messages early
    pub fn fast_recovery() -> Self {
        Self {
            operation_timeout: Duration::from_secs(15),
            republish_timeout: Duration::from_secs(2),
            retry_delay: Duration::from_millis(200),
            ..Default::default()
        }
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout == Duration::ZERO {
            return Err(StreamError::Configuration(
                "Operation timeout must be greater than 0".to_string(),
            ));
        }

        if self.republish_timeout == Duration::ZERO {
            return Err(StreamError::Configuration(
                "Republish timeout must be greater than 0".to_string(),
            ));
        }

        if self.event_buffer_size == 0 {
            return Err(StreamError::Configuration(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_republish_timeout(mut self, timeout: Duration) -> Self {
        self.republish_timeout = timeout;
        self
    }

    pub fn with_keep_alive_grace(mut self, grace: Duration) -> Self {
        self.keep_alive_grace = grace;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }
}
