//! Event types for the opcua-stream crate.

use chrono::{DateTime, Utc};
use opcua_api::{DataValue, NodeId, StatusCode, Variant};
use std::fmt;
use std::sync::Arc;

bitflags::bitflags! {
    /// Accumulated lifecycle changes of a subscription since the last
    /// state-changed event
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChangeMask: u32 {
        const CREATED = 1;
        const DELETED = 1 << 1;
        const MODIFIED = 1 << 2;
        const ITEMS_ADDED = 1 << 3;
        const ITEMS_REMOVED = 1 << 4;
        const ITEMS_CREATED = 1 << 5;
        const ITEMS_DELETED = 1 << 6;
        const ITEMS_MODIFIED = 1 << 7;
    }
}

impl ChangeMask {
    pub const NONE: ChangeMask = ChangeMask::empty();
}

impl Default for ChangeMask {
    fn default() -> Self {
        ChangeMask::NONE
    }
}

impl fmt::Display for ChangeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        f.write_str(&names.join("|"))
    }
}

/// Liveness of a subscription as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionStatus {
    #[default]
    NotCreated,
    Created,
    /// No notification or keep-alive within the keep-alive window
    PublishingStopped,
    /// Notifications arrive again after a stop
    PublishingActive,
    Deleted,
}

impl SubscriptionStatus {
    /// True while the server-side subscription is expected to exist
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Created
                | SubscriptionStatus::PublishingStopped
                | SubscriptionStatus::PublishingActive
        )
    }
}

/// Notification of one monitored item as handed to consumers
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemNotificationModel {
    pub client_handle: u32,
    /// Caller id of the item, if it is still known
    pub id: Option<String>,
    pub display_name: Option<String>,
    pub node_id: Option<NodeId>,
    /// Set for data-change notifications
    pub value: Option<DataValue>,
    /// Set for event notifications
    pub event_fields: Option<Vec<Variant>>,
    pub status: StatusCode,
}

/// All notifications of one processed notification message
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionNotification {
    /// Logical subscription id
    pub subscription_id: String,
    pub server_id: u32,
    pub sequence_number: u32,
    pub publish_time: DateTime<Utc>,
    pub notifications: Vec<MonitoredItemNotificationModel>,
    pub string_table: Vec<String>,
}

/// Direct per-subscription callback, invoked before the broadcast event
pub type FastCallback = Arc<dyn Fn(&SubscriptionNotification) + Send + Sync>;

/// Events emitted by the subscription manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// Lifecycle changes of a subscription, one event per completed operation
    SubscriptionChanged {
        subscription_id: String,
        mask: ChangeMask,
    },

    /// Keep-alive liveness changed or publishing is still stopped
    PublishStatusChanged {
        subscription_id: String,
        status: SubscriptionStatus,
        late_count: u32,
    },

    /// Data changes and events of one notification message
    Notification(SubscriptionNotification),

    /// A publish or republish failed
    PublishError {
        subscription_id: Option<u32>,
        sequence_number: Option<u32>,
        status: StatusCode,
        message: String,
    },
}

impl Event {
    /// Logical subscription id, if the event names one
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Event::SubscriptionChanged {
                subscription_id, ..
            }
            | Event::PublishStatusChanged {
                subscription_id, ..
            } => Some(subscription_id),
            Event::Notification(notification) => Some(&notification.subscription_id),
            Event::PublishError { .. } => None,
        }
    }
}
