//! Notification messages delivered by publish and republish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DataValue, StatusCode, Variant};

/// One changed value of a data-change monitored item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemNotification {
    pub client_handle: u32,
    pub value: DataValue,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataChangeNotification {
    pub monitored_items: Vec<MonitoredItemNotification>,
}

/// Selected fields of one event, in select-clause order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFieldList {
    pub client_handle: u32,
    pub event_fields: Vec<Variant>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventNotificationList {
    pub events: Vec<EventFieldList>,
}

/// Subscription status change reported by the server (e.g. lifetime expiry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChangeNotification {
    pub status: StatusCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NotificationData {
    DataChange(DataChangeNotification),
    Events(EventNotificationList),
    StatusChange(StatusChangeNotification),
}

impl NotificationData {
    /// Number of item-level notifications carried by this entry
    pub fn len(&self) -> usize {
        match self {
            NotificationData::DataChange(change) => change.monitored_items.len(),
            NotificationData::Events(events) => events.events.len(),
            NotificationData::StatusChange(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Notification message of one subscription
///
/// A keep-alive message carries no notification data and reuses the
/// sequence number the next data message will get.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub sequence_number: u32,
    pub publish_time: DateTime<Utc>,
    pub notification_data: Vec<NotificationData>,
    #[serde(default)]
    pub string_table: Vec<String>,
}

impl NotificationMessage {
    /// Keep-alive message for the given sequence number
    pub fn keep_alive(sequence_number: u32, publish_time: DateTime<Utc>) -> Self {
        Self {
            sequence_number,
            publish_time,
            notification_data: Vec::new(),
            string_table: Vec::new(),
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        self.notification_data.is_empty()
    }

    /// Total data changes and events across all notification data
    pub fn notification_count(&self) -> usize {
        self.notification_data.iter().map(NotificationData::len).sum()
    }
}
