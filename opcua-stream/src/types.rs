//! Core types used throughout the opcua-stream crate.

use opcua_api::{
    AggregateFilter, AttributeId, DataChangeFilter, EventFilter, MonitoringFilter,
    MonitoringMode, NodeId,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::SubscriptionConfig;
use crate::error::{Result, StreamError};

/// Client-assigned handle of a monitored item.
///
/// Handles exist before the server knows the item and stay stable across
/// re-creation, unlike the server-assigned id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientHandle(pub u32);

impl ClientHandle {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Monotonic source of client handles.
///
/// One generator is shared by all subscriptions of a manager so handles are
/// unique per session without any process-wide counter.
#[derive(Debug)]
pub struct HandleGenerator {
    next: AtomicU32,
}

impl HandleGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    pub fn next_handle(&self) -> ClientHandle {
        ClientHandle(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HandleGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// True if sequence number `a` comes after `b`
///
/// Uses serial number arithmetic so the comparison holds across the
/// rollover from `u32::MAX` back to 1.
pub fn sequence_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Sequence number following `sequence_number`; 0 is never used
pub fn next_sequence(sequence_number: u32) -> u32 {
    match sequence_number.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// Desired configuration of a monitored item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemModel {
    /// Caller-chosen identifier, also the target of other items' `trigger_id`
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Id of the triggering item (its `id`, or its start node if it has none)
    #[serde(default)]
    pub trigger_id: Option<String>,
    pub start_node_id: NodeId,
    /// Browse names from the start node to the monitored node
    #[serde(default)]
    pub relative_path: Option<Vec<String>>,
    #[serde(default)]
    pub attribute_id: Option<AttributeId>,
    #[serde(default)]
    pub index_range: Option<String>,
    /// `None` samples at the publishing interval
    #[serde(default)]
    pub sampling_interval: Option<Duration>,
    #[serde(default)]
    pub queue_size: Option<u32>,
    #[serde(default)]
    pub discard_new: Option<bool>,
    #[serde(default)]
    pub data_change_filter: Option<DataChangeFilter>,
    #[serde(default)]
    pub event_filter: Option<EventFilter>,
    #[serde(default)]
    pub aggregate_filter: Option<AggregateFilter>,
    #[serde(default)]
    pub monitoring_mode: Option<MonitoringMode>,
}

impl MonitoredItemModel {
    pub fn new(start_node_id: impl Into<NodeId>) -> Self {
        Self {
            id: None,
            display_name: None,
            trigger_id: None,
            start_node_id: start_node_id.into(),
            relative_path: None,
            attribute_id: None,
            index_range: None,
            sampling_interval: None,
            queue_size: None,
            discard_new: None,
            data_change_filter: None,
            event_filter: None,
            aggregate_filter: None,
            monitoring_mode: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_trigger_id(mut self, trigger_id: impl Into<String>) -> Self {
        self.trigger_id = Some(trigger_id.into());
        self
    }

    pub fn with_relative_path<S: Into<String>>(mut self, path: impl IntoIterator<Item = S>) -> Self {
        self.relative_path = Some(path.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_attribute(mut self, attribute_id: AttributeId) -> Self {
        self.attribute_id = Some(attribute_id);
        self
    }

    pub fn with_index_range(mut self, range: impl Into<String>) -> Self {
        self.index_range = Some(range.into());
        self
    }

    pub fn with_sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval = Some(interval);
        self
    }

    pub fn with_queue_size(mut self, queue_size: u32) -> Self {
        self.queue_size = Some(queue_size);
        self
    }

    pub fn with_discard_new(mut self, discard_new: bool) -> Self {
        self.discard_new = Some(discard_new);
        self
    }

    pub fn with_data_change_filter(mut self, filter: DataChangeFilter) -> Self {
        self.data_change_filter = Some(filter);
        self
    }

    pub fn with_event_filter(mut self, filter: EventFilter) -> Self {
        self.event_filter = Some(filter);
        self
    }

    pub fn with_aggregate_filter(mut self, filter: AggregateFilter) -> Self {
        self.aggregate_filter = Some(filter);
        self
    }

    pub fn with_monitoring_mode(mut self, mode: MonitoringMode) -> Self {
        self.monitoring_mode = Some(mode);
        self
    }

    /// Identity of the item for diffing
    pub fn key(&self) -> ItemKey {
        ItemKey {
            id: self.id.clone(),
            relative_path: self.relative_path.clone(),
            start_node_id: self.start_node_id.clone(),
            index_range: self.index_range.clone(),
            attribute_id: self.attribute_id,
        }
    }

    /// Name other items use in `trigger_id` to reference this one
    pub fn trigger_name(&self) -> &str {
        self.id.as_deref().unwrap_or(self.start_node_id.as_str())
    }

    /// Event items monitor an event notifier instead of a value
    pub fn is_event_item(&self) -> bool {
        self.event_filter.is_some() || self.attribute_id == Some(AttributeId::EventNotifier)
    }

    pub fn effective_attribute(&self) -> AttributeId {
        match self.attribute_id {
            Some(attribute) => attribute,
            None if self.event_filter.is_some() => AttributeId::EventNotifier,
            None => AttributeId::Value,
        }
    }

    pub fn effective_monitoring_mode(&self) -> MonitoringMode {
        self.monitoring_mode.unwrap_or_default()
    }

    /// Filter to send with create and modify requests
    ///
    /// Event items without an explicit filter get the base event filter.
    pub fn monitoring_filter(&self) -> Option<MonitoringFilter> {
        if let Some(filter) = &self.data_change_filter {
            return Some(MonitoringFilter::DataChange(filter.clone()));
        }
        if let Some(filter) = &self.event_filter {
            return Some(MonitoringFilter::Event(filter.clone()));
        }
        if let Some(filter) = &self.aggregate_filter {
            return Some(MonitoringFilter::Aggregate(filter.clone()));
        }
        if self.is_event_item() {
            return Some(MonitoringFilter::Event(EventFilter::base_event()));
        }
        None
    }

    /// Sampling interval on the wire, -1 meaning the publishing interval
    pub fn sampling_interval_ms(&self) -> f64 {
        self.sampling_interval
            .map(|interval| interval.as_secs_f64() * 1000.0)
            .unwrap_or(-1.0)
    }

    /// Queue size on the wire; event items default to an unbounded server queue
    pub fn effective_queue_size(&self) -> u32 {
        match self.queue_size {
            Some(size) => size,
            None if self.is_event_item() => u32::MAX,
            None => 0,
        }
    }

    /// Check filters against the item kind
    pub fn validate(&self) -> Result<()> {
        let filters = [
            self.data_change_filter.is_some(),
            self.event_filter.is_some(),
            self.aggregate_filter.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if filters > 1 {
            return Err(StreamError::Configuration(format!(
                "Item '{}' sets more than one filter",
                self.trigger_name()
            )));
        }

        if self.is_event_item()
            && (self.data_change_filter.is_some() || self.aggregate_filter.is_some())
        {
            return Err(StreamError::Configuration(format!(
                "Event item '{}' only accepts an event filter",
                self.trigger_name()
            )));
        }

        if self.start_node_id.is_null() {
            return Err(StreamError::Configuration(
                "Monitored item without start node".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration key of a monitored item
///
/// Two items with the same key are the same item; sampling, queue, discard
/// policy, monitoring mode and filters are tunables compared separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub id: Option<String>,
    pub relative_path: Option<Vec<String>>,
    pub start_node_id: NodeId,
    pub index_range: Option<String>,
    pub attribute_id: Option<AttributeId>,
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}'",
            self.id.as_deref().unwrap_or("<unknown>"),
            self.start_node_id
        )?;
        if let Some(path) = &self.relative_path {
            write!(f, "/{}", path.join("/"))?;
        }
        Ok(())
    }
}

/// Desired subscription as handed to the manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionModel {
    /// Logical id, stable across reconnects
    pub id: String,
    #[serde(default)]
    pub configuration: SubscriptionConfig,
}

impl SubscriptionModel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            configuration: SubscriptionConfig::default(),
        }
    }

    pub fn with_configuration(mut self, configuration: SubscriptionConfig) -> Self {
        self.configuration = configuration;
        self
    }
}
