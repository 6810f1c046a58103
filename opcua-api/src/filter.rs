//! Monitoring filters.
//!
//! A monitored item carries at most one filter. Data-change and aggregate
//! filters apply to variables, event filters to objects and views. All
//! filters compare structurally, which is what the engine relies on when it
//! decides whether an item needs a modify request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AttributeId, NodeId, Variant};

/// Well-known node of the `BaseEventType`
pub const BASE_EVENT_TYPE: &str = "i=2041";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataChangeTrigger {
    Status,
    #[default]
    StatusValue,
    StatusValueTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeadbandType {
    #[default]
    None,
    Absolute,
    Percent,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataChangeFilter {
    pub trigger: DataChangeTrigger,
    pub deadband_type: DeadbandType,
    pub deadband_value: f64,
}

/// Select clause of an event filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleAttributeOperand {
    pub type_definition_id: NodeId,
    pub browse_path: Vec<String>,
    pub attribute_id: AttributeId,
    pub index_range: Option<String>,
}

impl SimpleAttributeOperand {
    /// Select a `BaseEventType` field by browse name
    pub fn base_event_field(name: &str) -> Self {
        Self {
            type_definition_id: NodeId::from(BASE_EVENT_TYPE),
            browse_path: vec![name.to_string()],
            attribute_id: AttributeId::Value,
            index_range: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentFilterElement {
    pub operator: String,
    pub operands: Vec<Variant>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub select_clauses: Vec<SimpleAttributeOperand>,
    pub where_clause: Vec<ContentFilterElement>,
}

impl EventFilter {
    /// Filter selecting the standard `BaseEventType` fields
    pub fn base_event() -> Self {
        let select_clauses = [
            "EventId",
            "EventType",
            "SourceNode",
            "SourceName",
            "Time",
            "ReceiveTime",
            "LocalTime",
            "Message",
            "Severity",
        ]
        .iter()
        .map(|name| SimpleAttributeOperand::base_event_field(name))
        .collect();

        Self {
            select_clauses,
            where_clause: Vec::new(),
        }
    }

    /// Index of the select clause for a `BaseEventType` field
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.select_clauses
            .iter()
            .position(|clause| clause.browse_path.len() == 1 && clause.browse_path[0] == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateConfiguration {
    pub use_server_capabilities_defaults: bool,
    pub treat_uncertain_as_bad: bool,
    pub percent_data_bad: u8,
    pub percent_data_good: u8,
    pub use_sloped_extrapolation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateFilter {
    pub start_time: Option<DateTime<Utc>>,
    pub aggregate_type: NodeId,
    /// Milliseconds
    pub processing_interval: f64,
    pub configuration: Option<AggregateConfiguration>,
}

/// Filter as sent with a create or modify monitored item request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MonitoringFilter {
    DataChange(DataChangeFilter),
    Event(EventFilter),
    Aggregate(AggregateFilter),
}
