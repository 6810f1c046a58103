//! Core value types shared by the session contract and the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Variant payload of a data value or event field.
pub type Variant = serde_json::Value;

/// Textual OPC UA node id, e.g. `ns=2;s=Demo.Static.Int32`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty id or the null node `i=0`
    pub fn is_null(&self) -> bool {
        self.0.is_empty() || self.0 == "i=0" || self.0 == "ns=0;i=0"
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// OPC UA status code
///
/// The top two bits carry the severity (00 good, 01 uncertain, 10 bad).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0);
    pub const UNCERTAIN: StatusCode = StatusCode(0x4000_0000);
    pub const BAD: StatusCode = StatusCode(0x8000_0000);
    pub const BAD_INTERNAL_ERROR: StatusCode = StatusCode(0x8002_0000);
    pub const BAD_COMMUNICATION_ERROR: StatusCode = StatusCode(0x8005_0000);
    pub const BAD_UNKNOWN_RESPONSE: StatusCode = StatusCode(0x8009_0000);
    pub const BAD_TIMEOUT: StatusCode = StatusCode(0x800A_0000);
    pub const BAD_SERVER_HALTED: StatusCode = StatusCode(0x800E_0000);
    pub const BAD_SESSION_ID_INVALID: StatusCode = StatusCode(0x8025_0000);
    pub const BAD_SESSION_CLOSED: StatusCode = StatusCode(0x8026_0000);
    pub const BAD_SUBSCRIPTION_ID_INVALID: StatusCode = StatusCode(0x8028_0000);
    pub const BAD_NODE_ID_UNKNOWN: StatusCode = StatusCode(0x8034_0000);
    pub const BAD_MONITORED_ITEM_ID_INVALID: StatusCode = StatusCode(0x8042_0000);
    pub const BAD_FILTER_NOT_ALLOWED: StatusCode = StatusCode(0x8045_0000);
    pub const BAD_NO_MATCH: StatusCode = StatusCode(0x806F_0000);
    pub const BAD_TOO_MANY_PUBLISH_REQUESTS: StatusCode = StatusCode(0x8078_0000);
    pub const BAD_NO_SUBSCRIPTION: StatusCode = StatusCode(0x8079_0000);
    pub const BAD_MESSAGE_NOT_AVAILABLE: StatusCode = StatusCode(0x807B_0000);
    pub const BAD_INVALID_STATE: StatusCode = StatusCode(0x80AF_0000);

    const SEVERITY_MASK: u32 = 0xC000_0000;
    const INFO_TYPE_DATA_VALUE: u32 = 0x0000_0400;
    const OVERFLOW: u32 = 0x0000_0080;

    pub fn is_good(self) -> bool {
        self.0 & Self::SEVERITY_MASK == 0
    }

    pub fn is_uncertain(self) -> bool {
        self.0 & Self::SEVERITY_MASK == Self::UNCERTAIN.0
    }

    pub fn is_bad(self) -> bool {
        self.0 & Self::BAD.0 != 0
    }

    /// Overflow flag of a data value status (queue overflow on the server)
    pub fn is_overflow(self) -> bool {
        self.0 & Self::INFO_TYPE_DATA_VALUE != 0 && self.0 & Self::OVERFLOW != 0
    }

    /// Symbolic name of the code with the info bits masked off
    pub fn name(self) -> Option<&'static str> {
        let name = match StatusCode(self.0 & 0xFFFF_0000) {
            Self::GOOD => "Good",
            Self::UNCERTAIN => "Uncertain",
            Self::BAD => "Bad",
            Self::BAD_INTERNAL_ERROR => "BadInternalError",
            Self::BAD_COMMUNICATION_ERROR => "BadCommunicationError",
            Self::BAD_UNKNOWN_RESPONSE => "BadUnknownResponse",
            Self::BAD_TIMEOUT => "BadTimeout",
            Self::BAD_SERVER_HALTED => "BadServerHalted",
            Self::BAD_SESSION_ID_INVALID => "BadSessionIdInvalid",
            Self::BAD_SESSION_CLOSED => "BadSessionClosed",
            Self::BAD_SUBSCRIPTION_ID_INVALID => "BadSubscriptionIdInvalid",
            Self::BAD_NODE_ID_UNKNOWN => "BadNodeIdUnknown",
            Self::BAD_MONITORED_ITEM_ID_INVALID => "BadMonitoredItemIdInvalid",
            Self::BAD_FILTER_NOT_ALLOWED => "BadFilterNotAllowed",
            Self::BAD_NO_MATCH => "BadNoMatch",
            Self::BAD_TOO_MANY_PUBLISH_REQUESTS => "BadTooManyPublishRequests",
            Self::BAD_NO_SUBSCRIPTION => "BadNoSubscription",
            Self::BAD_MESSAGE_NOT_AVAILABLE => "BadMessageNotAvailable",
            Self::BAD_INVALID_STATE => "BadInvalidState",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

/// Node attribute addressed by a monitored item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeId {
    NodeId = 1,
    NodeClass = 2,
    BrowseName = 3,
    DisplayName = 4,
    Description = 5,
    EventNotifier = 12,
    Value = 13,
    DataType = 14,
    ValueRank = 15,
    AccessLevel = 17,
    UserAccessLevel = 18,
    MinimumSamplingInterval = 19,
    Historizing = 20,
}

impl AttributeId {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl Default for AttributeId {
    fn default() -> Self {
        AttributeId::Value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum MonitoringMode {
    Disabled,
    Sampling,
    #[default]
    Reporting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimestampsToReturn {
    Source,
    Server,
    #[default]
    Both,
    Neither,
}

/// Value sample reported for a data-change monitored item
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataValue {
    pub value: Variant,
    pub status: StatusCode,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    pub fn new(value: impl Into<Variant>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StatusCode::GOOD, true, false, false)]
    #[case(StatusCode::UNCERTAIN, false, true, false)]
    #[case(StatusCode::BAD_TIMEOUT, false, false, true)]
    #[case(StatusCode::BAD_NO_SUBSCRIPTION, false, false, true)]
    fn test_status_severity(
        #[case] code: StatusCode,
        #[case] good: bool,
        #[case] uncertain: bool,
        #[case] bad: bool,
    ) {
        assert_eq!(code.is_good(), good);
        assert_eq!(code.is_uncertain(), uncertain);
        assert_eq!(code.is_bad(), bad);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(StatusCode::BAD_SESSION_CLOSED.to_string(), "BadSessionClosed");
        assert_eq!(StatusCode(0x8123_0000).to_string(), "0x81230000");
        // info bits do not hide the name
        assert_eq!(StatusCode(0x0000_0480).to_string(), "Good");
    }

    #[test]
    fn test_overflow_bit() {
        assert!(StatusCode(0x0000_0480).is_overflow());
        assert!(!StatusCode(0x0000_0080).is_overflow());
        assert!(!StatusCode::GOOD.is_overflow());
    }

    #[test]
    fn test_node_id() {
        let id = NodeId::from("ns=2;s=Demo");
        assert_eq!(id.as_str(), "ns=2;s=Demo");
        assert_eq!(id.to_string(), "ns=2;s=Demo");
        assert!(!id.is_null());
        assert!(NodeId::default().is_null());
        assert!(NodeId::new("i=0").is_null());
    }

    #[test]
    fn test_defaults() {
        assert_eq!(MonitoringMode::default(), MonitoringMode::Reporting);
        assert_eq!(TimestampsToReturn::default(), TimestampsToReturn::Both);
        assert_eq!(AttributeId::default().as_u32(), 13);
    }
}
