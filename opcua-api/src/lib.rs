//! Session contract for the OPC UA subscription engine
//!
//! This crate defines what the engine needs from a connected OPC UA session:
//! the subscription, monitored item, publish and view services as one
//! async trait, plus the plain data types those services exchange. Binary
//! encoding and the secure channel live below this crate.
//!
//! ```rust,ignore
//! use opcua_api::{Session, SubscriptionAcknowledgement};
//!
//! async fn pump(session: &dyn Session) -> opcua_api::Result<()> {
//!     let response = session.publish(Vec::new()).await?;
//!     let ack = SubscriptionAcknowledgement {
//!         subscription_id: response.subscription_id,
//!         sequence_number: response.notification_message.sequence_number,
//!     };
//!     session.publish(vec![ack]).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod filter;
pub mod notification;
pub mod service;
pub mod session;
pub mod types;

pub use error::{ApiError, Result};
pub use filter::{
    AggregateConfiguration, AggregateFilter, ContentFilterElement, DataChangeFilter,
    DataChangeTrigger, DeadbandType, EventFilter, MonitoringFilter, SimpleAttributeOperand,
};
pub use notification::{
    DataChangeNotification, EventFieldList, EventNotificationList, MonitoredItemNotification,
    NotificationData, NotificationMessage, StatusChangeNotification,
};
pub use service::{
    BrowsePath, BrowsePathResult, CreateSubscriptionRequest, CreateSubscriptionResponse,
    ModifySubscriptionRequest, ModifySubscriptionResponse, MonitoredItemCreateRequest,
    MonitoredItemCreateResult, MonitoredItemModifyRequest, MonitoredItemModifyResult,
    MonitoringParameters, PublishResponse, ReadValueId, SetTriggeringResponse,
    SubscriptionAcknowledgement,
};
pub use session::Session;
pub use types::{
    AttributeId, DataValue, MonitoringMode, NodeId, StatusCode, TimestampsToReturn, Variant,
};
