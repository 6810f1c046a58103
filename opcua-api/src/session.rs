//! The session contract the engine drives.

use async_trait::async_trait;

use crate::error::Result;
use crate::notification::NotificationMessage;
use crate::service::{
    BrowsePath, BrowsePathResult, CreateSubscriptionRequest, CreateSubscriptionResponse,
    ModifySubscriptionRequest, ModifySubscriptionResponse, MonitoredItemCreateRequest,
    MonitoredItemCreateResult, MonitoredItemModifyRequest, MonitoredItemModifyResult,
    PublishResponse, SetTriggeringResponse, SubscriptionAcknowledgement,
};
use crate::types::{MonitoringMode, StatusCode, TimestampsToReturn};

/// Connected OPC UA session
///
/// Implemented by the transport layer that owns the secure channel. Every
/// method is a single service round-trip. Batch operations return one result
/// per input element, in input order; a call that fails as a whole returns
/// `Err` instead.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`. The engine issues publish requests
/// concurrently with subscription and monitored item calls on the same
/// session.
#[async_trait]
pub trait Session: Send + Sync {
    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<CreateSubscriptionResponse>;

    async fn modify_subscription(
        &self,
        request: ModifySubscriptionRequest,
    ) -> Result<ModifySubscriptionResponse>;

    async fn delete_subscriptions(&self, subscription_ids: Vec<u32>) -> Result<Vec<StatusCode>>;

    async fn set_publishing_mode(
        &self,
        publishing_enabled: bool,
        subscription_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>>;

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        timestamps: TimestampsToReturn,
        items: Vec<MonitoredItemCreateRequest>,
    ) -> Result<Vec<MonitoredItemCreateResult>>;

    async fn modify_monitored_items(
        &self,
        subscription_id: u32,
        timestamps: TimestampsToReturn,
        items: Vec<MonitoredItemModifyRequest>,
    ) -> Result<Vec<MonitoredItemModifyResult>>;

    async fn delete_monitored_items(
        &self,
        subscription_id: u32,
        monitored_item_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>>;

    async fn set_monitoring_mode(
        &self,
        subscription_id: u32,
        mode: MonitoringMode,
        monitored_item_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>>;

    /// Add and remove links from a triggering item to the items it triggers
    async fn set_triggering(
        &self,
        subscription_id: u32,
        triggering_item_id: u32,
        links_to_add: Vec<u32>,
        links_to_remove: Vec<u32>,
    ) -> Result<SetTriggeringResponse>;

    /// Send one publish request carrying the given acknowledgements
    async fn publish(
        &self,
        acknowledgements: Vec<SubscriptionAcknowledgement>,
    ) -> Result<PublishResponse>;

    /// Ask for a message that was sent but not yet acknowledged
    async fn republish(
        &self,
        subscription_id: u32,
        sequence_number: u32,
    ) -> Result<NotificationMessage>;

    async fn translate_browse_paths(&self, paths: Vec<BrowsePath>)
        -> Result<Vec<BrowsePathResult>>;
}
