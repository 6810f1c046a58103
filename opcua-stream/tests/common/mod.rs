//! Test helpers for integration testing.
//!
//! Provides an in-memory session that records every service call and
//! answers like a cooperative server: requested settings are accepted as
//! revised values and ids are handed out in sequence. Publish responses are
//! queued by the test.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use opcua_api::{
    ApiError, BrowsePath, BrowsePathResult, CreateSubscriptionRequest, CreateSubscriptionResponse,
    DataChangeNotification, DataValue, ModifySubscriptionRequest, ModifySubscriptionResponse,
    MonitoredItemCreateRequest, MonitoredItemCreateResult, MonitoredItemModifyRequest,
    MonitoredItemModifyResult, MonitoredItemNotification, MonitoringMode, NodeId,
    NotificationData, NotificationMessage, PublishResponse, Result, Session,
    SetTriggeringResponse, StatusCode, SubscriptionAcknowledgement, TimestampsToReturn,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// One recorded service call
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateSubscription(CreateSubscriptionRequest),
    ModifySubscription(ModifySubscriptionRequest),
    DeleteSubscriptions(Vec<u32>),
    SetPublishingMode(bool, Vec<u32>),
    CreateMonitoredItems(u32, Vec<MonitoredItemCreateRequest>),
    ModifyMonitoredItems(u32, Vec<MonitoredItemModifyRequest>),
    DeleteMonitoredItems(u32, Vec<u32>),
    SetMonitoringMode(u32, MonitoringMode, Vec<u32>),
    SetTriggering {
        subscription_id: u32,
        triggering_item_id: u32,
        add: Vec<u32>,
        remove: Vec<u32>,
    },
    Publish(Vec<SubscriptionAcknowledgement>),
    Republish(u32, u32),
    TranslateBrowsePaths(Vec<BrowsePath>),
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::CreateSubscription(_) => "CreateSubscription",
            Call::ModifySubscription(_) => "ModifySubscription",
            Call::DeleteSubscriptions(_) => "DeleteSubscriptions",
            Call::SetPublishingMode(..) => "SetPublishingMode",
            Call::CreateMonitoredItems(..) => "CreateMonitoredItems",
            Call::ModifyMonitoredItems(..) => "ModifyMonitoredItems",
            Call::DeleteMonitoredItems(..) => "DeleteMonitoredItems",
            Call::SetMonitoringMode(..) => "SetMonitoringMode",
            Call::SetTriggering { .. } => "SetTriggering",
            Call::Publish(_) => "Publish",
            Call::Republish(..) => "Republish",
            Call::TranslateBrowsePaths(_) => "TranslateBrowsePaths",
        }
    }
}

/// Recording in-memory session
pub struct MockSession {
    calls: Mutex<Vec<Call>>,
    next_subscription_id: AtomicU32,
    next_item_id: AtomicU32,
    /// Whole-call failures keyed by service name, used once
    failures: Mutex<HashMap<&'static str, ApiError>>,
    /// Per-item create status keyed by node id
    rejected_nodes: Mutex<HashMap<String, StatusCode>>,
    /// Services whose next result list loses its last entry
    truncated: Mutex<HashSet<&'static str>>,
    /// Messages available for republish keyed by (subscription, sequence)
    retransmission: Mutex<HashMap<(u32, u32), NotificationMessage>>,
    publish_tx: mpsc::UnboundedSender<Result<PublishResponse>>,
    publish_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<PublishResponse>>>,
}

impl MockSession {
    pub fn new() -> Self {
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        Self {
            calls: Mutex::new(Vec::new()),
            next_subscription_id: AtomicU32::new(1),
            next_item_id: AtomicU32::new(1),
            failures: Mutex::new(HashMap::new()),
            rejected_nodes: Mutex::new(HashMap::new()),
            truncated: Mutex::new(HashSet::new()),
            retransmission: Mutex::new(HashMap::new()),
            publish_tx,
            publish_rx: tokio::sync::Mutex::new(publish_rx),
        }
    }

    pub fn with_first_subscription_id(self, id: u32) -> Self {
        self.next_subscription_id.store(id, Ordering::SeqCst);
        self
    }

    pub fn with_first_item_id(self, id: u32) -> Self {
        self.next_item_id.store(id, Ordering::SeqCst);
        self
    }

    /// Fail the next call of the named service as a whole
    pub fn fail_next(&self, service: &'static str, error: ApiError) {
        self.failures.lock().unwrap().insert(service, error);
    }

    /// Answer the next call of the named service with one result too few
    pub fn truncate_next(&self, service: &'static str) {
        self.truncated.lock().unwrap().insert(service);
    }

    fn shorten<T>(&self, service: &'static str, mut results: Vec<T>) -> Vec<T> {
        if self.truncated.lock().unwrap().remove(service) {
            results.pop();
        }
        results
    }

    /// Reject creation of items monitoring the given node
    pub fn reject_node(&self, node_id: &str, status: StatusCode) {
        self.rejected_nodes
            .lock()
            .unwrap()
            .insert(node_id.to_string(), status);
    }

    /// Keep a message for a later republish request
    pub fn retain_message(&self, subscription_id: u32, message: NotificationMessage) {
        self.retransmission
            .lock()
            .unwrap()
            .insert((subscription_id, message.sequence_number), message);
    }

    /// Queue the answer to the next publish request
    pub fn push_publish(&self, response: Result<PublishResponse>) {
        let _ = self.publish_tx.send(response);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_names(&self) -> Vec<&'static str> {
        self.calls().iter().map(Call::name).collect()
    }

    /// Calls other than publish, which tests usually do not care about
    pub fn service_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, Call::Publish(_)))
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|call| call.name() == name).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: Call) -> Result<()> {
        let name = call.name();
        self.calls.lock().unwrap().push(call);
        match self.failures.lock().unwrap().remove(name) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Session for MockSession {
    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<CreateSubscriptionResponse> {
        self.record(Call::CreateSubscription(request.clone()))?;
        Ok(CreateSubscriptionResponse {
            subscription_id: self.next_subscription_id.fetch_add(1, Ordering::SeqCst),
            revised_publishing_interval: request.requested_publishing_interval,
            revised_lifetime_count: request.requested_lifetime_count,
            revised_max_keep_alive_count: request.requested_max_keep_alive_count,
        })
    }

    async fn modify_subscription(
        &self,
        request: ModifySubscriptionRequest,
    ) -> Result<ModifySubscriptionResponse> {
        self.record(Call::ModifySubscription(request.clone()))?;
        Ok(ModifySubscriptionResponse {
            revised_publishing_interval: request.requested_publishing_interval,
            revised_lifetime_count: request.requested_lifetime_count,
            revised_max_keep_alive_count: request.requested_max_keep_alive_count,
        })
    }

    async fn delete_subscriptions(&self, subscription_ids: Vec<u32>) -> Result<Vec<StatusCode>> {
        self.record(Call::DeleteSubscriptions(subscription_ids.clone()))?;
        Ok(vec![StatusCode::GOOD; subscription_ids.len()])
    }

    async fn set_publishing_mode(
        &self,
        publishing_enabled: bool,
        subscription_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>> {
        self.record(Call::SetPublishingMode(
            publishing_enabled,
            subscription_ids.clone(),
        ))?;
        Ok(vec![StatusCode::GOOD; subscription_ids.len()])
    }

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        _timestamps: TimestampsToReturn,
        items: Vec<MonitoredItemCreateRequest>,
    ) -> Result<Vec<MonitoredItemCreateResult>> {
        self.record(Call::CreateMonitoredItems(subscription_id, items.clone()))?;

        let rejected = self.rejected_nodes.lock().unwrap().clone();
        let results = items
            .iter()
            .map(|item| match rejected.get(&item.item_to_monitor.node_id.0) {
                Some(status) => MonitoredItemCreateResult {
                    status_code: *status,
                    monitored_item_id: 0,
                    revised_sampling_interval: 0.0,
                    revised_queue_size: 0,
                },
                None => MonitoredItemCreateResult {
                    status_code: StatusCode::GOOD,
                    monitored_item_id: self.next_item_id.fetch_add(1, Ordering::SeqCst),
                    revised_sampling_interval: item.requested_parameters.sampling_interval,
                    revised_queue_size: item.requested_parameters.queue_size,
                },
            })
            .collect();
        Ok(self.shorten("CreateMonitoredItems", results))
    }

    async fn modify_monitored_items(
        &self,
        subscription_id: u32,
        _timestamps: TimestampsToReturn,
        items: Vec<MonitoredItemModifyRequest>,
    ) -> Result<Vec<MonitoredItemModifyResult>> {
        self.record(Call::ModifyMonitoredItems(subscription_id, items.clone()))?;
        Ok(items
            .iter()
            .map(|item| MonitoredItemModifyResult {
                status_code: StatusCode::GOOD,
                revised_sampling_interval: item.requested_parameters.sampling_interval,
                revised_queue_size: item.requested_parameters.queue_size,
            })
            .collect())
    }

    async fn delete_monitored_items(
        &self,
        subscription_id: u32,
        monitored_item_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>> {
        self.record(Call::DeleteMonitoredItems(
            subscription_id,
            monitored_item_ids.clone(),
        ))?;
        Ok(self.shorten(
            "DeleteMonitoredItems",
            vec![StatusCode::GOOD; monitored_item_ids.len()],
        ))
    }

    async fn set_monitoring_mode(
        &self,
        subscription_id: u32,
        mode: MonitoringMode,
        monitored_item_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>> {
        self.record(Call::SetMonitoringMode(
            subscription_id,
            mode,
            monitored_item_ids.clone(),
        ))?;
        Ok(vec![StatusCode::GOOD; monitored_item_ids.len()])
    }

    async fn set_triggering(
        &self,
        subscription_id: u32,
        triggering_item_id: u32,
        links_to_add: Vec<u32>,
        links_to_remove: Vec<u32>,
    ) -> Result<SetTriggeringResponse> {
        self.record(Call::SetTriggering {
            subscription_id,
            triggering_item_id,
            add: links_to_add.clone(),
            remove: links_to_remove.clone(),
        })?;
        Ok(SetTriggeringResponse {
            add_results: vec![StatusCode::GOOD; links_to_add.len()],
            remove_results: vec![StatusCode::GOOD; links_to_remove.len()],
        })
    }

    async fn publish(
        &self,
        acknowledgements: Vec<SubscriptionAcknowledgement>,
    ) -> Result<PublishResponse> {
        self.record(Call::Publish(acknowledgements))?;
        let mut rx = self.publish_rx.lock().await;
        match rx.recv().await {
            Some(response) => response,
            None => Err(ApiError::fault(StatusCode::BAD_SESSION_CLOSED)),
        }
    }

    async fn republish(
        &self,
        subscription_id: u32,
        sequence_number: u32,
    ) -> Result<NotificationMessage> {
        self.record(Call::Republish(subscription_id, sequence_number))?;
        self.retransmission
            .lock()
            .unwrap()
            .get(&(subscription_id, sequence_number))
            .cloned()
            .ok_or_else(|| ApiError::fault(StatusCode::BAD_MESSAGE_NOT_AVAILABLE))
    }

    async fn translate_browse_paths(
        &self,
        paths: Vec<BrowsePath>,
    ) -> Result<Vec<BrowsePathResult>> {
        self.record(Call::TranslateBrowsePaths(paths.clone()))?;
        Ok(paths
            .iter()
            .map(|path| BrowsePathResult {
                status_code: StatusCode::GOOD,
                targets: vec![NodeId::new(format!(
                    "{}/{}",
                    path.starting_node.0,
                    path.relative_path.join("/")
                ))],
            })
            .collect())
    }
}

/// Data change message for one client handle
pub fn data_message(sequence_number: u32, client_handle: u32, value: i32) -> NotificationMessage {
    NotificationMessage {
        sequence_number,
        publish_time: Utc::now(),
        notification_data: vec![NotificationData::DataChange(DataChangeNotification {
            monitored_items: vec![MonitoredItemNotification {
                client_handle,
                value: DataValue::new(value),
            }],
        })],
        string_table: Vec::new(),
    }
}

/// Publish response carrying the given message
pub fn publish_response(subscription_id: u32, message: NotificationMessage) -> PublishResponse {
    PublishResponse {
        subscription_id,
        available_sequence_numbers: vec![message.sequence_number],
        more_notifications: false,
        notification_message: message,
        results: Vec::new(),
    }
}
