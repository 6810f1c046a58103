//! State of a single monitored item.

use chrono::Utc;
use opcua_api::{
    BrowsePathResult, DataValue, EventFieldList, MonitoredItemCreateRequest,
    MonitoredItemCreateResult, MonitoredItemModifyRequest, MonitoredItemModifyResult,
    MonitoringMode, MonitoringParameters, NodeId, ReadValueId, SetTriggeringResponse, StatusCode,
    Variant,
};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::cache::ItemCache;
use crate::types::{ClientHandle, ItemKey, MonitoredItemModel};

/// Last failure recorded for an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemError {
    /// Service that failed for this item
    pub operation: &'static str,
    pub status: StatusCode,
}

/// Server-side view of an item
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemStatus {
    /// Set iff the item was created and not deleted since
    pub server_id: Option<u32>,
    pub error: Option<ItemError>,
    /// Node the relative path resolved to
    pub resolved_node_id: Option<NodeId>,
    pub revised_sampling_interval: Option<f64>,
    pub revised_queue_size: Option<u32>,
}

/// Trigger link delta of one triggering item, as server ids of triggered items
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkDelta {
    pub added: BTreeSet<u32>,
    pub removed: BTreeSet<u32>,
}

impl LinkDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Desired configuration of one item plus what the server reported for it.
///
/// Equality and hashing use the configuration key only, so a state keeps
/// its identity while its status is filled in.
#[derive(Debug, Clone)]
pub struct MonitoredItemState {
    handle: ClientHandle,
    key: ItemKey,
    model: MonitoredItemModel,
    status: ItemStatus,
    applied_mode: MonitoringMode,
    pending_mode: Option<MonitoringMode>,
    attributes_modified: bool,
    current_links: BTreeSet<u32>,
    pending_links: BTreeSet<u32>,
    cache: Option<ItemCache>,
}

impl MonitoredItemState {
    pub fn new(handle: ClientHandle, model: MonitoredItemModel) -> Self {
        let cache = if model.is_event_item() {
            ItemCache::for_events()
        } else {
            ItemCache::for_data()
        };

        Self {
            handle,
            key: model.key(),
            applied_mode: model.effective_monitoring_mode(),
            model,
            status: ItemStatus::default(),
            pending_mode: None,
            attributes_modified: true,
            current_links: BTreeSet::new(),
            pending_links: BTreeSet::new(),
            cache: Some(cache),
        }
    }

    /// Drop the value and event queues for this item
    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle
    }

    pub fn key(&self) -> &ItemKey {
        &self.key
    }

    pub fn model(&self) -> &MonitoredItemModel {
        &self.model
    }

    pub fn status(&self) -> &ItemStatus {
        &self.status
    }

    pub fn server_id(&self) -> Option<u32> {
        self.status.server_id
    }

    pub fn is_created(&self) -> bool {
        self.status.server_id.is_some()
    }

    pub fn attributes_modified(&self) -> bool {
        self.attributes_modified
    }

    /// Mode the server currently applies
    pub fn monitoring_mode(&self) -> MonitoringMode {
        self.applied_mode
    }

    /// Trigger links the server has for this item as triggering item
    pub fn trigger_links(&self) -> &BTreeSet<u32> {
        &self.current_links
    }

    /// Full configuration equality: key plus every tunable
    pub fn is_same_configuration(&self, desired: &MonitoredItemModel) -> bool {
        let current = &self.model;
        self.key == desired.key()
            && current.discard_new == desired.discard_new
            && current.aggregate_filter == desired.aggregate_filter
            && current.event_filter == desired.event_filter
            && current.data_change_filter == desired.data_change_filter
            && current.monitoring_mode == desired.monitoring_mode
            && current.queue_size == desired.queue_size
            && current.sampling_interval == desired.sampling_interval
            && current.trigger_id == desired.trigger_id
    }

    /// Take over the tunables of a desired model with the same key.
    ///
    /// Sampling, queue and filter changes mark the item for a modify request;
    /// a monitoring mode change is queued for the mode pass.
    pub fn merge_with(&mut self, desired: &MonitoredItemModel) -> bool {
        let mut changed = false;
        let model = &mut self.model;

        if model.sampling_interval != desired.sampling_interval
            || model.queue_size != desired.queue_size
            || model.discard_new != desired.discard_new
            || model.data_change_filter != desired.data_change_filter
            || model.event_filter != desired.event_filter
            || model.aggregate_filter != desired.aggregate_filter
        {
            tracing::debug!(
                item = %self.key,
                "sampling {:?} -> {:?}, queue {:?} -> {:?}",
                model.sampling_interval,
                desired.sampling_interval,
                model.queue_size,
                desired.queue_size
            );
            model.sampling_interval = desired.sampling_interval;
            model.queue_size = desired.queue_size;
            model.discard_new = desired.discard_new;
            model.data_change_filter = desired.data_change_filter.clone();
            model.event_filter = desired.event_filter.clone();
            model.aggregate_filter = desired.aggregate_filter.clone();
            self.attributes_modified = true;
            changed = true;
        }

        if model.monitoring_mode != desired.monitoring_mode {
            tracing::debug!(
                item = %self.key,
                "monitoring mode {:?} -> {:?}",
                model.monitoring_mode,
                desired.monitoring_mode
            );
            model.monitoring_mode = desired.monitoring_mode;
            self.pending_mode = Some(desired.effective_monitoring_mode());
            changed = true;
        }

        if model.trigger_id != desired.trigger_id {
            model.trigger_id = desired.trigger_id.clone();
            changed = true;
        }

        model.display_name = desired.display_name.clone();
        changed
    }

    fn requested_parameters(&self) -> MonitoringParameters {
        MonitoringParameters {
            client_handle: self.handle.as_u32(),
            sampling_interval: self.model.sampling_interval_ms(),
            filter: self.model.monitoring_filter(),
            queue_size: self.model.effective_queue_size(),
            discard_oldest: !self.model.discard_new.unwrap_or(false),
        }
    }

    /// Node to monitor: the resolved path target or the start node
    pub fn target_node(&self) -> &NodeId {
        self.status
            .resolved_node_id
            .as_ref()
            .unwrap_or(&self.model.start_node_id)
    }

    /// True if the relative path still has to be translated
    pub fn needs_resolve(&self) -> bool {
        self.model
            .relative_path
            .as_ref()
            .is_some_and(|path| !path.is_empty())
            && self.status.resolved_node_id.is_none()
    }

    pub fn create_request(&self) -> MonitoredItemCreateRequest {
        MonitoredItemCreateRequest {
            item_to_monitor: ReadValueId {
                node_id: self.target_node().clone(),
                attribute_id: self.model.effective_attribute(),
                index_range: self.model.index_range.clone(),
            },
            monitoring_mode: self.model.effective_monitoring_mode(),
            requested_parameters: self.requested_parameters(),
        }
    }

    /// None until the item has a server id
    pub fn modify_request(&self) -> Option<MonitoredItemModifyRequest> {
        Some(MonitoredItemModifyRequest {
            monitored_item_id: self.status.server_id?,
            requested_parameters: self.requested_parameters(),
        })
    }

    pub fn set_error(&mut self, operation: &'static str, status: StatusCode) {
        self.status.error = Some(ItemError { operation, status });
    }

    pub fn set_resolve_result(&mut self, result: &BrowsePathResult) {
        if result.status_code.is_bad() {
            self.set_error("TranslateBrowsePaths", result.status_code);
            return;
        }
        match result.targets.first() {
            Some(target) => {
                self.status.resolved_node_id = Some(target.clone());
                self.status.error = None;
            }
            None => self.set_error("TranslateBrowsePaths", StatusCode::BAD_NO_MATCH),
        }
    }

    pub fn set_create_result(&mut self, result: &MonitoredItemCreateResult) {
        if result.status_code.is_bad() {
            self.status.server_id = None;
            self.set_error("CreateMonitoredItems", result.status_code);
            return;
        }
        self.status.server_id = Some(result.monitored_item_id);
        self.status.error = None;
        self.status.revised_sampling_interval = Some(result.revised_sampling_interval);
        self.status.revised_queue_size = Some(result.revised_queue_size);
        self.applied_mode = self.model.effective_monitoring_mode();
        self.pending_mode = None;
        self.attributes_modified = false;
    }

    /// A failed modify keeps the item marked so the next apply retries it
    pub fn set_modify_result(&mut self, result: &MonitoredItemModifyResult) {
        if result.status_code.is_bad() {
            self.set_error("ModifyMonitoredItems", result.status_code);
            return;
        }
        self.status.error = None;
        self.status.revised_sampling_interval = Some(result.revised_sampling_interval);
        self.status.revised_queue_size = Some(result.revised_queue_size);
        self.attributes_modified = false;
    }

    /// The item is gone locally whatever the server answered
    pub fn set_delete_result(&mut self, status: StatusCode) {
        if status.is_bad() {
            self.set_error("DeleteMonitoredItems", status);
        }
        self.mark_deleted();
    }

    /// Forget everything the server knew about this item
    pub fn mark_deleted(&mut self) {
        self.status.server_id = None;
        self.status.resolved_node_id = None;
        self.attributes_modified = true;
        self.current_links.clear();
        self.pending_links.clear();
    }

    pub fn add_trigger_link(&mut self, triggered_server_id: u32) {
        self.pending_links.insert(triggered_server_id);
    }

    /// Diff pending against current links and commit pending as current
    pub fn take_link_changes(&mut self) -> LinkDelta {
        let pending = std::mem::take(&mut self.pending_links);
        let delta = LinkDelta {
            added: pending.difference(&self.current_links).copied().collect(),
            removed: self.current_links.difference(&pending).copied().collect(),
        };
        if !delta.is_empty() {
            tracing::debug!(
                item = %self.key,
                "adding {} links and removing {} links",
                delta.added.len(),
                delta.removed.len()
            );
        }
        self.current_links = pending;
        delta
    }

    /// Clear link bookkeeping of an item the server does not know
    pub fn reset_links(&mut self) {
        self.pending_links.clear();
        self.current_links.clear();
    }

    /// Undo the parts of a committed delta the server rejected
    pub fn set_triggering_result(&mut self, delta: &LinkDelta, response: &SetTriggeringResponse) {
        for (id, status) in delta.added.iter().zip(response.add_results.iter()) {
            if status.is_bad() {
                self.current_links.remove(id);
                self.set_error("SetTriggering", *status);
            }
        }
        for (id, status) in delta.removed.iter().zip(response.remove_results.iter()) {
            if status.is_bad() {
                self.current_links.insert(*id);
                self.set_error("SetTriggering", *status);
            }
        }
    }

    /// Pending mode change, if it differs from what the server applies
    pub fn take_monitoring_mode_change(&mut self) -> Option<MonitoringMode> {
        self.pending_mode
            .take()
            .filter(|mode| *mode != self.applied_mode)
    }

    /// A rejected change is queued again for the next pass
    pub fn set_monitoring_mode_result(&mut self, mode: MonitoringMode, status: StatusCode) {
        if status.is_good() {
            self.applied_mode = mode;
            self.status.error = None;
        } else {
            self.pending_mode = Some(mode);
            self.set_error("SetMonitoringMode", status);
        }
    }

    pub fn save_value(&mut self, value: &DataValue) {
        let now = Utc::now();
        if value.server_timestamp.is_some_and(|ts| ts > now) {
            tracing::warn!(handle = %self.handle, "server timestamp of notification is in the future");
        }
        if value.source_timestamp.is_some_and(|ts| ts > now) {
            tracing::warn!(handle = %self.handle, "source timestamp of notification is in the future");
        }
        if value.status.is_overflow() {
            tracing::warn!(handle = %self.handle, "overflow bit set on data change");
        }

        if let Some(cache) = self.cache.as_mut() {
            if !cache.save_value(value.clone()) {
                tracing::debug!(handle = %self.handle, "data change for event item ignored");
            }
        }
    }

    pub fn save_event(&mut self, event: &EventFieldList) {
        if let Some(cache) = self.cache.as_mut() {
            if !cache.save_event(event) {
                tracing::debug!(handle = %self.handle, "event for data item ignored");
            }
        }
    }

    pub fn dequeue_values(&mut self) -> Vec<DataValue> {
        self.cache
            .as_mut()
            .map(ItemCache::dequeue_values)
            .unwrap_or_default()
    }

    pub fn dequeue_events(&mut self) -> Vec<Vec<Variant>> {
        self.cache
            .as_mut()
            .map(ItemCache::dequeue_events)
            .unwrap_or_default()
    }

    pub fn last_value(&self) -> Option<&DataValue> {
        self.cache.as_ref().and_then(ItemCache::last_value)
    }

    pub fn last_event(&self) -> Option<&Vec<Variant>> {
        self.cache.as_ref().and_then(ItemCache::last_event)
    }

    /// 0 when the cache is disabled
    pub fn cache_queue_size(&self) -> usize {
        self.cache.as_ref().map(ItemCache::queue_size).unwrap_or(0)
    }

    pub fn set_cache_queue_size(&mut self, queue_size: usize) {
        if let Some(cache) = self.cache.as_mut() {
            cache.set_queue_size(queue_size);
        }
    }
}

impl PartialEq for MonitoredItemState {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for MonitoredItemState {}

impl Hash for MonitoredItemState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for MonitoredItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status.server_id {
            Some(id) => write!(f, "Item {} ({}): created", self.key, id),
            None => write!(f, "Item {}: not created", self.key),
        }
    }
}
