//! Monitored item orchestration of a subscription.

use opcua_api::{ApiError, BrowsePath, MonitoringMode, SetTriggeringResponse, StatusCode};

use super::state::SubscriptionState;
use crate::config::SubscriptionConfig;
use crate::error::Result;
use crate::event::ChangeMask;
use crate::item::{LinkDelta, MonitoredItemState};
use crate::types::{ClientHandle, MonitoredItemModel};

/// Reject a result list that does not match the request one to one
fn check_results<T>(
    operation: &'static str,
    expected: usize,
    results: Vec<T>,
) -> std::result::Result<Vec<T>, ApiError> {
    if results.len() == expected {
        Ok(results)
    } else {
        Err(ApiError::InvalidResponse(format!(
            "{operation} returned {} results for {expected} requests",
            results.len()
        )))
    }
}

impl SubscriptionState {
    /// Bring the server in line with a desired configuration and item list
    ///
    /// # Process
    ///
    /// 1. Diff the desired items against the living ones and apply the
    ///    result locally
    /// 2. Create the subscription if needed, otherwise modify it when its
    ///    settings changed
    /// 3. Delete, modify and create monitored items
    /// 4. Send trigger link and monitoring mode changes
    /// 5. Raise one state-changed event
    ///
    /// Per-item failures end up on the item status and do not fail the call.
    pub async fn apply(
        &self,
        config: SubscriptionConfig,
        desired: Vec<MonitoredItemModel>,
    ) -> Result<()> {
        config.validate()?;
        for item in &desired {
            item.validate()?;
        }

        let _apply = self.apply_lock.lock().await;
        let result = self.apply_desired(config, desired).await;
        self.changes_completed().await;
        result
    }

    async fn apply_desired(
        &self,
        config: SubscriptionConfig,
        desired: Vec<MonitoredItemModel>,
    ) -> Result<()> {
        let (created, config_changed, publishing_enabled) = {
            let mut inner = self.inner.lock().await;

            let changes = inner.items.diff(&desired);
            if !changes.adds.is_empty() {
                inner.change_mask |= ChangeMask::ITEMS_ADDED;
            }
            if !changes.deletes.is_empty() {
                inner.change_mask |= ChangeMask::ITEMS_REMOVED;
            }
            if changes.has_changes() {
                tracing::debug!(
                    subscription_id = %self.id,
                    "applying {} adds, {} updates and {} deletes",
                    changes.adds.len(),
                    changes.updates.len(),
                    changes.deletes.len()
                );
            }

            inner.items.set_cache_disabled(config.disable_item_cache);
            inner.items.apply_diff(&changes, &self.handles);

            let config_changed = !inner.config.is_same_as(&config);
            let publishing_enabled = config.publishing_enabled;
            inner.config = config;
            (inner.is_created(), config_changed, publishing_enabled)
        };

        if !created {
            self.create_subscription().await?;
        } else {
            if config_changed {
                self.modify_subscription().await?;
            }
            if publishing_enabled != self.current_publishing_enabled().await {
                self.update_publishing_mode(publishing_enabled).await?;
            }
            self.apply_item_changes().await?;
        }

        self.apply_link_changes().await
    }

    /// Send pending item deletes, modifies and creates, in that order
    pub async fn apply_changes(&self) -> Result<()> {
        let _apply = self.apply_lock.lock().await;
        let result = self.apply_item_changes().await;
        self.changes_completed().await;
        result
    }

    pub(super) async fn apply_item_changes(&self) -> Result<()> {
        let server_id = self.require_created().await?;
        self.delete_items(server_id).await?;
        self.modify_items(server_id).await?;
        self.create_items(server_id).await
    }

    async fn delete_items(&self, server_id: u32) -> Result<()> {
        let mut items = self.inner.lock().await.items.take_pending_deletes();
        if items.is_empty() {
            return Ok(());
        }

        let ids: Vec<u32> = items.iter().filter_map(MonitoredItemState::server_id).collect();
        let expected = ids.len();
        let result = self
            .session
            .delete_monitored_items(server_id, ids)
            .await
            .and_then(|results| check_results("DeleteMonitoredItems", expected, results));
        match result {
            Ok(results) => {
                for (item, status) in items.iter_mut().zip(results) {
                    if status.is_bad() {
                        tracing::warn!(subscription_id = %self.id, %item, %status, "delete failed");
                    }
                    item.set_delete_result(status);
                }
                self.inner.lock().await.change_mask |= ChangeMask::ITEMS_DELETED;
                tracing::debug!(subscription_id = %self.id, "{} items deleted", items.len());
                Ok(())
            }
            Err(e) => {
                tracing::warn!(subscription_id = %self.id, "delete of {} items failed: {e}", items.len());
                self.inner.lock().await.items.restore_pending_deletes(items);
                Err(e.into())
            }
        }
    }

    async fn modify_items(&self, server_id: u32) -> Result<()> {
        let (requests, timestamps) = {
            let inner = self.inner.lock().await;
            let requests: Vec<_> = inner
                .items
                .modified_handles()
                .into_iter()
                .filter_map(|handle| {
                    let request = inner.items.get(handle)?.modify_request()?;
                    Some((handle, request))
                })
                .collect();
            (requests, inner.config.timestamps_to_return)
        };
        if requests.is_empty() {
            return Ok(());
        }

        let (handles, requests): (Vec<ClientHandle>, Vec<_>) = requests.into_iter().unzip();
        let results = self
            .session
            .modify_monitored_items(server_id, timestamps, requests)
            .await
            .and_then(|results| check_results("ModifyMonitoredItems", handles.len(), results))?;

        let mut inner = self.inner.lock().await;
        for (handle, result) in handles.into_iter().zip(results) {
            if let Some(item) = inner.items.get_mut(handle) {
                if result.status_code.is_bad() {
                    tracing::warn!(subscription_id = %self.id, %item, status = %result.status_code, "modify failed");
                }
                item.set_modify_result(&result);
            }
        }
        inner.change_mask |= ChangeMask::ITEMS_MODIFIED;
        Ok(())
    }

    /// Resolve relative paths, then create every item the server lacks
    pub(super) async fn create_items(&self, server_id: u32) -> Result<()> {
        self.resolve_items().await;

        let (requests, timestamps) = {
            let inner = self.inner.lock().await;
            let requests: Vec<_> = inner
                .items
                .iter()
                .filter(|item| !item.is_created() && !item.needs_resolve())
                .map(|item| (item.handle(), item.create_request()))
                .collect();
            (requests, inner.config.timestamps_to_return)
        };
        if requests.is_empty() {
            return Ok(());
        }

        let (handles, requests): (Vec<ClientHandle>, Vec<_>) = requests.into_iter().unzip();
        let results = self
            .session
            .create_monitored_items(server_id, timestamps, requests)
            .await
            .and_then(|results| check_results("CreateMonitoredItems", handles.len(), results))?;

        let mut inner = self.inner.lock().await;
        let mut created = 0;
        for (handle, result) in handles.into_iter().zip(results) {
            if let Some(item) = inner.items.get_mut(handle) {
                item.set_create_result(&result);
                if item.is_created() {
                    created += 1;
                } else {
                    tracing::warn!(subscription_id = %self.id, %item, status = %result.status_code, "create failed");
                }
            }
        }
        inner.change_mask |= ChangeMask::ITEMS_CREATED;
        tracing::debug!(subscription_id = %self.id, server_id, "{created} items created");
        Ok(())
    }

    /// Translate the relative paths of uncreated items in one batch
    async fn resolve_items(&self) {
        let paths: Vec<(ClientHandle, BrowsePath)> = {
            let inner = self.inner.lock().await;
            inner
                .items
                .iter()
                .filter(|item| !item.is_created() && item.needs_resolve())
                .map(|item| {
                    let path = BrowsePath {
                        starting_node: item.model().start_node_id.clone(),
                        relative_path: item.model().relative_path.clone().unwrap_or_default(),
                    };
                    (item.handle(), path)
                })
                .collect()
        };
        if paths.is_empty() {
            return;
        }

        let (handles, paths): (Vec<ClientHandle>, Vec<BrowsePath>) = paths.into_iter().unzip();
        let result = self
            .session
            .translate_browse_paths(paths)
            .await
            .and_then(|results| check_results("TranslateBrowsePaths", handles.len(), results));

        let mut inner = self.inner.lock().await;
        match result {
            Ok(results) => {
                for (handle, result) in handles.into_iter().zip(results) {
                    if let Some(item) = inner.items.get_mut(handle) {
                        item.set_resolve_result(&result);
                        if item.needs_resolve() {
                            tracing::warn!(subscription_id = %self.id, %item, "relative path not resolved");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(subscription_id = %self.id, "failed to resolve relative paths: {e}");
                for handle in handles {
                    if let Some(item) = inner.items.get_mut(handle) {
                        item.set_error("TranslateBrowsePaths", e.status_code());
                    }
                }
            }
        }
    }

    /// Change the monitoring mode of the given items
    ///
    /// Returns the items the server rejected with their status.
    pub async fn set_monitoring_mode(
        &self,
        mode: MonitoringMode,
        handles: &[ClientHandle],
    ) -> Result<Vec<(ClientHandle, StatusCode)>> {
        let _apply = self.apply_lock.lock().await;
        let result = self.update_monitoring_mode(mode, handles).await;
        self.changes_completed().await;
        result
    }

    async fn update_monitoring_mode(
        &self,
        mode: MonitoringMode,
        handles: &[ClientHandle],
    ) -> Result<Vec<(ClientHandle, StatusCode)>> {
        let server_id = self.require_created().await?;
        let targets: Vec<(ClientHandle, u32)> = {
            let inner = self.inner.lock().await;
            handles
                .iter()
                .filter_map(|handle| Some((*handle, inner.items.get(*handle)?.server_id()?)))
                .collect()
        };
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let ids = targets.iter().map(|(_, id)| *id).collect();
        let result = self
            .session
            .set_monitoring_mode(server_id, mode, ids)
            .await
            .and_then(|results| check_results("SetMonitoringMode", targets.len(), results));

        let mut inner = self.inner.lock().await;
        let results = match result {
            Ok(results) => results,
            Err(e) => {
                for (handle, _) in &targets {
                    if let Some(item) = inner.items.get_mut(*handle) {
                        item.set_monitoring_mode_result(mode, e.status_code());
                    }
                }
                return Err(e.into());
            }
        };

        let mut failures = Vec::new();
        for ((handle, _), status) in targets.into_iter().zip(results) {
            if let Some(item) = inner.items.get_mut(handle) {
                item.set_monitoring_mode_result(mode, status);
            }
            if status.is_bad() {
                failures.push((handle, status));
            }
        }
        inner.change_mask |= ChangeMask::ITEMS_MODIFIED;

        if !failures.is_empty() {
            tracing::warn!(
                subscription_id = %self.id,
                ?mode,
                "{} items rejected the monitoring mode",
                failures.len()
            );
        }
        Ok(failures)
    }

    /// Second diff pass: trigger links and monitoring modes
    async fn apply_link_changes(&self) -> Result<()> {
        let (server_id, links, modes) = {
            let mut inner = self.inner.lock().await;
            if !inner.is_created() {
                return Ok(());
            }
            let changes = inner.items.link_changes();
            let links: Vec<(ClientHandle, u32, LinkDelta)> = changes
                .links
                .into_iter()
                .filter_map(|(handle, delta)| {
                    Some((handle, inner.items.get(handle)?.server_id()?, delta))
                })
                .collect();
            (inner.server_id, links, changes.modes)
        };

        for (handle, triggering_id, delta) in links {
            let response = match self
                .session
                .set_triggering(
                    server_id,
                    triggering_id,
                    delta.added.iter().copied().collect(),
                    delta.removed.iter().copied().collect(),
                )
                .await
                .and_then(|response| {
                    if response.add_results.len() == delta.added.len()
                        && response.remove_results.len() == delta.removed.len()
                    {
                        Ok(response)
                    } else {
                        Err(ApiError::InvalidResponse(format!(
                            "SetTriggering returned {} add and {} remove results for {} and {} links",
                            response.add_results.len(),
                            response.remove_results.len(),
                            delta.added.len(),
                            delta.removed.len()
                        )))
                    }
                })
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(subscription_id = %self.id, triggering_id, "set triggering failed: {e}");
                    let status = e.status_code();
                    SetTriggeringResponse {
                        add_results: vec![status; delta.added.len()],
                        remove_results: vec![status; delta.removed.len()],
                    }
                }
            };

            let mut inner = self.inner.lock().await;
            if let Some(item) = inner.items.get_mut(handle) {
                item.set_triggering_result(&delta, &response);
            }
            inner.change_mask |= ChangeMask::ITEMS_MODIFIED;
        }

        for (mode, handles) in modes {
            self.update_monitoring_mode(mode, &handles).await?;
        }
        Ok(())
    }

    /// Snapshot of all living items
    pub async fn items(&self) -> Vec<MonitoredItemState> {
        self.inner.lock().await.items.iter().cloned().collect()
    }

    pub async fn item(&self, handle: ClientHandle) -> Option<MonitoredItemState> {
        self.inner.lock().await.items.get(handle).cloned()
    }

    pub async fn item_count(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    /// Take the queued values of a data item
    pub async fn dequeue_values(&self, handle: ClientHandle) -> Vec<opcua_api::DataValue> {
        self.inner
            .lock()
            .await
            .items
            .get_mut(handle)
            .map(MonitoredItemState::dequeue_values)
            .unwrap_or_default()
    }

    /// Take the queued events of an event item
    pub async fn dequeue_events(&self, handle: ClientHandle) -> Vec<Vec<opcua_api::Variant>> {
        self.inner
            .lock()
            .await
            .items
            .get_mut(handle)
            .map(MonitoredItemState::dequeue_events)
            .unwrap_or_default()
    }

    pub async fn set_item_cache_queue_size(&self, handle: ClientHandle, queue_size: usize) {
        if let Some(item) = self.inner.lock().await.items.get_mut(handle) {
            item.set_cache_queue_size(queue_size);
        }
    }
}
