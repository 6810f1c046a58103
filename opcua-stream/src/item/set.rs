//! The monitored items of one subscription and the two diff passes over them.
//!
//! Phase 1 compares a desired item list with the living items by
//! configuration key and applies the result locally. Phase 2 runs after the
//! server calls, when every created item has a server id, and produces the
//! trigger link and monitoring mode changes that reference those ids.

use opcua_api::MonitoringMode;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::state::{LinkDelta, MonitoredItemState};
use crate::types::{ClientHandle, HandleGenerator, ItemKey, MonitoredItemModel};

/// Result of the item diff
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemChanges {
    /// Living items without a desired counterpart
    pub deletes: Vec<ClientHandle>,
    /// Desired items without a living counterpart
    pub adds: Vec<MonitoredItemModel>,
    /// Living items whose desired configuration differs
    pub updates: Vec<(ClientHandle, MonitoredItemModel)>,
}

impl ItemChanges {
    pub fn has_changes(&self) -> bool {
        !self.deletes.is_empty() || !self.adds.is_empty() || !self.updates.is_empty()
    }
}

/// Result of the link and mode pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkChanges {
    /// Link deltas keyed by the triggering item
    pub links: BTreeMap<ClientHandle, LinkDelta>,
    /// Created items grouped by the mode they move to
    pub modes: BTreeMap<MonitoringMode, Vec<ClientHandle>>,
}

impl LinkChanges {
    pub fn has_changes(&self) -> bool {
        !self.links.is_empty() || !self.modes.is_empty()
    }
}

/// Living monitored items keyed by client handle, plus the items removed
/// locally whose server-side delete is still outstanding
#[derive(Debug, Default)]
pub struct MonitoredItemSet {
    items: BTreeMap<ClientHandle, MonitoredItemState>,
    deleted: Vec<MonitoredItemState>,
    cache_disabled: bool,
}

impl MonitoredItemSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// New items are created without value and event queues
    pub fn set_cache_disabled(&mut self, disabled: bool) {
        self.cache_disabled = disabled;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, handle: ClientHandle) -> Option<&MonitoredItemState> {
        self.items.get(&handle)
    }

    pub fn get_mut(&mut self, handle: ClientHandle) -> Option<&mut MonitoredItemState> {
        self.items.get_mut(&handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MonitoredItemState> {
        self.items.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MonitoredItemState> {
        self.items.values_mut()
    }

    pub fn handles(&self) -> Vec<ClientHandle> {
        self.items.keys().copied().collect()
    }

    /// Items removed locally that still exist on the server
    pub fn pending_deletes(&self) -> &[MonitoredItemState] {
        &self.deleted
    }

    pub fn take_pending_deletes(&mut self) -> Vec<MonitoredItemState> {
        std::mem::take(&mut self.deleted)
    }

    /// Put back deletes that could not be sent
    pub fn restore_pending_deletes(&mut self, items: Vec<MonitoredItemState>) {
        self.deleted.extend(items);
    }

    pub fn clear_pending_deletes(&mut self) {
        self.deleted.clear();
    }

    /// Items that exist on the server and have unsent attribute changes
    pub fn modified_handles(&self) -> Vec<ClientHandle> {
        self.items
            .values()
            .filter(|item| item.is_created() && item.attributes_modified())
            .map(MonitoredItemState::handle)
            .collect()
    }

    /// Items the server does not know yet
    pub fn uncreated_handles(&self) -> Vec<ClientHandle> {
        self.items
            .values()
            .filter(|item| !item.is_created())
            .map(MonitoredItemState::handle)
            .collect()
    }

    /// Phase 1: compare the desired items with the living ones by key
    ///
    /// Duplicate keys in `desired` are ignored after the first occurrence.
    pub fn diff(&self, desired: &[MonitoredItemModel]) -> ItemChanges {
        let mut desired_by_key: HashMap<ItemKey, &MonitoredItemModel> = HashMap::new();
        let mut desired_order = Vec::with_capacity(desired.len());
        for model in desired {
            let key = model.key();
            if desired_by_key.contains_key(&key) {
                tracing::debug!(item = %key, "duplicate desired item ignored");
                continue;
            }
            desired_order.push(key.clone());
            desired_by_key.insert(key, model);
        }

        let mut changes = ItemChanges::default();
        let mut current_keys = HashSet::with_capacity(self.items.len());

        for item in self.items.values() {
            current_keys.insert(item.key().clone());
            match desired_by_key.get(item.key()) {
                None => changes.deletes.push(item.handle()),
                Some(model) if !item.is_same_configuration(model) => {
                    changes.updates.push((item.handle(), (*model).clone()));
                }
                Some(_) => {}
            }
        }

        for key in desired_order {
            if !current_keys.contains(&key) {
                if let Some(model) = desired_by_key.get(&key) {
                    changes.adds.push((*model).clone());
                }
            }
        }

        changes
    }

    /// Apply a phase 1 result to the local state
    ///
    /// Deleted items that exist on the server are queued for the delete
    /// request; items that were never created are dropped right away.
    pub fn apply_diff(&mut self, changes: &ItemChanges, handles: &HandleGenerator) {
        for handle in &changes.deletes {
            if let Some(item) = self.items.remove(handle) {
                if item.is_created() {
                    self.deleted.push(item);
                } else {
                    tracing::debug!(%item, "dropping item never created on the server");
                }
            }
        }

        for (handle, model) in &changes.updates {
            if let Some(item) = self.items.get_mut(handle) {
                item.merge_with(model);
            }
        }

        for model in &changes.adds {
            self.insert(handles.next_handle(), model.clone());
        }
    }

    pub fn insert(&mut self, handle: ClientHandle, model: MonitoredItemModel) {
        let mut item = MonitoredItemState::new(handle, model);
        if self.cache_disabled {
            item = item.without_cache();
        }
        self.items.insert(handle, item);
    }

    /// Phase 2: trigger links and monitoring mode changes
    ///
    /// Every pass rebuilds the pending links of all items from the desired
    /// trigger ids and commits them, so a removed trigger reference shows up
    /// as a removed link exactly once.
    pub fn link_changes(&mut self) -> LinkChanges {
        let names: HashMap<&str, ClientHandle> = self
            .items
            .values()
            .map(|item| (item.model().trigger_name(), item.handle()))
            .collect();

        let links: Vec<(ClientHandle, u32)> = self
            .items
            .values()
            .filter_map(|item| {
                let trigger_id = item.model().trigger_id.as_deref()?;
                let target = *names.get(trigger_id)?;
                if target == item.handle() {
                    return None;
                }
                Some((target, item.server_id()?))
            })
            .collect();

        for (target, triggered_server_id) in links {
            if let Some(item) = self.items.get_mut(&target) {
                item.add_trigger_link(triggered_server_id);
            }
        }

        let mut changes = LinkChanges::default();
        for item in self.items.values_mut() {
            if !item.is_created() {
                // Server has no links for it; they are added once it exists
                item.reset_links();
            } else {
                let delta = item.take_link_changes();
                if !delta.is_empty() {
                    changes.links.insert(item.handle(), delta);
                }
            }

            if let Some(mode) = item.take_monitoring_mode_change() {
                if item.is_created() {
                    changes.modes.entry(mode).or_default().push(item.handle());
                }
            }
        }

        changes
    }

    /// Mark every item as unknown to the server
    pub fn mark_all_deleted(&mut self) {
        for item in self.items.values_mut() {
            item.mark_deleted();
        }
        self.deleted.clear();
    }
}
