//! Registry of the subscriptions of one session.

use dashmap::DashMap;
use opcua_api::Session;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::PublishConfig;
use crate::error::{Result, StreamError};
use crate::event::Event;
use crate::subscription::SubscriptionState;
use crate::types::{HandleGenerator, SubscriptionModel};

/// Manager for the subscriptions of one session.
///
/// Subscriptions are keyed by their logical id and created lazily on first
/// reference. Concurrent callers asking for the same id get the same state.
/// All subscriptions share one client handle generator and one event
/// channel.
pub struct SubscriptionManager {
    session: Arc<dyn Session>,
    subscriptions: DashMap<String, Arc<SubscriptionState>>,
    handles: Arc<HandleGenerator>,
    events: broadcast::Sender<Event>,
    config: PublishConfig,
    disposed: AtomicBool,
}

impl SubscriptionManager {
    pub fn new(session: Arc<dyn Session>, config: PublishConfig) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_buffer_size);

        Ok(Self {
            session,
            subscriptions: DashMap::new(),
            handles: Arc::new(HandleGenerator::new()),
            events,
            config,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> Arc<dyn Session> {
        Arc::clone(&self.session)
    }

    pub fn publish_config(&self) -> &PublishConfig {
        &self.config
    }

    /// Subscribe to subscription, notification and publish error events
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// Get the subscription with the model's id, creating its state if needed
    ///
    /// The model's configuration is only used for a new state; existing
    /// subscriptions change through [`SubscriptionState::apply`].
    pub fn get_or_create(&self, model: SubscriptionModel) -> Result<Arc<SubscriptionState>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StreamError::InvalidState(
                "Subscription manager disposed".to_string(),
            ));
        }
        if model.id.trim().is_empty() {
            return Err(StreamError::Configuration(
                "Subscription id must not be empty".to_string(),
            ));
        }
        model.configuration.validate()?;

        let state = self
            .subscriptions
            .entry(model.id.clone())
            .or_insert_with(|| {
                tracing::debug!(subscription_id = %model.id, "new subscription state");
                Arc::new(SubscriptionState::new(
                    model,
                    Arc::clone(&self.session),
                    Arc::clone(&self.handles),
                    self.events.clone(),
                    self.config.clone(),
                ))
            })
            .clone();

        Ok(state)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SubscriptionState>> {
        self.subscriptions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Delete a subscription on the server and forget it
    ///
    /// Returns false if no subscription has this id.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let Some(state) = self.get(id) else {
            return Ok(false);
        };

        let result = state.delete(true).await;
        self.subscriptions.remove(id);
        tracing::debug!(subscription_id = id, "subscription removed");
        result.map(|_| true)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Snapshot of all subscription states
    pub fn subscriptions(&self) -> Vec<Arc<SubscriptionState>> {
        self.subscriptions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Subscription with the given server-assigned id
    pub async fn find_by_server_id(&self, server_id: u32) -> Option<Arc<SubscriptionState>> {
        if server_id == 0 {
            return None;
        }
        for state in self.subscriptions() {
            if state.server_id().await == server_id {
                return Some(state);
            }
        }
        None
    }

    /// Server ids of all created subscriptions
    pub async fn server_ids(&self) -> HashSet<u32> {
        let mut ids = HashSet::new();
        for state in self.subscriptions() {
            let id = state.server_id().await;
            if id != 0 {
                ids.insert(id);
            }
        }
        ids
    }

    /// Number of subscriptions that exist on the server
    pub async fn created_count(&self) -> usize {
        let mut count = 0;
        for state in self.subscriptions() {
            if state.is_created().await {
                count += 1;
            }
        }
        count
    }

    /// Forget all server-side state after the session was lost
    pub async fn reset_all(&self) {
        for state in self.subscriptions() {
            state.reset().await;
        }
    }

    /// Create every subscription that has no server id
    ///
    /// Returns the subscriptions that failed; the others are created even if
    /// some fail.
    pub async fn recreate_all(&self) -> Vec<(String, StreamError)> {
        let mut failures = Vec::new();
        for state in self.subscriptions() {
            if state.is_created().await {
                continue;
            }
            if let Err(e) = state.create().await {
                tracing::warn!(subscription_id = %state.id(), "failed to recreate subscription: {e}");
                failures.push((state.id().to_string(), e));
            }
        }
        failures
    }

    /// Delete all subscriptions silently and clear the registry
    ///
    /// The manager refuses new subscriptions afterwards.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);

        let states = self.subscriptions();
        let deletes = states.iter().map(|state| state.delete(true));
        for (state, result) in states.iter().zip(futures::future::join_all(deletes).await) {
            if let Err(e) = result {
                tracing::debug!(subscription_id = %state.id(), "delete on dispose failed: {e}");
            }
        }

        self.subscriptions.clear();
        tracing::info!("{} subscriptions disposed", states.len());
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("subscriptions", &self.subscriptions.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
