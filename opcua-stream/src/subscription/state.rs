//! Subscription lifecycle: create, modify, delete and publishing mode.

use chrono::{DateTime, Utc};
use opcua_api::{
    CreateSubscriptionRequest, ModifySubscriptionRequest, NotificationMessage, Session,
    StatusCode,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;

use super::keep_alive::KeepAliveTimer;
use super::messages::IncomingMessage;
use crate::config::{PublishConfig, SubscriptionConfig};
use crate::error::{Result, StreamError};
use crate::event::{ChangeMask, Event, FastCallback, SubscriptionStatus};
use crate::item::MonitoredItemSet;
use crate::types::{HandleGenerator, SubscriptionModel};

/// Lifetime count requested when the publishing interval is unknown
pub const UNKNOWN_INTERVAL_LIFETIME_COUNT: u32 = 1000;

/// Keep-alive and lifetime counts to request from the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjustedCounts {
    pub keep_alive_count: u32,
    pub lifetime_count: u32,
}

/// Floor the requested counters before create and modify
///
/// The keep-alive count is at least 1. The lifetime count covers at least
/// the minimum lifetime interval, or [`UNKNOWN_INTERVAL_LIFETIME_COUNT`]
/// intervals when the publishing interval is zero, and never falls below
/// the keep-alive count.
pub fn adjust_counts(config: &SubscriptionConfig) -> AdjustedCounts {
    let keep_alive_count = config.keep_alive_count.max(1);

    let mut lifetime_count = config.lifetime_count;
    if config.publishing_interval > Duration::ZERO {
        let min_lifetime = (config.min_lifetime_interval.as_secs_f64()
            / config.publishing_interval.as_secs_f64())
        .ceil() as u32;
        lifetime_count = lifetime_count.max(min_lifetime);
    } else {
        lifetime_count = lifetime_count.max(UNKNOWN_INTERVAL_LIFETIME_COUNT);
    }

    AdjustedCounts {
        keep_alive_count,
        lifetime_count: lifetime_count.max(keep_alive_count),
    }
}

pub(super) fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

pub(super) fn from_millis(millis: f64) -> Duration {
    if millis.is_finite() && millis > 0.0 {
        Duration::from_secs_f64(millis / 1000.0)
    } else {
        Duration::ZERO
    }
}

/// Everything guarded by the subscription lock
#[derive(Debug)]
pub(crate) struct Inner {
    pub(super) config: SubscriptionConfig,
    /// 0 until created
    pub(super) server_id: u32,
    pub(super) current_publishing_interval: Duration,
    pub(super) current_keep_alive_count: u32,
    pub(super) current_lifetime_count: u32,
    pub(super) current_priority: u8,
    pub(super) current_publishing_enabled: bool,
    pub(super) items: MonitoredItemSet,
    pub(super) change_mask: ChangeMask,
    pub(super) status: SubscriptionStatus,
    pub(super) last_notification: Option<Instant>,
    pub(super) last_notification_time: Option<DateTime<Utc>>,
    pub(super) publish_late_count: u32,
    pub(super) incoming: VecDeque<IncomingMessage>,
    pub(super) message_cache: VecDeque<NotificationMessage>,
    pub(super) available_sequence_numbers: Vec<u32>,
    pub(super) keep_alive: Option<KeepAliveTimer>,
}

impl Inner {
    pub(super) fn new(config: SubscriptionConfig) -> Self {
        let mut items = MonitoredItemSet::new();
        items.set_cache_disabled(config.disable_item_cache);

        Self {
            config,
            server_id: 0,
            current_publishing_interval: Duration::ZERO,
            current_keep_alive_count: 0,
            current_lifetime_count: 0,
            current_priority: 0,
            current_publishing_enabled: false,
            items,
            change_mask: ChangeMask::NONE,
            status: SubscriptionStatus::NotCreated,
            last_notification: None,
            last_notification_time: None,
            publish_late_count: 0,
            incoming: VecDeque::new(),
            message_cache: VecDeque::new(),
            available_sequence_numbers: Vec::new(),
            keep_alive: None,
        }
    }

    pub(super) fn is_created(&self) -> bool {
        self.server_id != 0
    }

    /// Time the server may stay silent before publishing counts as stopped
    pub(super) fn keep_alive_window(&self) -> Duration {
        self.current_publishing_interval
            .saturating_mul(self.current_keep_alive_count)
    }

    pub(super) fn publishing_stopped(&self, now: Instant, grace: Duration) -> bool {
        match self.last_notification {
            Some(last) => last + self.keep_alive_window() + grace < now,
            None => false,
        }
    }

    /// Liveness check run by the keep-alive timer
    pub(super) fn on_keep_alive_tick(
        &mut self,
        subscription_id: &str,
        now: Instant,
        grace: Duration,
    ) -> Option<Event> {
        if !self.status.is_live() || !self.publishing_stopped(now, grace) {
            return None;
        }

        self.publish_late_count += 1;
        if self.status != SubscriptionStatus::PublishingStopped {
            tracing::info!(
                subscription_id,
                server_id = self.server_id,
                "publishing stopped, no keep-alive within {:?}",
                self.keep_alive_window() + grace
            );
        }
        self.status = SubscriptionStatus::PublishingStopped;

        Some(Event::PublishStatusChanged {
            subscription_id: subscription_id.to_string(),
            status: self.status,
            late_count: self.publish_late_count,
        })
    }

    /// Local convergence after a delete, whatever the server answered
    fn reset_to_deleted(&mut self) {
        if let Some(mut timer) = self.keep_alive.take() {
            timer.stop();
        }
        self.server_id = 0;
        self.current_publishing_interval = Duration::ZERO;
        self.current_keep_alive_count = 0;
        self.current_lifetime_count = 0;
        self.current_priority = 0;
        self.current_publishing_enabled = false;
        self.publish_late_count = 0;
        self.last_notification = None;
        self.items.mark_all_deleted();
        self.incoming.clear();
        self.available_sequence_numbers.clear();
        self.status = SubscriptionStatus::Deleted;
        self.change_mask |= ChangeMask::DELETED;
    }
}

/// State of one logical subscription and its monitored items.
///
/// The logical id is stable across reconnects; the server id is assigned on
/// create and reset on delete. All mutable state sits behind one lock that
/// is never held across a session call or while consumers are notified.
///
/// Lifecycle and item operations are serialized per subscription. Message
/// processing has its own ordering lock so it can run while an apply cycle
/// waits on the server.
pub struct SubscriptionState {
    pub(super) id: String,
    pub(super) session: Arc<dyn Session>,
    pub(super) handles: Arc<HandleGenerator>,
    pub(super) events: broadcast::Sender<Event>,
    pub(super) publish_config: PublishConfig,
    pub(super) inner: Arc<Mutex<Inner>>,
    pub(super) apply_lock: Mutex<()>,
    pub(super) drain_lock: Mutex<()>,
    pub(super) fast_callback: RwLock<Option<FastCallback>>,
}

impl SubscriptionState {
    pub fn new(
        model: SubscriptionModel,
        session: Arc<dyn Session>,
        handles: Arc<HandleGenerator>,
        events: broadcast::Sender<Event>,
        publish_config: PublishConfig,
    ) -> Self {
        Self {
            id: model.id,
            session,
            handles,
            events,
            publish_config,
            inner: Arc::new(Mutex::new(Inner::new(model.configuration))),
            apply_lock: Mutex::new(()),
            drain_lock: Mutex::new(()),
            fast_callback: RwLock::new(None),
        }
    }

    /// Logical subscription id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Server-assigned id, 0 while not created
    pub async fn server_id(&self) -> u32 {
        self.inner.lock().await.server_id
    }

    pub async fn is_created(&self) -> bool {
        self.inner.lock().await.is_created()
    }

    pub async fn status(&self) -> SubscriptionStatus {
        self.inner.lock().await.status
    }

    pub async fn configuration(&self) -> SubscriptionConfig {
        self.inner.lock().await.config.clone()
    }

    /// Keep-alive periods that passed without any message
    pub async fn publish_late_count(&self) -> u32 {
        self.inner.lock().await.publish_late_count
    }

    /// Publish time of the last message or keep-alive
    pub async fn last_notification_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().await.last_notification_time
    }

    /// Sequence numbers the server reported as retransmittable
    pub async fn available_sequence_numbers(&self) -> Vec<u32> {
        self.inner.lock().await.available_sequence_numbers.clone()
    }

    pub async fn current_publishing_interval(&self) -> Duration {
        self.inner.lock().await.current_publishing_interval
    }

    pub async fn current_keep_alive_count(&self) -> u32 {
        self.inner.lock().await.current_keep_alive_count
    }

    pub async fn current_lifetime_count(&self) -> u32 {
        self.inner.lock().await.current_lifetime_count
    }

    pub async fn current_publishing_enabled(&self) -> bool {
        self.inner.lock().await.current_publishing_enabled
    }

    /// Register the direct callback for processed notifications
    pub async fn set_fast_callback(&self, callback: Option<FastCallback>) {
        *self.fast_callback.write().await = callback;
    }

    pub(super) fn emit(&self, event: Event) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Raise one state-changed event for everything done since the last call
    pub async fn changes_completed(&self) {
        let mask = std::mem::take(&mut self.inner.lock().await.change_mask);
        if mask.is_empty() {
            return;
        }

        tracing::debug!(subscription_id = %self.id, %mask, "subscription changed");
        self.emit(Event::SubscriptionChanged {
            subscription_id: self.id.clone(),
            mask,
        });
    }

    pub(super) async fn require_created(&self) -> Result<u32> {
        let inner = self.inner.lock().await;
        if inner.is_created() {
            Ok(inner.server_id)
        } else {
            Err(StreamError::NotCreated(self.id.clone()))
        }
    }

    fn start_keep_alive(&self, inner: &mut Inner) {
        if let Some(mut timer) = inner.keep_alive.take() {
            timer.stop();
        }

        let period = inner.keep_alive_window();
        if period.is_zero() {
            tracing::debug!(subscription_id = %self.id, "no keep-alive window, timer not started");
            return;
        }

        inner.keep_alive = Some(KeepAliveTimer::start(
            period,
            Arc::downgrade(&self.inner),
            self.id.clone(),
            self.events.clone(),
            self.publish_config.keep_alive_grace,
        ));
    }

    /// Create the subscription and its monitored items on the server
    ///
    /// Does nothing when the subscription already exists.
    pub async fn create(&self) -> Result<()> {
        let _apply = self.apply_lock.lock().await;
        let result = self.create_subscription().await;
        self.changes_completed().await;
        result
    }

    pub(super) async fn create_subscription(&self) -> Result<()> {
        let request = {
            let inner = self.inner.lock().await;
            if inner.is_created() {
                tracing::debug!(
                    subscription_id = %self.id,
                    server_id = inner.server_id,
                    "subscription already created"
                );
                return Ok(());
            }
            let counts = adjust_counts(&inner.config);
            CreateSubscriptionRequest {
                requested_publishing_interval: millis(inner.config.publishing_interval),
                requested_lifetime_count: counts.lifetime_count,
                requested_max_keep_alive_count: counts.keep_alive_count,
                max_notifications_per_publish: inner.config.max_notifications_per_publish,
                publishing_enabled: inner.config.publishing_enabled,
                priority: inner.config.priority,
            }
        };

        let response = self.session.create_subscription(request.clone()).await?;

        {
            let mut inner = self.inner.lock().await;
            inner.server_id = response.subscription_id;
            inner.current_publishing_interval = from_millis(response.revised_publishing_interval);
            inner.current_keep_alive_count = response.revised_max_keep_alive_count;
            inner.current_lifetime_count = response.revised_lifetime_count;
            inner.current_priority = request.priority;
            inner.current_publishing_enabled = request.publishing_enabled;
            inner.publish_late_count = 0;
            inner.last_notification = Some(Instant::now());
            inner.status = SubscriptionStatus::Created;
            inner.change_mask |= ChangeMask::CREATED;
            // Items of an earlier incarnation are gone with it
            inner.items.clear_pending_deletes();

            self.log_revised_settings(&inner, &request);
            self.start_keep_alive(&mut inner);
        }

        tracing::info!(
            subscription_id = %self.id,
            server_id = response.subscription_id,
            "subscription created"
        );

        self.create_items(response.subscription_id).await
    }

    fn log_revised_settings(&self, inner: &Inner, request: &CreateSubscriptionRequest) {
        if millis(inner.current_publishing_interval) != request.requested_publishing_interval {
            tracing::info!(
                subscription_id = %self.id,
                "revised publishing interval {:?}, requested {}ms",
                inner.current_publishing_interval,
                request.requested_publishing_interval
            );
        }
        if inner.current_keep_alive_count != request.requested_max_keep_alive_count {
            tracing::info!(
                subscription_id = %self.id,
                "revised keep alive count {}, requested {}",
                inner.current_keep_alive_count,
                request.requested_max_keep_alive_count
            );
        }
        if inner.current_lifetime_count != request.requested_lifetime_count {
            tracing::info!(
                subscription_id = %self.id,
                "revised lifetime count {}, requested {}",
                inner.current_lifetime_count,
                request.requested_lifetime_count
            );
        }
        if inner.current_lifetime_count < inner.current_keep_alive_count.saturating_mul(3) {
            tracing::warn!(
                subscription_id = %self.id,
                "lifetime count {} is less than three times the keep alive count {}",
                inner.current_lifetime_count,
                inner.current_keep_alive_count
            );
        }
        if request.priority == 0 {
            tracing::debug!(subscription_id = %self.id, "subscription created with default priority");
        }
    }

    /// Send the desired subscription settings to the server
    pub async fn modify(&self) -> Result<()> {
        let _apply = self.apply_lock.lock().await;
        let result = self.modify_subscription().await;
        self.changes_completed().await;
        result
    }

    pub(super) async fn modify_subscription(&self) -> Result<()> {
        let request = {
            let inner = self.inner.lock().await;
            if !inner.is_created() {
                return Err(StreamError::NotCreated(self.id.clone()));
            }
            let counts = adjust_counts(&inner.config);
            ModifySubscriptionRequest {
                subscription_id: inner.server_id,
                requested_publishing_interval: millis(inner.config.publishing_interval),
                requested_lifetime_count: counts.lifetime_count,
                requested_max_keep_alive_count: counts.keep_alive_count,
                max_notifications_per_publish: inner.config.max_notifications_per_publish,
                priority: inner.config.priority,
            }
        };

        let response = self.session.modify_subscription(request.clone()).await?;

        let mut inner = self.inner.lock().await;
        inner.current_publishing_interval = from_millis(response.revised_publishing_interval);
        inner.current_keep_alive_count = response.revised_max_keep_alive_count;
        inner.current_lifetime_count = response.revised_lifetime_count;
        inner.current_priority = request.priority;
        inner.change_mask |= ChangeMask::MODIFIED;
        self.start_keep_alive(&mut inner);

        tracing::info!(
            subscription_id = %self.id,
            server_id = request.subscription_id,
            "subscription modified, publishing interval {:?}",
            inner.current_publishing_interval
        );
        Ok(())
    }

    /// Delete the subscription on the server
    ///
    /// Local state is reset whatever the server answers. With `silent` a
    /// failed or pointless delete is only logged.
    pub async fn delete(&self, silent: bool) -> Result<()> {
        let _apply = self.apply_lock.lock().await;
        let result = self.delete_subscription(silent).await;
        self.changes_completed().await;
        result
    }

    async fn delete_subscription(&self, silent: bool) -> Result<()> {
        let (server_id, timer) = {
            let mut inner = self.inner.lock().await;
            if !inner.is_created() {
                if silent {
                    return Ok(());
                }
                return Err(StreamError::NotCreated(self.id.clone()));
            }
            (inner.server_id, inner.keep_alive.take())
        };

        if let Some(timer) = timer {
            if let Err(e) = timer.shutdown().await {
                tracing::debug!(subscription_id = %self.id, "{e}");
            }
        }

        let result = match self.session.delete_subscriptions(vec![server_id]).await {
            Ok(results) => match results.first() {
                Some(status) if status.is_bad() => Err(StreamError::BadStatus {
                    operation: "DeleteSubscriptions",
                    status: *status,
                }),
                _ => Ok(()),
            },
            Err(e) => Err(StreamError::from(e)),
        };

        self.inner.lock().await.reset_to_deleted();

        match result {
            Ok(()) => {
                tracing::info!(subscription_id = %self.id, server_id, "subscription deleted");
                Ok(())
            }
            Err(e) if silent => {
                tracing::debug!(subscription_id = %self.id, server_id, "delete failed: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Enable or disable publishing for the whole subscription
    pub async fn set_publishing_mode(&self, enabled: bool) -> Result<()> {
        let _apply = self.apply_lock.lock().await;
        let result = self.update_publishing_mode(enabled).await;
        self.changes_completed().await;
        result
    }

    pub(super) async fn update_publishing_mode(&self, enabled: bool) -> Result<()> {
        let server_id = self.require_created().await?;
        let results = self
            .session
            .set_publishing_mode(enabled, vec![server_id])
            .await?;

        let status = results
            .first()
            .copied()
            .unwrap_or(StatusCode::BAD_UNKNOWN_RESPONSE);
        if status.is_bad() {
            return Err(StreamError::BadStatus {
                operation: "SetPublishingMode",
                status,
            });
        }

        let mut inner = self.inner.lock().await;
        inner.current_publishing_enabled = enabled;
        inner.config.publishing_enabled = enabled;
        inner.change_mask |= ChangeMask::MODIFIED;
        tracing::debug!(subscription_id = %self.id, server_id, enabled, "publishing mode set");
        Ok(())
    }

    /// Forget the server-side subscription without a delete request
    ///
    /// Used when the session was lost; the next create starts over.
    pub async fn reset(&self) {
        let _apply = self.apply_lock.lock().await;
        self.inner.lock().await.reset_to_deleted();
        self.changes_completed().await;
    }
}

impl std::fmt::Debug for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionState")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(interval_ms: u64, keep_alive: u32, lifetime: u32) -> SubscriptionConfig {
        SubscriptionConfig::default()
            .with_publishing_interval(Duration::from_millis(interval_ms))
            .with_keep_alive_count(keep_alive)
            .with_lifetime_count(lifetime)
    }

    #[rstest]
    #[case::defaults(config(1000, 10, 2400), 10, 2400)]
    #[case::zero_keep_alive(config(1000, 0, 2400), 1, 2400)]
    #[case::min_lifetime_interval(config(1000, 10, 5), 10, 10)]
    #[case::short_interval(config(100, 10, 30), 10, 100)]
    #[case::unknown_interval(config(0, 10, 30), 10, 1000)]
    #[case::lifetime_below_keep_alive(config(10_000, 50, 20), 50, 50)]
    fn test_adjust_counts(
        #[case] config: SubscriptionConfig,
        #[case] keep_alive: u32,
        #[case] lifetime: u32,
    ) {
        let counts = adjust_counts(&config);
        assert_eq!(counts.keep_alive_count, keep_alive);
        assert_eq!(counts.lifetime_count, lifetime);
    }

    #[test]
    fn test_millis_conversion() {
        assert_eq!(millis(Duration::from_millis(250)), 250.0);
        assert_eq!(from_millis(250.0), Duration::from_millis(250));
        assert_eq!(from_millis(-1.0), Duration::ZERO);
        assert_eq!(from_millis(f64::NAN), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_keep_alive_tick_reports_stop() {
        tokio::time::pause();
        let mut inner = Inner::new(SubscriptionConfig::default());
        inner.server_id = 5;
        inner.status = SubscriptionStatus::Created;
        inner.current_publishing_interval = Duration::from_secs(1);
        inner.current_keep_alive_count = 3;
        inner.last_notification = Some(Instant::now());
        let grace = Duration::from_millis(500);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(inner.on_keep_alive_tick("sub", Instant::now(), grace).is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        match inner.on_keep_alive_tick("sub", Instant::now(), grace) {
            Some(Event::PublishStatusChanged {
                status, late_count, ..
            }) => {
                assert_eq!(status, SubscriptionStatus::PublishingStopped);
                assert_eq!(late_count, 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        // reported again on every tick while stopped
        assert!(inner.on_keep_alive_tick("sub", Instant::now(), grace).is_some());
        assert_eq!(inner.publish_late_count, 2);
    }

    #[test]
    fn test_reset_to_deleted() {
        let mut inner = Inner::new(SubscriptionConfig::default());
        inner.server_id = 5;
        inner.current_keep_alive_count = 10;
        inner.publish_late_count = 3;
        inner.status = SubscriptionStatus::PublishingActive;

        inner.reset_to_deleted();
        assert!(!inner.is_created());
        assert_eq!(inner.current_keep_alive_count, 0);
        assert_eq!(inner.publish_late_count, 0);
        assert_eq!(inner.status, SubscriptionStatus::Deleted);
        assert!(inner.change_mask.contains(ChangeMask::DELETED));
    }
}
