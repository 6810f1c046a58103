//! Ordered intake and processing of notification messages.
//!
//! Messages are stored by sequence number as they arrive from the publish
//! pipeline. Missing sequence numbers get placeholder entries. Processing
//! walks the list in order and stops at the first placeholder, so consumers
//! see notifications in sequence order. A placeholder older than the
//! republish timeout is republished once; if that fails it is skipped.

use opcua_api::{ApiError, NotificationData, NotificationMessage, StatusCode};
use tokio::time::{timeout, Instant};

use super::state::{Inner, SubscriptionState};
use crate::event::{
    Event, MonitoredItemNotificationModel, SubscriptionNotification, SubscriptionStatus,
};
use crate::types::{next_sequence, sequence_after, ClientHandle};

/// Widest sequence gap filled with placeholders
const MAX_GAP_FILL: u32 = 1000;

/// Entry of the incoming message list
#[derive(Debug, Clone)]
pub(crate) struct IncomingMessage {
    pub(crate) sequence_number: u32,
    /// Arrival of the message, or creation of the placeholder
    pub(crate) timestamp: Instant,
    /// None for placeholders and keep-alive slots
    pub(crate) message: Option<NotificationMessage>,
    pub(crate) processed: bool,
    pub(crate) republished: bool,
}

impl IncomingMessage {
    fn placeholder(sequence_number: u32, timestamp: Instant) -> Self {
        Self {
            sequence_number,
            timestamp,
            message: None,
            processed: false,
            republished: false,
        }
    }
}

impl Inner {
    /// Store a message from a publish response
    ///
    /// Returns a status event when publishing resumes after a stop.
    pub(super) fn save_message(
        &mut self,
        subscription_id: &str,
        available: Option<Vec<u32>>,
        message: NotificationMessage,
        now: Instant,
    ) -> Option<Event> {
        if let Some(available) = available {
            self.available_sequence_numbers = available;
        }
        self.last_notification = Some(now);
        self.last_notification_time = Some(message.publish_time);

        let recovered = if self.status == SubscriptionStatus::PublishingStopped {
            tracing::info!(subscription_id, server_id = self.server_id, "publishing active again");
            self.status = SubscriptionStatus::PublishingActive;
            Some(Event::PublishStatusChanged {
                subscription_id: subscription_id.to_string(),
                status: self.status,
                late_count: self.publish_late_count,
            })
        } else {
            None
        };

        self.insert_message(message, now);
        self.fill_gaps(now);
        self.trim_processed();
        recovered
    }

    fn insert_message(&mut self, message: NotificationMessage, now: Instant) {
        let sequence_number = message.sequence_number;
        let payload = if message.is_keep_alive() {
            None
        } else {
            Some(message)
        };

        let position = self
            .incoming
            .iter()
            .rposition(|entry| !sequence_after(entry.sequence_number, sequence_number));

        match position {
            Some(index) if self.incoming[index].sequence_number == sequence_number => {
                let entry = &mut self.incoming[index];
                if payload.is_some() && entry.message.is_none() && !entry.processed {
                    entry.message = payload;
                    entry.timestamp = now;
                } else if payload.is_some() {
                    tracing::debug!(sequence_number, "duplicate message ignored");
                }
            }
            Some(index) => {
                let mut entry = IncomingMessage::placeholder(sequence_number, now);
                entry.message = payload;
                self.incoming.insert(index + 1, entry);
            }
            None if self.incoming.is_empty() => {
                let mut entry = IncomingMessage::placeholder(sequence_number, now);
                entry.message = payload;
                self.incoming.push_back(entry);
            }
            None => {
                // Older than anything kept, so already processed
                tracing::debug!(sequence_number, "stale message ignored");
            }
        }
    }

    fn fill_gaps(&mut self, now: Instant) {
        let mut index = 0;
        while index + 1 < self.incoming.len() {
            let current = self.incoming[index].sequence_number;
            let expected = next_sequence(current);
            let next = self.incoming[index + 1].sequence_number;
            if sequence_after(next, expected) {
                if next.wrapping_sub(expected) > MAX_GAP_FILL {
                    tracing::warn!(
                        server_id = self.server_id,
                        "sequence jumped from {} to {}, not waiting for the gap",
                        current,
                        next
                    );
                } else {
                    self.incoming
                        .insert(index + 1, IncomingMessage::placeholder(expected, now));
                }
            }
            index += 1;
        }
    }

    /// Drop processed entries from the front, keeping one as the baseline
    fn trim_processed(&mut self) {
        while self.incoming.len() > 1 && self.incoming.front().is_some_and(|e| e.processed) {
            self.incoming.pop_front();
        }
    }

    /// Take every message that is ready, in sequence order
    ///
    /// Stops at the first placeholder that has a successor. Returns the
    /// sequence number to republish if that placeholder timed out.
    pub(super) fn collect_ready(
        &mut self,
        now: Instant,
        republish_timeout: std::time::Duration,
    ) -> (Vec<NotificationMessage>, Option<u32>) {
        let mut ready = Vec::new();
        let mut republish = None;
        let len = self.incoming.len();

        for index in 0..len {
            let has_next = index + 1 < len;
            let entry = &mut self.incoming[index];
            if entry.processed {
                continue;
            }
            match entry.message.as_ref() {
                Some(message) => {
                    ready.push(message.clone());
                    entry.processed = true;
                }
                None => {
                    if has_next
                        && !entry.republished
                        && now.duration_since(entry.timestamp) > republish_timeout
                    {
                        entry.republished = true;
                        republish = Some(entry.sequence_number);
                    }
                    break;
                }
            }
        }

        self.trim_processed();
        (ready, republish)
    }

    /// Fill a placeholder with its republished message
    pub(super) fn fill_gap(&mut self, message: NotificationMessage) {
        let sequence_number = message.sequence_number;
        if let Some(entry) = self
            .incoming
            .iter_mut()
            .find(|entry| entry.sequence_number == sequence_number && !entry.processed)
        {
            entry.message = Some(message);
        }
    }

    /// Give up on a placeholder so processing continues past it
    pub(super) fn abandon_gap(&mut self, sequence_number: u32) {
        if let Some(entry) = self
            .incoming
            .iter_mut()
            .find(|entry| entry.sequence_number == sequence_number)
        {
            entry.processed = true;
        }
    }

    /// Hand a message to the item caches and build the consumer notification
    pub(super) fn deliver(
        &mut self,
        subscription_id: &str,
        message: NotificationMessage,
    ) -> Option<SubscriptionNotification> {
        let mut notifications = Vec::new();

        for data in &message.notification_data {
            match data {
                NotificationData::DataChange(change) => {
                    for notification in &change.monitored_items {
                        let handle = ClientHandle(notification.client_handle);
                        let item = match self.items.get_mut(handle) {
                            Some(item) => {
                                item.save_value(&notification.value);
                                Some(&*item)
                            }
                            None => {
                                tracing::debug!(subscription_id, %handle, "data change for unknown item");
                                None
                            }
                        };
                        notifications.push(MonitoredItemNotificationModel {
                            client_handle: notification.client_handle,
                            id: item.and_then(|i| i.model().id.clone()),
                            display_name: item.and_then(|i| i.model().display_name.clone()),
                            node_id: item.map(|i| i.target_node().clone()),
                            value: Some(notification.value.clone()),
                            event_fields: None,
                            status: notification.value.status,
                        });
                    }
                }
                NotificationData::Events(events) => {
                    for event in &events.events {
                        let handle = ClientHandle(event.client_handle);
                        let item = match self.items.get_mut(handle) {
                            Some(item) => {
                                item.save_event(event);
                                Some(&*item)
                            }
                            None => {
                                tracing::debug!(subscription_id, %handle, "event for unknown item");
                                None
                            }
                        };
                        notifications.push(MonitoredItemNotificationModel {
                            client_handle: event.client_handle,
                            id: item.and_then(|i| i.model().id.clone()),
                            display_name: item.and_then(|i| i.model().display_name.clone()),
                            node_id: item.map(|i| i.target_node().clone()),
                            value: None,
                            event_fields: Some(event.event_fields.clone()),
                            status: StatusCode::GOOD,
                        });
                    }
                }
                NotificationData::StatusChange(change) => {
                    tracing::info!(
                        subscription_id,
                        server_id = self.server_id,
                        status = %change.status,
                        "subscription status changed on the server"
                    );
                }
            }
        }

        let max = self.config.max_notifications_per_publish;
        if max != 0 && notifications.len() > max as usize {
            tracing::warn!(
                subscription_id,
                sequence_number = message.sequence_number,
                "{} notifications exceed max notifications per publish {}",
                notifications.len(),
                max
            );
        }

        let notification = SubscriptionNotification {
            subscription_id: subscription_id.to_string(),
            server_id: self.server_id,
            sequence_number: message.sequence_number,
            publish_time: message.publish_time,
            notifications,
            string_table: message.string_table.clone(),
        };

        self.message_cache.push_back(message);
        while self.message_cache.len() > self.config.max_message_count.max(1) {
            self.message_cache.pop_front();
        }

        if notification.notifications.is_empty() {
            None
        } else {
            Some(notification)
        }
    }
}

impl SubscriptionState {
    /// Store a message received for this subscription
    ///
    /// `available` replaces the retransmittable sequence numbers when set.
    pub async fn save_message(&self, available: Option<Vec<u32>>, message: NotificationMessage) {
        let recovered = self.inner.lock().await.save_message(
            &self.id,
            available,
            message,
            Instant::now(),
        );
        if let Some(event) = recovered {
            self.emit(event);
        }
    }

    /// Deliver every message that is ready, republishing timed-out gaps
    ///
    /// Concurrent calls are serialized so delivery order follows sequence
    /// order.
    pub async fn process_messages(&self) {
        let _drain = self.drain_lock.lock().await;

        loop {
            let (ready, republish, server_id) = {
                let mut inner = self.inner.lock().await;
                let (ready, republish) =
                    inner.collect_ready(Instant::now(), self.publish_config.republish_timeout);
                (ready, republish, inner.server_id)
            };

            if !ready.is_empty() {
                self.dispatch(ready).await;
            }

            match republish {
                Some(sequence_number) => self.republish_gap(server_id, sequence_number).await,
                None => break,
            }
        }
    }

    async fn dispatch(&self, messages: Vec<NotificationMessage>) {
        let callback = self.fast_callback.read().await.clone();

        for message in messages {
            let notification = self.inner.lock().await.deliver(&self.id, message);
            let Some(notification) = notification else {
                continue;
            };

            if let Some(callback) = &callback {
                callback(&notification);
            }
            self.emit(Event::Notification(notification));
        }
    }

    async fn republish_gap(&self, server_id: u32, sequence_number: u32) {
        tracing::debug!(subscription_id = %self.id, server_id, sequence_number, "republishing missing message");

        let result = match timeout(
            self.publish_config.operation_timeout,
            self.session.republish(server_id, sequence_number),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout),
        };

        let mut inner = self.inner.lock().await;
        match result {
            Ok(message) if !message.is_keep_alive() && message.sequence_number == sequence_number => {
                inner.fill_gap(message);
            }
            Ok(_) => {
                tracing::debug!(subscription_id = %self.id, sequence_number, "republish returned no data, gap skipped");
                inner.abandon_gap(sequence_number);
            }
            Err(e) => {
                inner.abandon_gap(sequence_number);
                drop(inner);

                let status = e.status_code();
                if status == StatusCode::BAD_MESSAGE_NOT_AVAILABLE {
                    tracing::debug!(subscription_id = %self.id, sequence_number, "message no longer available, gap skipped");
                } else {
                    tracing::warn!(subscription_id = %self.id, sequence_number, "republish failed: {e}");
                    self.emit(Event::PublishError {
                        subscription_id: Some(server_id),
                        sequence_number: Some(sequence_number),
                        status,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Recently processed messages, oldest first
    pub async fn notifications(&self) -> Vec<NotificationMessage> {
        self.inner.lock().await.message_cache.iter().cloned().collect()
    }

    /// Sequence numbers of placeholders still waiting for their message
    pub async fn missing_sequence_numbers(&self) -> Vec<u32> {
        let inner = self.inner.lock().await;
        let len = inner.incoming.len();
        inner
            .incoming
            .iter()
            .enumerate()
            .filter(|(index, entry)| !entry.processed && entry.message.is_none() && index + 1 < len)
            .map(|(_, entry)| entry.sequence_number)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriptionConfig;
    use chrono::Utc;
    use opcua_api::{DataChangeNotification, DataValue, MonitoredItemNotification};
    use std::time::Duration;

    fn data_message(sequence_number: u32, handle: u32) -> NotificationMessage {
        NotificationMessage {
            sequence_number,
            publish_time: Utc::now(),
            notification_data: vec![NotificationData::DataChange(DataChangeNotification {
                monitored_items: vec![MonitoredItemNotification {
                    client_handle: handle,
                    value: DataValue::new(sequence_number),
                }],
            })],
            string_table: Vec::new(),
        }
    }

    fn sequence(messages: &[NotificationMessage]) -> Vec<u32> {
        messages.iter().map(|m| m.sequence_number).collect()
    }

    fn inner() -> Inner {
        let mut inner = Inner::new(SubscriptionConfig::default());
        inner.server_id = 1;
        inner.status = SubscriptionStatus::Created;
        inner
    }

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_messages_wait_for_gap() {
        let mut inner = inner();
        let now = Instant::now();

        inner.save_message("sub", None, data_message(1, 1), now);
        inner.save_message("sub", None, data_message(3, 1), now);
        let (ready, republish) = inner.collect_ready(now, TIMEOUT);
        assert_eq!(sequence(&ready), vec![1]);
        assert_eq!(republish, None);

        inner.save_message("sub", None, data_message(2, 1), now);
        let (ready, _) = inner.collect_ready(now, TIMEOUT);
        assert_eq!(sequence(&ready), vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_gap_is_republished_once() {
        let mut inner = inner();
        let start = Instant::now();
        inner.save_message("sub", None, data_message(1, 1), start);
        inner.save_message("sub", None, data_message(3, 1), start);
        let _ = inner.collect_ready(start, TIMEOUT);

        let later = start + Duration::from_secs(11);
        let (_, republish) = inner.collect_ready(later, TIMEOUT);
        assert_eq!(republish, Some(2));
        let (ready, republish) = inner.collect_ready(later, TIMEOUT);
        assert!(ready.is_empty());
        assert_eq!(republish, None);

        inner.abandon_gap(2);
        let (ready, _) = inner.collect_ready(later, TIMEOUT);
        assert_eq!(sequence(&ready), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_reveals_gap() {
        let mut inner = inner();
        let now = Instant::now();
        inner.save_message("sub", None, data_message(1, 1), now);
        let _ = inner.collect_ready(now, TIMEOUT);

        // keep-alive announces 4 as the next sequence number
        inner.save_message("sub", Some(vec![]), NotificationMessage::keep_alive(4, Utc::now()), now);
        assert!(inner.incoming.iter().any(|e| e.sequence_number == 2));
        assert!(inner.incoming.iter().any(|e| e.sequence_number == 3));

        // the trailing keep-alive slot is filled by the data message
        inner.save_message("sub", None, data_message(4, 1), now);
        inner.fill_gap(data_message(2, 1));
        inner.fill_gap(data_message(3, 1));
        let (ready, _) = inner.collect_ready(now, TIMEOUT);
        assert_eq!(sequence(&ready), vec![2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_rollover_keeps_order() {
        let mut inner = inner();
        let now = Instant::now();
        inner.save_message("sub", None, data_message(u32::MAX - 1, 1), now);
        let (ready, _) = inner.collect_ready(now, TIMEOUT);
        assert_eq!(sequence(&ready), vec![u32::MAX - 1]);

        // 1 follows u32::MAX, so only u32::MAX is missing
        inner.save_message("sub", None, data_message(1, 1), now);
        assert_eq!(
            inner.incoming.iter().map(|e| e.sequence_number).collect::<Vec<_>>(),
            vec![u32::MAX, 1]
        );
        let (ready, _) = inner.collect_ready(now, TIMEOUT);
        assert!(ready.is_empty());

        inner.save_message("sub", None, data_message(u32::MAX, 1), now);
        inner.save_message("sub", None, data_message(2, 1), now);
        let (ready, _) = inner.collect_ready(now, TIMEOUT);
        assert_eq!(sequence(&ready), vec![u32::MAX, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_and_stale_messages_ignored() {
        let mut inner = inner();
        let now = Instant::now();
        inner.save_message("sub", None, data_message(5, 1), now);
        inner.save_message("sub", None, data_message(6, 1), now);
        let (ready, _) = inner.collect_ready(now, TIMEOUT);
        assert_eq!(sequence(&ready), vec![5, 6]);
        // only the baseline entry stays
        assert_eq!(inner.incoming.len(), 1);

        inner.save_message("sub", None, data_message(6, 1), now);
        inner.save_message("sub", None, data_message(4, 1), now);
        let (ready, _) = inner.collect_ready(now, TIMEOUT);
        assert!(ready.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_fills_message_cache() {
        let mut inner = inner();
        inner.config.max_message_count = 2;
        inner.items.insert(ClientHandle(1), crate::types::MonitoredItemModel::new("ns=2;s=A").with_id("a"));

        for seq in 1..=3 {
            let notification = inner.deliver("sub", data_message(seq, 1)).expect("notification");
            assert_eq!(notification.notifications[0].id.as_deref(), Some("a"));
        }
        assert_eq!(inner.message_cache.len(), 2);
        assert_eq!(inner.message_cache.front().map(|m| m.sequence_number), Some(2));

        let item = inner.items.get_mut(ClientHandle(1)).expect("item");
        assert_eq!(item.dequeue_values(), vec![DataValue::new(3)]);

        let status_only = NotificationMessage {
            sequence_number: 4,
            publish_time: Utc::now(),
            notification_data: vec![NotificationData::StatusChange(
                opcua_api::StatusChangeNotification {
                    status: StatusCode::BAD_TIMEOUT,
                },
            )],
            string_table: Vec::new(),
        };
        assert!(inner.deliver("sub", status_only).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_message_recovers_publishing() {
        let mut inner = inner();
        inner.status = SubscriptionStatus::PublishingStopped;
        let event = inner.save_message("sub", None, data_message(1, 1), Instant::now());
        assert!(matches!(
            event,
            Some(Event::PublishStatusChanged {
                status: SubscriptionStatus::PublishingActive,
                ..
            })
        ));
        assert_eq!(inner.status, SubscriptionStatus::PublishingActive);
    }
}
