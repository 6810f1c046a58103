//! The publish loop of one session.

use chrono::Utc;
use opcua_api::{
    ApiError, PublishResponse, Session, StatusCode, SubscriptionAcknowledgement,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::acks::AckTracker;
use crate::config::PublishConfig;
use crate::error::{Result, StreamError};
use crate::event::Event;
use crate::manager::SubscriptionManager;
use crate::subscription::SubscriptionState;

/// Why a publish loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Enough requests are outstanding for the current subscriptions
    Backpressure,
    /// The session or server can no longer serve publish requests
    Terminal(StatusCode),
    /// The session is being re-established
    Reconnecting,
    Cancelled,
}

/// Status codes that end the publish loop
pub fn is_terminal(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_NO_SUBSCRIPTION
            | StatusCode::BAD_SESSION_CLOSED
            | StatusCode::BAD_SESSION_ID_INVALID
            | StatusCode::BAD_TOO_MANY_PUBLISH_REQUESTS
            | StatusCode::BAD_SERVER_HALTED
    )
}

/// Publish request pipeline of one session.
///
/// Each running loop keeps one publish request in flight. Responses are
/// routed to the subscription they belong to, which stores the message and
/// processes it on a separate task. Acknowledgements are collected here and
/// sent with the next request of any loop.
///
/// # Process
///
/// 1. Take the pending acknowledgements of subscriptions that still exist
/// 2. Send a publish request bounded by the operation timeout
/// 3. Rebuild the acknowledgements from the response
/// 4. Hand the message to its subscription and start processing
/// 5. Repeat while fewer requests are in flight than subscriptions exist
pub struct PublishLoop {
    session: Arc<dyn Session>,
    manager: Arc<SubscriptionManager>,
    config: PublishConfig,
    acks: Mutex<AckTracker>,
    outstanding: AtomicUsize,
    running: AtomicUsize,
    reconnecting: AtomicBool,
}

impl PublishLoop {
    pub fn new(manager: Arc<SubscriptionManager>) -> Self {
        Self {
            session: manager.session(),
            config: manager.publish_config().clone(),
            manager,
            acks: Mutex::new(AckTracker::new()),
            outstanding: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            reconnecting: AtomicBool::new(false),
        }
    }

    /// While set, failed requests are abandoned without error events
    pub fn set_reconnecting(&self, reconnecting: bool) {
        self.reconnecting.store(reconnecting, Ordering::SeqCst);
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Publish requests currently waiting for a response
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Loops currently running
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn pending_acknowledgements(&self) -> Vec<SubscriptionAcknowledgement> {
        self.acks.lock().await.pending().to_vec()
    }

    /// Start loops until one runs per created subscription
    pub async fn spawn_pipeline(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<PublishOutcome>> {
        let wanted = self
            .manager
            .created_count()
            .await
            .saturating_sub(self.running());

        (0..wanted)
            .map(|_| {
                let publish_loop = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { publish_loop.run(cancel).await })
            })
            .collect()
    }

    /// Run publish requests until cancelled, stopped by backpressure or
    /// ended by a terminal error
    ///
    /// Cancellation is checked between requests; a request in flight is
    /// allowed to complete.
    pub async fn run(&self, cancel: CancellationToken) -> PublishOutcome {
        self.running.fetch_add(1, Ordering::SeqCst);
        let outcome = self.run_loop(&cancel).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        tracing::debug!(?outcome, "publish loop stopped");
        outcome
    }

    async fn run_loop(&self, cancel: &CancellationToken) -> PublishOutcome {
        loop {
            if cancel.is_cancelled() {
                return PublishOutcome::Cancelled;
            }
            if self.is_reconnecting() {
                return PublishOutcome::Reconnecting;
            }
            if self.outstanding() >= self.manager.created_count().await {
                return PublishOutcome::Backpressure;
            }

            match self.publish_once().await {
                Ok(()) => {}
                Err(Some(outcome)) => return outcome,
                Err(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                        _ = cancel.cancelled() => return PublishOutcome::Cancelled,
                    }
                }
            }
        }
    }

    /// One request and its response
    ///
    /// `Err(None)` is a transient failure, `Err(Some(_))` ends the loop.
    async fn publish_once(&self) -> std::result::Result<(), Option<PublishOutcome>> {
        let known = self.manager.server_ids().await;
        let acks = {
            let mut tracker = self.acks.lock().await;
            let dropped = tracker.retain_subscriptions(&known);
            if dropped > 0 {
                tracing::debug!("dropped {dropped} acknowledgements of removed subscriptions");
            }
            tracker.take()
        };

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let result = match timeout(
            self.config.operation_timeout,
            self.session.publish(acks.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout),
        };
        self.outstanding.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(response) => {
                self.handle_response(&acks, response).await;
                Ok(())
            }
            Err(e) => Err(self.handle_error(acks, e).await),
        }
    }

    async fn handle_response(&self, sent: &[SubscriptionAcknowledgement], response: PublishResponse) {
        let PublishResponse {
            subscription_id,
            available_sequence_numbers,
            more_notifications,
            notification_message: message,
            results,
        } = response;

        for (ack, status) in sent.iter().zip(&results) {
            if status.is_bad() {
                tracing::debug!(
                    subscription_id = ack.subscription_id,
                    sequence_number = ack.sequence_number,
                    %status,
                    "acknowledgement rejected"
                );
            }
        }

        let Some(subscription) = self.manager.find_by_server_id(subscription_id).await else {
            tracing::warn!(
                subscription_id,
                sequence_number = message.sequence_number,
                "publish response for unknown subscription dropped"
            );
            return;
        };

        let sequence_number = message.sequence_number;
        let keep_alive = message.is_keep_alive();
        let duplicate = self.acks.lock().await.on_response(
            subscription_id,
            &available_sequence_numbers,
            sequence_number,
            keep_alive,
        );
        if duplicate {
            tracing::warn!(
                subscription_id,
                sequence_number,
                "received sequence number which was already acknowledged"
            );
        }
        if more_notifications {
            tracing::trace!(subscription_id, "server has more notifications queued");
        }

        self.check_freshness(&subscription, subscription_id, &message).await;

        subscription
            .save_message(Some(available_sequence_numbers), message)
            .await;
        tokio::spawn(async move { subscription.process_messages().await });
    }

    async fn check_freshness(
        &self,
        subscription: &SubscriptionState,
        subscription_id: u32,
        message: &opcua_api::NotificationMessage,
    ) {
        let window = subscription
            .current_publishing_interval()
            .await
            .saturating_mul(subscription.current_keep_alive_count().await);
        let now = Utc::now();

        if message.publish_time > now {
            tracing::warn!(
                subscription_id,
                sequence_number = message.sequence_number,
                "publish time {} is in the future",
                message.publish_time
            );
        } else if window.is_zero() {
            return;
        } else if let Ok(window) = chrono::Duration::from_std(window) {
            if message.publish_time + window < now {
                tracing::warn!(
                    subscription_id,
                    sequence_number = message.sequence_number,
                    "publish time {} is older than the keep alive window",
                    message.publish_time
                );
            }
        }
    }

    async fn handle_error(
        &self,
        sent: Vec<SubscriptionAcknowledgement>,
        error: ApiError,
    ) -> Option<PublishOutcome> {
        if self.is_reconnecting() {
            tracing::debug!("publish abandoned while reconnecting: {error}");
            return Some(PublishOutcome::Reconnecting);
        }

        self.acks.lock().await.requeue(sent);

        let status = error.status_code();
        if status == StatusCode::BAD_NO_SUBSCRIPTION {
            tracing::debug!("publish returned no subscription");
        } else {
            tracing::warn!(%status, "publish failed: {error}");
            self.manager.emit(Event::PublishError {
                subscription_id: None,
                sequence_number: None,
                status,
                message: error.to_string(),
            });
        }

        if is_terminal(status) {
            Some(PublishOutcome::Terminal(status))
        } else {
            None
        }
    }

    /// Ask the server to resend one message and deliver it
    ///
    /// Returns false when the server no longer has the message.
    pub async fn republish(&self, server_id: u32, sequence_number: u32) -> Result<bool> {
        let subscription = self
            .manager
            .find_by_server_id(server_id)
            .await
            .ok_or_else(|| StreamError::NotCreated(format!("server id {server_id}")))?;

        let result = match timeout(
            self.config.operation_timeout,
            self.session.republish(server_id, sequence_number),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout),
        };

        match result {
            Ok(message) => {
                subscription.save_message(None, message).await;
                subscription.process_messages().await;
                Ok(true)
            }
            Err(e) if e.status_code() == StatusCode::BAD_MESSAGE_NOT_AVAILABLE => {
                tracing::debug!(server_id, sequence_number, "message not available for republish");
                Ok(false)
            }
            Err(e) => {
                self.manager.emit(Event::PublishError {
                    subscription_id: Some(server_id),
                    sequence_number: Some(sequence_number),
                    status: e.status_code(),
                    message: e.to_string(),
                });
                Err(e.into())
            }
        }
    }
}
