//! Keep-alive liveness timer of a subscription.

use std::sync::Weak;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use super::state::Inner;
use crate::error::{Result, StreamError};
use crate::event::Event;

/// Background task that checks for missing keep-alives.
///
/// Ticks once per keep-alive window. A tick that finds no message within the
/// window plus the grace period marks publishing as stopped and raises a
/// status event. The timer only observes; it never reconnects.
///
/// # Shutdown
///
/// [`stop`](Self::stop) is synchronous so it can run under the subscription
/// lock. Dropping the timer stops it. The task also ends on its own once the
/// subscription state is gone.
#[derive(Debug)]
pub struct KeepAliveTimer {
    background_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl KeepAliveTimer {
    pub(crate) fn start(
        period: Duration,
        target: Weak<Mutex<Inner>>,
        subscription_id: String,
        events: broadcast::Sender<Event>,
        grace: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let background_task = tokio::spawn(Self::keep_alive_task(
            period,
            target,
            subscription_id,
            events,
            grace,
            shutdown_rx,
        ));

        Self {
            background_task: Some(background_task),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Stop the timer without waiting for the task
    pub fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.try_send(());
        }
        if let Some(task) = self.background_task.take() {
            task.abort();
        }
    }

    /// Signal the task and wait up to 5 seconds for it to finish
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }

        if let Some(task) = self.background_task.take() {
            match timeout(Duration::from_secs(5), task).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) if e.is_cancelled() => Ok(()),
                Ok(Err(e)) => Err(StreamError::ShutdownError(format!(
                    "Keep-alive task panicked: {e}"
                ))),
                Err(_) => Err(StreamError::ShutdownError(
                    "Keep-alive task shutdown timed out after 5 seconds".to_string(),
                )),
            }
        } else {
            Ok(())
        }
    }

    pub fn is_running(&self) -> bool {
        self.background_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    async fn keep_alive_task(
        period: Duration,
        target: Weak<Mutex<Inner>>,
        subscription_id: String,
        events: broadcast::Sender<Event>,
        grace: Duration,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut check_interval = interval_at(Instant::now() + period, period);
        check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = check_interval.tick() => {
                    let Some(inner) = target.upgrade() else {
                        break;
                    };
                    let event = inner
                        .lock()
                        .await
                        .on_keep_alive_tick(&subscription_id, Instant::now(), grace);
                    if let Some(event) = event {
                        let _ = events.send(event);
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        tracing::trace!(subscription_id = %subscription_id, "keep-alive timer stopped");
    }
}

impl Drop for KeepAliveTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriptionConfig;
    use crate::event::SubscriptionStatus;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_timer_reports_missing_keep_alive() {
        let inner = Arc::new(Mutex::new(Inner::new(SubscriptionConfig::default())));
        {
            let mut guard = inner.lock().await;
            guard.server_id = 1;
            guard.status = SubscriptionStatus::Created;
            guard.current_publishing_interval = Duration::from_millis(100);
            guard.current_keep_alive_count = 5;
            guard.last_notification = Some(Instant::now());
        }
        let (events, mut rx) = broadcast::channel(16);

        let mut timer = KeepAliveTimer::start(
            Duration::from_millis(500),
            Arc::downgrade(&inner),
            "sub".to_string(),
            events,
            Duration::from_millis(100),
        );
        assert!(timer.is_running());

        // first tick at 500ms is within the window plus grace
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        match rx.try_recv() {
            Ok(Event::PublishStatusChanged { status, .. }) => {
                assert_eq!(status, SubscriptionStatus::PublishingStopped);
            }
            other => panic!("unexpected {other:?}"),
        }

        timer.stop();
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ends_with_subscription() {
        let inner = Arc::new(Mutex::new(Inner::new(SubscriptionConfig::default())));
        let (events, _rx) = broadcast::channel(16);
        let timer = KeepAliveTimer::start(
            Duration::from_millis(100),
            Arc::downgrade(&inner),
            "sub".to_string(),
            events,
            Duration::ZERO,
        );

        drop(inner);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(timer.shutdown().await.is_ok());
    }
}
