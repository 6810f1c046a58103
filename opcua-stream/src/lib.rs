//! # opcua-stream
//!
//! Subscription and monitored item synchronization for OPC UA clients.
//!
//! Callers describe the subscriptions and monitored items they want. The
//! engine computes the difference to what exists on the server, issues the
//! service calls to converge, keeps publish requests outstanding and
//! delivers data changes and events in sequence order.
//!
//! # Architecture
//!
//! ```text
//! desired items -> MonitoredItemSet::diff -> SubscriptionState -> Session
//!                                                 ^                 |
//!                  events <- process_messages <- PublishLoop <------+
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use opcua_stream::{
//!     MonitoredItemModel, PublishConfig, PublishLoop, SubscriptionManager, SubscriptionModel,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let manager = Arc::new(SubscriptionManager::new(session, PublishConfig::default())?);
//! let mut events = manager.events();
//!
//! let subscription = manager.get_or_create(SubscriptionModel::new("plant"))?;
//! subscription
//!     .apply(
//!         subscription.configuration().await,
//!         vec![MonitoredItemModel::new("ns=2;s=Boiler.Temperature")],
//!     )
//!     .await?;
//!
//! let publisher = Arc::new(PublishLoop::new(Arc::clone(&manager)));
//! publisher.spawn_pipeline(CancellationToken::new()).await;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod item;
pub mod logging;
pub mod manager;
pub mod publish;
pub mod subscription;
pub mod types;

pub use cache::{ItemCache, NotificationQueue};
pub use config::{PublishConfig, SubscriptionConfig};
pub use error::{Result, StreamError};
pub use event::{
    ChangeMask, Event, FastCallback, MonitoredItemNotificationModel, SubscriptionNotification,
    SubscriptionStatus,
};
pub use item::{
    ItemChanges, ItemError, ItemStatus, LinkChanges, LinkDelta, MonitoredItemSet,
    MonitoredItemState,
};
pub use logging::{init_logging, init_logging_from_env, LoggingMode};
pub use manager::SubscriptionManager;
pub use publish::{is_terminal, AckTracker, PublishLoop, PublishOutcome};
pub use subscription::{
    adjust_counts, AdjustedCounts, SubscriptionState, UNKNOWN_INTERVAL_LIFETIME_COUNT,
};
pub use types::{
    next_sequence, sequence_after, ClientHandle, HandleGenerator, ItemKey, MonitoredItemModel,
    SubscriptionModel,
};

// Re-export the session contract so callers need a single dependency
pub use opcua_api;
