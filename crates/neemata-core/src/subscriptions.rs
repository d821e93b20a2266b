// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pub/sub subscription manager.
//!
//! Maps channel keys to connected subscribers and fans events out through
//! each subscriber's transport sender. Delivery is best-effort: a full send
//! buffer drops the payload for that subscriber and bumps a counter; the
//! subscription itself survives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use neemata_protocol::{ClientFrame, ClientFrameKind};

use crate::format::FormatSelector;
use crate::transport::{ConnectionHandle, ConnectionId};

/// Optional per-subscription payload filter.
pub type FilterFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// The subscription manager contract.
///
/// Channel keys are opaque strings; whether keys support wildcards is a
/// policy of the implementation. The manager is fixed at initialization.
pub trait SubscriptionManager: Send + Sync {
    /// Add a subscription for a connection.
    fn subscribe(&self, connection: &ConnectionHandle, channel: &str, filter: Option<FilterFn>);

    /// Remove one subscription.
    fn unsubscribe(&self, connection: ConnectionId, channel: &str);

    /// Remove every subscription of a connection (called on disconnect,
    /// before any later publish can observe the closed connection).
    fn remove_connection(&self, connection: ConnectionId);

    /// Fan a payload out to the channel's subscribers. Returns the number of
    /// subscribers the payload was handed to.
    fn publish(&self, channel: &str, payload: &Value) -> usize;

    /// Total payloads dropped on full send buffers.
    fn dropped(&self) -> u64;
}

struct Subscriber {
    connection: ConnectionId,
    content_type: String,
    sender: mpsc::Sender<ClientFrame>,
    filter: Option<FilterFn>,
}

/// Exact-match subscription manager.
pub struct BasicSubscriptions {
    format: Arc<FormatSelector>,
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
    dropped: AtomicU64,
}

impl BasicSubscriptions {
    pub fn new(format: Arc<FormatSelector>) -> Self {
        Self {
            format,
            channels: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        self.channels.lock().expect("subscription lock poisoned")
    }
}

impl SubscriptionManager for BasicSubscriptions {
    fn subscribe(&self, connection: &ConnectionHandle, channel: &str, filter: Option<FilterFn>) {
        let mut channels = self.lock();
        let subscribers = channels.entry(channel.to_string()).or_default();
        // Re-subscribing replaces the filter.
        subscribers.retain(|s| s.connection != connection.id());
        subscribers.push(Subscriber {
            connection: connection.id(),
            content_type: connection.content_type().to_string(),
            sender: connection.sender().clone(),
            filter,
        });
    }

    fn unsubscribe(&self, connection: ConnectionId, channel: &str) {
        let mut channels = self.lock();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|s| s.connection != connection);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
    }

    fn remove_connection(&self, connection: ConnectionId) {
        let mut channels = self.lock();
        channels.retain(|_, subscribers| {
            subscribers.retain(|s| s.connection != connection);
            !subscribers.is_empty()
        });
    }

    fn publish(&self, channel: &str, payload: &Value) -> usize {
        let mut channels = self.lock();
        let Some(subscribers) = channels.get_mut(channel) else {
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|subscriber| {
            if let Some(filter) = &subscriber.filter
                && !filter(payload)
            {
                return true;
            }

            let event = serde_json::json!({ "channel": channel, "payload": payload });
            let bytes = match self.format.encode(&event, &subscriber.content_type) {
                Ok(bytes) => bytes,
                Err(error) => {
                    debug!(channel, %error, "failed to encode subscription event");
                    return true;
                }
            };

            match subscriber
                .sender
                .try_send(ClientFrame::new(ClientFrameKind::SubscriptionEvent, bytes))
            {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::scope::Scope;
    use crate::streams::StreamTable;
    use crate::transport::Connection;
    use serde_json::json;

    fn connection(buffer: usize) -> (ConnectionHandle, mpsc::Receiver<ClientFrame>) {
        let (tx, rx) = mpsc::channel(buffer);
        let container = Container::new(Scope::Connection);
        let streams = StreamTable::new(16, Arc::new(AtomicU64::new(0)));
        let conn = Arc::new(Connection::new(
            "application/json".to_string(),
            tx,
            container,
            streams,
        ));
        (conn, rx)
    }

    fn manager() -> BasicSubscriptions {
        BasicSubscriptions::new(Arc::new(FormatSelector::default()))
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_subscribers() {
        let manager = manager();
        let (c1, mut rx1) = connection(8);
        let (c2, mut rx2) = connection(8);
        let (c3, mut rx3) = connection(8);

        for conn in [&c1, &c2, &c3] {
            manager.subscribe(conn, "orders", None);
        }

        assert_eq!(manager.publish("orders", &json!({"id": 1})), 3);
        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.kind, ClientFrameKind::SubscriptionEvent);
            let event: Value = serde_json::from_slice(&frame.payload).unwrap();
            assert_eq!(event["channel"], "orders");
            assert_eq!(event["payload"]["id"], 1);
        }
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_receives_nothing_further() {
        let manager = manager();
        let (c1, mut rx1) = connection(8);
        let (c2, mut rx2) = connection(8);

        manager.subscribe(&c1, "orders", None);
        manager.subscribe(&c2, "orders", None);
        manager.remove_connection(c2.id());

        assert_eq!(manager.publish("orders", &json!({"id": 2})), 1);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_filter_limits_delivery() {
        let manager = manager();
        let (c1, mut rx1) = connection(8);
        let filter: FilterFn = Arc::new(|payload| payload["level"] == "high");
        manager.subscribe(&c1, "alerts", Some(filter));

        assert_eq!(manager.publish("alerts", &json!({"level": "low"})), 0);
        assert_eq!(manager.publish("alerts", &json!({"level": "high"})), 1);
        assert!(rx1.recv().await.is_some());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_buffer_drops_payload_but_keeps_subscription() {
        let manager = manager();
        let (c1, mut rx1) = connection(1);
        manager.subscribe(&c1, "ticks", None);

        assert_eq!(manager.publish("ticks", &json!(1)), 1);
        // Buffer of one is now full; this publish is dropped.
        assert_eq!(manager.publish("ticks", &json!(2)), 0);
        assert_eq!(manager.dropped(), 1);

        // Draining the buffer resumes delivery on the same subscription.
        rx1.recv().await.unwrap();
        assert_eq!(manager.publish("ticks", &json!(3)), 1);
    }

    #[tokio::test]
    async fn test_exact_match_only() {
        let manager = manager();
        let (c1, _rx1) = connection(8);
        manager.subscribe(&c1, "orders", None);

        assert_eq!(manager.publish("orders.created", &json!(1)), 0);
        assert_eq!(manager.publish("order", &json!(1)), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_single_channel() {
        let manager = manager();
        let (c1, mut rx1) = connection(8);
        manager.subscribe(&c1, "a", None);
        manager.subscribe(&c1, "b", None);

        manager.unsubscribe(c1.id(), "a");
        assert_eq!(manager.publish("a", &json!(1)), 0);
        assert_eq!(manager.publish("b", &json!(1)), 1);
        assert!(rx1.recv().await.is_some());
    }
}
