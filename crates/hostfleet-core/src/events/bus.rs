// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-order event log with live fan-out.
//!
//! ```text
//!   publish(order, type, payload)
//!        │
//!        ├─► EventRepository::append_event   (seq = max + 1)
//!        │
//!        ├─► subscribers[order]  try_send, drop when full
//!        │     (append and fan-out hold the order's lock, so
//!        │      subscribers see seq ascending)
//!        │
//!        └─► sinks               spawned, errors logged
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::OrderEvent;
use crate::error::Result;
use crate::locks::KeyedLocks;
use crate::store::EventRepository;

/// Capacity of each subscriber channel.
pub const SUBSCRIBER_BUFFER: usize = 16;

/// Best-effort consumer of published events.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, event: &OrderEvent) -> Result<()>;
}

type SubscriberMap = HashMap<i64, HashMap<u64, mpsc::Sender<OrderEvent>>>;

/// Persists order events and fans them out.
pub struct EventBus {
    repo: Arc<dyn EventRepository>,
    subscribers: Arc<RwLock<SubscriberMap>>,
    next_subscriber: AtomicU64,
    sinks: Vec<Arc<dyn EventSink>>,
    order_locks: KeyedLocks<i64>,
}

impl EventBus {
    pub fn new(repo: Arc<dyn EventRepository>) -> Self {
        Self {
            repo,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_subscriber: AtomicU64::new(1),
            sinks: Vec::new(),
            order_locks: KeyedLocks::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub(crate) fn repo(&self) -> &Arc<dyn EventRepository> {
        &self.repo
    }

    /// Persist an event and notify subscribers and sinks.
    ///
    /// Only the append can fail; delivery problems are logged.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        order_id: i64,
        event_type: &str,
        payload: &T,
    ) -> Result<OrderEvent> {
        let data_json = serde_json::to_string(payload)?;
        let event = {
            let _order = self.order_locks.lock(order_id).await;
            let event = self
                .repo
                .append_event(order_id, event_type, &data_json)
                .await?;
            self.fan_out(&event);
            event
        };
        debug!(order_id, seq = event.seq, event = %event.event_type, "Order event published");

        self.notify_sinks(&event);
        Ok(event)
    }

    fn fan_out(&self, event: &OrderEvent) {
        let subscribers = self.subscribers.read();
        let Some(subs) = subscribers.get(&event.order_id) else {
            return;
        };
        for (id, tx) in subs {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                debug!(
                    order_id = event.order_id,
                    seq = event.seq,
                    subscriber = id,
                    "Subscriber buffer full, dropping event"
                );
            }
        }
    }

    fn notify_sinks(&self, event: &OrderEvent) {
        for sink in &self.sinks {
            let sink = sink.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.deliver(&event).await {
                    warn!(
                        sink = sink.name(),
                        order_id = event.order_id,
                        seq = event.seq,
                        error = %e,
                        "Event sink delivery failed"
                    );
                }
            });
        }
    }

    /// Live events of one order from now on.
    pub fn subscribe(&self, order_id: i64) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .write()
            .entry(order_id)
            .or_default()
            .insert(id, tx);
        Subscription {
            order_id,
            id,
            rx,
            subscribers: self.subscribers.clone(),
        }
    }

    /// Number of live subscribers of an order.
    pub fn subscriber_count(&self, order_id: i64) -> usize {
        self.subscribers
            .read()
            .get(&order_id)
            .map_or(0, |subs| subs.len())
    }

    /// Persisted events with `seq > after_seq`, oldest first.
    pub async fn events_after(
        &self,
        order_id: i64,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<OrderEvent>> {
        self.repo.list_events_after(order_id, after_seq, limit).await
    }
}

/// Receiving end of [`EventBus::subscribe`]. Unsubscribes on drop.
pub struct Subscription {
    order_id: i64,
    id: u64,
    rx: mpsc::Receiver<OrderEvent>,
    subscribers: Arc<RwLock<SubscriberMap>>,
}

impl Subscription {
    pub fn order_id(&self) -> i64 {
        self.order_id
    }

    /// Next event, `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<OrderEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut subscribers = self.subscribers.write();
        if let Some(subs) = subscribers.get_mut(&self.order_id) {
            subs.remove(&self.id);
            if subs.is_empty() {
                subscribers.remove(&self.order_id);
            }
        }
    }
}
