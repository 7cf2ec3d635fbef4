// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pub/sub brokers over Postgres `LISTEN/NOTIFY`.
//!
//! Every write-performing table carries an AFTER trigger that publishes a
//! `(action, id)` notification on a channel named after the table. A
//! single [`Listener`] task consumes all channels and hands each
//! notification to the [`Broker`] registered for it. The broker
//! rehydrates the full payload through its [`Fetcher`] and fans the
//! resulting [`Event`] out to in-process subscribers over bounded
//! channels.
//!
//! Slow subscribers are dropped rather than blocking the rest: when a
//! subscriber's buffer is full its stream is closed and a warning logged.
//! When the database connection is lost and re-established, every
//! subscriber receives a synthetic [`Event::Resync`] so consumers can
//! invalidate caches built from the stream.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgListener, PgNotification};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Result;

/// Default per-subscriber buffer capacity.
pub const DEFAULT_BUFFER: usize = 256;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// The kind of row change a database notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted. The notification fires after the row is gone,
    /// so only the identifier can be rehydrated.
    Delete,
}

/// A notification delivered to broker subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum Event<T> {
    /// An entity was created.
    Created(T),
    /// An entity was updated.
    Updated(T),
    /// An entity was deleted; the payload is a skeleton carrying only
    /// the identifier.
    Deleted(T),
    /// The database listener re-established a lost connection; events may
    /// have been missed and caches built from this stream are stale.
    Resync,
}

impl<T> Event<T> {
    /// The entity carried by the event, if any.
    pub fn payload(&self) -> Option<&T> {
        match self {
            Event::Created(payload) | Event::Updated(payload) | Event::Deleted(payload) => {
                Some(payload)
            }
            Event::Resync => None,
        }
    }
}

/// Rehydrates notification payloads from the store.
///
/// Invoked with the primary-key string of the changed row. For
/// [`Action::Delete`] the row is gone; implementations construct a
/// skeleton payload carrying only the identifier.
#[async_trait]
pub trait Fetcher<T>: Send + Sync {
    /// Load or construct the payload for a notification.
    async fn fetch(&self, id: &str, action: Action) -> Result<T>;
}

type Subscribers<T> = Arc<Mutex<HashMap<u64, mpsc::Sender<Event<T>>>>>;

struct BrokerInner<T> {
    table: &'static str,
    fetcher: Arc<dyn Fetcher<T>>,
    subscribers: Subscribers<T>,
    next_id: AtomicU64,
}

/// Fans change notifications for one entity kind out to in-process
/// subscribers.
///
/// Constructed once at startup per entity kind and passed explicitly to
/// every component that needs it.
pub struct Broker<T>(Arc<BrokerInner<T>>);

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Broker(Arc::clone(&self.0))
    }
}

impl<T: Clone + Send + 'static> Broker<T> {
    /// Create a broker for the given table, rehydrating payloads through
    /// `fetcher`.
    pub fn new(table: &'static str, fetcher: Arc<dyn Fetcher<T>>) -> Self {
        Broker(Arc::new(BrokerInner {
            table,
            fetcher,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }))
    }

    /// Subscribe with the default buffer capacity.
    pub fn subscribe(&self) -> Subscription<T> {
        self.subscribe_with_buffer(DEFAULT_BUFFER)
    }

    /// Subscribe with an explicit buffer capacity. If the buffer fills up
    /// the subscription is dropped and its stream closed.
    pub fn subscribe_with_buffer(&self, buffer: usize) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        self.0
            .subscribers
            .lock()
            .expect("broker subscriber table poisoned")
            .insert(id, tx);
        Subscription {
            id,
            rx,
            subscribers: Arc::clone(&self.0.subscribers),
        }
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.0
            .subscribers
            .lock()
            .expect("broker subscriber table poisoned")
            .len()
    }

    /// Deliver an event to every subscriber, dropping any whose buffer is
    /// full.
    pub(crate) fn publish(&self, event: Event<T>) {
        let table = self.0.table;
        let mut subscribers = self
            .0
            .subscribers
            .lock()
            .expect("broker subscriber table poisoned");
        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(table, subscriber = id, "dropping slow broker subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Rehydrate a raw notification and publish the resulting event.
    pub(crate) async fn notify(&self, action: Action, id: &str) {
        let payload = match self.0.fetcher.fetch(id, action).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    table = self.0.table,
                    id,
                    error = %err,
                    "failed to rehydrate notification payload"
                );
                return;
            }
        };
        let event = match action {
            Action::Insert => Event::Created(payload),
            Action::Update => Event::Updated(payload),
            Action::Delete => Event::Deleted(payload),
        };
        self.publish(event);
    }
}

/// A live subscription to a [`Broker`]. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<Event<T>>,
    subscribers: Subscribers<T>,
}

impl<T> Subscription<T> {
    /// Receive the next event. Returns `None` when the subscription was
    /// dropped for falling behind or the broker shut down.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        self.rx.recv().await
    }

    /// Remove this subscription from the broker. Idempotent; also runs on
    /// drop.
    pub fn unsubscribe(&self) {
        self.subscribers
            .lock()
            .expect("broker subscriber table poisoned")
            .remove(&self.id);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = Event<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// A broker viewed through its type-erased notification interface, as
/// registered with the [`Listener`].
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Handle one raw notification from the channel.
    async fn handle(&self, action: Action, id: &str);

    /// Tell subscribers the connection was lost and re-established.
    fn resync(&self);
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> ChannelHandler for Broker<T> {
    async fn handle(&self, action: Action, id: &str) {
        self.notify(action, id).await;
    }

    fn resync(&self) {
        self.publish(Event::Resync);
    }
}

/// Wire form of a table notification, produced by the notify triggers.
#[derive(Debug, Deserialize)]
struct NotifyPayload {
    action: Action,
    id: String,
}

/// Consumes `LISTEN/NOTIFY` channels and dispatches raw notifications to
/// the broker registered for each channel.
pub struct Listener {
    pool: PgPool,
    handlers: HashMap<String, Arc<dyn ChannelHandler>>,
}

impl Listener {
    /// Create a listener over the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a channel. Channels are listened to when
    /// [`start`](Self::start) runs.
    pub fn register(&mut self, channel: impl Into<String>, handler: Arc<dyn ChannelHandler>) {
        self.handlers.insert(channel.into(), handler);
    }

    /// Consume notifications until shutdown is signaled.
    ///
    /// A lost connection is re-established with exponential backoff; on
    /// re-establishment every registered broker publishes
    /// [`Event::Resync`] since notifications may have been missed.
    pub async fn start(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        let channels: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        listener.listen_all(channels).await?;
        debug!("database listener started");

        let mut backoff = INITIAL_BACKOFF;
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                received = listener.try_recv() => match received {
                    Ok(Some(notification)) => {
                        backoff = INITIAL_BACKOFF;
                        self.dispatch(&notification).await;
                    }
                    Ok(None) => {
                        // the connection died; sqlx reconnects on the
                        // next receive, but events in between are lost
                        warn!("database listener lost its connection; resyncing subscribers");
                        for handler in self.handlers.values() {
                            handler.resync();
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, backoff = ?backoff, "database listener error");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        }
        debug!("database listener stopped");
        Ok(())
    }

    async fn dispatch(&self, notification: &PgNotification) {
        let payload: NotifyPayload = match serde_json::from_str(notification.payload()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    channel = notification.channel(),
                    error = %err,
                    "discarding malformed notification payload"
                );
                return;
            }
        };
        match self.handlers.get(notification.channel()) {
            Some(handler) => handler.handle(payload.action, &payload.id).await,
            None => debug!(
                channel = notification.channel(),
                "notification on unhandled channel"
            ),
        }
    }
}
