// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log chunks and the caching proxy.
//!
//! Agents stream Terraform output in chunks, one stream per `(run,
//! phase)`. The proxy keeps an in-memory copy of each stream, kept
//! current by subscribing to chunk notifications, so readers across the
//! cluster are served from memory instead of the store.
//!
//! The cache has a single writer from chunk events: [`LogsProxy::put`]
//! writes to the store only, and the store's notification feeds the cache
//! through the proxy's event loop. Readers fall back to the store on a
//! miss and populate the cache with what they find.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::pubsub::{Broker, Event};
use crate::run::{Phase, RunId};

/// An append-only slice of log bytes for a single `(run, phase)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// The run the log belongs to.
    pub run_id: RunId,
    /// The phase of the run the log belongs to.
    pub phase: Phase,
    /// Raw log bytes.
    pub data: Vec<u8>,
    /// Position of `data` within the phase's log stream.
    pub offset: usize,
}

/// Options for reading a window of a log stream.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct GetChunkOptions {
    /// The run to read logs for.
    pub run_id: RunId,
    /// The phase to read logs for.
    pub phase: Phase,
    /// Position to start reading from.
    #[serde(default)]
    pub offset: usize,
    /// Maximum number of bytes to return; zero means to the end.
    #[serde(default)]
    pub limit: usize,
}

impl Chunk {
    /// Whether this chunk opens a fresh log stream for its phase.
    pub fn is_start(&self) -> bool {
        self.offset == 0
    }

    /// Cut the chunk down to the requested window, clipping to bounds.
    pub fn cut(self, opts: &GetChunkOptions) -> Chunk {
        let start = opts
            .offset
            .saturating_sub(self.offset)
            .min(self.data.len());
        let end = if opts.limit == 0 {
            self.data.len()
        } else {
            start.saturating_add(opts.limit).min(self.data.len())
        };
        Chunk {
            offset: self.offset + start,
            data: self.data[start..end].to_vec(),
            ..self
        }
    }
}

/// Durable storage for log chunks. Implemented by the store; tests use an
/// in-memory fake.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// The full accumulated log for a phase.
    async fn get_logs(&self, run_id: RunId, phase: Phase) -> Result<Vec<u8>>;

    /// Persist a chunk, returning its identifier. The store emits the
    /// chunk notification that keeps proxy caches current.
    async fn put_chunk(&self, chunk: &Chunk) -> Result<Uuid>;
}

/// Caching tier between the log store and readers.
pub struct LogsProxy {
    cache: DashMap<String, Vec<u8>>,
    store: Arc<dyn ChunkStore>,
    broker: Broker<Chunk>,
}

fn cache_key(run_id: RunId, phase: Phase) -> String {
    format!("{}.{}.log", run_id, phase)
}

impl LogsProxy {
    /// Create a proxy over the given store and chunk broker.
    pub fn new(store: Arc<dyn ChunkStore>, broker: Broker<Chunk>) -> Self {
        Self {
            cache: DashMap::new(),
            store,
            broker,
        }
    }

    /// Keep the cache current with chunks published across the cluster,
    /// until shutdown is signaled.
    ///
    /// A resync (or a dropped subscription) means events may have been
    /// missed, so the entire cache is invalidated.
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let mut sub = self.broker.subscribe();
            debug!("log proxy subscribed to chunk stream");
            loop {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }

                    event = sub.recv() => match event {
                        Some(Event::Created(chunk)) | Some(Event::Updated(chunk)) => {
                            self.apply(chunk).await;
                        }
                        Some(Event::Deleted(_)) => {}
                        Some(Event::Resync) => {
                            warn!("chunk stream resynced; invalidating log cache");
                            self.cache.clear();
                        }
                        None => {
                            warn!("chunk subscription lost; invalidating log cache");
                            self.cache.clear();
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Fold one arriving chunk into the cache.
    async fn apply(&self, chunk: Chunk) {
        let key = cache_key(chunk.run_id, chunk.phase);
        // A start chunk overwrites whatever is cached; the phase began a
        // fresh stream.
        if chunk.is_start() {
            self.cache.insert(key, chunk.data);
            return;
        }
        if let Some(mut cached) = self.cache.get_mut(&key) {
            cached.extend_from_slice(&chunk.data);
            return;
        }
        // No cache entry; the store already contains this chunk since it
        // was written before the notification fired.
        match self.store.get_logs(chunk.run_id, chunk.phase).await {
            Ok(logs) => {
                self.cache.insert(key, logs);
            }
            Err(err) => warn!(
                run_id = %chunk.run_id,
                phase = %chunk.phase,
                error = %err,
                "failed to backfill log cache entry"
            ),
        }
    }

    /// Read a window of a log stream, from the cache when possible.
    pub async fn get(&self, opts: GetChunkOptions) -> Result<Chunk> {
        let key = cache_key(opts.run_id, opts.phase);
        // take the cached copy out of the map guard before any await
        let cached = self.cache.get(&key).map(|entry| entry.clone());
        let data = match cached {
            Some(data) => data,
            None => {
                let logs = self.store.get_logs(opts.run_id, opts.phase).await?;
                self.cache.insert(key, logs.clone());
                logs
            }
        };
        let chunk = Chunk {
            run_id: opts.run_id,
            phase: opts.phase,
            data,
            offset: 0,
        };
        Ok(chunk.cut(&opts))
    }

    /// Persist a chunk. The cache is not touched here; the store's
    /// notification updates it through the event loop.
    pub async fn put(&self, chunk: Chunk) -> Result<()> {
        self.store.put_chunk(&chunk).await?;
        Ok(())
    }

    #[cfg(test)]
    fn cached(&self, run_id: RunId, phase: Phase) -> Option<Vec<u8>> {
        self.cache
            .get(&cache_key(run_id, phase))
            .map(|data| data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::pubsub::{Action, Fetcher};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeChunkStore {
        logs: Mutex<HashMap<(RunId, Phase), Vec<u8>>>,
    }

    #[async_trait]
    impl ChunkStore for FakeChunkStore {
        async fn get_logs(&self, run_id: RunId, phase: Phase) -> Result<Vec<u8>> {
            Ok(self
                .logs
                .lock()
                .unwrap()
                .get(&(run_id, phase))
                .cloned()
                .unwrap_or_default())
        }

        async fn put_chunk(&self, chunk: &Chunk) -> Result<Uuid> {
            let mut logs = self.logs.lock().unwrap();
            let entry = logs.entry((chunk.run_id, chunk.phase)).or_default();
            if chunk.is_start() {
                *entry = chunk.data.clone();
            } else {
                entry.extend_from_slice(&chunk.data);
            }
            Ok(Uuid::new_v4())
        }
    }

    struct NoFetcher;

    #[async_trait]
    impl Fetcher<Chunk> for NoFetcher {
        async fn fetch(&self, id: &str, _action: Action) -> Result<Chunk> {
            Err(CoreError::ResourceNotFound {
                resource: "chunk",
                id: id.to_string(),
            })
        }
    }

    fn proxy() -> (LogsProxy, Arc<FakeChunkStore>) {
        let store = Arc::new(FakeChunkStore::default());
        let broker = Broker::new("logs", Arc::new(NoFetcher));
        (LogsProxy::new(store.clone(), broker), store)
    }

    fn chunk(run_id: RunId, data: &[u8], offset: usize) -> Chunk {
        Chunk {
            run_id,
            phase: Phase::Plan,
            data: data.to_vec(),
            offset,
        }
    }

    #[test]
    fn cut_clips_to_bounds() {
        let run_id = Uuid::new_v4();
        let full = chunk(run_id, b"0123456789", 0);

        let window = full.clone().cut(&GetChunkOptions {
            run_id,
            phase: Phase::Plan,
            offset: 3,
            limit: 4,
        });
        assert_eq!(window.data, b"3456");
        assert_eq!(window.offset, 3);

        // limit of zero reads to the end
        let tail = full.clone().cut(&GetChunkOptions {
            run_id,
            phase: Phase::Plan,
            offset: 7,
            limit: 0,
        });
        assert_eq!(tail.data, b"789");

        // windows past the end clip to empty
        let past = full.clone().cut(&GetChunkOptions {
            run_id,
            phase: Phase::Plan,
            offset: 42,
            limit: 10,
        });
        assert!(past.data.is_empty());

        // limit larger than the remainder clips
        let over = full.cut(&GetChunkOptions {
            run_id,
            phase: Phase::Plan,
            offset: 8,
            limit: 100,
        });
        assert_eq!(over.data, b"89");
    }

    #[tokio::test]
    async fn start_chunk_overwrites_stale_cache() {
        let (proxy, _) = proxy();
        let run_id = Uuid::new_v4();
        proxy
            .cache
            .insert(cache_key(run_id, Phase::Plan), b"stale".to_vec());

        proxy.apply(chunk(run_id, b"new", 0)).await;
        assert_eq!(proxy.cached(run_id, Phase::Plan), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn successive_chunks_append_to_cache_hit() {
        let (proxy, _) = proxy();
        let run_id = Uuid::new_v4();

        proxy.apply(chunk(run_id, b"init", 0)).await;
        proxy.apply(chunk(run_id, b"plan", 4)).await;
        assert_eq!(proxy.cached(run_id, Phase::Plan), Some(b"initplan".to_vec()));
    }

    #[tokio::test]
    async fn cache_miss_backfills_from_store() {
        let (proxy, store) = proxy();
        let run_id = Uuid::new_v4();

        // the store already holds the full log, including the chunk that
        // triggered the notification
        store
            .put_chunk(&chunk(run_id, b"initplan", 0))
            .await
            .unwrap();

        proxy.apply(chunk(run_id, b"plan", 4)).await;
        assert_eq!(proxy.cached(run_id, Phase::Plan), Some(b"initplan".to_vec()));
    }

    #[tokio::test]
    async fn get_falls_back_to_store_and_populates_cache() {
        let (proxy, store) = proxy();
        let run_id = Uuid::new_v4();
        store.put_chunk(&chunk(run_id, b"hello", 0)).await.unwrap();

        let read = proxy
            .get(GetChunkOptions {
                run_id,
                phase: Phase::Plan,
                offset: 0,
                limit: 0,
            })
            .await
            .unwrap();
        assert_eq!(read.data, b"hello");
        assert_eq!(proxy.cached(run_id, Phase::Plan), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn put_does_not_touch_the_cache() {
        let (proxy, store) = proxy();
        let run_id = Uuid::new_v4();

        proxy.put(chunk(run_id, b"init", 0)).await.unwrap();
        assert_eq!(proxy.cached(run_id, Phase::Plan), None);
        assert_eq!(
            store.get_logs(run_id, Phase::Plan).await.unwrap(),
            b"init".to_vec()
        );
    }

    #[tokio::test]
    async fn resync_invalidates_the_whole_cache() {
        let store: Arc<FakeChunkStore> = Arc::new(FakeChunkStore::default());
        let broker: Broker<Chunk> = Broker::new("logs", Arc::new(NoFetcher));
        let proxy = Arc::new(LogsProxy::new(store, broker.clone()));
        let run_id = Uuid::new_v4();
        proxy
            .cache
            .insert(cache_key(run_id, Phase::Plan), b"data".to_vec());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.start(shutdown_rx).await })
        };

        // wait for the worker's subscription before publishing
        while broker.subscriber_count() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        broker.publish(Event::Resync);

        while proxy.cached(run_id, Phase::Plan).is_some() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }
}
