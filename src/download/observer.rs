// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Snapshot fan-out to observers.
//!
//! Two ways to observe the registry, both seeing the same ordered sequence
//! of snapshots:
//!
//! - [`SnapshotHub::subscribe`]: a callback, invoked immediately with the
//!   current snapshot and then synchronously on every publish.
//! - [`SnapshotHub::events`]: a [`SnapshotStream`] over a broadcast channel,
//!   for async consumers.
//!
//! The empty placeholder held before the first publish is never delivered.
//! An observer attached that early gets the first published snapshot first.
//!
//! Callbacks must not call `subscribe` or `events` from inside the callback.
//! Reading snapshots, unsubscribing and issuing registry commands are fine.

use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::types::DownloadItem;
use crate::locks::{resilient_lock, resilient_read, resilient_write};

/// Broadcast buffer per stream consumer.
const EVENT_CAPACITY: usize = 64;

/// Immutable view of the whole collection at one revision.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    revision: u64,
    items: Arc<Vec<DownloadItem>>,
}

impl Snapshot {
    /// Monotonically increasing; 0 is the empty pre-initialization snapshot.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn items(&self) -> &[DownloadItem] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&DownloadItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn to_vec(&self) -> Vec<DownloadItem> {
        self.items.as_ref().clone()
    }
}

impl Deref for Snapshot {
    type Target = [DownloadItem];

    fn deref(&self) -> &Self::Target {
        &self.items
    }
}

type Callback = Arc<dyn Fn(&Snapshot) + Send + Sync>;

struct HubState {
    current: Snapshot,
    subscribers: Vec<(u64, Callback)>,
    next_subscriber: u64,
}

/// Holds the latest snapshot and fans new ones out to observers.
pub struct SnapshotHub {
    state: RwLock<HubState>,
    /// Serializes publish/subscribe so observers see revisions in order.
    dispatch: Mutex<()>,
    events: broadcast::Sender<Snapshot>,
}

impl SnapshotHub {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            state: RwLock::new(HubState {
                current: Snapshot::default(),
                subscribers: Vec::new(),
                next_subscriber: 0,
            }),
            dispatch: Mutex::new(()),
            events,
        })
    }

    /// The latest published snapshot.
    pub fn current(&self) -> Snapshot {
        resilient_read(&self.state).current.clone()
    }

    /// Replace the current snapshot and notify every observer.
    pub fn publish(&self, items: Vec<DownloadItem>) -> Snapshot {
        let _dispatch = resilient_lock(&self.dispatch);

        let (snapshot, subscribers) = {
            let mut state = resilient_write(&self.state);
            state.current = Snapshot {
                revision: state.current.revision + 1,
                items: Arc::new(items),
            };
            let subscribers: Vec<Callback> =
                state.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect();
            (state.current.clone(), subscribers)
        };

        for callback in &subscribers {
            invoke(callback, &snapshot);
        }
        // No stream consumers is not an error.
        let _ = self.events.send(snapshot.clone());

        snapshot
    }

    /// Register a callback. It runs once right away with the current
    /// snapshot, then after every state change until unsubscribed.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&Snapshot) + Send + Sync + 'static,
    ) -> Subscription {
        let _dispatch = resilient_lock(&self.dispatch);
        let callback: Callback = Arc::new(callback);

        let (id, current) = {
            let mut state = resilient_write(&self.state);
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state.subscribers.push((id, Arc::clone(&callback)));
            (id, state.current.clone())
        };

        if current.revision() > 0 {
            invoke(&callback, &current);
        }

        Subscription {
            id,
            hub: Arc::downgrade(self),
            active: AtomicBool::new(true),
        }
    }

    /// An async stream starting with the current snapshot.
    pub fn events(&self) -> SnapshotStream {
        let _dispatch = resilient_lock(&self.dispatch);
        let rx = self.events.subscribe();
        let current = self.current();
        SnapshotStream {
            pending: (current.revision() > 0).then_some(current),
            inner: BroadcastStream::new(rx),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        resilient_read(&self.state).subscribers.len()
    }

    fn remove(&self, id: u64) {
        resilient_write(&self.state)
            .subscribers
            .retain(|(subscriber, _)| *subscriber != id);
    }
}

fn invoke(callback: &Callback, snapshot: &Snapshot) {
    if catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
        tracing::error!(
            revision = snapshot.revision(),
            "Download observer panicked; continuing with remaining observers"
        );
    }
}

/// Returned by [`SnapshotHub::subscribe`].
///
/// Dropping it does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    id: u64,
    hub: Weak<SnapshotHub>,
    active: AtomicBool,
}

impl Subscription {
    /// Stop receiving snapshots. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            if let Some(hub) = self.hub.upgrade() {
                hub.remove(self.id);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Snapshots as an async stream: the current one first, then every publish.
///
/// A consumer that falls more than the channel capacity behind skips the
/// snapshots it missed and carries on with the ones still buffered.
pub struct SnapshotStream {
    pending: Option<Snapshot>,
    inner: BroadcastStream<Snapshot>,
}

impl SnapshotStream {
    /// Next snapshot, or `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<Snapshot> {
        self.next().await
    }

    /// Wait for the first snapshot satisfying `predicate`.
    pub async fn wait_for(&mut self, mut predicate: impl FnMut(&Snapshot) -> bool) -> Option<Snapshot> {
        while let Some(snapshot) = self.recv().await {
            if predicate(&snapshot) {
                return Some(snapshot);
            }
        }
        None
    }
}

impl Stream for SnapshotStream {
    type Item = Snapshot;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(snapshot) = this.pending.take() {
            return Poll::Ready(Some(snapshot));
        }
        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(snapshot))) => return Poll::Ready(Some(snapshot)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    tracing::debug!(skipped, "Snapshot stream lagged");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
