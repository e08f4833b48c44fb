//! The network substrate abstraction.
//!
//! The protocol only needs three things from the network: registering an
//! interest filter on a prefix, expressing an interest and waiting for data,
//! and putting data to satisfy pending interests. [`MemHub`] provides an
//! in-memory implementation with forwarder semantics (content store, pending
//! interest table, multicast filter delivery) for tests and local groups.

use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::error::Error;
use crate::name::Name;
use crate::packet::{Data, Interest, NackReason};
use crate::store::{DataStore, MemoryStore};

/// Channel capacity for interests queued towards one filter.
const FILTER_QUEUE_CAP: usize = 1024;

/// Why an expressed interest returned no data.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ExpressError {
    #[error("nacked: {0}")]
    Nack(NackReason),
    #[error("timed out")]
    Timeout,
    #[error("face closed")]
    Closed,
}

/// Future resolving to the data satisfying an expressed interest. Dropping it
/// cancels the request.
pub type ExpressFuture = BoxFuture<'static, Result<Data, ExpressError>>;

/// Access to the network substrate.
pub trait Face: Send + Sync + 'static {
    /// Register an interest filter. Interests whose names the prefix matches
    /// are delivered to the returned registration until it is dropped.
    fn register(&self, prefix: Name) -> Result<Registration, Error>;

    /// Express an interest and wait for matching data.
    fn express(&self, interest: Interest) -> ExpressFuture;

    /// Publish data: satisfies pending interests and enters caches.
    fn put(&self, data: Data);
}

/// A registered interest filter: a stream of matching interests plus the
/// scoped handle keeping the registration alive.
#[derive(Debug)]
pub struct Registration {
    prefix: Name,
    incoming: mpsc::Receiver<Interest>,
    _handle: FilterHandle,
}

impl Registration {
    pub fn prefix(&self) -> &Name {
        &self.prefix
    }

    /// The next matching interest, or `None` once the face is gone.
    pub async fn next(&mut self) -> Option<Interest> {
        self.incoming.recv().await
    }
}

/// Unregisters the filter on drop.
#[derive(Debug)]
struct FilterHandle {
    hub: Weak<Mutex<HubInner>>,
    id: u64,
}

impl Drop for FilterHandle {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.lock().expect("poisoned").filters.retain(|f| f.id != self.id);
        }
    }
}

struct FilterEntry {
    id: u64,
    face: u64,
    prefix: Name,
    tx: mpsc::Sender<Interest>,
}

struct PendingEntry {
    id: u64,
    interest: Interest,
    tx: oneshot::Sender<Data>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    filters: Vec<FilterEntry>,
    pending: Vec<PendingEntry>,
    content_store: MemoryStore,
}

impl HubInner {
    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// An in-memory forwarder connecting any number of faces.
#[derive(Clone, Default)]
pub struct MemHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new face to this hub.
    pub fn face(&self) -> MemFace {
        let id = self.inner.lock().expect("poisoned").fresh_id();
        MemFace {
            hub: self.inner.clone(),
            id,
        }
    }
}

impl std::fmt::Debug for MemHub {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MemHub").finish_non_exhaustive()
    }
}

/// One attachment point on a [`MemHub`].
#[derive(Clone)]
pub struct MemFace {
    hub: Arc<Mutex<HubInner>>,
    id: u64,
}

impl std::fmt::Debug for MemFace {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MemFace").field("id", &self.id).finish()
    }
}

impl Face for MemFace {
    fn register(&self, prefix: Name) -> Result<Registration, Error> {
        let mut inner = self.hub.lock().expect("poisoned");
        let id = inner.fresh_id();
        let (tx, rx) = mpsc::channel(FILTER_QUEUE_CAP);
        inner.filters.push(FilterEntry {
            id,
            face: self.id,
            prefix: prefix.clone(),
            tx,
        });
        trace!(%prefix, face = self.id, "register filter");
        Ok(Registration {
            prefix,
            incoming: rx,
            _handle: FilterHandle {
                hub: Arc::downgrade(&self.hub),
                id,
            },
        })
    }

    fn express(&self, interest: Interest) -> ExpressFuture {
        let hub = self.hub.clone();
        let face = self.id;
        async move {
            let (pending_id, rx) = {
                let mut inner = hub.lock().expect("poisoned");
                if let Some(data) = inner.content_store.find(&interest) {
                    trace!(name = %interest.name(), "express: content store hit");
                    return Ok(data);
                }
                let mut routed = false;
                for filter in &inner.filters {
                    if filter.face != face && filter.prefix.is_prefix_of(interest.name()) {
                        // A full queue counts as routed; the interest is lost
                        // like on a congested link and the requester retries.
                        let _ = filter.tx.try_send(interest.clone());
                        routed = true;
                    }
                }
                if !routed {
                    trace!(name = %interest.name(), "express: no route");
                    return Err(ExpressError::Nack(NackReason::NoRoute));
                }
                let pending_id = inner.fresh_id();
                let (tx, rx) = oneshot::channel();
                inner.pending.push(PendingEntry {
                    id: pending_id,
                    interest: interest.clone(),
                    tx,
                });
                (pending_id, rx)
            };

            match tokio::time::timeout(interest.lifetime(), rx).await {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(_)) => Err(ExpressError::Closed),
                Err(_) => {
                    let mut inner = hub.lock().expect("poisoned");
                    inner.pending.retain(|p| p.id != pending_id);
                    Err(ExpressError::Timeout)
                }
            }
        }
        .boxed()
    }

    fn put(&self, data: Data) {
        let mut inner = self.hub.lock().expect("poisoned");
        inner.pending.retain(|p| !p.tx.is_closed());
        let mut satisfied = Vec::new();
        let mut index = 0;
        while index < inner.pending.len() {
            if inner.pending[index].interest.matches(&data) {
                satisfied.push(inner.pending.swap_remove(index));
            } else {
                index += 1;
            }
        }
        trace!(name = %data.name(), pending = satisfied.len(), "put");
        if satisfied.is_empty() {
            // Unsolicited data is dropped, like a forwarder would.
            return;
        }
        inner.content_store.insert(data.clone());
        for entry in satisfied {
            let _ = entry.tx.send(data.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn fresh_data(name: &str) -> Data {
        Data::new(Name::from(name), &b"payload"[..]).with_freshness(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn filter_serves_interest() {
        let hub = MemHub::new();
        let producer = hub.face();
        let consumer = hub.face();

        let mut registration = producer.register(Name::from("/node/a")).unwrap();
        let server = tokio::spawn(async move {
            let interest = registration.next().await.unwrap();
            assert_eq!(interest.name(), &Name::from("/node/a/1"));
            producer.put(fresh_data("/node/a/1"));
        });

        let data = consumer
            .express(Interest::new(Name::from("/node/a/1")))
            .await
            .unwrap();
        assert_eq!(data.name(), &Name::from("/node/a/1"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn content_store_answers_repeat_interest() {
        let hub = MemHub::new();
        let producer = hub.face();
        let consumer = hub.face();

        let mut registration = producer.register(Name::from("/node/a")).unwrap();
        let server = tokio::spawn(async move {
            // Serve exactly one interest, then disappear.
            let _ = registration.next().await.unwrap();
            producer.put(fresh_data("/node/a/1"));
        });
        let first = consumer
            .express(Interest::new(Name::from("/node/a/1")))
            .await
            .unwrap();
        server.await.unwrap();

        // The producer is gone; the cached copy answers.
        let second = consumer
            .express(Interest::new(Name::from("/node/a/1")))
            .await
            .unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn unsolicited_data_is_dropped() {
        let hub = MemHub::new();
        let producer = hub.face();
        let consumer = hub.face();
        producer.put(fresh_data("/node/a/1"));

        let err = consumer
            .express(Interest::new(Name::from("/node/a/1")))
            .await
            .unwrap_err();
        assert_eq!(err, ExpressError::Nack(NackReason::NoRoute));
    }

    #[tokio::test]
    async fn no_route_nacks() {
        let hub = MemHub::new();
        let consumer = hub.face();
        let err = consumer
            .express(Interest::new(Name::from("/nowhere")))
            .await
            .unwrap_err();
        assert_eq!(err, ExpressError::Nack(NackReason::NoRoute));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn unanswered_interest_times_out() {
        let hub = MemHub::new();
        let producer = hub.face();
        let consumer = hub.face();
        // Registered but never answered.
        let registration = producer.register(Name::from("/node/a")).unwrap();

        let err = consumer
            .express(
                Interest::new(Name::from("/node/a/1")).with_lifetime(Duration::from_secs(2)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, ExpressError::Timeout);
        drop(registration);
    }

    #[tokio::test]
    async fn dropping_registration_unregisters() {
        let hub = MemHub::new();
        let producer = hub.face();
        let consumer = hub.face();
        let registration = producer.register(Name::from("/node/a")).unwrap();
        drop(registration);

        let err = consumer
            .express(Interest::new(Name::from("/node/a/1")))
            .await
            .unwrap_err();
        assert_eq!(err, ExpressError::Nack(NackReason::NoRoute));
    }

    #[tokio::test]
    async fn interest_multicasts_to_all_matching_filters() {
        let hub = MemHub::new();
        let a = hub.face();
        let b = hub.face();
        let sender = hub.face();

        let mut reg_a = a.register(Name::from("/sync")).unwrap();
        let mut reg_b = b.register(Name::from("/sync")).unwrap();

        let interest =
            Interest::new(Name::from("/sync/v=2")).with_lifetime(Duration::from_millis(1));
        let pending = sender.express(interest);
        // Nobody answers a sync interest; both peers still see it.
        let _ = tokio::time::timeout(Duration::from_millis(50), pending).await;

        assert_eq!(reg_a.next().await.unwrap().name(), &Name::from("/sync/v=2"));
        assert_eq!(reg_b.next().await.unwrap().name(), &Name::from("/sync/v=2"));
    }

    #[tokio::test]
    async fn prefix_interest_matches_segmented_data() {
        let hub = MemHub::new();
        let producer = hub.face();
        let consumer = hub.face();

        let mut registration = producer.register(Name::from("/node/a")).unwrap();
        tokio::spawn(async move {
            let _ = registration.next().await.unwrap();
            producer.put(fresh_data("/node/a/1/v=0/seg=0"));
        });

        let data = consumer
            .express(Interest::new(Name::from("/node/a/1")).with_can_be_prefix(true))
            .await
            .unwrap();
        assert_eq!(data.name(), &Name::from("/node/a/1/v=0/seg=0"));
    }
}
