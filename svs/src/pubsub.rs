//! Publish/subscribe on top of the sync engine.
//!
//! Publications are named by the application; the facade maps them onto
//! `(producer, seq)` pairs, persists them in the local store, splits large
//! payloads into segments, fetches what peers announce, and dispatches
//! arrivals to matching subscriptions. Subscriptions either follow a producer
//! prefix (no mapping needed) or an application name prefix (resolved through
//! the mapping provider).

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, error_span, trace, Instrument};

use crate::core::{CoreOptions, SyncCore, UpdateCallback};
use crate::error::Error;
use crate::face::Face;
use crate::mapping::{
    ExtraBlock, MappingEntry, MappingList, MappingProvider, MAPPING_QUERY_SPAN,
};
use crate::name::{Component, Name};
use crate::packet::{ContentType, Data};
use crate::proto::{MissingRange, SeqNo};
use crate::security::SecurityOptions;
use crate::store::DataStore;
use crate::svsync::{NameScheme, SvSync};

/// Payloads above this size are split into segments.
pub const MAX_PUBLICATION_SIZE: usize = 8000;

/// Retries for publication fetches triggered by sync updates.
const DATA_FETCH_RETRIES: u32 = 12;

/// Retries for individual segment fetches.
const SEGMENT_FETCH_RETRIES: u32 = 3;

/// Retries for mapping queries.
const MAPPING_FETCH_RETRIES: u32 = 3;

/// Additional query rounds when a producer answered with a partial list.
const MAPPING_QUERY_ATTEMPTS: u8 = 2;

/// Default publication freshness: effectively forever.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(10_000 * 365 * 24 * 60 * 60);

/// A delivered publication.
#[derive(Debug, Clone)]
pub struct SubscriptionData {
    /// The signed inner packet (for blobs, the first segment's packet).
    pub data: Data,
    /// The producer that published it.
    pub producer: Name,
    /// The producer-local sequence number.
    pub seq: SeqNo,
    /// The application name of the publication.
    pub name: Name,
    /// The payload: one packet's content, or the whole reassembled blob.
    pub payload: Bytes,
}

/// Called for every delivered publication. Runs on the dispatch path; keep it
/// short and non-blocking.
pub type SubscriptionCallback = Arc<dyn Fn(SubscriptionData) + Send + Sync + 'static>;

/// Tunables for the facade.
#[derive(Debug, Clone, Default)]
pub struct PubSubOptions {
    /// Drop publications whose mapping timestamp is older than this.
    /// Publications without a timestamp always pass.
    pub max_pub_age: Option<Duration>,
    /// Data naming scheme, see [`NameScheme`].
    pub scheme: NameScheme,
    /// Sync engine options.
    pub core: CoreOptions,
}

#[derive(Clone)]
struct Subscription {
    handle: u32,
    prefix: Name,
    cb: SubscriptionCallback,
    prefetch: bool,
    is_packet: bool,
}

#[derive(Default)]
struct PubState {
    next_handle: u32,
    producer_subs: Vec<Subscription>,
    prefix_subs: Vec<Subscription>,
    /// Mappings of fresh local publications, shipped with the next sync
    /// interest.
    notification: MappingList,
    fetching: HashSet<(Name, SeqNo)>,
    // TODO: bound this set; it grows with every received publication.
    received: HashSet<(Name, SeqNo)>,
}

/// Publish/subscribe group member.
pub struct SvsPubSub {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SvsPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SvsPubSub")
            .field("node_id", &self.shared.node_id)
            .finish_non_exhaustive()
    }
}

struct Shared {
    svsync: SvSync,
    mapping: MappingProvider,
    security: SecurityOptions,
    options: PubSubOptions,
    node_id: Name,
    state: Mutex<PubState>,
}

impl SvsPubSub {
    /// Create a group member and start synchronizing.
    pub async fn new(
        face: Arc<dyn Face>,
        sync_prefix: Name,
        node_prefix: Name,
        on_update: UpdateCallback,
        security: SecurityOptions,
        store: Option<Arc<dyn DataStore>>,
        options: PubSubOptions,
    ) -> Result<Self, Error> {
        let (update_tx, mut update_rx) = mpsc::unbounded_channel::<Vec<MissingRange>>();
        let internal_update: UpdateCallback = Box::new(move |missing| {
            let _ = update_tx.send(missing);
        });

        let svsync = SvSync::with_options(
            face.clone(),
            sync_prefix.clone(),
            node_prefix.clone(),
            internal_update,
            security.clone(),
            store,
            options.scheme,
            options.core.clone(),
        )?;
        let mapping =
            MappingProvider::new(face, sync_prefix, node_prefix.clone(), security.clone())?;

        let shared = Arc::new(Shared {
            svsync,
            mapping,
            security,
            options,
            node_id: node_prefix.clone(),
            state: Mutex::new(PubState::default()),
        });

        // Dispatch task: reacts to sync updates, then forwards them to the
        // application. Holds only a weak reference; it ends when the facade
        // is dropped and the engine's callback sender goes away.
        let weak = Arc::downgrade(&shared);
        let span = error_span!("pubsub-dispatch", me = %node_prefix);
        tokio::spawn(
            async move {
                while let Some(missing) = update_rx.recv().await {
                    let Some(shared) = weak.upgrade() else {
                        break;
                    };
                    shared.dispatch(&missing);
                    on_update(missing);
                }
                debug!("dispatch task stopped");
            }
            .instrument(span),
        );

        // Piggyback fresh local mappings on outgoing sync interests, and
        // absorb piggybacked mappings from peers.
        let weak = Arc::downgrade(&shared);
        shared
            .svsync
            .core()
            .set_get_extra(Box::new(move |_vector| {
                let shared = weak.upgrade()?;
                let mut state = shared.state.lock().expect("poisoned");
                if state.notification.is_empty() {
                    return None;
                }
                let list = std::mem::take(&mut state.notification);
                Some(list.encode())
            }))
            .await?;
        let weak = Arc::downgrade(&shared);
        shared
            .svsync
            .core()
            .set_recv_extra(Box::new(move |block| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match MappingList::decode(block) {
                    Ok(list) => shared.mapping.insert_list(&list),
                    // Not a mapping list; some other layer's piggyback.
                    Err(err) => trace!("ignoring extra block: {err}"),
                }
            }))
            .await?;

        shared.svsync.core().start().await?;
        Ok(Self { shared })
    }

    /// The underlying sync engine handle.
    pub fn core(&self) -> &SyncCore {
        self.shared.svsync.core()
    }

    /// Publish `bytes` under an application name. Returns the sequence
    /// number assigned under `nid` (the own node by default).
    ///
    /// Payloads above [`MAX_PUBLICATION_SIZE`] are split into signed
    /// segments named `<name>/v=0/seg=<i>`.
    pub async fn publish(
        &self,
        name: Name,
        bytes: impl Into<Bytes>,
        nid: Option<Name>,
        freshness: Option<Duration>,
        extra_blocks: Vec<ExtraBlock>,
    ) -> Result<SeqNo, Error> {
        let shared = &self.shared;
        let bytes = bytes.into();
        let nid = nid.unwrap_or_else(|| shared.node_id.clone());
        let freshness = freshness.unwrap_or(DEFAULT_FRESHNESS);
        let mut blocks = extra_blocks;
        blocks.push(ExtraBlock::timestamp_micros(now_micros()));

        if bytes.len() > MAX_PUBLICATION_SIZE {
            let count = bytes.len().div_ceil(MAX_PUBLICATION_SIZE) as u64;
            let final_block = Component::segment(count - 1);
            let seq = shared.svsync.core().seq(Some(nid.clone())).await? + 1;
            for (index, offset) in (0..bytes.len()).step_by(MAX_PUBLICATION_SIZE).enumerate() {
                let end = (offset + MAX_PUBLICATION_SIZE).min(bytes.len());
                let segment_name = name
                    .append(Component::version(0))
                    .append(Component::segment(index as u64));
                let mut inner = Data::new(segment_name, bytes.slice(offset..end))
                    .with_freshness(freshness)
                    .with_final_block_id(final_block.clone());
                shared.security.pub_signer.sign_data(&mut inner);
                shared.svsync.insert_data_segment(
                    inner.encode(),
                    freshness,
                    &nid,
                    seq,
                    index as u64,
                    final_block.clone(),
                    ContentType::Data,
                );
            }
            shared.record_mapping(&nid, seq, name, blocks);
            shared.svsync.core().update_seq(seq, Some(nid)).await?;
            Ok(seq)
        } else {
            let mut inner = Data::new(name.clone(), bytes).with_freshness(freshness);
            shared.security.pub_signer.sign_data(&mut inner);
            let seq = shared.svsync.core().seq(Some(nid.clone())).await? + 1;
            shared.record_mapping(&nid, seq, name, blocks);
            let assigned = shared.svsync.publish_packet(inner, Some(nid)).await?;
            debug_assert_eq!(assigned, seq);
            Ok(assigned)
        }
    }

    /// Subscribe to publications whose application name starts with
    /// `prefix`. Requires producers that announce mappings.
    pub fn subscribe(&self, prefix: Name, cb: SubscriptionCallback, packet: bool) -> u32 {
        let mut state = self.shared.state.lock().expect("poisoned");
        let handle = state.fresh_handle();
        state.prefix_subs.push(Subscription {
            handle,
            prefix,
            cb,
            prefetch: false,
            is_packet: packet,
        });
        handle
    }

    /// Subscribe to everything published by producers whose id starts with
    /// `nid_prefix`. Works without the mapping protocol.
    pub fn subscribe_to_producer(
        &self,
        nid_prefix: Name,
        cb: SubscriptionCallback,
        prefetch: bool,
        packet: bool,
    ) -> u32 {
        let mut state = self.shared.state.lock().expect("poisoned");
        let handle = state.fresh_handle();
        state.producer_subs.push(Subscription {
            handle,
            prefix: nid_prefix,
            cb,
            prefetch,
            is_packet: packet,
        });
        handle
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, handle: u32) {
        let mut state = self.shared.state.lock().expect("poisoned");
        state.producer_subs.retain(|s| s.handle != handle);
        state.prefix_subs.retain(|s| s.handle != handle);
    }
}

impl PubState {
    fn fresh_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }
}

impl Shared {
    fn record_mapping(&self, nid: &Name, seq: SeqNo, name: Name, blocks: Vec<ExtraBlock>) {
        let entry = MappingEntry::with_blocks(name, blocks);
        self.mapping.insert_mapping(nid, seq, entry.clone());

        let mut state = self.state.lock().expect("poisoned");
        if state.notification.node_id.is_empty() || &state.notification.node_id == nid {
            state.notification.node_id = nid.clone();
            state.notification.entries.push((seq, entry));
        }
    }

    fn dispatch(self: &Arc<Self>, ranges: &[MissingRange]) {
        for range in ranges {
            trace!(id = %range.id, low = range.low, high = range.high, "dispatch");
            self.dispatch_producer_subs(range);
            self.dispatch_prefix_subs(range);
        }
    }

    fn dispatch_producer_subs(self: &Arc<Self>, range: &MissingRange) {
        let (matched, prefetch) = {
            let state = self.state.lock().expect("poisoned");
            let matched = state
                .producer_subs
                .iter()
                .any(|sub| sub.prefix.is_prefix_of(&range.id));
            let prefetch = state
                .producer_subs
                .iter()
                .any(|sub| sub.prefix.is_prefix_of(&range.id) && sub.prefetch);
            (matched, prefetch)
        };
        if !matched {
            return;
        }
        for seq in range.low..=range.high {
            self.enqueue_fetch(&range.id, seq);
        }
        if prefetch {
            self.enqueue_fetch(&range.id, range.high + 1);
        }
    }

    fn dispatch_prefix_subs(self: &Arc<Self>, range: &MissingRange) {
        if self.state.lock().expect("poisoned").prefix_subs.is_empty() {
            return;
        }
        let mut unresolved = Vec::new();
        for seq in range.low..=range.high {
            match self.mapping.get_mapping(&range.id, seq) {
                Some(entry) => {
                    if self.mapping_passes(&entry) && self.matches_prefix_subs(&entry.name) {
                        self.enqueue_fetch(&range.id, seq);
                    }
                }
                None => unresolved.push(seq),
            }
        }
        for span in contiguous_spans(&unresolved, MAPPING_QUERY_SPAN) {
            self.query_mappings(
                MissingRange {
                    id: range.id.clone(),
                    low: span.0,
                    high: span.1,
                },
                MAPPING_QUERY_ATTEMPTS,
            );
        }
    }

    /// Ask the producer for mappings of a span and fetch whatever matches a
    /// subscription. Partially answered spans are re-queried a bounded
    /// number of times.
    fn query_mappings(self: &Arc<Self>, span: MissingRange, attempts_left: u8) {
        let weak = Arc::downgrade(self);
        let requested = span.clone();
        self.mapping.fetch_mappings(
            &span,
            Box::new(move |list| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let mut covered = HashSet::new();
                for (seq, entry) in &list.entries {
                    covered.insert(*seq);
                    if shared.mapping_passes(entry) && shared.matches_prefix_subs(&entry.name) {
                        shared.enqueue_fetch(&list.node_id, *seq);
                    }
                }
                if attempts_left > 0 {
                    let missing: Vec<SeqNo> = (requested.low..=requested.high)
                        .filter(|seq| !covered.contains(seq))
                        .collect();
                    for span in contiguous_spans(&missing, MAPPING_QUERY_SPAN) {
                        shared.query_mappings(
                            MissingRange {
                                id: requested.id.clone(),
                                low: span.0,
                                high: span.1,
                            },
                            attempts_left - 1,
                        );
                    }
                }
            }),
            MAPPING_FETCH_RETRIES,
        );
    }

    /// Apply the max-age filter: a mapping with a timestamp older than the
    /// limit is not fetched at all.
    fn mapping_passes(&self, entry: &MappingEntry) -> bool {
        let Some(max_age) = self.options.max_pub_age else {
            return true;
        };
        let Some(timestamp) = entry.timestamp_micros() else {
            return true;
        };
        let age = now_micros().saturating_sub(timestamp);
        age as u128 <= max_age.as_micros()
    }

    fn matches_prefix_subs(&self, name: &Name) -> bool {
        self.state
            .lock()
            .expect("poisoned")
            .prefix_subs
            .iter()
            .any(|sub| sub.prefix.is_prefix_of(name))
    }

    fn enqueue_fetch(self: &Arc<Self>, nid: &Name, seq: SeqNo) {
        {
            let mut state = self.state.lock().expect("poisoned");
            let key = (nid.clone(), seq);
            if state.received.contains(&key) || !state.fetching.insert(key) {
                return;
            }
        }
        trace!(%nid, seq, "fetch publication");
        let weak = Arc::downgrade(self);
        let nid_data = nid.clone();
        let weak_fail = Arc::downgrade(self);
        let nid_fail = nid.clone();
        self.svsync.fetch_with(
            nid,
            seq,
            DATA_FETCH_RETRIES,
            move |outer| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_sync_data(nid_data, seq, outer);
                }
            },
            move |failure| {
                debug!(seq, "publication fetch failed: {failure:?}");
                if let Some(shared) = weak_fail.upgrade() {
                    shared.finish_fetch(&nid_fail, seq);
                }
            },
        );
    }

    /// First packet for `(nid, seq)` arrived.
    fn on_sync_data(self: Arc<Self>, nid: Name, seq: SeqNo, outer: Data) {
        {
            let mut state = self.state.lock().expect("poisoned");
            if !state.received.insert((nid.clone(), seq)) {
                return;
            }
        }
        if outer.content_type() != ContentType::Data {
            debug!(%nid, seq, "dropping publication without encapsulation");
            self.finish_fetch(&nid, seq);
            return;
        }
        let inner = match Data::decode(outer.content()) {
            Ok(inner) => inner,
            Err(err) => {
                debug!(%nid, seq, "dropping undecodable publication: {err}");
                self.finish_fetch(&nid, seq);
                return;
            }
        };
        let app_name = strip_segment_suffix(inner.name());

        // Remember the mapping if the producer never told us.
        if self.mapping.get_mapping(&nid, seq).is_none() {
            self.mapping
                .insert_mapping(&nid, seq, MappingEntry::new(app_name.clone()));
        }

        if !self.validate_publication(&inner) {
            debug!(%nid, seq, "dropping publication failing validation");
            self.finish_fetch(&nid, seq);
            return;
        }

        let subs = self.matching_subscriptions(&nid, &app_name);
        if subs.is_empty() {
            self.finish_fetch(&nid, seq);
            return;
        }

        // Packet subscribers always get the arrived packet as-is.
        for sub in subs.iter().filter(|s| s.is_packet) {
            deliver(sub, &inner, &nid, seq, &app_name, inner.content().clone());
        }

        match inner.final_block_id() {
            None => {
                for sub in subs.iter().filter(|s| !s.is_packet) {
                    deliver(sub, &inner, &nid, seq, &app_name, inner.content().clone());
                }
                self.finish_fetch(&nid, seq);
            }
            Some(_) => {
                // Segmented: collect the remaining segments in the
                // background, delivering each to packet subscribers and the
                // assembled blob once to the rest.
                let shared = self.clone();
                let span = error_span!("segments", %nid, seq);
                tokio::spawn(
                    async move {
                        if let Err(err) =
                            shared.fetch_segments(&nid, seq, inner, &subs).await
                        {
                            debug!("segment assembly aborted: {err}");
                        }
                        shared.finish_fetch(&nid, seq);
                    }
                    .instrument(span),
                );
            }
        }
    }

    /// Retrieve all segments of a segmented publication. Returns an error
    /// when any segment cannot be fetched or validated; blob delivery is
    /// aborted in that case.
    async fn fetch_segments(
        self: &Arc<Self>,
        nid: &Name,
        seq: SeqNo,
        first: Data,
        subs: &[Subscription],
    ) -> Result<(), Error> {
        let app_name = strip_segment_suffix(first.name());
        let failure = || Error::SegmentAssemblyFailure(app_name.clone());
        let final_seg = first
            .final_block_id()
            .and_then(Component::as_segment)
            .ok_or_else(failure)?;
        let first_seg = first
            .name()
            .get_back(0)
            .and_then(Component::as_segment)
            .ok_or_else(failure)?;

        let mut segments: Vec<Option<Data>> = vec![None; final_seg as usize + 1];
        *segments.get_mut(first_seg as usize).ok_or_else(failure)? = Some(first);

        let base = self.svsync.data_name(nid, seq).append(Component::version(0));
        for index in 0..=final_seg {
            if segments[index as usize].is_some() {
                continue;
            }
            let outer_name = base.append(Component::segment(index));
            let (tx, rx) = tokio::sync::oneshot::channel();
            self.svsync.fetch_name(
                outer_name,
                SEGMENT_FETCH_RETRIES,
                move |data| {
                    tx.send(data).ok();
                },
                |failure| debug!("segment fetch failed: {failure:?}"),
            );
            let outer = rx.await.map_err(|_| failure())?;
            if outer.content_type() != ContentType::Data {
                return Err(failure());
            }
            let inner = Data::decode(outer.content()).map_err(|_| failure())?;
            if !self.validate_publication(&inner) {
                return Err(failure());
            }
            for sub in subs.iter().filter(|s| s.is_packet) {
                deliver(sub, &inner, nid, seq, &app_name, inner.content().clone());
            }
            segments[index as usize] = Some(inner);
        }

        let blob_subs: Vec<&Subscription> = subs.iter().filter(|s| !s.is_packet).collect();
        if blob_subs.is_empty() {
            return Ok(());
        }
        let mut payload = BytesMut::new();
        for segment in &segments {
            payload.extend_from_slice(segment.as_ref().ok_or_else(failure)?.content());
        }
        let payload = payload.freeze();
        let representative = segments[0].clone().ok_or_else(failure)?;
        for sub in blob_subs {
            deliver(sub, &representative, nid, seq, &app_name, payload.clone());
        }
        Ok(())
    }

    fn validate_publication(&self, inner: &Data) -> bool {
        self.security
            .encapsulated_data_validator
            .as_ref()
            .map_or(true, |v| v.verify_data(inner))
    }

    /// All subscriptions this publication must reach.
    fn matching_subscriptions(&self, nid: &Name, app_name: &Name) -> Vec<Subscription> {
        let state = self.state.lock().expect("poisoned");
        let mut subs: Vec<Subscription> = state
            .producer_subs
            .iter()
            .filter(|sub| sub.prefix.is_prefix_of(nid))
            .cloned()
            .collect();
        subs.extend(
            state
                .prefix_subs
                .iter()
                .filter(|sub| sub.prefix.is_prefix_of(app_name))
                .cloned(),
        );
        subs
    }

    fn finish_fetch(&self, nid: &Name, seq: SeqNo) {
        self.state
            .lock()
            .expect("poisoned")
            .fetching
            .remove(&(nid.clone(), seq));
    }
}

fn deliver(
    sub: &Subscription,
    data: &Data,
    producer: &Name,
    seq: SeqNo,
    app_name: &Name,
    payload: Bytes,
) {
    (sub.cb)(SubscriptionData {
        data: data.clone(),
        producer: producer.clone(),
        seq,
        name: app_name.clone(),
        payload,
    });
}

/// Strip the trailing `/v=<n>/seg=<n>` of a segment name.
fn strip_segment_suffix(name: &Name) -> Name {
    let segmented = name.len() >= 2
        && name.get_back(0).and_then(Component::as_segment).is_some()
        && name.get_back(1).and_then(Component::as_version).is_some();
    if segmented {
        name.prefix(name.len() - 2)
    } else {
        name.clone()
    }
}

/// Group maximal runs of consecutive numbers, capped at `max_len` each.
fn contiguous_spans(seqs: &[SeqNo], max_len: SeqNo) -> Vec<(SeqNo, SeqNo)> {
    let mut spans = Vec::new();
    let mut iter = seqs.iter().copied();
    let Some(mut start) = iter.next() else {
        return spans;
    };
    let mut end = start;
    for seq in iter {
        if seq == end + 1 && seq - start + 1 <= max_len {
            end = seq;
        } else {
            spans.push((start, end));
            start = seq;
            end = seq;
        }
    }
    spans.push((start, end));
    spans
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
