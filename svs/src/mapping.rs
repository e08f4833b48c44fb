//! Mapping between `(producer, seq)` and application publication names.
//!
//! The sync engine only says *who* has *how many* publications; this layer
//! remembers *what name* each of them carries. Local publications register
//! their mapping here; remote ones arrive either piggybacked on sync
//! interests or through the query protocol
//! `<nid>/<sync_prefix>/MAPPING/<low>/<high>`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, trace, Instrument};

use crate::error::Error;
use crate::face::Face;
use crate::fetcher::{FetchRequest, Fetcher};
use crate::name::{Component, Name};
use crate::packet::{Data, Interest};
use crate::proto::{MissingRange, SeqNo};
use crate::security::SecurityOptions;
use crate::tlv::{self, types, Decoder, Encoder};

/// Requester-side cap on entries per mapping query. Larger ranges are
/// covered by chained queries.
pub const MAPPING_QUERY_SPAN: SeqNo = 11;

/// Freshness of mapping reply data.
const MAPPING_REPLY_FRESHNESS: Duration = Duration::from_secs(1);

/// An opaque typed block attached to a mapping entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraBlock {
    pub typ: u64,
    pub value: Bytes,
}

impl ExtraBlock {
    /// The well-known block carrying the publication time in microseconds
    /// since the unix epoch.
    pub fn timestamp_micros(micros: u64) -> Self {
        let value = if micros <= u8::MAX as u64 {
            Bytes::copy_from_slice(&[micros as u8])
        } else if micros <= u16::MAX as u64 {
            Bytes::copy_from_slice(&(micros as u16).to_be_bytes())
        } else if micros <= u32::MAX as u64 {
            Bytes::copy_from_slice(&(micros as u32).to_be_bytes())
        } else {
            Bytes::copy_from_slice(&micros.to_be_bytes())
        };
        Self {
            typ: types::TIMESTAMP,
            value,
        }
    }

    pub fn as_timestamp_micros(&self) -> Option<u64> {
        if self.typ != types::TIMESTAMP {
            return None;
        }
        tlv::parse_non_negative(&self.value).ok()
    }
}

/// One mapping: the application name of a publication plus optional blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub name: Name,
    pub blocks: Vec<ExtraBlock>,
}

impl MappingEntry {
    pub fn new(name: Name) -> Self {
        Self {
            name,
            blocks: Vec::new(),
        }
    }

    pub fn with_blocks(name: Name, blocks: Vec<ExtraBlock>) -> Self {
        Self { name, blocks }
    }

    /// The publication timestamp, if a timestamp block is attached.
    pub fn timestamp_micros(&self) -> Option<u64> {
        self.blocks.iter().find_map(ExtraBlock::as_timestamp_micros)
    }
}

/// A list of mappings from one producer, as carried in mapping replies and
/// piggybacked on sync interests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingList {
    pub node_id: Name,
    pub entries: Vec<(SeqNo, MappingEntry)>,
}

impl MappingList {
    pub fn new(node_id: Name) -> Self {
        Self {
            node_id,
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode as a complete `MappingData` TLV element.
    pub fn encode(&self) -> Bytes {
        let mut value = Encoder::new();
        value.raw(&self.node_id.encode());
        for (seq, entry) in &self.entries {
            let mut inner = Encoder::new();
            inner.non_negative(types::SEQ_NO, *seq);
            inner.raw(&entry.name.encode());
            for block in &entry.blocks {
                inner.element(block.typ, &block.value);
            }
            value.element(types::MAPPING_ENTRY, &inner.finish());
        }
        let mut enc = Encoder::new();
        enc.element(types::MAPPING_DATA, &value.finish());
        enc.finish()
    }

    /// Decode from a complete `MappingData` TLV element.
    pub fn decode(input: &[u8]) -> Result<Self, Error> {
        let mut outer = Decoder::new(input);
        let value = outer
            .expect(types::MAPPING_DATA)
            .map_err(Error::MalformedMapping)?;
        let mut dec = Decoder::new(value);
        let node_id = Name::decode_value(dec.expect(types::NAME).map_err(Error::MalformedMapping)?)
            .map_err(Error::MalformedMapping)?;
        let mut list = MappingList::new(node_id);
        while !dec.is_finished() {
            let (typ, entry) = dec.element().map_err(Error::MalformedMapping)?;
            if typ != types::MAPPING_ENTRY {
                continue;
            }
            list.entries
                .push(Self::decode_entry(entry).map_err(Error::MalformedMapping)?);
        }
        Ok(list)
    }

    fn decode_entry(entry: &[u8]) -> tlv::Result<(SeqNo, MappingEntry)> {
        let mut dec = Decoder::new(entry);
        let seq = tlv::parse_non_negative(dec.expect(types::SEQ_NO)?)?;
        let name = Name::decode_value(dec.expect(types::NAME)?)?;
        let mut blocks = Vec::new();
        while !dec.is_finished() {
            let (typ, value) = dec.element()?;
            blocks.push(ExtraBlock {
                typ,
                value: Bytes::copy_from_slice(value),
            });
        }
        Ok((seq, MappingEntry { name, blocks }))
    }
}

/// Called with the mappings a query returned.
pub type MappingListCallback = Box<dyn FnOnce(MappingList) + Send + 'static>;

/// Stores mappings and answers/issues mapping queries.
pub struct MappingProvider {
    map: Arc<Mutex<BTreeMap<(Name, SeqNo), MappingEntry>>>,
    fetcher: Fetcher,
    sync_prefix: Name,
    node_id: Name,
    _serve_guard: tokio_util::sync::DropGuard,
}

impl std::fmt::Debug for MappingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MappingProvider")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl MappingProvider {
    pub fn new(
        face: Arc<dyn Face>,
        sync_prefix: Name,
        node_id: Name,
        security: SecurityOptions,
    ) -> Result<Self, Error> {
        let query_prefix = node_id
            .append_name(&sync_prefix)
            .append(Component::from("MAPPING"));
        let registration = face
            .register(query_prefix.clone())
            .map_err(|_| Error::PrefixRegistrationFailed(query_prefix))?;

        let map: Arc<Mutex<BTreeMap<(Name, SeqNo), MappingEntry>>> = Default::default();
        let cancel = CancellationToken::new();

        let serve_map = map.clone();
        let serve_face = face.clone();
        let serve_cancel = cancel.clone();
        let serve_security = security.clone();
        let serve_sync_prefix = sync_prefix.clone();
        let span = error_span!("mapping-serve", me = %node_id);
        tokio::spawn(
            async move {
                let mut registration = registration;
                loop {
                    let interest = tokio::select! {
                        _ = serve_cancel.cancelled() => break,
                        interest = registration.next() => match interest {
                            Some(interest) => interest,
                            None => break,
                        },
                    };
                    Self::answer_query(
                        &serve_map,
                        &serve_face,
                        &serve_security,
                        &serve_sync_prefix,
                        &interest,
                    );
                }
                debug!("mapping query handler stopped");
            }
            .instrument(span),
        );

        let fetcher = Fetcher::new(face, &security);
        Ok(Self {
            map,
            fetcher,
            sync_prefix,
            node_id,
            _serve_guard: cancel.drop_guard(),
        })
    }

    /// Remember a mapping.
    pub fn insert_mapping(&self, nid: &Name, seq: SeqNo, entry: MappingEntry) {
        self.map
            .lock()
            .expect("poisoned")
            .insert((nid.clone(), seq), entry);
    }

    /// Look up a mapping.
    pub fn get_mapping(&self, nid: &Name, seq: SeqNo) -> Option<MappingEntry> {
        self.map
            .lock()
            .expect("poisoned")
            .get(&(nid.clone(), seq))
            .cloned()
    }

    /// Absorb all mappings of a received list.
    pub fn insert_list(&self, list: &MappingList) {
        let mut map = self.map.lock().expect("poisoned");
        for (seq, entry) in &list.entries {
            map.insert((list.node_id.clone(), *seq), entry.clone());
        }
    }

    /// The query name for a range: `<nid>/<sync_prefix>/MAPPING/<low>/<high>`.
    pub fn query_name(&self, range: &MissingRange) -> Name {
        range
            .id
            .append_name(&self.sync_prefix)
            .append(Component::from("MAPPING"))
            .append_number(range.low)
            .append_number(range.high)
    }

    /// Query the producer for the mappings of a range. Received entries are
    /// absorbed into the local store before the callback runs.
    ///
    /// Queries should stay within [`MAPPING_QUERY_SPAN`] entries; chain
    /// queries to cover more.
    pub fn fetch_mappings(
        &self,
        range: &MissingRange,
        on_list: MappingListCallback,
        n_retries: u32,
    ) {
        let interest = Interest::new(self.query_name(range)).with_must_be_fresh(true);
        let map = self.map.clone();
        let request = FetchRequest::new(interest, move |data: Data| match MappingList::decode(
            data.content(),
        ) {
            Ok(list) => {
                let mut guard = map.lock().expect("poisoned");
                for (seq, entry) in &list.entries {
                    guard.insert((list.node_id.clone(), *seq), entry.clone());
                }
                drop(guard);
                on_list(list);
            }
            Err(err) => debug!("dropping mapping reply: {err}"),
        })
        .with_retries(n_retries);
        self.fetcher.express(request);
    }

    fn answer_query(
        map: &Mutex<BTreeMap<(Name, SeqNo), MappingEntry>>,
        face: &Arc<dyn Face>,
        security: &SecurityOptions,
        sync_prefix: &Name,
        interest: &Interest,
    ) {
        let Some(query) = parse_query_name(interest.name(), sync_prefix) else {
            trace!(name = %interest.name(), "ignoring malformed mapping query");
            return;
        };
        let mut list = MappingList::new(query.id.clone());
        {
            let map = map.lock().expect("poisoned");
            for seq in query.low..=query.high.max(query.low) {
                if let Some(entry) = map.get(&(query.id.clone(), seq)) {
                    list.entries.push((seq, entry.clone()));
                }
            }
        }
        trace!(name = %interest.name(), entries = list.entries.len(), "answering mapping query");
        let mut data = Data::new(interest.name().clone(), list.encode())
            .with_freshness(MAPPING_REPLY_FRESHNESS);
        security.data_signer.sign_data(&mut data);
        face.put(data);
    }
}

/// Parse `<nid>/<sync_prefix>/MAPPING/<low>/<high>`.
fn parse_query_name(name: &Name, sync_prefix: &Name) -> Option<MissingRange> {
    let fixed = sync_prefix.len() + 3;
    if name.len() < fixed {
        return None;
    }
    let low = name.get_back(1)?.as_number()?;
    let high = name.get_back(0)?.as_number()?;
    let id = name.prefix(name.len() - fixed);
    Some(MissingRange { id, low, high })
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;
    use crate::face::MemHub;

    fn provider(hub: &MemHub, id: &str) -> MappingProvider {
        MappingProvider::new(
            Arc::new(hub.face()),
            Name::from("/sync/group"),
            Name::from(id),
            SecurityOptions::default(),
        )
        .unwrap()
    }

    fn entry(name: &str) -> MappingEntry {
        MappingEntry::new(Name::from(name))
    }

    #[test]
    fn mapping_list_roundtrip() {
        let mut list = MappingList::new(Name::from("/node/a"));
        list.entries.push((1, entry("/chat/alice/one")));
        list.entries.push((
            2,
            MappingEntry::with_blocks(
                Name::from("/chat/alice/two"),
                vec![ExtraBlock::timestamp_micros(1_700_000_000_000_000)],
            ),
        ));
        let decoded = MappingList::decode(&list.encode()).unwrap();
        assert_eq!(decoded, list);
        assert_eq!(
            decoded.entries[1].1.timestamp_micros(),
            Some(1_700_000_000_000_000)
        );
        assert_eq!(decoded.entries[0].1.timestamp_micros(), None);
    }

    #[test]
    fn mapping_list_rejects_garbage() {
        assert!(matches!(
            MappingList::decode(&[1, 2, 3]),
            Err(Error::MalformedMapping(_))
        ));
    }

    #[test]
    fn query_name_roundtrip() {
        let range = MissingRange {
            id: Name::from("/node/a"),
            low: 3,
            high: 9,
        };
        let sync_prefix = Name::from("/sync/group");
        let name = range
            .id
            .append_name(&sync_prefix)
            .append(Component::from("MAPPING"))
            .append_number(3)
            .append_number(9);
        let parsed = parse_query_name(&name, &sync_prefix).unwrap();
        assert_eq!(parsed, range);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn query_protocol_roundtrip() {
        let hub = MemHub::new();
        let producer = provider(&hub, "/node/a");
        let requester = provider(&hub, "/node/b");

        for seq in 1..=3 {
            producer.insert_mapping(
                &Name::from("/node/a"),
                seq,
                entry(&format!("/chat/alice/{seq}")),
            );
        }

        let (tx, rx) = oneshot::channel();
        requester.fetch_mappings(
            &MissingRange {
                id: Name::from("/node/a"),
                low: 1,
                high: 3,
            },
            Box::new(move |list| {
                tx.send(list).ok();
            }),
            1,
        );
        let list = rx.await.unwrap();
        assert_eq!(list.node_id, Name::from("/node/a"));
        assert_eq!(list.entries.len(), 3);
        assert_eq!(list.entries[2].1.name, Name::from("/chat/alice/3"));

        // Received mappings were absorbed locally.
        assert_eq!(
            requester.get_mapping(&Name::from("/node/a"), 2),
            Some(entry("/chat/alice/2"))
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn query_returns_known_subset() {
        let hub = MemHub::new();
        let producer = provider(&hub, "/node/a");
        let requester = provider(&hub, "/node/b");

        producer.insert_mapping(&Name::from("/node/a"), 1, entry("/chat/one"));
        producer.insert_mapping(&Name::from("/node/a"), 3, entry("/chat/three"));

        let (tx, rx) = oneshot::channel();
        requester.fetch_mappings(
            &MissingRange {
                id: Name::from("/node/a"),
                low: 1,
                high: 4,
            },
            Box::new(move |list| {
                tx.send(list).ok();
            }),
            1,
        );
        let list = rx.await.unwrap();
        let seqs: Vec<SeqNo> = list.entries.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![1, 3]);
    }
}
