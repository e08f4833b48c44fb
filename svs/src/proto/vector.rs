//! The version vector: per-producer sequence state.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use bytes::Bytes;

use crate::error::Error;
use crate::name::Name;
use crate::tlv::{self, types, Decoder, Encoder};

/// Per-producer sequence number. Zero means "nothing known"; the first
/// published value is 1.
pub type SeqNo = u64;

/// Maps producer ids to the highest sequence number known for them, and
/// remembers when each entry last advanced locally.
///
/// Iteration is in ascending name order, so the wire encoding of equal
/// vectors is byte-identical across peers. Entries are never removed.
#[derive(Debug, Clone, Default)]
pub struct VersionVector {
    entries: BTreeMap<Name, SeqNo>,
    last_update: BTreeMap<Name, Instant>,
}

impl PartialEq for VersionVector {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for VersionVector {}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sequence number for `id`, zero when unknown.
    pub fn get(&self, id: &Name) -> SeqNo {
        self.entries.get(id).copied().unwrap_or(0)
    }

    pub fn has(&self, id: &Name) -> bool {
        self.entries.contains_key(id)
    }

    /// Raise the entry for `id` to `seq`. Lower or equal values are a no-op;
    /// an entry never decreases. Returns the stored value.
    pub fn set(&mut self, id: &Name, seq: SeqNo) -> SeqNo {
        let entry = self.entries.entry(id.clone()).or_insert(0);
        *entry = (*entry).max(seq);
        *entry
    }

    /// Like [`Self::set`], also recording `now` as the entry's last local
    /// update time when the entry advances.
    pub fn set_at(&mut self, id: &Name, seq: SeqNo, now: Instant) -> SeqNo {
        let entry = self.entries.entry(id.clone()).or_insert(0);
        if seq > *entry {
            *entry = seq;
            self.last_update.insert(id.clone(), now);
        }
        *entry
    }

    /// When the entry for `id` last advanced locally.
    pub fn last_update(&self, id: &Name) -> Option<Instant> {
        self.last_update.get(id).copied()
    }

    /// Fold `other` in, keeping the per-key maximum. Update times are left
    /// untouched.
    pub fn merge_max(&mut self, other: &VersionVector) {
        for (id, seq) in other.iter() {
            self.set(id, seq);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, SeqNo)> {
        self.entries.iter().map(|(id, &seq)| (id, seq))
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &Name> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode as a complete `StateVector` TLV element.
    pub fn encode(&self) -> Bytes {
        let mut enc = Encoder::new();
        enc.element(types::STATE_VECTOR, &self.encode_value());
        enc.finish()
    }

    fn encode_value(&self) -> Bytes {
        let mut enc = Encoder::new();
        for (id, seq) in self.iter() {
            let mut entry = Encoder::new();
            entry.raw(&id.encode());
            entry.non_negative(types::SEQ_NO, seq);
            enc.element(types::STATE_VECTOR_ENTRY, &entry.finish());
        }
        enc.finish()
    }

    /// Decode from a complete `StateVector` TLV element.
    pub fn decode(input: &[u8]) -> Result<VersionVector, Error> {
        let mut dec = Decoder::new(input);
        let value = dec.expect(types::STATE_VECTOR).map_err(Error::InvalidStateVector)?;
        Self::decode_value(value)
    }

    /// Decode from the inner value of a `StateVector` TLV: a sequence of
    /// `StateVectorEntry` elements. Unknown elements at this level abort;
    /// unknown elements inside an entry are skipped.
    pub fn decode_value(value: &[u8]) -> Result<VersionVector, Error> {
        let mut dec = Decoder::new(value);
        let mut vector = VersionVector::new();
        while !dec.is_finished() {
            let entry = dec
                .expect(types::STATE_VECTOR_ENTRY)
                .map_err(Error::InvalidStateVector)?;
            let (id, seq) = Self::decode_entry(entry).map_err(Error::InvalidStateVector)?;
            vector.set(&id, seq);
        }
        Ok(vector)
    }

    fn decode_entry(entry: &[u8]) -> tlv::Result<(Name, SeqNo)> {
        let mut dec = Decoder::new(entry);
        let id = Name::decode_value(dec.expect(types::NAME)?)?;
        let mut seq = None;
        while !dec.is_finished() {
            let (typ, field) = dec.element()?;
            if typ == types::SEQ_NO {
                seq = Some(tlv::parse_non_negative(field)?);
            }
        }
        let seq = seq.ok_or(tlv::Error::UnexpectedType {
            expected: types::SEQ_NO,
            found: 0,
        })?;
        Ok((id, seq))
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (id, seq) in self.iter() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{id}:{seq}")?;
            first = false;
        }
        Ok(())
    }
}
