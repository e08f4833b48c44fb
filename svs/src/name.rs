//! Hierarchical names: ordered sequences of opaque byte components.
//!
//! Names identify producers, publications and interest filters. Ordering is
//! lexicographic by component, byte-wise within a component, which makes the
//! wire encoding of sorted name collections reproducible across peers.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use derive_more::From;

use crate::tlv::{self, types, Decoder, Encoder};

/// One opaque name component.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, From)]
pub struct Component(Bytes);

impl Component {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// A component carrying a non-negative integer in shortest big-endian form.
    pub fn number(n: u64) -> Self {
        let bytes = n.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
        Self(Bytes::copy_from_slice(&bytes[skip..]))
    }

    /// The version component used for segmented publications, `v=<n>`.
    pub fn version(n: u64) -> Self {
        Self(format!("v={n}").into())
    }

    /// The segment component used for segmented publications, `seg=<n>`.
    pub fn segment(n: u64) -> Self {
        Self(format!("seg={n}").into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parse as a shortest-form big-endian integer.
    pub fn as_number(&self) -> Option<u64> {
        if self.0.is_empty() || self.0.len() > 8 {
            return None;
        }
        let mut n = 0u64;
        for &b in self.0.iter() {
            n = n << 8 | b as u64;
        }
        Some(n)
    }

    /// Parse a `seg=<n>` component.
    pub fn as_segment(&self) -> Option<u64> {
        let text = std::str::from_utf8(&self.0).ok()?;
        text.strip_prefix("seg=")?.parse().ok()
    }

    /// Parse a `v=<n>` component.
    pub fn as_version(&self) -> Option<u64> {
        let text = std::str::from_utf8(&self.0).ok()?;
        text.strip_prefix("v=")?.parse().ok()
    }
}

impl From<&str> for Component {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<&[u8]> for Component {
    fn from(value: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(value))
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &b in self.0.iter() {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~' | b'=') {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "%{}", data_encoding::HEXUPPER.encode(&[b]))?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// A hierarchical name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Name {
    components: Vec<Component>,
}

impl Name {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_components(components: Vec<Component>) -> Self {
        Self { components }
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Component> {
        self.components.get(index)
    }

    /// Component counted from the back: `get_back(0)` is the last component.
    pub fn get_back(&self, index: usize) -> Option<&Component> {
        self.components.iter().rev().nth(index)
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.iter()
    }

    /// The first `len` components as a new name.
    pub fn prefix(&self, len: usize) -> Name {
        Self {
            components: self.components[..len.min(self.components.len())].to_vec(),
        }
    }

    /// True if every component of `self` matches the front of `other`.
    pub fn is_prefix_of(&self, other: &Name) -> bool {
        other.components.len() >= self.components.len()
            && self
                .components
                .iter()
                .zip(other.components.iter())
                .all(|(a, b)| a == b)
    }

    #[must_use]
    pub fn append(&self, component: Component) -> Name {
        let mut components = self.components.clone();
        components.push(component);
        Self { components }
    }

    #[must_use]
    pub fn append_name(&self, other: &Name) -> Name {
        let mut components = self.components.clone();
        components.extend(other.components.iter().cloned());
        Self { components }
    }

    #[must_use]
    pub fn append_number(&self, n: u64) -> Name {
        self.append(Component::number(n))
    }

    /// Encode as a `Name` TLV element.
    pub fn encode(&self) -> Bytes {
        let mut enc = Encoder::new();
        enc.element(types::NAME, &self.encode_value());
        enc.finish()
    }

    /// The inner value of the `Name` TLV: concatenated component elements.
    pub fn encode_value(&self) -> Bytes {
        let mut enc = Encoder::new();
        for component in &self.components {
            enc.element(types::NAME_COMPONENT, component.as_bytes());
        }
        enc.finish()
    }

    /// Decode from a complete `Name` TLV element.
    pub fn decode(input: &[u8]) -> tlv::Result<Name> {
        let mut dec = Decoder::new(input);
        let value = dec.expect(types::NAME)?;
        if !dec.is_finished() {
            return Err(tlv::Error::TrailingBytes);
        }
        Self::decode_value(value)
    }

    /// Decode from the inner value of a `Name` TLV.
    pub fn decode_value(value: &[u8]) -> tlv::Result<Name> {
        let mut dec = Decoder::new(value);
        let mut components = Vec::new();
        while !dec.is_finished() {
            let bytes = dec.expect(types::NAME_COMPONENT)?;
            components.push(Component(Bytes::copy_from_slice(bytes)));
        }
        Ok(Self { components })
    }
}

impl From<&str> for Name {
    /// Build a name from a `/`-separated path. Empty segments are dropped, so
    /// `"/alice/chat"` and `"alice/chat"` are the same name.
    fn from(value: &str) -> Self {
        Self {
            components: value
                .split('/')
                .filter(|s| !s.is_empty())
                .map(Component::from)
                .collect(),
        }
    }
}

impl FromStr for Name {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.components.is_empty() {
            return write!(f, "/");
        }
        for component in &self.components {
            write!(f, "/{component}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_display() {
        let name = Name::from("/chat/alice").append_number(3);
        assert_eq!(name.len(), 3);
        assert_eq!(name.to_string(), "/chat/alice/%03");
        assert_eq!(name.get_back(0).unwrap().as_number(), Some(3));
    }

    #[test]
    fn prefix_relations() {
        let a = Name::from("/chat");
        let b = Name::from("/chat/alice/1");
        assert!(a.is_prefix_of(&b));
        assert!(!b.is_prefix_of(&a));
        assert!(a.is_prefix_of(&a));
        assert!(Name::new().is_prefix_of(&a));
        assert_eq!(b.prefix(2), Name::from("/chat/alice"));
    }

    #[test]
    fn ordering_is_lexicographic() {
        let mut names = vec![
            Name::from("/b"),
            Name::from("/a/z"),
            Name::from("/a"),
            Name::from("/a/b"),
        ];
        names.sort();
        let display: Vec<_> = names.iter().map(|n| n.to_string()).collect();
        assert_eq!(display, vec!["/a", "/a/b", "/a/z", "/b"]);
    }

    #[test]
    fn number_components() {
        assert_eq!(Component::number(0).as_bytes(), &[0]);
        assert_eq!(Component::number(255).as_bytes(), &[255]);
        assert_eq!(Component::number(256).as_bytes(), &[1, 0]);
        assert_eq!(Component::number(7).as_number(), Some(7));
        assert_eq!(Component::number(u64::MAX).as_number(), Some(u64::MAX));
    }

    #[test]
    fn version_and_segment_components() {
        let name = Name::from("/doc")
            .append(Component::version(0))
            .append(Component::segment(12));
        assert_eq!(name.to_string(), "/doc/v=0/seg=12");
        assert_eq!(name.get_back(0).unwrap().as_segment(), Some(12));
        assert_eq!(name.get_back(1).unwrap().as_version(), Some(0));
        assert_eq!(name.get_back(1).unwrap().as_segment(), None);
    }

    #[test]
    fn encode_decode() {
        let name = Name::from("/chat/alice").append_number(300);
        let decoded = Name::decode(&name.encode()).unwrap();
        assert_eq!(name, decoded);

        let empty = Name::new();
        assert_eq!(Name::decode(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Name::decode(&[9, 1, 0]).is_err());
        let name = Name::from("/x");
        let mut bytes = name.encode().to_vec();
        bytes.push(0);
        assert!(Name::decode(&bytes).is_err());
    }
}
