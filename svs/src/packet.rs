//! Interest and Data packets exchanged with the network substrate.
//!
//! Data packets have a full wire encoding because publications are
//! encapsulated: a signed inner Data travels as the content of an outer Data
//! whose content type is [`ContentType::Data`].

use std::time::Duration;

use bytes::Bytes;
use rand::Rng;

use crate::name::{Component, Name};
use crate::tlv::{self, types, Decoder, Encoder};

/// Default interest lifetime when none is set explicitly.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(4);

/// A request for named data.
#[derive(Debug, Clone)]
pub struct Interest {
    name: Name,
    can_be_prefix: bool,
    must_be_fresh: bool,
    lifetime: Duration,
    nonce: u32,
    app_parameters: Option<Bytes>,
    signature: Option<Bytes>,
}

impl Interest {
    pub fn new(name: Name) -> Self {
        Self {
            name,
            can_be_prefix: false,
            must_be_fresh: false,
            lifetime: DEFAULT_LIFETIME,
            nonce: rand::thread_rng().gen(),
            app_parameters: None,
            signature: None,
        }
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn can_be_prefix(&self) -> bool {
        self.can_be_prefix
    }

    pub fn must_be_fresh(&self) -> bool {
        self.must_be_fresh
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    pub fn app_parameters(&self) -> Option<&Bytes> {
        self.app_parameters.as_ref()
    }

    pub fn signature(&self) -> Option<&Bytes> {
        self.signature.as_ref()
    }

    pub fn with_can_be_prefix(mut self, value: bool) -> Self {
        self.can_be_prefix = value;
        self
    }

    pub fn with_must_be_fresh(mut self, value: bool) -> Self {
        self.must_be_fresh = value;
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_app_parameters(mut self, parameters: impl Into<Bytes>) -> Self {
        self.app_parameters = Some(parameters.into());
        self
    }

    pub fn set_signature(&mut self, signature: Bytes) {
        self.signature = Some(signature);
    }

    /// Replace the nonce so a retransmission is not collapsed as a duplicate.
    pub fn refresh_nonce(&mut self) {
        self.nonce = rand::thread_rng().gen();
    }

    /// The bytes covered by an interest signature: the encoded name followed
    /// by the application parameters.
    pub fn signed_portion(&self) -> Bytes {
        let mut enc = Encoder::new();
        enc.raw(&self.name.encode());
        if let Some(params) = &self.app_parameters {
            enc.raw(params);
        }
        enc.finish()
    }

    /// Interest-to-data name matching: exact, or prefix when `can_be_prefix`.
    pub fn matches(&self, data: &Data) -> bool {
        if self.can_be_prefix {
            self.name.is_prefix_of(data.name())
        } else {
            &self.name == data.name()
        }
    }
}

/// Reason a request was refused by the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackReason {
    /// No registered filter or cached data could satisfy the interest.
    NoRoute,
    /// The substrate is overloaded.
    Congestion,
    /// Duplicate nonce observed.
    Duplicate,
}

impl std::fmt::Display for NackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            NackReason::NoRoute => write!(f, "no route"),
            NackReason::Congestion => write!(f, "congestion"),
            NackReason::Duplicate => write!(f, "duplicate"),
        }
    }
}

/// What the content bytes of a [`Data`] are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    /// Opaque payload.
    #[default]
    Blob,
    /// The content is itself an encoded [`Data`] packet (encapsulation).
    Data,
}

impl ContentType {
    fn to_wire(self) -> u64 {
        match self {
            ContentType::Blob => 0,
            ContentType::Data => types::DATA,
        }
    }

    fn from_wire(n: u64) -> Self {
        if n == types::DATA {
            ContentType::Data
        } else {
            ContentType::Blob
        }
    }
}

/// A signed, named payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    name: Name,
    content: Bytes,
    content_type: ContentType,
    freshness: Duration,
    final_block_id: Option<Component>,
    signature: Bytes,
}

impl Data {
    pub fn new(name: Name, content: impl Into<Bytes>) -> Self {
        Self {
            name,
            content: content.into(),
            content_type: ContentType::Blob,
            freshness: Duration::ZERO,
            final_block_id: None,
            signature: Bytes::new(),
        }
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    pub fn final_block_id(&self) -> Option<&Component> {
        self.final_block_id.as_ref()
    }

    pub fn signature(&self) -> &Bytes {
        &self.signature
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_final_block_id(mut self, component: Component) -> Self {
        self.final_block_id = Some(component);
        self
    }

    pub fn set_signature(&mut self, signature: Bytes) {
        self.signature = signature;
    }

    /// The bytes covered by the data signature: name, meta info and content.
    pub fn signed_portion(&self) -> Bytes {
        let mut enc = Encoder::new();
        self.encode_signed_portion(&mut enc);
        enc.finish()
    }

    fn encode_signed_portion(&self, enc: &mut Encoder) {
        enc.raw(&self.name.encode());

        let mut meta = Encoder::new();
        if self.content_type != ContentType::Blob {
            meta.non_negative(types::CONTENT_TYPE, self.content_type.to_wire());
        }
        if !self.freshness.is_zero() {
            meta.non_negative(types::FRESHNESS_PERIOD, self.freshness.as_millis() as u64);
        }
        if let Some(final_block) = &self.final_block_id {
            let mut inner = Encoder::new();
            inner.element(types::NAME_COMPONENT, final_block.as_bytes());
            meta.element(types::FINAL_BLOCK_ID, &inner.finish());
        }
        enc.element(types::META_INFO, &meta.finish());
        enc.element(types::CONTENT, &self.content);
    }

    /// Encode the complete packet as a `Data` TLV element.
    pub fn encode(&self) -> Bytes {
        let mut value = Encoder::new();
        self.encode_signed_portion(&mut value);
        value.element(types::SIGNATURE_VALUE, &self.signature);
        let mut enc = Encoder::new();
        enc.element(types::DATA, &value.finish());
        enc.finish()
    }

    /// Decode a complete `Data` TLV element.
    pub fn decode(input: &[u8]) -> tlv::Result<Data> {
        let mut outer = Decoder::new(input);
        let value = outer.expect(types::DATA)?;
        let mut dec = Decoder::new(value);

        let name = Name::decode_value(dec.expect(types::NAME)?)?;

        let mut data = Data::new(name, Bytes::new());
        let meta = dec.expect(types::META_INFO)?;
        let mut meta_dec = Decoder::new(meta);
        while !meta_dec.is_finished() {
            let (typ, field) = meta_dec.element()?;
            match typ {
                types::CONTENT_TYPE => {
                    data.content_type = ContentType::from_wire(tlv::parse_non_negative(field)?);
                }
                types::FRESHNESS_PERIOD => {
                    data.freshness = Duration::from_millis(tlv::parse_non_negative(field)?);
                }
                types::FINAL_BLOCK_ID => {
                    let mut inner = Decoder::new(field);
                    let bytes = inner.expect(types::NAME_COMPONENT)?;
                    data.final_block_id = Some(Component::from(bytes));
                }
                // Unknown meta fields are skippable.
                _ => {}
            }
        }

        data.content = Bytes::copy_from_slice(dec.expect(types::CONTENT)?);
        data.signature = Bytes::copy_from_slice(dec.expect(types::SIGNATURE_VALUE)?);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_roundtrip() {
        let mut data = Data::new(Name::from("/chat/alice/1"), &b"hello"[..])
            .with_freshness(Duration::from_secs(1))
            .with_content_type(ContentType::Data)
            .with_final_block_id(Component::segment(2));
        data.set_signature(Bytes::from_static(&[1, 2, 3]));

        let decoded = Data::decode(&data.encode()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn data_roundtrip_minimal() {
        let data = Data::new(Name::from("/x"), &b""[..]);
        let decoded = Data::decode(&data.encode()).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(decoded.content_type(), ContentType::Blob);
        assert_eq!(decoded.final_block_id(), None);
    }

    #[test]
    fn encapsulation_roundtrip() {
        let mut inner = Data::new(Name::from("/app/pub"), &b"payload"[..]);
        inner.set_signature(Bytes::from_static(b"sig"));
        let outer = Data::new(Name::from("/node/a/sync/1"), inner.encode())
            .with_content_type(ContentType::Data);
        let decoded_outer = Data::decode(&outer.encode()).unwrap();
        assert_eq!(decoded_outer.content_type(), ContentType::Data);
        let decoded_inner = Data::decode(decoded_outer.content()).unwrap();
        assert_eq!(decoded_inner, inner);
    }

    #[test]
    fn interest_matching() {
        let data = Data::new(Name::from("/a/b/c"), &b""[..]);
        assert!(Interest::new(Name::from("/a/b/c")).matches(&data));
        assert!(!Interest::new(Name::from("/a/b")).matches(&data));
        assert!(Interest::new(Name::from("/a/b"))
            .with_can_be_prefix(true)
            .matches(&data));
        assert!(!Interest::new(Name::from("/a/x"))
            .with_can_be_prefix(true)
            .matches(&data));
    }

    #[test]
    fn nonce_refresh_changes_nonce() {
        let mut interest = Interest::new(Name::from("/a"));
        let before = interest.nonce();
        // Two draws colliding twice in a row is vanishingly unlikely.
        interest.refresh_nonce();
        let mid = interest.nonce();
        interest.refresh_nonce();
        assert!(before != mid || mid != interest.nonce());
    }
}
