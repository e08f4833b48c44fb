//! Type-length-value primitives for the wire format.
//!
//! All multi-byte integers are big-endian. Type and length numbers use the
//! variable-size encoding: one byte below 253, otherwise a marker byte
//! (253/254/255) followed by the value in 2, 4 or 8 bytes.

use bytes::{BufMut, Bytes, BytesMut};

/// Assigned TLV type numbers.
///
/// The 200-range is reserved for the sync protocol itself; the low numbers
/// are the packet-level structure shared with the substrate.
pub mod types {
    /// Data packet.
    pub const DATA: u64 = 6;
    /// Hierarchical name.
    pub const NAME: u64 = 7;
    /// One opaque name component.
    pub const NAME_COMPONENT: u64 = 8;
    /// Data meta information (content type, freshness, final block id).
    pub const META_INFO: u64 = 20;
    /// Data payload.
    pub const CONTENT: u64 = 21;
    /// Signature bytes over the preceding packet fields.
    pub const SIGNATURE_VALUE: u64 = 23;
    /// Content type number inside [`META_INFO`].
    pub const CONTENT_TYPE: u64 = 24;
    /// Freshness period in milliseconds inside [`META_INFO`].
    pub const FRESHNESS_PERIOD: u64 = 25;
    /// Final block id inside [`META_INFO`]; value is a name component.
    pub const FINAL_BLOCK_ID: u64 = 26;
    /// Timestamp name component, microseconds since the unix epoch.
    pub const TIMESTAMP: u64 = 36;

    /// Version vector.
    pub const STATE_VECTOR: u64 = 201;
    /// One producer entry inside [`STATE_VECTOR`].
    pub const STATE_VECTOR_ENTRY: u64 = 202;
    /// Non-negative sequence number.
    pub const SEQ_NO: u64 = 204;
    /// Mapping list for one producer.
    pub const MAPPING_DATA: u64 = 205;
    /// One `(seq, name, blocks)` entry inside [`MAPPING_DATA`].
    pub const MAPPING_ENTRY: u64 = 206;
    /// LZMA-compressed wrapper around other TLVs.
    pub const LZMA_BLOCK: u64 = 211;
}

/// Decoding failure. Encoders cannot fail.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("expected TLV type {expected}, found {found}")]
    UnexpectedType { expected: u64, found: u64 },
    #[error("integer field has invalid width {0}")]
    BadIntegerWidth(usize),
    #[error("trailing bytes after element")]
    TrailingBytes,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Appends TLV elements to a growable buffer.
///
/// Nested elements are built innermost-first: encode the child into its own
/// encoder, then wrap the finished bytes with [`Encoder::element`].
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a complete element with the given type and value bytes.
    pub fn element(&mut self, typ: u64, value: &[u8]) {
        self.varnum(typ);
        self.varnum(value.len() as u64);
        self.buf.put_slice(value);
    }

    /// Append an element whose value is a non-negative integer in its
    /// shortest 1/2/4/8-byte form.
    pub fn non_negative(&mut self, typ: u64, n: u64) {
        self.varnum(typ);
        if n <= u8::MAX as u64 {
            self.varnum(1);
            self.buf.put_u8(n as u8);
        } else if n <= u16::MAX as u64 {
            self.varnum(2);
            self.buf.put_u16(n as u16);
        } else if n <= u32::MAX as u64 {
            self.varnum(4);
            self.buf.put_u32(n as u32);
        } else {
            self.varnum(8);
            self.buf.put_u64(n);
        }
    }

    /// Append raw pre-encoded bytes (already valid TLV).
    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    fn varnum(&mut self, n: u64) {
        if n < 253 {
            self.buf.put_u8(n as u8);
        } else if n <= u16::MAX as u64 {
            self.buf.put_u8(253);
            self.buf.put_u16(n as u16);
        } else if n <= u32::MAX as u64 {
            self.buf.put_u8(254);
            self.buf.put_u32(n as u32);
        } else {
            self.buf.put_u8(255);
            self.buf.put_u64(n);
        }
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// A cursor over a byte slice yielding TLV elements.
#[derive(Debug, Clone, Copy)]
pub struct Decoder<'a> {
    rest: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { rest: input }
    }

    /// True once all input is consumed.
    pub fn is_finished(&self) -> bool {
        self.rest.is_empty()
    }

    /// The not yet consumed input.
    pub fn remaining(&self) -> &'a [u8] {
        self.rest
    }

    /// Peek the type of the next element without consuming it.
    pub fn peek_type(&self) -> Result<u64> {
        let mut probe = *self;
        probe.varnum()
    }

    /// Read the next element, returning its type and value slice.
    pub fn element(&mut self) -> Result<(u64, &'a [u8])> {
        let typ = self.varnum()?;
        let len = self.varnum()? as usize;
        if self.rest.len() < len {
            return Err(Error::UnexpectedEnd);
        }
        let (value, rest) = self.rest.split_at(len);
        self.rest = rest;
        Ok((typ, value))
    }

    /// Read the next element and require it to have the given type.
    pub fn expect(&mut self, typ: u64) -> Result<&'a [u8]> {
        let (found, value) = self.element()?;
        if found != typ {
            return Err(Error::UnexpectedType {
                expected: typ,
                found,
            });
        }
        Ok(value)
    }

    /// Skip the next element.
    pub fn skip(&mut self) -> Result<()> {
        self.element().map(|_| ())
    }

    fn varnum(&mut self) -> Result<u64> {
        let (&first, rest) = self.rest.split_first().ok_or(Error::UnexpectedEnd)?;
        self.rest = rest;
        match first {
            0..=252 => Ok(first as u64),
            253 => self.fixed::<2>().map(|b| u16::from_be_bytes(b) as u64),
            254 => self.fixed::<4>().map(|b| u32::from_be_bytes(b) as u64),
            255 => self.fixed::<8>().map(u64::from_be_bytes),
        }
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.rest.len() < N {
            return Err(Error::UnexpectedEnd);
        }
        let (head, rest) = self.rest.split_at(N);
        self.rest = rest;
        Ok(head.try_into().expect("split length"))
    }
}

/// Parse a non-negative integer value field (1, 2, 4 or 8 bytes).
pub fn parse_non_negative(value: &[u8]) -> Result<u64> {
    match value.len() {
        1 => Ok(value[0] as u64),
        2 => Ok(u16::from_be_bytes(value.try_into().unwrap()) as u64),
        4 => Ok(u32::from_be_bytes(value.try_into().unwrap()) as u64),
        8 => Ok(u64::from_be_bytes(value.try_into().unwrap())),
        n => Err(Error::BadIntegerWidth(n)),
    }
}
