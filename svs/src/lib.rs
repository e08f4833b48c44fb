//! State Vector Sync: eventually-consistent group state over named data.
//!
//! A group of peers shares a multicast sync prefix. Every peer maintains a
//! [version vector](proto::VersionVector) mapping producer ids to their
//! highest known sequence numbers and announces it in periodic, suppressed
//! sync interests; merging received vectors yields the set of publications a
//! peer is missing, which it then fetches directly from their producers.
//!
//! The crate is layered:
//!
//! - [`proto`] — the protocol core as a state machine without IO;
//! - [`core`] — the runtime driving that state machine over a [`face::Face`];
//! - [`svsync`] — sequence assignment, the data store and the fetch path;
//! - [`pubsub`] — named publications, subscriptions and segmentation, with
//!   [`mapping`] translating `(producer, seq)` pairs to application names.
//!
//! The network substrate is abstracted behind [`face::Face`]; an in-memory
//! implementation ([`face::MemHub`]) connects any number of instances for
//! tests and local groups. Signing and validation plug in through
//! [`security::SecurityOptions`].

pub mod core;
pub mod error;
pub mod face;
pub mod fetcher;
pub mod mapping;
pub mod name;
pub mod packet;
pub mod proto;
pub mod pubsub;
pub mod security;
pub mod store;
pub mod svsync;
pub mod tlv;

mod util;

pub use crate::core::{CoreOptions, SyncCore, UpdateCallback};
pub use crate::error::Error;
pub use crate::name::{Component, Name};
pub use crate::packet::{ContentType, Data, Interest, NackReason};
pub use crate::proto::{MissingRange, SeqNo, VersionVector};
pub use crate::pubsub::{PubSubOptions, SubscriptionData, SvsPubSub};
pub use crate::security::SecurityOptions;
pub use crate::store::{DataStore, MemoryStore};
pub use crate::svsync::{NameScheme, SvSync};
