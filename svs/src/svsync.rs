//! Sequence assignment and data transport on top of the sync engine.
//!
//! `SvSync` owns the [`SyncCore`], the local [`DataStore`] and a [`Fetcher`]:
//! publishing allocates the next sequence number, stores the signed packet
//! and bumps the vector; a background task serves data interests from the
//! store; fetching retrieves and optionally caches packets published by
//! peers.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, trace, Instrument};

use crate::core::{CoreOptions, SyncCore, UpdateCallback};
use crate::error::Error;
use crate::face::Face;
use crate::fetcher::{FetchRequest, Fetcher};
use crate::name::{Component, Name};
use crate::packet::{ContentType, Data, Interest, NackReason};
use crate::proto::SeqNo;
use crate::security::SecurityOptions;
use crate::store::{DataStore, MemoryStore};

/// Lifetime of data interests.
pub const DATA_INTEREST_LIFETIME: Duration = Duration::from_secs(2);

/// How data names are derived from `(producer, seq)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameScheme {
    /// `<nid>/<sync_prefix>/<seq>`: the producer prefix routes data
    /// interests to the producer.
    #[default]
    PerProducer,
    /// `<sync_prefix>/d/<nid>/<seq>`: all producers share a data prefix, so
    /// any group member can answer from its cache. Fetched packets are
    /// cached.
    SharedPrefix,
}

/// Why a fetch did not deliver data.
#[derive(Debug, Clone)]
pub enum FetchFailure {
    Timeout(Name),
    Nack(Name, NackReason),
    Validation(Name),
}

pub struct SvSync {
    core: SyncCore,
    store: Arc<dyn DataStore>,
    fetcher: Fetcher,
    face: Arc<dyn Face>,
    security: SecurityOptions,
    scheme: NameScheme,
    sync_prefix: Name,
    node_id: Name,
    _serve_guard: tokio_util::sync::DropGuard,
}

impl std::fmt::Debug for SvSync {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SvSync")
            .field("node_id", &self.node_id)
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

impl SvSync {
    pub fn new(
        face: Arc<dyn Face>,
        sync_prefix: Name,
        node_id: Name,
        on_update: UpdateCallback,
        security: SecurityOptions,
    ) -> Result<Self, Error> {
        Self::with_options(
            face,
            sync_prefix,
            node_id,
            on_update,
            security,
            None,
            NameScheme::default(),
            CoreOptions::default(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_options(
        face: Arc<dyn Face>,
        sync_prefix: Name,
        node_id: Name,
        on_update: UpdateCallback,
        security: SecurityOptions,
        store: Option<Arc<dyn DataStore>>,
        scheme: NameScheme,
        options: CoreOptions,
    ) -> Result<Self, Error> {
        let store = store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let data_prefix = match scheme {
            NameScheme::PerProducer => node_id.clone(),
            NameScheme::SharedPrefix => sync_prefix.append(Component::from("d")),
        };
        let registration = face
            .register(data_prefix.clone())
            .map_err(|_| Error::PrefixRegistrationFailed(data_prefix))?;

        let cancel = CancellationToken::new();
        let serve_face = face.clone();
        let serve_store = store.clone();
        let serve_cancel = cancel.clone();
        let span = error_span!("svsync-serve", me = %node_id);
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
                    match serve_store.find(&interest) {
                        Some(data) => {
                            trace!(name = %interest.name(), "serving from store");
                            serve_face.put(data);
                        }
                        // Not ours to answer; peers will retry elsewhere.
                        None => trace!(name = %interest.name(), "no data in store"),
                    }
                }
                debug!("data interest handler stopped");
            }
            .instrument(span),
        );

        let fetcher = Fetcher::new(face.clone(), &security);
        let core = SyncCore::with_options(
            face.clone(),
            sync_prefix.clone(),
            on_update,
            security.clone(),
            node_id.clone(),
            options,
        )?;
        Ok(Self {
            core,
            store,
            fetcher,
            face,
            security,
            scheme,
            sync_prefix,
            node_id,
            _serve_guard: cancel.drop_guard(),
        })
    }

    /// The underlying sync engine.
    pub fn core(&self) -> &SyncCore {
        &self.core
    }

    /// The shared data store.
    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn node_id(&self) -> &Name {
        &self.node_id
    }

    /// The data name for `(nid, seq)` under the configured scheme.
    pub fn data_name(&self, nid: &Name, seq: SeqNo) -> Name {
        match self.scheme {
            NameScheme::PerProducer => {
                nid.append_name(&self.sync_prefix).append_number(seq)
            }
            NameScheme::SharedPrefix => self
                .sync_prefix
                .append(Component::from("d"))
                .append_name(nid)
                .append_number(seq),
        }
    }

    /// Publish opaque bytes. Allocates the next sequence number, signs and
    /// stores the packet, and announces it to the group.
    pub async fn publish(
        &self,
        bytes: impl Into<Bytes>,
        freshness: Duration,
        nid: Option<Name>,
    ) -> Result<SeqNo, Error> {
        let nid = nid.unwrap_or_else(|| self.node_id.clone());
        let new_seq = self.core.seq(Some(nid.clone())).await? + 1;
        let mut data =
            Data::new(self.data_name(&nid, new_seq), bytes).with_freshness(freshness);
        self.security.data_signer.sign_data(&mut data);
        self.store.insert(data.clone());
        self.core.update_seq(new_seq, Some(nid)).await?;
        self.face.put(data);
        Ok(new_seq)
    }

    /// Publish an already-signed packet. It travels encapsulated: the outer
    /// packet's content is the encoded inner one.
    pub async fn publish_packet(&self, packet: Data, nid: Option<Name>) -> Result<SeqNo, Error> {
        let nid = nid.unwrap_or_else(|| self.node_id.clone());
        let new_seq = self.core.seq(Some(nid.clone())).await? + 1;
        let mut data = Data::new(self.data_name(&nid, new_seq), packet.encode())
            .with_content_type(ContentType::Data)
            .with_freshness(packet.freshness());
        self.security.data_signer.sign_data(&mut data);
        self.store.insert(data.clone());
        self.core.update_seq(new_seq, Some(nid)).await?;
        self.face.put(data);
        Ok(new_seq)
    }

    /// Store one segment of a segmented publication under
    /// `data_name(nid, seq)/v=0/seg=<segment>`. The caller announces the
    /// sequence number once all segments are in place.
    pub fn insert_data_segment(
        &self,
        content: impl Into<Bytes>,
        freshness: Duration,
        nid: &Name,
        seq: SeqNo,
        segment: u64,
        final_block: Component,
        content_type: ContentType,
    ) {
        let name = self
            .data_name(nid, seq)
            .append(Component::version(0))
            .append(Component::segment(segment));
        let mut data = Data::new(name, content)
            .with_content_type(content_type)
            .with_freshness(freshness)
            .with_final_block_id(final_block);
        self.security.data_signer.sign_data(&mut data);
        self.store.insert(data);
    }

    /// Fetch the packet for `(nid, seq)` from the group. The callback runs
    /// once the packet passed the configured validator; caching depends on
    /// the name scheme.
    pub fn fetch(
        &self,
        nid: &Name,
        seq: SeqNo,
        on_validated: impl FnOnce(Data) + Send + 'static,
        n_retries: u32,
    ) {
        self.fetch_with(nid, seq, n_retries, on_validated, |_| {});
    }

    /// Like [`Self::fetch`], additionally reporting terminal failures.
    pub fn fetch_with(
        &self,
        nid: &Name,
        seq: SeqNo,
        n_retries: u32,
        on_validated: impl FnOnce(Data) + Send + 'static,
        on_failure: impl FnOnce(FetchFailure) + Send + 'static,
    ) {
        let interest = Interest::new(self.data_name(nid, seq))
            .with_can_be_prefix(true)
            .with_must_be_fresh(true)
            .with_lifetime(DATA_INTEREST_LIFETIME);
        self.fetch_interest(interest, n_retries, on_validated, on_failure);
    }

    /// Fetch an exact name, e.g. one segment of a segmented publication.
    pub fn fetch_name(
        &self,
        name: Name,
        n_retries: u32,
        on_validated: impl FnOnce(Data) + Send + 'static,
        on_failure: impl FnOnce(FetchFailure) + Send + 'static,
    ) {
        let interest = Interest::new(name)
            .with_must_be_fresh(true)
            .with_lifetime(DATA_INTEREST_LIFETIME);
        self.fetch_interest(interest, n_retries, on_validated, on_failure);
    }

    fn fetch_interest(
        &self,
        interest: Interest,
        n_retries: u32,
        on_validated: impl FnOnce(Data) + Send + 'static,
        on_failure: impl FnOnce(FetchFailure) + Send + 'static,
    ) {
        let cache = self.should_cache();
        let store = self.store.clone();
        let failure = Arc::new(std::sync::Mutex::new(Some(on_failure)));
        let fail = |variant: fn(Name) -> FetchFailure| {
            let failure = failure.clone();
            move |name: Name| {
                if let Some(cb) = failure.lock().expect("poisoned").take() {
                    cb(variant(name));
                }
            }
        };
        let on_timeout = fail(FetchFailure::Timeout);
        let on_validation = fail(FetchFailure::Validation);
        let on_nack = {
            let failure = failure.clone();
            move |interest: Interest, reason: NackReason| {
                if let Some(cb) = failure.lock().expect("poisoned").take() {
                    cb(FetchFailure::Nack(interest.name().clone(), reason));
                }
            }
        };
        let request = FetchRequest::new(interest, move |data: Data| {
            if cache {
                store.insert(data.clone());
            }
            on_validated(data);
        })
        .with_retries(n_retries)
        .on_timeout(move |interest| on_timeout(interest.name().clone()))
        .on_nack(on_nack)
        .on_validation_fail(move |data| on_validation(data.name().clone()));
        self.fetcher.express(request);
    }

    /// Whether validated fetches enter the local store.
    fn should_cache(&self) -> bool {
        matches!(self.scheme, NameScheme::SharedPrefix)
    }
}
