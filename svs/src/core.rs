//! Runtime for the sync engine.
//!
//! [`SyncCore`] is a cheap-to-clone handle to an actor that owns the
//! [`proto::State`] state machine and drives it over a [`Face`]: incoming
//! sync interests are validated, decompressed and parsed here, outgoing ones
//! are built, signed and expressed here, and scheduled timers are fed back
//! into the state machine when they expire. The actor stops when the last
//! handle is dropped, releasing the interest filter and every pending timer.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error_span, trace, warn, Instrument};

use crate::error::Error;
use crate::face::{Face, Registration};
use crate::name::{Component, Name};
use crate::packet::Interest;
use crate::proto::{self, InEvent, MissingRange, OutEvent, SeqNo, VersionVector};
use crate::security::{InterestSigningPolicy, SecurityOptions, Validator};
use crate::tlv::{types, Decoder, Encoder};
use crate::util::Timers;

/// Protocol version carried in the sync interest name.
pub const SYNC_VERSION: u64 = 2;

/// Lifetime of a sync interest: the substrate only needs it long enough to
/// aggregate duplicates.
pub const SYNC_INTEREST_LIFETIME: Duration = Duration::from_millis(1);

/// Channel capacity for the ToActor message queue.
const TO_ACTOR_CAP: usize = 64;

/// Called with every batch of newly-learned missing ranges.
pub type UpdateCallback = Box<dyn Fn(Vec<MissingRange>) + Send + Sync + 'static>;
/// Produces an opaque block to piggyback on the next outgoing sync interest.
pub type GetExtraCallback = Box<dyn Fn(&VersionVector) -> Option<Bytes> + Send + Sync + 'static>;
/// Receives the opaque block of an incoming sync interest, before the merge.
pub type RecvExtraCallback = Box<dyn Fn(&Bytes) + Send + Sync + 'static>;

/// Tunables for one engine instance.
#[derive(Debug, Clone, Default)]
pub struct CoreOptions {
    /// Timing parameters of the state machine.
    pub proto: proto::Config,
    /// Compress outgoing sync interest parameters into an `LzmaBlock`.
    /// Uncompressed peers stay interoperable either way.
    pub compress_state_vector: bool,
}

/// Handle to a running sync engine.
#[derive(Clone)]
pub struct SyncCore {
    to_actor: mpsc::Sender<ToActor>,
    node_id: Name,
    _actor_handle: Arc<JoinHandle<()>>,
}

impl std::fmt::Debug for SyncCore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SyncCore").field("node_id", &self.node_id).finish()
    }
}

enum ToActor {
    Start,
    UpdateSeq {
        id: Option<Name>,
        seq: SeqNo,
        reply: oneshot::Sender<()>,
    },
    GetSeq {
        id: Option<Name>,
        reply: oneshot::Sender<SeqNo>,
    },
    GetState {
        reply: oneshot::Sender<VersionVector>,
    },
    SetGetExtra(GetExtraCallback),
    SetRecvExtra(RecvExtraCallback),
}

impl SyncCore {
    /// Create an engine on `face`, registered on `sync_prefix`.
    ///
    /// Fails with [`Error::PrefixRegistrationFailed`] when the filter cannot
    /// be registered; there is no way to participate without it. The engine
    /// stays silent until [`Self::start`].
    pub fn new(
        face: Arc<dyn Face>,
        sync_prefix: Name,
        on_update: UpdateCallback,
        security: SecurityOptions,
        node_id: Name,
    ) -> Result<Self, Error> {
        Self::with_options(
            face,
            sync_prefix,
            on_update,
            security,
            node_id,
            CoreOptions::default(),
        )
    }

    pub fn with_options(
        face: Arc<dyn Face>,
        sync_prefix: Name,
        on_update: UpdateCallback,
        security: SecurityOptions,
        node_id: Name,
        options: CoreOptions,
    ) -> Result<Self, Error> {
        let registration = face
            .register(sync_prefix.clone())
            .map_err(|_| Error::PrefixRegistrationFailed(sync_prefix.clone()))?;
        let (to_actor, to_actor_rx) = mpsc::channel(TO_ACTOR_CAP);
        let sync_name = sync_prefix.append(Component::version(SYNC_VERSION));
        let state = proto::State::new(node_id.clone(), options.proto);
        let actor = Actor {
            state,
            face,
            registration,
            sync_name,
            security,
            compress: options.compress_state_vector,
            on_update,
            get_extra: None,
            recv_extra: None,
            to_actor_rx,
            timers: Timers::new(),
        };
        let span = error_span!("sync", me = %node_id);
        let actor_handle = tokio::spawn(actor.run().instrument(span));
        Ok(Self {
            to_actor,
            node_id,
            _actor_handle: Arc::new(actor_handle),
        })
    }

    pub fn node_id(&self) -> &Name {
        &self.node_id
    }

    /// Begin operating: after a short settling delay the initial sync
    /// interest goes out and the periodic retransmit starts.
    pub async fn start(&self) -> Result<(), Error> {
        self.send(ToActor::Start).await
    }

    /// The current sequence number for `id`, defaulting to the own node id.
    pub async fn seq(&self, id: Option<Name>) -> Result<SeqNo, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::GetSeq { id, reply }).await?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Raise the sequence number for `id`. When it advances, a sync interest
    /// follows after a short debounce.
    pub async fn update_seq(&self, seq: SeqNo, id: Option<Name>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::UpdateSeq { id, seq, reply }).await?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Snapshot of the whole version vector.
    pub async fn state_vector(&self) -> Result<VersionVector, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::GetState { reply }).await?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// All producer ids currently present in the vector.
    pub async fn node_ids(&self) -> Result<Vec<Name>, Error> {
        let vector = self.state_vector().await?;
        Ok(vector.node_ids().cloned().collect())
    }

    /// Install the hook producing the piggyback block for outgoing interests.
    pub async fn set_get_extra(&self, cb: GetExtraCallback) -> Result<(), Error> {
        self.send(ToActor::SetGetExtra(cb)).await
    }

    /// Install the hook receiving piggyback blocks from incoming interests.
    pub async fn set_recv_extra(&self, cb: RecvExtraCallback) -> Result<(), Error> {
        self.send(ToActor::SetRecvExtra(cb)).await
    }

    /// Restart synchronization. Kept for interface compatibility; the
    /// observable behavior is a no-op.
    pub async fn reset(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn send(&self, msg: ToActor) -> Result<(), Error> {
        self.to_actor.send(msg).await.map_err(|_| Error::Shutdown)
    }
}

struct Actor {
    state: proto::State<rand::rngs::StdRng>,
    face: Arc<dyn Face>,
    registration: Registration,
    sync_name: Name,
    security: SecurityOptions,
    compress: bool,
    on_update: UpdateCallback,
    get_extra: Option<GetExtraCallback>,
    recv_extra: Option<RecvExtraCallback>,
    to_actor_rx: mpsc::Receiver<ToActor>,
    timers: Timers<proto::Timer>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                msg = self.to_actor_rx.recv() => {
                    match msg {
                        Some(msg) => self.handle_to_actor(msg),
                        None => {
                            debug!("all handles dropped, stopping sync actor");
                            break;
                        }
                    }
                }
                interest = self.registration.next() => {
                    match interest {
                        Some(interest) => self.handle_sync_interest(interest),
                        None => {
                            debug!("face closed, stopping sync actor");
                            break;
                        }
                    }
                }
                drain = self.timers.wait_and_drain() => {
                    for (_instant, timer) in drain {
                        self.handle_in_event(InEvent::TimerExpired(timer));
                    }
                }
            }
        }
    }

    fn handle_to_actor(&mut self, msg: ToActor) {
        match msg {
            ToActor::Start => self.handle_in_event(InEvent::Start),
            ToActor::UpdateSeq { id, seq, reply } => {
                self.handle_in_event(InEvent::UpdateSeq { id, seq });
                reply.send(()).ok();
            }
            ToActor::GetSeq { id, reply } => {
                reply.send(self.state.seq(id.as_ref())).ok();
            }
            ToActor::GetState { reply } => {
                reply.send(self.state.vector().clone()).ok();
            }
            ToActor::SetGetExtra(cb) => self.get_extra = Some(cb),
            ToActor::SetRecvExtra(cb) => self.recv_extra = Some(cb),
        }
    }

    fn handle_in_event(&mut self, event: InEvent) {
        let now = tokio::time::Instant::now().into_std();
        let out: Vec<OutEvent> = self.state.handle(event, now).collect();
        for event in out {
            match event {
                OutEvent::SendSyncInterest(vector) => self.send_sync_interest(&vector),
                OutEvent::EmitUpdate(missing) => {
                    trace!(count = missing.len(), "emit update");
                    (self.on_update)(missing);
                }
                OutEvent::ScheduleTimer(delay, timer) => {
                    self.timers.insert(now + delay, timer);
                }
            }
        }
    }

    fn send_sync_interest(&mut self, vector: &VersionVector) {
        let mut params = Encoder::new();
        params.raw(&vector.encode());
        if let Some(get_extra) = &self.get_extra {
            if let Some(extra) = get_extra(vector) {
                params.raw(&extra);
            }
        }
        let mut payload = params.finish();
        if self.compress {
            match compress(&payload) {
                Ok(compressed) => {
                    let mut enc = Encoder::new();
                    enc.element(types::LZMA_BLOCK, &compressed);
                    payload = enc.finish();
                }
                Err(err) => {
                    warn!("failed to compress sync interest, sending plain: {err}");
                }
            }
        }

        let mut interest = Interest::new(self.sync_name.clone())
            .with_can_be_prefix(true)
            .with_must_be_fresh(true)
            .with_lifetime(SYNC_INTEREST_LIFETIME)
            .with_app_parameters(payload);
        match &self.security.interest_signing {
            InterestSigningPolicy::None => {}
            InterestSigningPolicy::Hmac(key) => {
                let signature = key.sign(&interest.signed_portion());
                interest.set_signature(signature);
            }
            InterestSigningPolicy::Custom(signer) => signer.sign_interest(&mut interest),
        }

        trace!(vector = %vector, "send sync interest");
        // Sync interests are never answered with data; express and forget.
        let pending = self.face.express(interest);
        tokio::spawn(async move {
            let _ = pending.await;
        });
    }

    fn handle_sync_interest(&mut self, interest: Interest) {
        // The filter covers the whole sync prefix; only the versioned sync
        // name is for us.
        if interest.name() != &self.sync_name {
            return;
        }

        let accepted = match &self.security.interest_signing {
            InterestSigningPolicy::None => true,
            InterestSigningPolicy::Hmac(key) => key.verify_interest(&interest),
            InterestSigningPolicy::Custom(_) => self
                .security
                .validator
                .as_ref()
                .map_or(true, |v| v.verify_interest(&interest)),
        };
        if !accepted {
            debug!("dropping sync interest: signature failure");
            return;
        }

        let Some(params) = interest.app_parameters() else {
            return;
        };
        match parse_sync_parameters(params) {
            Ok((vector, extra)) => {
                if let (Some(recv_extra), Some(extra)) = (&self.recv_extra, extra) {
                    recv_extra(&extra);
                }
                trace!(vector = %vector, "recv sync interest");
                self.handle_in_event(InEvent::RecvStateVector(vector));
            }
            Err(err) => {
                // Malformed or from a newer protocol: not our problem.
                debug!("dropping sync interest: {err}");
            }
        }
    }
}

/// Parse sync interest application parameters into the state vector and the
/// optional trailing extra block.
fn parse_sync_parameters(params: &[u8]) -> Result<(VersionVector, Option<Bytes>), Error> {
    let mut dec = Decoder::new(params);
    let typ = dec.peek_type().map_err(Error::InvalidStateVector)?;
    if typ == types::LZMA_BLOCK {
        let compressed = dec
            .expect(types::LZMA_BLOCK)
            .map_err(Error::InvalidStateVector)?;
        let inner = decompress(compressed).map_err(|_| {
            Error::InvalidStateVector(crate::tlv::Error::UnexpectedEnd)
        })?;
        return parse_sync_parameters_plain(&inner);
    }
    parse_sync_parameters_plain(params)
}

fn parse_sync_parameters_plain(params: &[u8]) -> Result<(VersionVector, Option<Bytes>), Error> {
    let mut dec = Decoder::new(params);
    let value = dec
        .expect(types::STATE_VECTOR)
        .map_err(Error::InvalidStateVector)?;
    let vector = VersionVector::decode_value(value)?;
    let extra = if dec.is_finished() {
        None
    } else {
        Some(Bytes::copy_from_slice(dec.remaining()))
    };
    Ok((vector, extra))
}

fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    encoder.write_all(data)?;
    encoder.finish()
}

fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    xz2::read::XzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}
