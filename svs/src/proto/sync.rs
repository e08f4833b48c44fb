//! The sync engine as a state machine without IO.
//!
//! Peers converge on a shared version vector by exchanging multicast sync
//! interests. The state machine decides *when* to speak: a jittered periodic
//! retransmit keeps the group alive, and a suppression phase with a biased
//! delay curve keeps large groups from answering in a storm. All network and
//! timer effects are returned as [`OutEvent`]s; the runtime feeds network
//! input and expired timers back in as [`InEvent`]s.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::name::Name;

use super::vector::{SeqNo, VersionVector};

/// Protocol timing parameters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base period between unsolicited sync interests.
    pub periodic_timeout: Duration,
    /// Fraction of the period used as uniform jitter.
    pub periodic_jitter: f64,
    /// Upper bound for suppression replies, and the grace window in merges.
    pub suppression_timeout: Duration,
    /// Delay after a local sequence bump, so bursts coalesce into one send.
    pub update_debounce: Duration,
    /// Delay between `start()` and the first sync interest.
    pub settle_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            periodic_timeout: Duration::from_secs(30),
            periodic_jitter: 0.10,
            suppression_timeout: Duration::from_millis(500),
            update_debounce: Duration::from_millis(1),
            settle_delay: Duration::from_millis(100),
        }
    }
}

/// A contiguous span of sequence numbers from one producer that just became
/// known locally but has not been fetched yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingRange {
    pub id: Name,
    pub low: SeqNo,
    pub high: SeqNo,
}

/// Where the instance is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created but not started; nothing is sent.
    Uninitialized,
    /// Normal operation.
    Steady,
    /// We know more than at least one peer and are waiting to see whether
    /// somebody else says so first.
    Suppressing,
}

/// Input event to the state handler.
#[derive(Debug, Clone)]
pub enum InEvent {
    /// Begin operating: the settle delay starts now.
    Start,
    /// A validated sync interest's state vector arrived.
    RecvStateVector(VersionVector),
    /// A local publish advanced a sequence number.
    UpdateSeq { id: Option<Name>, seq: SeqNo },
    /// Trigger a previously scheduled timer.
    TimerExpired(Timer),
}

/// An output event from the state handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutEvent {
    /// Send a sync interest carrying this snapshot of the local vector.
    SendSyncInterest(VersionVector),
    /// Newly learned ranges; hand them to the owner.
    EmitUpdate(Vec<MissingRange>),
    /// Schedule a timer. The runtime sends [`InEvent::TimerExpired`] after
    /// the duration.
    ScheduleTimer(Duration, Timer),
}

/// Timers used by the engine.
///
/// There is one logical retransmit timer; rescheduling bumps the generation
/// so an already-queued expiry for an older generation is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Fires once, `settle_delay` after start.
    Settle,
    /// The (re)transmit timer, tagged with its generation.
    Retx(u64),
}

/// Outcome of merging a received vector into the local one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeResult {
    /// The local vector is strictly newer on at least one key.
    pub my_new: bool,
    /// The received vector advanced at least one local key.
    pub other_new: bool,
    /// Newly learned ranges, one per advanced key.
    pub missing: Vec<MissingRange>,
}

/// The suppression curve: maps a uniform draw `x` from `[0, c]` to a delay
/// biased towards `c`, so that in a large group most peers wait long and only
/// a few reply early.
pub(crate) fn curve(c: f64, x: f64) -> f64 {
    (c * (1.0 - ((x - c) / (c / 10.0)).exp())).floor()
}

/// Sync engine state for one group.
#[derive(Debug)]
pub struct State<R> {
    node_id: Name,
    config: Config,
    rng: R,
    vv: VersionVector,
    recorded: Option<VersionVector>,
    phase: Phase,
    retx_gen: u64,
    next_retx_at: Option<Instant>,
    outbox: Vec<OutEvent>,
}

impl State<rand::rngs::StdRng> {
    /// Initialize with an entropy-seeded per-instance random number
    /// generator.
    pub fn new(node_id: Name, config: Config) -> Self {
        use rand::SeedableRng;
        Self::with_rng(node_id, config, rand::rngs::StdRng::from_entropy())
    }
}

impl<R: Rng> State<R> {
    pub fn with_rng(node_id: Name, config: Config, rng: R) -> Self {
        Self {
            node_id,
            config,
            rng,
            vv: VersionVector::new(),
            recorded: None,
            phase: Phase::Uninitialized,
            retx_gen: 0,
            next_retx_at: None,
            outbox: Vec::new(),
        }
    }

    pub fn node_id(&self) -> &Name {
        &self.node_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Snapshot of the local vector.
    pub fn vector(&self) -> &VersionVector {
        &self.vv
    }

    /// The sequence number for `id`, defaulting to the own node id.
    pub fn seq(&self, id: Option<&Name>) -> SeqNo {
        self.vv.get(id.unwrap_or(&self.node_id))
    }

    /// Handle an incoming event.
    ///
    /// Returns an iterator of outgoing events that must be processed by the
    /// runtime.
    pub fn handle(&mut self, event: InEvent, now: Instant) -> impl Iterator<Item = OutEvent> + '_ {
        match event {
            InEvent::Start => {
                self.outbox
                    .push(OutEvent::ScheduleTimer(self.config.settle_delay, Timer::Settle));
            }
            InEvent::UpdateSeq { id, seq } => self.on_update_seq(id, seq, now),
            InEvent::RecvStateVector(other) => self.on_state_vector(other, now),
            InEvent::TimerExpired(timer) => self.on_timer(timer, now),
        }
        self.outbox.drain(..)
    }

    fn on_update_seq(&mut self, id: Option<Name>, seq: SeqNo, now: Instant) {
        let id = id.unwrap_or_else(|| self.node_id.clone());
        let prev = self.vv.get(&id);
        self.vv.set_at(&id, seq, now);
        if seq > prev {
            // Coalesce bursts: every bump within the window just replaces the
            // pending timer.
            self.schedule_retx(self.config.update_debounce, now);
        }
    }

    fn on_state_vector(&mut self, other: VersionVector, now: Instant) {
        let result = self.merge(&other, now);
        if !result.missing.is_empty() {
            self.outbox.push(OutEvent::EmitUpdate(result.missing));
        }

        if self.phase == Phase::Suppressing {
            if let Some(recorded) = self.recorded.as_mut() {
                recorded.merge_max(&other);
            }
            return;
        }

        if !result.my_new {
            // The peer knows at least as much as we do: push the next
            // unsolicited send out by a full fresh period.
            let delay = self.periodic_delay();
            self.schedule_retx(delay, now);
        } else {
            self.phase = Phase::Suppressing;
            self.recorded = Some(other);
            let delay = self.suppression_delay();
            // Only move the timer if the reply would beat the pending fire.
            if self.next_retx_at.map_or(true, |at| now + delay < at) {
                self.schedule_retx(delay, now);
            }
        }
    }

    fn on_timer(&mut self, timer: Timer, now: Instant) {
        match timer {
            Timer::Settle => {
                self.phase = Phase::Steady;
                self.send_sync_interest();
                let delay = self.periodic_delay();
                self.schedule_retx(delay, now);
            }
            Timer::Retx(gen) => {
                if gen != self.retx_gen {
                    return;
                }
                self.next_retx_at = None;
                match self.recorded.take() {
                    Some(recorded) => {
                        // While we waited, peers showed what they have. Speak
                        // only if we are still ahead of the aggregate.
                        let result = self.merge(&recorded, now);
                        if !result.missing.is_empty() {
                            self.outbox.push(OutEvent::EmitUpdate(result.missing));
                        }
                        if result.my_new {
                            self.send_sync_interest();
                        }
                        self.phase = Phase::Steady;
                    }
                    None => self.send_sync_interest(),
                }
                let delay = self.periodic_delay();
                self.schedule_retx(delay, now);
            }
        }
    }

    /// Merge a received vector into the local one.
    ///
    /// Keys the local side advanced less than a suppression window ago are
    /// excluded from the "I am newer" check: their sync interest may simply
    /// not have reached the peer yet.
    fn merge(&mut self, other: &VersionVector, now: Instant) -> MergeResult {
        let mut result = MergeResult::default();
        for (id, seq_other) in other.iter() {
            let seq_cur = self.vv.get(id);
            if seq_cur < seq_other {
                result.other_new = true;
                result.missing.push(MissingRange {
                    id: id.clone(),
                    low: seq_cur + 1,
                    high: seq_other,
                });
                self.vv.set_at(id, seq_other, now);
            }
        }
        for (id, seq) in self.vv.iter() {
            if let Some(updated) = self.vv.last_update(id) {
                if now.saturating_duration_since(updated) < self.config.suppression_timeout {
                    continue;
                }
            }
            if other.get(id) < seq {
                result.my_new = true;
                break;
            }
        }
        result
    }

    fn send_sync_interest(&mut self) {
        if self.phase == Phase::Uninitialized {
            return;
        }
        self.outbox.push(OutEvent::SendSyncInterest(self.vv.clone()));
    }

    fn schedule_retx(&mut self, delay: Duration, now: Instant) {
        self.retx_gen += 1;
        self.next_retx_at = Some(now + delay);
        self.outbox
            .push(OutEvent::ScheduleTimer(delay, Timer::Retx(self.retx_gen)));
    }

    fn periodic_delay(&mut self) -> Duration {
        let base = self.config.periodic_timeout.as_secs_f64();
        let jitter = self.config.periodic_jitter;
        Duration::from_secs_f64(self.rng.gen_range(base * (1.0 - jitter)..=base * (1.0 + jitter)))
    }

    fn suppression_delay(&mut self) -> Duration {
        let c = self.config.suppression_timeout.as_secs_f64() * 1000.0;
        let x = self.rng.gen_range(0.0..=c);
        Duration::from_millis(curve(c, x).max(0.0) as u64)
    }
}
