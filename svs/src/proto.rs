//! Protocol implementation, as a state machine without IO.
//!
//! [`sync::State`] holds the replicated version vector and decides when sync
//! interests go out; all effects are [`sync::OutEvent`]s interpreted by the
//! runtime in [`crate::core`]. This keeps the protocol deterministic and
//! testable without a network.

pub mod sync;
pub mod util;
pub mod vector;

pub use sync::{Config, InEvent, MissingRange, OutEvent, Phase, State, Timer};
pub use vector::{SeqNo, VersionVector};
