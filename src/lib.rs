//! Per-identity connected-time accounting engine.
//!
//! A firewall rule references a named accounting identity; every packet
//! that matches the rule contributes quantized connected-time to that
//! identity within its current reset epoch. Rules either monitor
//! (always match, just accumulate) or compare (match only once accumulated
//! time crosses a threshold).
//!
//! [`coordinator::Coordinator`] is the crate's entry point: it owns the
//! two-tier lock discipline and exposes the lifecycle calls
//! (`register_identity`/`destroy_identity`/`on_match`) a packet-filter host
//! would invoke. [`control::ControlServer`] exposes the binary GET/SET
//! protocol over any `Read + Write` transport.

pub mod accountant;
pub mod clock;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod corrector;
pub mod epoch;
pub mod error;
pub mod identity;
pub mod logging;
pub mod ring_history;
pub mod store;
pub mod wire;

pub use accountant::{Accountant, Packet};
pub use clock::{Clock, SystemClock};
pub use config::EngineConfig;
pub use control::ControlServer;
pub use coordinator::Coordinator;
pub use error::{EngineError, Result};
pub use identity::{CheckKind, IdentityConfig, IdentityState, Mode};
pub use store::{IdentityHandle, IdentityStore};
