//! hookbus core - shared types for the agent event bus
//!
//! This crate provides the domain types shared between the bus daemon
//! (hookbusd), the sender-side pool and observers (hookbus-client):
//! - `envelope` - the normalized event record
//! - `router` - classification of raw inbound events into envelopes
//! - `hook` - canonical hook sub-events
//! - `session` - in-flight agent session records
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod envelope;
pub mod error;
pub mod hook;
pub mod router;
pub mod session;

// Re-exports for convenience
pub use envelope::{channel_matches, now_timestamp, Envelope, WILDCARD_CHANNEL};
pub use error::{DomainError, DomainResult};
pub use hook::HookKind;
pub use router::{normalize, route, LegacyEvent, Normalized, Route, PROTECTED_KEYS};
pub use session::{SessionId, SessionRecord, SessionStatus, SessionSummary};
