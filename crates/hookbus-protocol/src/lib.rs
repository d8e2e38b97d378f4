//! hookbus protocol - wire protocol for bus communication
//!
//! This crate provides message types for communication between event
//! producers, dashboard observers and the bus daemon, plus the health
//! report served on `/health`.

pub mod health;
pub mod message;
pub mod version;

pub use health::HealthReport;
pub use message::{BusMessage, BusStatus, ChannelEvent, ClientMessage, MessageType};
pub use version::{ProtocolVersion, VersionError};
