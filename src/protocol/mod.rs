//! Packet type identifiers and the analyzers/builders/rewriters for them.

pub mod constants;
pub mod packets;

pub use constants::*;
