//! Application-layer intercepting proxy for the ShadowPlayer relay
//! protocol: binary framing, packet analyzers/builders, the connection
//! registry, the pre-proxy handshake state machine, and the proxy pipe
//! itself.

pub mod codec;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod trace;
