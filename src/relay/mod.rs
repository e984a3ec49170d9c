//! The CDP Relay Bridge (§4.3): frame parsing, per-client state, and the
//! per-device routing actor.

pub mod bridge;
pub mod client;
pub mod frame;

pub use bridge::Relay;
