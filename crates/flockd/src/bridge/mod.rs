//! Supervisor↔worker control channel: wire types, framing, channel tasks.

pub mod channel;
pub mod codec;
pub mod protocol;
