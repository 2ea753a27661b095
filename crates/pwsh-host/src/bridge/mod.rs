//! Manager-host IPC: framing, wire protocol, and the channel transport.

pub mod codec;
pub mod protocol;
pub mod transport;
