//! Capability IPC: ports, messages, rights and the named-port registry.

pub mod message;
pub mod named;
pub mod port;
pub mod rights;

pub use message::Message;
pub use port::Port;
pub use rights::{Right, RightType};
