//! # sl-channel
//!
//! Boundary channels for Sluice. A channel moves items from one blob's
//! output buffer to another blob's input buffer, either on the same node
//! ([`LocalChannel`]) or across the network ([`TcpOutputChannel`] and
//! [`TcpInputChannel`]). Network channels survive link failures by
//! reconnecting, and a clean stop never loses an item queued before it.

mod channel;
pub mod codec;
mod config;
mod directory;
mod local;
mod tcp;

pub use channel::{BoundaryChannel, ChannelHandle, ChannelReport, ConnectionStatus};
pub use config::ChannelConfig;
pub use directory::ChannelDirectory;
pub use local::LocalChannel;
pub use tcp::{TcpInputChannel, TcpOutputChannel};
