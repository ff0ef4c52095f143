//! A virtual camera platform's broker and IPC bridge.
//!
//! One small daemon (the *broker*, [`broker::Service`]) owns a
//! per-device slot table in memory and serves it over a loopback TCP
//! protocol ([`message`], [`wire`]) to any number of client processes.
//! Each client talks to it through an [`bridge::IpcBridge`], the façade
//! a camera filter or a writer embeds: it reads and writes the shared
//! [`preferences::Preferences`] store that holds the device catalogue,
//! and it runs per-device frame pumps over the broker connection.
//!
//! Everything here is plain OS threads and blocking I/O — there is no
//! async runtime in this design (§5 of the design notes).

pub mod broker;
pub mod bridge;
pub mod client;
pub mod control;
pub mod error;
pub mod format;
pub mod fraction;
pub mod frame;
pub mod message;
pub mod peer;
pub mod preferences;
pub mod server;
pub mod wire;

pub use bridge::{IpcBridge, Operation, StreamType};
pub use error::{Error, Result};
pub use format::{FourCc, VideoFormat};
pub use fraction::Fraction;
pub use frame::VideoFrame;
pub use peer::Peer;
pub use preferences::Preferences;
