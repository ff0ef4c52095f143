//! The error type for interactions with this crate.

use thiserror::Error;

/// Errors surfaced by the broker, the message transport, and the bridge.
///
/// Most Preferences- and protocol-level failures are deliberately *not*
/// represented here: a decode of a wrong-length payload degrades to a
/// default value, and a busy slot degrades to a `STATUS(-1)` response,
/// exactly as described by the protocol itself. This type is for the
/// operations that fail loudly: binding a socket, connecting, allocating
/// a device id under a strict caller, and the like.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An underlying I/O error occurred on a control-socket operation.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The peer closed the connection before a full message frame arrived.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A received message frame's declared length didn't match any
    /// known payload shape for its message id.
    #[error("malformed message body for id {0:#x}")]
    MalformedMessage(i32),

    /// `subscribe` was called twice for the same message id.
    #[error("a handler is already registered for message id {0:#x}")]
    HandlerAlreadyRegistered(i32),

    /// The device-id allocator has no free slot left in `[0, 64)`.
    #[error("no free device id available")]
    DeviceIdSpaceExhausted,

    /// A pump was started for a device id that already has one running.
    #[error("a pump is already running for device {0:?}")]
    PumpAlreadyRunning(String),

    /// The broker reported that another peer already owns the broadcaster
    /// role for this device.
    #[error("device {0:?} is already being broadcast by another peer")]
    DeviceBusy(String),

    /// The local broker could not be reached within `serviceTimeout`.
    #[error("broker did not come up on port {0} within the configured timeout")]
    ServiceUnreachable(u16),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
