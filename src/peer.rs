//! Connected-peer identity.

/// Identifies one connected peer: the broker-assigned connection id and
/// the process id the peer reports on each request.
///
/// Never persisted — peers exist only for the lifetime of a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Peer {
    pub client_id: u64,
    pub pid: u64,
}

impl Peer {
    pub const fn new(client_id: u64, pid: u64) -> Self {
        Peer { client_id, pid }
    }

    /// The zero peer used as a placeholder for "no broadcaster".
    pub const NONE: Peer = Peer { client_id: 0, pid: 0 };

    pub const fn is_none(&self) -> bool {
        self.pid == 0
    }
}
