//! Error types for the session layer.

use crate::address::NetAddress;
use crate::connection::ConnectionId;
use crate::session::SessionState;

/// Errors returned by [`NetSession`](crate::NetSession) operations.
///
/// Protocol-level problems (lost, duplicated, malformed or foreign packets)
/// never show up here: they are absorbed by the session and only logged.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// No port in the tried range could be bound.
    #[error("failed to bind {addr} (tried {range} ports): {source}")]
    Bind {
        /// First address tried.
        addr: NetAddress,
        /// Number of consecutive ports tried.
        range: u16,
        /// The last bind error.
        #[source]
        source: std::io::Error,
    },

    /// A socket operation other than bind failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation is not valid in the session's current state.
    #[error("operation '{operation}' not allowed in state {state:?}")]
    InvalidState {
        /// What was attempted.
        operation: &'static str,
        /// The session state at the time.
        state: SessionState,
    },

    /// No message type is registered under this index or name.
    #[error("unknown message type '{0}'")]
    UnknownMessage(String),

    /// Indices below this value belong to the session's own messages.
    #[error("message index {0} is reserved for session messages")]
    ReservedIndex(u8),

    /// No connection in a usable state exists at this index.
    #[error("no connection at index {0}")]
    NoConnection(u8),

    /// The slot already holds a different connection.
    #[error("connection slot {0} is already in use")]
    SlotInUse(u8),

    /// The connection handle does not refer to a live connection.
    #[error("connection {0} does not exist")]
    UnknownConnection(ConnectionId),

    /// A connectionless send was attempted with a message that requires a
    /// connection.
    #[error("message type {0} cannot be sent without a connection")]
    NotConnectionless(u8),

    /// A message does not fit into a single packet.
    #[error("message of {size} bytes exceeds the {max} byte packet limit")]
    MessageTooLarge {
        /// Encoded message size.
        size: usize,
        /// Largest payload a packet can carry.
        max: usize,
    },
}
