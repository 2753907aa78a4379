//! The session's own message catalog.
//!
//! These types drive the join handshake, liveness and time sync. They occupy
//! the low end of the index space; applications register their messages at
//! [`RESERVED_MESSAGE_COUNT`](crate::registry::RESERVED_MESSAGE_COUNT) and up.

use crate::address::NetAddress;
use crate::connection::ConnectionState;
use crate::message::{MessageError, MessageOptions, NetMessage};
use crate::registry::MessageRegistry;

pub const PING: u8 = 0;
pub const PONG: u8 = 1;
pub const HEARTBEAT: u8 = 2;
pub const JOIN_REQUEST: u8 = 3;
pub const JOIN_DENY: u8 = 4;
pub const JOIN_ACCEPT: u8 = 5;
pub const NEW_CONNECTION: u8 = 6;
pub const JOIN_FINISHED: u8 = 7;
pub const UPDATE_CONN_STATE: u8 = 8;
pub const HANGUP: u8 = 9;
pub const PEER_LEFT: u8 = 10;

/// Channel used by the ordered session messages.
pub const SESSION_CHANNEL: u8 = 0;

pub(crate) fn register_core(registry: &mut MessageRegistry) {
    let connectionless = MessageOptions::CONNECTIONLESS;
    registry.define(PING, "ping", connectionless, 0);
    registry.define(PONG, "pong", connectionless, 0);
    registry.define(HEARTBEAT, "heartbeat", MessageOptions::empty(), 0);
    registry.define(JOIN_REQUEST, "join_request", connectionless, 0);
    registry.define(JOIN_DENY, "join_deny", connectionless, 0);
    registry.define(JOIN_ACCEPT, "join_accept", connectionless, 0);
    registry.define(
        NEW_CONNECTION,
        "new_connection",
        MessageOptions::RELIABLE_IN_ORDER,
        SESSION_CHANNEL,
    );
    registry.define(JOIN_FINISHED, "join_finished", MessageOptions::RELIABLE, 0);
    registry.define(
        UPDATE_CONN_STATE,
        "update_conn_state",
        MessageOptions::RELIABLE_IN_ORDER,
        SESSION_CHANNEL,
    );
    registry.define(HANGUP, "hangup", MessageOptions::empty(), 0);
    registry.define(
        PEER_LEFT,
        "peer_left",
        MessageOptions::RELIABLE_IN_ORDER,
        SESSION_CHANNEL,
    );
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// `join_request`: a client asking to join.
///
/// Every resend carries a fresh `stamp`, which the host echoes in its
/// [`JoinAccept`] so the joiner can time the exact request that was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub peer_id: String,
    pub stamp: u16,
}

impl JoinRequest {
    pub fn write(&self, msg: &mut NetMessage) -> Result<(), MessageError> {
        msg.write_string(&self.peer_id)?;
        msg.write(self.stamp)
    }

    pub fn read(msg: &mut NetMessage) -> Result<Self, MessageError> {
        Ok(Self {
            peer_id: msg.read_string()?,
            stamp: msg.read()?,
        })
    }
}

/// `join_accept`: the host's answer to a successful `join_request`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAccept {
    /// Connection index the host assigned to the joiner.
    pub index: u8,
    /// The host's peer id.
    pub host_id: String,
    /// Host clock in milliseconds when the accept was written.
    pub host_time_ms: u32,
    /// Stamp of the `join_request` being answered.
    pub request_stamp: u16,
}

impl JoinAccept {
    pub fn write(&self, msg: &mut NetMessage) -> Result<(), MessageError> {
        msg.write(self.index)?;
        msg.write_string(&self.host_id)?;
        msg.write(self.host_time_ms)?;
        msg.write(self.request_stamp)
    }

    pub fn read(msg: &mut NetMessage) -> Result<Self, MessageError> {
        Ok(Self {
            index: msg.read()?,
            host_id: msg.read_string()?,
            host_time_ms: msg.read()?,
            request_stamp: msg.read()?,
        })
    }
}

/// `new_connection`: tells a client about another ready peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnection {
    pub index: u8,
    pub peer_id: String,
    pub address: NetAddress,
}

impl NewConnection {
    pub fn write(&self, msg: &mut NetMessage) -> Result<(), MessageError> {
        msg.write(self.index)?;
        msg.write_string(&self.peer_id)?;
        msg.write(u32::from(self.address.ip()))?;
        msg.write(self.address.port())
    }

    pub fn read(msg: &mut NetMessage) -> Result<Self, MessageError> {
        let index = msg.read()?;
        let peer_id = msg.read_string()?;
        let ip: u32 = msg.read()?;
        let port: u16 = msg.read()?;
        Ok(Self {
            index,
            peer_id,
            address: NetAddress::new(ip.into(), port),
        })
    }
}

/// Write a single length-prefixed string (join_deny, ping, pong).
pub fn write_text(msg: &mut NetMessage, text: &str) -> Result<(), MessageError> {
    msg.write_string(text)
}

/// Read the string written by [`write_text`].
pub fn read_text(msg: &mut NetMessage) -> Result<String, MessageError> {
    msg.read_string()
}

/// `heartbeat`: the sender's host clock in milliseconds.
pub fn write_heartbeat(msg: &mut NetMessage, host_time_ms: u32) -> Result<(), MessageError> {
    msg.write(host_time_ms)
}

pub fn read_heartbeat(msg: &mut NetMessage) -> Result<u32, MessageError> {
    msg.read()
}

/// `update_conn_state`: the sender's view of its connection to us.
pub fn write_conn_state(msg: &mut NetMessage, state: ConnectionState) -> Result<(), MessageError> {
    msg.write(state as u8)
}

pub fn read_conn_state(msg: &mut NetMessage) -> Result<Option<ConnectionState>, MessageError> {
    Ok(ConnectionState::from_u8(msg.read()?))
}

/// `peer_left`: the host dropped the peer at this connection index.
pub fn write_peer_left(msg: &mut NetMessage, index: u8) -> Result<(), MessageError> {
    msg.write(index)
}

pub fn read_peer_left(msg: &mut NetMessage) -> Result<u8, MessageError> {
    msg.read()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reread(msg: &NetMessage) -> NetMessage {
        NetMessage::with_payload(msg.index(), msg.options(), msg.channel(), msg.payload().to_vec())
    }

    #[test]
    fn test_catalog_options() {
        let registry = MessageRegistry::new();
        for index in [PING, PONG, JOIN_REQUEST, JOIN_DENY, JOIN_ACCEPT] {
            assert!(registry.create(index).unwrap().is_connectionless());
        }
        assert!(registry.create(JOIN_FINISHED).unwrap().is_reliable());
        assert!(registry.create(NEW_CONNECTION).unwrap().is_in_order());
        assert!(!registry.create(HEARTBEAT).unwrap().is_reliable());
        assert!(registry.create(PEER_LEFT).unwrap().is_in_order());
    }

    #[test]
    fn test_join_request_carries_stamp() {
        let request = JoinRequest {
            peer_id: "CLIENT1".into(),
            stamp: 7,
        };
        let mut msg = NetMessage::new(JOIN_REQUEST, MessageOptions::CONNECTIONLESS, 0);
        request.write(&mut msg).unwrap();
        assert_eq!(JoinRequest::read(&mut reread(&msg)).unwrap(), request);
    }

    #[test]
    fn test_join_accept_payload() {
        let accept = JoinAccept {
            index: 3,
            host_id: "HOST".into(),
            host_time_ms: 12_345,
            request_stamp: 4,
        };
        let mut msg = NetMessage::new(JOIN_ACCEPT, MessageOptions::CONNECTIONLESS, 0);
        accept.write(&mut msg).unwrap();
        assert_eq!(JoinAccept::read(&mut reread(&msg)).unwrap(), accept);
    }

    #[test]
    fn test_new_connection_payload_keeps_address() {
        let info = NewConnection {
            index: 2,
            peer_id: "CLIENT2".into(),
            address: "10.0.0.7:4100".parse().unwrap(),
        };
        let mut msg = NetMessage::new(NEW_CONNECTION, MessageOptions::RELIABLE_IN_ORDER, 0);
        info.write(&mut msg).unwrap();
        assert_eq!(NewConnection::read(&mut reread(&msg)).unwrap(), info);
    }

    #[test]
    fn test_conn_state_rejects_unknown_value() {
        let mut msg = NetMessage::new(UPDATE_CONN_STATE, MessageOptions::RELIABLE_IN_ORDER, 0);
        msg.write(200u8).unwrap();
        assert_eq!(read_conn_state(&mut reread(&msg)).unwrap(), None);
    }
}
