//! UDP session layer: reliable and ordered messaging, connection lifecycle,
//! host-time synchronization and simulated network conditions.
//!
//! Everything is polled from the game loop. A typical frame:
//!
//! ```no_run
//! use nebula_net::{MessageOptions, NetSession, SessionConfig};
//!
//! let mut session = NetSession::new(SessionConfig::default());
//! session
//!     .register_message(32, "chat", MessageOptions::RELIABLE_IN_ORDER, 1, |msg, sender, _| {
//!         if let Ok(text) = msg.read_string() {
//!             println!("{}: {}", sender.peer_id, text);
//!         }
//!     })
//!     .unwrap();
//! session.host("HOST", nebula_net::DEFAULT_PORT).unwrap();
//!
//! loop {
//!     session.process_incoming();
//!     // game update
//!     session.process_outgoing();
//! #   break;
//! }
//! ```

pub mod ack;
pub mod address;
pub mod clock;
pub mod condition;
pub mod connection;
pub mod core_messages;
pub mod diagnostics;
pub mod error;
pub mod framing;
pub mod message;
pub mod packer;
pub mod packet;
pub mod registry;
pub mod sequence;
pub mod session;
pub mod socket;

pub use address::{AddressError, NetAddress};
pub use clock::{ClockAdjustment, HostClock};
pub use condition::{ConditionerConfig, NetConditioner};
pub use connection::{ConnectionConfig, ConnectionId, ConnectionState, NetConnection};
pub use diagnostics::{ConnectionStats, NetworkDiagnostics, SessionCounters};
pub use error::NetError;
pub use framing::{FrameConfig, FrameDecoder, FrameError, FramedStream};
pub use message::{MAX_CHANNELS, MessageError, MessageOptions, NetMessage};
pub use packer::{BytePacker, Endianness, PackValue, PackerError};
pub use packet::{MAX_MESSAGE_PAYLOAD, MAX_PACKET_SIZE};
pub use registry::{
    Destination, MessageDefinition, MessageHandler, MessageRegistry, NetSender, Outbox,
    RESERVED_MESSAGE_COUNT,
};
pub use session::{
    DEFAULT_PORT, HOST_INDEX, MAX_CONNECTIONS, NetSession, SessionConfig, SessionEvent,
    SessionState,
};
pub use socket::{SocketConfig, TcpListenerHandle, TcpStreamHandle, UdpSocketHandle};
