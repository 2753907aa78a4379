//! Packet framing: one header plus a run of messages per datagram.
//!
//! ```text
//! header : u8 sender index (0xFF = none) | u16 ack | u16 last_received_ack
//!          | u32 received_ack_bits | u8 message_count
//! message: u8 type index | [u16 reliable id] | [u16 sequence id]
//!          | u16 payload length | payload
//! ```
//!
//! All fields are little endian. The reliable and sequence ids are present
//! only when the registered options of the type index call for them, so
//! decoding needs the [`MessageRegistry`].

use crate::message::{MessageOptions, NetMessage};
use crate::packer::{BytePacker, PackerError};
use crate::registry::MessageRegistry;

/// Largest datagram the session writes or accepts.
pub const MAX_PACKET_SIZE: usize = 1232;

/// Encoded size of a [`PacketHeader`].
pub const PACKET_HEADER_SIZE: usize = 10;

/// Sender index meaning "no connection".
pub const NO_CONNECTION: u8 = 0xFF;

/// Fixed per-message overhead when both optional ids are present.
const MAX_MESSAGE_OVERHEAD: usize = 7;

/// Largest payload a single message can carry.
pub const MAX_MESSAGE_PAYLOAD: usize = MAX_PACKET_SIZE - PACKET_HEADER_SIZE - MAX_MESSAGE_OVERHEAD;

const MESSAGE_COUNT_OFFSET: usize = PACKET_HEADER_SIZE - 1;

/// Errors produced while parsing or building a packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// Fewer bytes than a header.
    #[error("packet of {0} bytes is shorter than its header")]
    TooShort(usize),

    /// The declared content runs past the end of the datagram.
    #[error("truncated packet: {0}")]
    Truncated(#[from] PackerError),

    /// A message names a type index with no registered definition.
    #[error("unknown message type {0}")]
    UnknownMessage(u8),

    /// Bytes left over after the declared message count.
    #[error("{0} trailing bytes after last message")]
    TrailingBytes(usize),

    /// The message does not fit the remaining packet space.
    #[error("message of {size} bytes does not fit ({remaining} bytes left)")]
    Full {
        /// Encoded message size.
        size: usize,
        /// Space left in the packet.
        remaining: usize,
    },
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Per-packet reliability header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    /// Sender's connection index on the receiving session, if any.
    pub sender_index: Option<u8>,
    /// This packet's ack number.
    pub ack: u16,
    /// Newest ack the sender has received from us.
    pub last_received_ack: u16,
    /// Which acks before `last_received_ack` the sender has received.
    pub received_ack_bits: u32,
    /// Number of messages that follow.
    pub message_count: u8,
}

impl PacketHeader {
    fn write(&self, packer: &mut BytePacker) -> Result<(), PackerError> {
        packer.write(self.sender_index.unwrap_or(NO_CONNECTION))?;
        packer.write(self.ack)?;
        packer.write(self.last_received_ack)?;
        packer.write(self.received_ack_bits)?;
        packer.write(self.message_count)
    }

    fn read(packer: &mut BytePacker) -> Result<Self, PackerError> {
        let sender: u8 = packer.read()?;
        Ok(Self {
            sender_index: (sender != NO_CONNECTION).then_some(sender),
            ack: packer.read()?,
            last_received_ack: packer.read()?,
            received_ack_bits: packer.read()?,
            message_count: packer.read()?,
        })
    }

    /// Parse only the header of a datagram.
    pub fn peek(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(PacketError::TooShort(bytes.len()));
        }
        let mut packer = BytePacker::from_bytes(&bytes[..PACKET_HEADER_SIZE]);
        Ok(Self::read(&mut packer)?)
    }
}

/// Bytes `msg` occupies inside a packet.
pub fn encoded_size(msg: &NetMessage) -> usize {
    let mut size = 1 + 2 + msg.payload().len();
    if msg.is_reliable() {
        size += 2;
    }
    if msg.is_in_order() {
        size += 2;
    }
    size
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Incrementally fills one datagram.
#[derive(Debug)]
pub struct PacketWriter {
    packer: BytePacker,
    count: u8,
}

impl PacketWriter {
    /// Start a packet; the header's message count is filled in by
    /// [`finish`](Self::finish).
    pub fn new(header: PacketHeader) -> Self {
        let mut packer = BytePacker::bounded(MAX_PACKET_SIZE);
        // A fresh bounded buffer always has room for the header.
        let _ = header.write(&mut packer);
        Self { packer, count: 0 }
    }

    pub fn remaining(&self) -> usize {
        MAX_PACKET_SIZE - self.packer.written_len()
    }

    pub fn message_count(&self) -> u8 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether `msg` fits into what is left of the packet.
    pub fn fits(&self, msg: &NetMessage) -> bool {
        self.count < u8::MAX && encoded_size(msg) <= self.remaining()
    }

    /// Append a message.
    pub fn push(&mut self, msg: &NetMessage) -> Result<(), PacketError> {
        if !self.fits(msg) {
            return Err(PacketError::Full {
                size: encoded_size(msg),
                remaining: self.remaining(),
            });
        }
        let payload = msg.payload();
        self.packer.write(msg.index())?;
        if msg.is_reliable() {
            self.packer.write(msg.reliable_id)?;
        }
        if msg.is_in_order() {
            self.packer.write(msg.sequence_id)?;
        }
        // Payloads are bounded by MAX_MESSAGE_PAYLOAD, well under u16::MAX.
        self.packer.write(payload.len() as u16)?;
        self.packer.write_bytes(payload)?;
        self.count += 1;
        Ok(())
    }

    /// Patch the message count and return the datagram bytes.
    pub fn finish(self) -> Vec<u8> {
        let mut bytes = self.packer.into_bytes();
        bytes[MESSAGE_COUNT_OFFSET] = self.count;
        bytes
    }
}

// ---------------------------------------------------------------------------
// Parsed packet
// ---------------------------------------------------------------------------

/// A received datagram split into header and messages.
#[derive(Debug)]
pub struct NetPacket {
    pub header: PacketHeader,
    pub messages: Vec<NetMessage>,
}

impl NetPacket {
    /// Parse a whole datagram.
    ///
    /// Any inconsistency (short header, unknown type, truncated payload,
    /// trailing garbage) rejects the entire packet.
    pub fn decode(bytes: &[u8], registry: &MessageRegistry) -> Result<Self, PacketError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(PacketError::TooShort(bytes.len()));
        }
        let mut packer = BytePacker::from_bytes(bytes);
        let header = PacketHeader::read(&mut packer)?;

        let mut messages = Vec::with_capacity(usize::from(header.message_count));
        for _ in 0..header.message_count {
            let index: u8 = packer.read()?;
            let definition = registry
                .definition(index)
                .ok_or(PacketError::UnknownMessage(index))?;
            let reliable_id = if definition.options.contains(MessageOptions::RELIABLE) {
                packer.read()?
            } else {
                0
            };
            let sequence_id = if definition.options.contains(MessageOptions::IN_ORDER) {
                packer.read()?
            } else {
                0
            };
            let len = usize::from(packer.read::<u16>()?);
            let payload = packer.read_bytes(len)?.to_vec();

            let mut msg =
                NetMessage::with_payload(index, definition.options, definition.channel, payload);
            msg.reliable_id = reliable_id;
            msg.sequence_id = sequence_id;
            messages.push(msg);
        }

        if packer.readable_len() > 0 {
            return Err(PacketError::TrailingBytes(packer.readable_len()));
        }
        Ok(Self { header, messages })
    }
}
