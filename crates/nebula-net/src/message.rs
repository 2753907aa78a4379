//! [`NetMessage`]: one typed unit of application data.

use std::time::Instant;

use bitflags::bitflags;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::packer::{BytePacker, PackValue, PackerError};

/// Number of in-order channels each connection keeps.
pub const MAX_CHANNELS: u8 = 8;

bitflags! {
    /// Delivery options of a message type, fixed at registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageOptions: u8 {
        /// May be processed without an established connection.
        const CONNECTIONLESS = 1 << 0;
        /// Retransmitted until the peer acknowledges it.
        const RELIABLE = 1 << 1;
        /// Delivered in send order within its channel. Implies reliable.
        const IN_ORDER = 1 << 2;
        /// Shorthand for reliable, ordered delivery.
        const RELIABLE_IN_ORDER = Self::RELIABLE.bits() | Self::IN_ORDER.bits();
    }
}

impl MessageOptions {
    /// Normalise a set of options: ordering requires reliability, and a
    /// connectionless message can be neither.
    pub fn normalized(self) -> Self {
        if self.contains(Self::CONNECTIONLESS) {
            Self::CONNECTIONLESS
        } else if self.contains(Self::IN_ORDER) {
            self | Self::RELIABLE
        } else {
            self
        }
    }
}

/// Errors raised while reading or writing a message payload.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The payload buffer rejected the operation.
    #[error(transparent)]
    Packer(#[from] PackerError),

    /// A serde value could not be encoded or decoded.
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),

    /// An encoded serde value does not fit a u16 length.
    #[error("serialized value of {0} bytes is too large")]
    TooLarge(usize),
}

/// A message ready to send, or one just received.
///
/// The type index and delivery options are stamped when the message is built
/// from its registered definition and never change afterwards.
#[derive(Debug, Clone)]
pub struct NetMessage {
    index: u8,
    options: MessageOptions,
    channel: u8,
    pub(crate) reliable_id: u16,
    pub(crate) sequence_id: u16,
    pub(crate) first_sent: Option<Instant>,
    payload: BytePacker,
}

impl NetMessage {
    /// Build an empty message of type `index` with explicit options.
    ///
    /// Normally created through
    /// [`MessageRegistry::create`](crate::MessageRegistry::create) so the
    /// options always match the registered definition.
    pub fn new(index: u8, options: MessageOptions, channel: u8) -> Self {
        Self {
            index,
            options: options.normalized(),
            channel: channel.min(MAX_CHANNELS - 1),
            reliable_id: 0,
            sequence_id: 0,
            first_sent: None,
            payload: BytePacker::new(),
        }
    }

    pub(crate) fn with_payload(
        index: u8,
        options: MessageOptions,
        channel: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            payload: BytePacker::from_bytes(payload),
            ..Self::new(index, options, channel)
        }
    }

    /// Registered message type index.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Delivery options.
    pub fn options(&self) -> MessageOptions {
        self.options
    }

    /// In-order channel (meaningful only for in-order messages).
    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn is_reliable(&self) -> bool {
        self.options.contains(MessageOptions::RELIABLE)
    }

    pub fn is_in_order(&self) -> bool {
        self.options.contains(MessageOptions::IN_ORDER)
    }

    pub fn is_connectionless(&self) -> bool {
        self.options.contains(MessageOptions::CONNECTIONLESS)
    }

    /// Reliable id assigned on first transmission (0 before that).
    pub fn reliable_id(&self) -> u16 {
        self.reliable_id
    }

    /// Per-channel sequence id assigned when queued on a connection.
    pub fn sequence_id(&self) -> u16 {
        self.sequence_id
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    /// Direct access to the payload buffer.
    pub fn packer(&mut self) -> &mut BytePacker {
        &mut self.payload
    }

    pub fn write<T: PackValue>(&mut self, value: T) -> Result<(), MessageError> {
        Ok(self.payload.write(value)?)
    }

    pub fn read<T: PackValue>(&mut self) -> Result<T, MessageError> {
        Ok(self.payload.read()?)
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), MessageError> {
        Ok(self.payload.write_string(value)?)
    }

    pub fn read_string(&mut self) -> Result<String, MessageError> {
        Ok(self.payload.read_string()?)
    }

    /// Append any serde value, postcard-encoded behind a u16 length.
    pub fn write_serde<T: Serialize>(&mut self, value: &T) -> Result<(), MessageError> {
        let bytes = postcard::to_allocvec(value)?;
        let len = u16::try_from(bytes.len()).map_err(|_| MessageError::TooLarge(bytes.len()))?;
        self.payload.write(len)?;
        self.payload.write_bytes(&bytes)?;
        Ok(())
    }

    /// Read a value written by [`write_serde`](Self::write_serde).
    pub fn read_serde<T: DeserializeOwned>(&mut self) -> Result<T, MessageError> {
        let len = usize::from(self.payload.read::<u16>()?);
        let bytes = self.payload.read_bytes(len)?;
        Ok(postcard::from_bytes(bytes)?)
    }
}
