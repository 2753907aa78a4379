//! Message-type registry and handler dispatch.
//!
//! Every message type is registered once under a small integer index with a
//! name, its [`MessageOptions`], an in-order channel and (for application
//! messages) a handler. Incoming messages are routed to the handler for their
//! index. Handlers reply through an [`Outbox`]; the session sends whatever the
//! outbox collected once the handler returns.

use std::collections::HashMap;

use crate::address::NetAddress;
use crate::connection::ConnectionId;
use crate::core_messages;
use crate::error::NetError;
use crate::message::{MessageOptions, NetMessage};

/// Indices below this are owned by the session's own message catalog.
pub const RESERVED_MESSAGE_COUNT: u8 = 16;

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Who a received message came from.
///
/// For connectionless traffic this is a throwaway view built from the
/// datagram's source address; it has no index, id or reliability state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetSender {
    /// Source address of the packet.
    pub address: NetAddress,
    /// Sender's connection index, if it has a live connection.
    pub connection_index: Option<u8>,
    /// Stable handle of that connection.
    pub connection_id: Option<ConnectionId>,
    /// Peer-supplied identifier, empty when unknown.
    pub peer_id: String,
}

impl NetSender {
    /// A sender with no connection, identified only by its address.
    pub fn connectionless(address: NetAddress) -> Self {
        Self {
            address,
            connection_index: None,
            connection_id: None,
            peer_id: String::new(),
        }
    }

    /// Whether the message arrived outside any connection.
    pub fn is_connectionless(&self) -> bool {
        self.connection_index.is_none()
    }

    /// The source address formatted as `ip:port`.
    pub fn address_string(&self) -> String {
        self.address.to_string()
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Where a handler wants a message to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Back to whoever sent the message being handled.
    Reply,
    /// To the connection at this index.
    Connection(u8),
    /// Connectionless, straight to an address.
    Address(NetAddress),
    /// To every ready remote connection.
    Broadcast,
}

/// Messages queued by a handler, sent after it returns.
pub struct Outbox<'a> {
    registry: &'a MessageRegistry,
    sends: Vec<(Destination, NetMessage)>,
}

impl<'a> Outbox<'a> {
    pub(crate) fn new(registry: &'a MessageRegistry) -> Self {
        Self {
            registry,
            sends: Vec::new(),
        }
    }

    /// Build an empty message of a registered type by name.
    pub fn create(&self, name: &str) -> Option<NetMessage> {
        self.registry.create_named(name)
    }

    /// Queue a message for `destination`.
    pub fn send(&mut self, destination: Destination, msg: NetMessage) {
        self.sends.push((destination, msg));
    }

    /// Queue a reply to the current sender.
    pub fn reply(&mut self, msg: NetMessage) {
        self.send(Destination::Reply, msg);
    }

    /// Queue a message for every ready remote connection.
    pub fn broadcast(&mut self, msg: NetMessage) {
        self.send(Destination::Broadcast, msg);
    }

    pub(crate) fn into_sends(self) -> Vec<(Destination, NetMessage)> {
        self.sends
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Application callback for one message type.
pub trait MessageHandler {
    /// Process a single incoming message.
    fn handle(&mut self, msg: &mut NetMessage, sender: &NetSender, outbox: &mut Outbox<'_>);
}

/// Blanket implementation for closures.
impl<F> MessageHandler for F
where
    F: FnMut(&mut NetMessage, &NetSender, &mut Outbox<'_>),
{
    fn handle(&mut self, msg: &mut NetMessage, sender: &NetSender, outbox: &mut Outbox<'_>) {
        self(msg, sender, outbox);
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Static description of a message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDefinition {
    /// Wire index.
    pub index: u8,
    /// Human-readable name, unique within a registry.
    pub name: String,
    /// Delivery options.
    pub options: MessageOptions,
    /// In-order channel.
    pub channel: u8,
}

impl MessageDefinition {
    /// Build an empty message of this type.
    pub fn create(&self) -> NetMessage {
        NetMessage::new(self.index, self.options, self.channel)
    }
}

/// Index → definition and handler table.
pub struct MessageRegistry {
    definitions: Vec<Option<MessageDefinition>>,
    names: HashMap<String, u8>,
    handlers: HashMap<u8, Box<dyn MessageHandler>>,
}

impl MessageRegistry {
    /// A registry holding only the session's own message catalog.
    pub fn new() -> Self {
        let mut registry = Self {
            definitions: vec![None; 256],
            names: HashMap::new(),
            handlers: HashMap::new(),
        };
        core_messages::register_core(&mut registry);
        registry
    }

    pub(crate) fn define(&mut self, index: u8, name: &str, options: MessageOptions, channel: u8) {
        let definition = NetMessage::new(index, options, channel);
        if let Some(old) = self.definitions[usize::from(index)].take() {
            tracing::debug!("Message index {} re-registered ('{}' -> '{}')", index, old.name, name);
            self.names.remove(&old.name);
        }
        self.names.insert(name.to_owned(), index);
        self.definitions[usize::from(index)] = Some(MessageDefinition {
            index,
            name: name.to_owned(),
            options: definition.options(),
            channel: definition.channel(),
        });
    }

    /// Register an application message type with a closure handler.
    ///
    /// Registering an index twice replaces the earlier definition and
    /// handler. Indices below [`RESERVED_MESSAGE_COUNT`] are refused.
    pub fn register<F>(
        &mut self,
        index: u8,
        name: &str,
        options: MessageOptions,
        channel: u8,
        handler: F,
    ) -> Result<(), NetError>
    where
        F: FnMut(&mut NetMessage, &NetSender, &mut Outbox<'_>) + 'static,
    {
        self.register_handler(index, name, options, channel, handler)
    }

    /// Register an application message type with any [`MessageHandler`].
    pub fn register_handler<H>(
        &mut self,
        index: u8,
        name: &str,
        options: MessageOptions,
        channel: u8,
        handler: H,
    ) -> Result<(), NetError>
    where
        H: MessageHandler + 'static,
    {
        if index < RESERVED_MESSAGE_COUNT {
            return Err(NetError::ReservedIndex(index));
        }
        self.define(index, name, options, channel);
        self.handlers.insert(index, Box::new(handler));
        Ok(())
    }

    /// Look up a definition by index.
    pub fn definition(&self, index: u8) -> Option<&MessageDefinition> {
        self.definitions[usize::from(index)].as_ref()
    }

    /// Look up the index registered under `name`.
    pub fn index_for_name(&self, name: &str) -> Option<u8> {
        self.names.get(name).copied()
    }

    /// Build an empty message of type `index`.
    pub fn create(&self, index: u8) -> Option<NetMessage> {
        self.definition(index).map(MessageDefinition::create)
    }

    /// Build an empty message by type name.
    pub fn create_named(&self, name: &str) -> Option<NetMessage> {
        self.create(self.index_for_name(name)?)
    }

    /// Every registered definition in index order.
    pub fn definitions(&self) -> impl Iterator<Item = &MessageDefinition> {
        self.definitions.iter().flatten()
    }

    /// Run the handler for `msg`.
    ///
    /// Returns `None` when no handler is registered for its index.
    pub(crate) fn dispatch(
        &mut self,
        msg: &mut NetMessage,
        sender: &NetSender,
    ) -> Option<Vec<(Destination, NetMessage)>> {
        let index = msg.index();
        let mut handler = self.handlers.remove(&index)?;
        let mut outbox = Outbox::new(self);
        handler.handle(msg, sender, &mut outbox);
        let sends = outbox.into_sends();
        self.handlers.insert(index, handler);
        Some(sends)
    }

    /// Whether a handler is registered for `index`.
    pub fn has_handler(&self, index: u8) -> bool {
        self.handlers.contains_key(&index)
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}
