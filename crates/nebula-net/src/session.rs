//! [`NetSession`]: the socket, the connection table and the join handshake.
//!
//! A session is either idle, hosting, or joined to a host. It owns the single
//! UDP socket, every [`NetConnection`], the message registry, the simulated
//! network conditions and the host clock. Nothing here blocks: the game calls
//! [`process_incoming`](NetSession::process_incoming) and
//! [`process_outgoing`](NetSession::process_outgoing) once per frame and all
//! waiting (acks, join retries, timeouts, heartbeats) is polled against the
//! clock.
//!
//! # Handshake
//!
//! ```text
//! client                                host
//!   | -- join_request{id} ------------>  |  (connectionless, resent)
//!   | <------------ join_accept{index} --|  (connectionless)
//!   | -- join_finished --------------->  |  (reliable)
//!   |   Ready once acked                 |  Ready; new_connection to peers
//! ```
//!
//! Connections live in an arena keyed by [`ConnectionId`]; the fixed slot
//! array maps the small wire index to a handle. Destroying a connection
//! removes it from the arena and clears its slot, so a stale index can never
//! reach a dead connection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::address::NetAddress;
use crate::clock::HostClock;
use crate::condition::{ConditionerConfig, NetConditioner};
use crate::connection::{ConnectionConfig, ConnectionId, ConnectionState, NetConnection};
use crate::core_messages::{self, JoinAccept, JoinRequest, NewConnection};
use crate::diagnostics::{ConnectionStats, SessionCounters};
use crate::error::NetError;
use crate::message::{MessageOptions, NetMessage};
use crate::packet::{MAX_MESSAGE_PAYLOAD, MAX_PACKET_SIZE, NetPacket, PacketHeader, PacketWriter};
use crate::registry::{Destination, MessageDefinition, MessageRegistry, NetSender, Outbox};
use crate::socket::{SocketConfig, UdpSocketHandle};

/// Number of connection slots, and so the largest possible session.
pub const MAX_CONNECTIONS: usize = 32;

/// The host always sits at this index.
pub const HOST_INDEX: u8 = 0;

/// Consecutive ports tried when binding.
pub const BIND_PORT_RANGE: u16 = 8;

/// Port hosts listen on unless told otherwise.
pub const DEFAULT_PORT: u16 = 10084;

/// Outstanding `join_request` send times kept while joining.
const TRACKED_JOIN_REQUESTS: usize = 64;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Session-wide settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connection slots a host hands out, its own included. Default: 8.
    pub max_clients: usize,
    /// Silence after which a connection is dropped. Default: 10s.
    pub connection_timeout: Duration,
    /// How long a join may take before giving up. Default: 10s.
    pub join_timeout: Duration,
    /// Interval between `join_request` retries. Default: 100ms.
    pub join_resend_interval: Duration,
    /// Session ticks per second; flushes only happen on a tick. Default: 20.
    pub tick_rate_hz: f32,
    /// Client bind port, 0 for an ephemeral port. Default: 0.
    pub client_port: u16,
    /// Defaults for every new connection.
    pub connection: ConnectionConfig,
    /// Simulated loss and latency on incoming traffic.
    pub conditioner: ConditionerConfig,
    /// Fixed RNG seed for the conditioner, for reproducible runs.
    pub conditioner_seed: Option<u64>,
    pub socket: SocketConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_clients: 8,
            connection_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(10),
            join_resend_interval: Duration::from_millis(100),
            tick_rate_hz: 20.0,
            client_port: 0,
            connection: ConnectionConfig::default(),
            conditioner: ConditionerConfig::default(),
            conditioner_seed: None,
            socket: SocketConfig::default(),
        }
    }
}

fn rate_to_interval(hz: f32) -> Duration {
    if hz > 0.0 {
        Duration::from_secs_f32(1.0 / hz)
    } else {
        Duration::ZERO
    }
}

// ---------------------------------------------------------------------------
// State and events
// ---------------------------------------------------------------------------

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// No socket.
    #[default]
    Disconnected,
    /// Socket bound, role not yet established.
    Bound,
    /// Client waiting for `join_accept`.
    Connecting,
    /// Client accepted, waiting for the host to confirm `join_finished`.
    Joining,
    /// Hosting, or fully joined.
    Ready,
}

/// Notable things that happened during processing, for the game layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Hosting started.
    Hosted { address: NetAddress },
    /// The host accepted our join and assigned us `index`.
    JoinAccepted { index: u8, host_id: String },
    /// The join handshake completed.
    Joined,
    /// The host refused the join.
    JoinDenied { reason: String },
    /// The session returned to [`SessionState::Disconnected`].
    Disconnected { reason: String },
    /// A peer finished joining.
    ConnectionJoined {
        id: ConnectionId,
        index: u8,
        peer_id: String,
    },
    /// A peer left or timed out.
    ConnectionLeft {
        id: ConnectionId,
        index: Option<u8>,
        peer_id: String,
    },
    /// Answer to [`NetSession::send_ping`].
    Pong {
        from: NetAddress,
        text: String,
        rtt: Option<Duration>,
    },
}

#[derive(Debug)]
struct JoinAttempt {
    host_address: NetAddress,
    started: Instant,
    last_request: Option<Instant>,
    next_stamp: u16,
    /// Send time of each recent request, oldest first.
    sent: VecDeque<(u16, Instant)>,
}

impl JoinAttempt {
    fn new(host_address: NetAddress, now: Instant) -> Self {
        Self {
            host_address,
            started: now,
            last_request: None,
            next_stamp: 0,
            sent: VecDeque::with_capacity(TRACKED_JOIN_REQUESTS),
        }
    }

    fn record_request(&mut self, now: Instant) -> u16 {
        let stamp = self.next_stamp;
        self.next_stamp = self.next_stamp.wrapping_add(1);
        if self.sent.len() == TRACKED_JOIN_REQUESTS {
            self.sent.pop_front();
        }
        self.sent.push_back((stamp, now));
        self.last_request = Some(now);
        stamp
    }

    /// Round trip of the request the host answered. Falls back to the whole
    /// attempt when the stamp is no longer tracked, which overestimates.
    fn rtt_for(&self, stamp: u16, now: Instant) -> Duration {
        let sent = self
            .sent
            .iter()
            .rev()
            .find(|(s, _)| *s == stamp)
            .map_or(self.started, |(_, at)| *at);
        now.saturating_duration_since(sent)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One application's participation in a networked game.
pub struct NetSession {
    config: SessionConfig,
    state: SessionState,
    local_id: String,
    socket: Option<UdpSocketHandle>,
    registry: MessageRegistry,

    connections: BTreeMap<ConnectionId, NetConnection>,
    slots: [Option<ConnectionId>; MAX_CONNECTIONS],
    next_connection_id: u64,
    my_connection: Option<ConnectionId>,
    host_connection: Option<ConnectionId>,

    conditioner: NetConditioner,
    clock: HostClock,
    join: Option<JoinAttempt>,
    tick_interval: Duration,
    last_tick: Option<Instant>,

    events: VecDeque<SessionEvent>,
    counters: SessionCounters,
    pending_pings: HashMap<NetAddress, Instant>,
    recv_buffer: Vec<u8>,
}

impl NetSession {
    /// Create an idle session.
    pub fn new(config: SessionConfig) -> Self {
        let conditioner = match config.conditioner_seed {
            Some(seed) => NetConditioner::with_seed(config.conditioner, seed),
            None => NetConditioner::new(config.conditioner),
        };
        Self {
            tick_interval: rate_to_interval(config.tick_rate_hz),
            config,
            state: SessionState::Disconnected,
            local_id: String::new(),
            socket: None,
            registry: MessageRegistry::new(),
            connections: BTreeMap::new(),
            slots: [None; MAX_CONNECTIONS],
            next_connection_id: 1,
            my_connection: None,
            host_connection: None,
            conditioner,
            clock: HostClock::new(),
            join: None,
            last_tick: None,
            events: VecDeque::new(),
            counters: SessionCounters::default(),
            pending_pings: HashMap::new(),
            recv_buffer: vec![0; MAX_PACKET_SIZE * 2],
        }
    }

    // -- accessors ---------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Our own peer id.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Address the socket is bound to.
    pub fn local_address(&self) -> Option<NetAddress> {
        self.socket.as_ref().map(UdpSocketHandle::local_address)
    }

    pub fn is_host(&self) -> bool {
        self.clock.is_authoritative()
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Our own connection slot, once hosting or accepted.
    pub fn my_index(&self) -> Option<u8> {
        self.my_connection
            .and_then(|id| self.connections.get(&id))
            .and_then(NetConnection::index)
    }

    pub fn my_connection(&self) -> Option<&NetConnection> {
        self.my_connection.and_then(|id| self.connections.get(&id))
    }

    pub fn host_connection(&self) -> Option<&NetConnection> {
        self.host_connection.and_then(|id| self.connections.get(&id))
    }

    /// Current host time in milliseconds.
    pub fn current_host_time(&self) -> u32 {
        self.host_time_at(Instant::now())
    }

    pub fn host_time_at(&self, now: Instant) -> u32 {
        self.clock.now_ms(now)
    }

    pub fn clock(&self) -> &HostClock {
        &self.clock
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    /// Take every event raised since the last call.
    pub fn drain_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.events.drain(..)
    }

    /// Receive counters, including datagrams dropped by simulation.
    pub fn counters(&self) -> SessionCounters {
        SessionCounters {
            packets_dropped: self.conditioner.dropped(),
            ..self.counters
        }
    }

    /// Per-connection statistics in slot order, unbound connections last.
    pub fn connection_stats(&self) -> Vec<ConnectionStats> {
        let mut stats: Vec<ConnectionStats> =
            self.connections.values().map(NetConnection::stats).collect();
        stats.sort_by_key(|s| s.index.unwrap_or(u8::MAX));
        stats
    }

    // -- message registry --------------------------------------------------

    /// Register an application message type.
    ///
    /// Re-registering an index replaces its definition and handler. Indices
    /// below [`RESERVED_MESSAGE_COUNT`](crate::RESERVED_MESSAGE_COUNT) belong
    /// to the session and are refused.
    pub fn register_message<F>(
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
        self.registry.register(index, name, options, channel, handler)
    }

    pub fn message_index_for_name(&self, name: &str) -> Option<u8> {
        self.registry.index_for_name(name)
    }

    /// Definition registered at `index`.
    pub fn definition(&self, index: u8) -> Option<&MessageDefinition> {
        self.registry.definition(index)
    }

    /// Build an empty message of a registered type.
    pub fn create_message(&self, name: &str) -> Result<NetMessage, NetError> {
        self.registry
            .create_named(name)
            .ok_or_else(|| NetError::UnknownMessage(name.to_owned()))
    }

    // -- simulation and rates ----------------------------------------------

    pub fn set_simulated_loss(&mut self, loss_rate: f32) {
        self.conditioner.set_loss(loss_rate);
        tracing::info!("Simulated loss set to {:.1}%", self.conditioner.config().loss_rate * 100.0);
    }

    pub fn set_simulated_latency(&mut self, min: Duration, max: Duration) {
        self.conditioner.set_latency(min, max);
        let config = self.conditioner.config();
        tracing::info!(
            "Simulated latency set to {:?}..{:?}",
            config.min_latency,
            config.max_latency
        );
    }

    pub fn conditions(&self) -> ConditionerConfig {
        self.conditioner.config()
    }

    /// Session ticks per second.
    pub fn set_tick_rate(&mut self, hz: f32) {
        self.config.tick_rate_hz = hz;
        self.tick_interval = rate_to_interval(hz);
    }

    /// Packets per second for the connection at `index`.
    pub fn set_send_rate(&mut self, index: u8, hz: f32) -> Result<(), NetError> {
        let conn = self.connection_mut(index).ok_or(NetError::NoConnection(index))?;
        conn.set_send_rate(hz);
        Ok(())
    }

    // -- connection table --------------------------------------------------

    /// Put a new, unbound connection into the table.
    pub fn add_connection(&mut self, address: NetAddress, state: ConnectionState) -> ConnectionId {
        self.insert_connection(address, state, false, Instant::now())
    }

    fn insert_connection(
        &mut self,
        address: NetAddress,
        state: ConnectionState,
        local: bool,
        now: Instant,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;
        let mut conn = if local {
            NetConnection::new_local(id, address, &self.config.connection, now)
        } else {
            NetConnection::new(id, address, &self.config.connection, now)
        };
        conn.set_state(state);
        self.connections.insert(id, conn);
        id
    }

    /// Assign the connection `id` to slot `index`.
    pub fn bind_connection(&mut self, index: u8, id: ConnectionId) -> Result<(), NetError> {
        let slot = self
            .slots
            .get(usize::from(index))
            .ok_or(NetError::NoConnection(index))?;
        if slot.is_some_and(|held| held != id) {
            return Err(NetError::SlotInUse(index));
        }
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(NetError::UnknownConnection(id))?;
        if let Some(old) = conn.index() {
            self.slots[usize::from(old)] = None;
        }
        conn.set_index(Some(index));
        if conn.state() < ConnectionState::Bound {
            conn.set_state(ConnectionState::Bound);
        }
        self.slots[usize::from(index)] = Some(id);
        Ok(())
    }

    /// Remove a connection from the table and its slot.
    pub fn destroy_connection(&mut self, id: ConnectionId) -> Option<NetConnection> {
        let mut conn = self.connections.remove(&id)?;
        if let Some(index) = conn.index()
            && self.slots[usize::from(index)] == Some(id)
        {
            self.slots[usize::from(index)] = None;
        }
        if self.my_connection == Some(id) {
            self.my_connection = None;
        }
        if self.host_connection == Some(id) {
            self.host_connection = None;
        }
        conn.disconnect();
        tracing::debug!("Destroyed connection {} ({})", id, conn.address());
        Some(conn)
    }

    /// The connection at `index`, if it is at least connected.
    pub fn connection(&self, index: u8) -> Option<&NetConnection> {
        let id = (*self.slots.get(usize::from(index))?)?;
        self.connections.get(&id).filter(|c| c.is_connected())
    }

    pub fn connection_mut(&mut self, index: u8) -> Option<&mut NetConnection> {
        let id = (*self.slots.get(usize::from(index))?)?;
        self.connections.get_mut(&id).filter(|c| c.is_connected())
    }

    /// Any connection by handle, whatever its state.
    pub fn connection_by_id(&self, id: ConnectionId) -> Option<&NetConnection> {
        self.connections.get(&id)
    }

    /// Every connection in the table.
    pub fn connections(&self) -> impl Iterator<Item = &NetConnection> {
        self.connections.values()
    }

    /// Remote connections whose peers have finished joining.
    pub fn ready_connections(&self) -> impl Iterator<Item = &NetConnection> {
        self.connections
            .values()
            .filter(|c| !c.is_local() && c.is_ready())
    }

    fn find_by_address(&self, address: NetAddress) -> Option<ConnectionId> {
        self.connections
            .values()
            .find(|c| !c.is_local() && c.address() == address)
            .map(NetConnection::id)
    }

    fn free_index(&self) -> Option<u8> {
        let limit = self.config.max_clients.min(MAX_CONNECTIONS);
        (0..limit)
            .find(|&i| self.slots[i].is_none())
            .map(|i| i as u8)
    }

    fn usable_connection(&self, index: u8, from: NetAddress) -> Option<ConnectionId> {
        let id = (*self.slots.get(usize::from(index))?)?;
        let conn = self.connections.get(&id)?;
        (conn.is_connected() && !conn.is_local() && conn.address() == from).then_some(id)
    }

    // -- lifecycle ---------------------------------------------------------

    fn bind_socket(&self, addr: NetAddress, range: u16) -> Result<UdpSocketHandle, NetError> {
        UdpSocketHandle::bind_in_range(addr, range, &self.config.socket).map_err(|source| {
            tracing::error!("Failed to bind {} (+{} ports): {}", addr, range, source);
            NetError::Bind { addr, range, source }
        })
    }

    fn require_disconnected(&self, operation: &'static str) -> Result<(), NetError> {
        if self.state != SessionState::Disconnected {
            tracing::error!("Cannot {} while {:?}", operation, self.state);
            return Err(NetError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Start hosting on the first free port in `port..port + 8`.
    pub fn host(&mut self, id: &str, port: u16) -> Result<(), NetError> {
        self.host_at(id, port, Instant::now())
    }

    pub fn host_at(&mut self, id: &str, port: u16, now: Instant) -> Result<(), NetError> {
        self.require_disconnected("host")?;
        let socket = self.bind_socket(NetAddress::any(port), BIND_PORT_RANGE)?;
        let bound = socket.local_address();
        self.socket = Some(socket);
        self.state = SessionState::Bound;
        self.local_id = id.to_owned();

        let me = self.insert_connection(
            NetAddress::local(bound.port()),
            ConnectionState::Ready,
            true,
            now,
        );
        self.bind_connection(HOST_INDEX, me)?;
        if let Some(conn) = self.connections.get_mut(&me) {
            conn.set_peer_id(id);
            conn.set_state(ConnectionState::Ready);
        }
        self.my_connection = Some(me);
        self.host_connection = Some(me);
        self.clock.start_authoritative(now);
        self.last_tick = None;

        self.state = SessionState::Ready;
        tracing::info!("Hosting as '{}' on {}", id, bound);
        self.events.push_back(SessionEvent::Hosted { address: bound });
        Ok(())
    }

    /// Start joining the host at `host_address`.
    pub fn join(&mut self, id: &str, host_address: NetAddress) -> Result<(), NetError> {
        self.join_at(id, host_address, Instant::now())
    }

    pub fn join_at(&mut self, id: &str, host_address: NetAddress, now: Instant) -> Result<(), NetError> {
        self.require_disconnected("join")?;
        let port = self.config.client_port;
        let bind_addr = if host_address.is_loopback() {
            NetAddress::loopback(port)
        } else {
            NetAddress::local(port)
        };
        let range = if port == 0 { 1 } else { BIND_PORT_RANGE };
        let socket = self.bind_socket(bind_addr, range)?;
        let bound = socket.local_address();
        self.socket = Some(socket);
        self.state = SessionState::Bound;
        self.local_id = id.to_owned();

        let host = self.insert_connection(host_address, ConnectionState::Connecting, false, now);
        self.bind_connection(HOST_INDEX, host)?;
        if let Some(conn) = self.connections.get_mut(&host) {
            conn.set_state(ConnectionState::Connecting);
        }
        self.host_connection = Some(host);
        self.join = Some(JoinAttempt::new(host_address, now));
        self.last_tick = None;

        self.state = SessionState::Connecting;
        tracing::info!("Joining {} as '{}' from {}", host_address, id, bound);
        self.send_join_request(now);
        Ok(())
    }

    /// Leave the session. Safe to call in any state, any number of times.
    pub fn disconnect(&mut self) {
        self.disconnect_with("disconnected locally");
    }

    fn disconnect_with(&mut self, reason: &str) {
        if self.state == SessionState::Disconnected && self.socket.is_none() {
            return;
        }

        let now = Instant::now();
        let my_index = self.my_index();
        let hangup_targets: Vec<ConnectionId> = if self.is_host() {
            self.connections
                .values()
                .filter(|c| !c.is_local() && c.is_connected())
                .map(NetConnection::id)
                .collect()
        } else {
            self.host_connection
                .filter(|id| self.connections.get(id).is_some_and(NetConnection::is_connected))
                .into_iter()
                .collect()
        };
        for id in hangup_targets {
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            if let Some(msg) = self.registry.create(core_messages::HANGUP) {
                conn.send(msg);
            }
            if let Some(bytes) = conn.flush(now, my_index)
                && let Some(socket) = &self.socket
            {
                let _ = socket.send_to(&bytes, conn.address());
            }
        }

        for conn in self.connections.values_mut() {
            conn.disconnect();
        }
        self.connections.clear();
        self.slots = [None; MAX_CONNECTIONS];
        self.my_connection = None;
        self.host_connection = None;
        self.join = None;
        self.socket = None;
        self.conditioner.clear();
        self.clock.reset();
        self.pending_pings.clear();
        self.last_tick = None;
        self.state = SessionState::Disconnected;

        tracing::info!("Session disconnected: {}", reason);
        self.events.push_back(SessionEvent::Disconnected {
            reason: reason.to_owned(),
        });
    }

    // -- sending -----------------------------------------------------------

    fn check_size(msg: &NetMessage) -> Result<(), NetError> {
        let size = msg.payload().len();
        if size > MAX_MESSAGE_PAYLOAD {
            return Err(NetError::MessageTooLarge {
                size,
                max: MAX_MESSAGE_PAYLOAD,
            });
        }
        Ok(())
    }

    /// Queue a message on the connection at `index`.
    pub fn send_to(&mut self, index: u8, msg: NetMessage) -> Result<(), NetError> {
        Self::check_size(&msg)?;
        let conn = self.connection_mut(index).ok_or(NetError::NoConnection(index))?;
        conn.send(msg);
        Ok(())
    }

    /// Queue a copy of `msg` on every ready remote connection. Returns how
    /// many connections it was queued on.
    pub fn broadcast(&mut self, msg: NetMessage) -> Result<usize, NetError> {
        Self::check_size(&msg)?;
        let mut count = 0;
        for conn in self.connections.values_mut() {
            if !conn.is_local() && conn.is_ready() {
                conn.send(msg.clone());
                count += 1;
            }
        }
        Ok(count)
    }

    /// Send a connectionless message straight to `to`, bypassing any
    /// connection.
    pub fn send_connectionless(&mut self, to: NetAddress, msg: NetMessage) -> Result<(), NetError> {
        if !msg.is_connectionless() {
            return Err(NetError::NotConnectionless(msg.index()));
        }
        Self::check_size(&msg)?;
        let socket = self.socket.as_ref().ok_or(NetError::InvalidState {
            operation: "send_connectionless",
            state: self.state,
        })?;

        let mut writer = PacketWriter::new(PacketHeader::default());
        writer.push(&msg).map_err(|_| NetError::MessageTooLarge {
            size: msg.payload().len(),
            max: MAX_MESSAGE_PAYLOAD,
        })?;
        let bytes = writer.finish();
        if socket.send_to(&bytes, to)? {
            self.counters.packets_sent += 1;
        }
        Ok(())
    }

    /// Send a connectionless `ping`; the answer arrives as
    /// [`SessionEvent::Pong`].
    pub fn send_ping(&mut self, to: NetAddress, text: &str) -> Result<(), NetError> {
        let mut msg = self
            .registry
            .create(core_messages::PING)
            .ok_or_else(|| NetError::UnknownMessage("ping".into()))?;
        core_messages::write_text(&mut msg, text)
            .map_err(|_| NetError::MessageTooLarge { size: text.len(), max: MAX_MESSAGE_PAYLOAD })?;
        self.send_connectionless(to, msg)?;
        self.pending_pings.insert(to, Instant::now());
        Ok(())
    }

    fn send_join_request(&mut self, now: Instant) {
        let Some(join) = self.join.as_mut() else {
            return;
        };
        let host_address = join.host_address;
        let request = JoinRequest {
            peer_id: self.local_id.clone(),
            stamp: join.record_request(now),
        };
        let Some(mut msg) = self.registry.create(core_messages::JOIN_REQUEST) else {
            return;
        };
        if request.write(&mut msg).is_err() {
            return;
        }
        match self.send_connectionless(host_address, msg) {
            Ok(()) => tracing::trace!("join_request {} sent to {}", request.stamp, host_address),
            Err(e) => tracing::debug!("join_request to {} failed: {}", host_address, e),
        }
    }

    fn send_deny(&mut self, to: NetAddress, reason: &str) {
        tracing::info!("Denying join from {}: {}", to, reason);
        if let Some(mut msg) = self.registry.create(core_messages::JOIN_DENY)
            && core_messages::write_text(&mut msg, reason).is_ok()
            && let Err(e) = self.send_connectionless(to, msg)
        {
            tracing::debug!("join_deny to {} failed: {}", to, e);
        }
    }

    fn send_accept(&mut self, id: ConnectionId, request_stamp: u16, now: Instant) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        let (Some(index), address) = (conn.index(), conn.address()) else {
            return;
        };
        let accept = JoinAccept {
            index,
            host_id: self.local_id.clone(),
            host_time_ms: self.clock.now_ms(now),
            request_stamp,
        };
        let Some(mut msg) = self.registry.create(core_messages::JOIN_ACCEPT) else {
            return;
        };
        if accept.write(&mut msg).is_ok()
            && let Err(e) = self.send_connectionless(address, msg)
        {
            tracing::debug!("join_accept to {} failed: {}", address, e);
        }
    }

    fn send_new_connection(&mut self, to: ConnectionId, about: ConnectionId) {
        let Some(info) = self.connections.get(&about).and_then(|c| {
            Some(NewConnection {
                index: c.index()?,
                peer_id: c.peer_id().to_owned(),
                address: c.address(),
            })
        }) else {
            return;
        };
        let Some(mut msg) = self.registry.create(core_messages::NEW_CONNECTION) else {
            return;
        };
        if info.write(&mut msg).is_ok()
            && let Some(conn) = self.connections.get_mut(&to)
        {
            conn.send(msg);
        }
    }

    fn send_conn_state(&mut self, to: ConnectionId, state: ConnectionState) {
        let Some(mut msg) = self.registry.create(core_messages::UPDATE_CONN_STATE) else {
            return;
        };
        if core_messages::write_conn_state(&mut msg, state).is_ok()
            && let Some(conn) = self.connections.get_mut(&to)
        {
            conn.send(msg);
        }
    }

    // -- incoming ----------------------------------------------------------

    /// Read and dispatch everything that has arrived.
    pub fn process_incoming(&mut self) {
        self.process_incoming_at(Instant::now());
    }

    pub fn process_incoming_at(&mut self, now: Instant) {
        self.dispatch_loopback(now);

        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        loop {
            match socket.receive(&mut self.recv_buffer) {
                Ok(Some((len, from))) => {
                    self.counters.packets_received += 1;
                    let bytes = self.recv_buffer[..len].to_vec();
                    if !self.conditioner.push(from, bytes, now) {
                        tracing::trace!("Simulated loss dropped {} bytes from {}", len, from);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("UDP receive failed: {}", e);
                    break;
                }
            }
        }

        for (from, bytes) in self.conditioner.release(now) {
            // A handler may have disconnected the session.
            if self.socket.is_none() {
                break;
            }
            self.process_datagram(from, &bytes, now);
        }
        self.check_join_complete();
    }

    fn dispatch_loopback(&mut self, now: Instant) {
        let Some(me) = self.my_connection else {
            return;
        };
        let Some(conn) = self.connections.get_mut(&me) else {
            return;
        };
        let pending = conn.drain_loopback();
        if pending.is_empty() {
            return;
        }
        let sender = NetSender {
            address: conn.address(),
            connection_index: conn.index(),
            connection_id: Some(me),
            peer_id: conn.peer_id().to_owned(),
        };
        for msg in pending {
            self.dispatch(msg, &sender, now);
        }
    }

    fn process_datagram(&mut self, from: NetAddress, bytes: &[u8], now: Instant) {
        let packet = match NetPacket::decode(bytes, &self.registry) {
            Ok(packet) => packet,
            Err(e) => {
                self.counters.packets_malformed += 1;
                tracing::trace!("Malformed packet from {}: {}", from, e);
                return;
            }
        };

        let routed = packet
            .header
            .sender_index
            .and_then(|index| self.usable_connection(index, from));

        match routed {
            Some(id) => {
                let Some(conn) = self.connections.get_mut(&id) else {
                    return;
                };
                let delivered = conn.process_packet(&packet.header, packet.messages, bytes.len(), now);
                let sender = NetSender {
                    address: from,
                    connection_index: conn.index(),
                    connection_id: Some(id),
                    peer_id: conn.peer_id().to_owned(),
                };
                for msg in delivered {
                    self.dispatch(msg, &sender, now);
                }
            }
            None => {
                let sender = NetSender::connectionless(from);
                let mut unroutable = false;
                for msg in packet.messages {
                    if msg.is_connectionless() {
                        self.dispatch(msg, &sender, now);
                    } else {
                        unroutable = true;
                    }
                }
                if unroutable {
                    self.counters.packets_unroutable += 1;
                    tracing::trace!(
                        "Dropped packet from {} for unknown connection {:?}",
                        from,
                        packet.header.sender_index
                    );
                }
            }
        }
    }

    fn dispatch(&mut self, mut msg: NetMessage, sender: &NetSender, now: Instant) {
        if self.socket.is_none() {
            return;
        }
        match msg.index() {
            core_messages::PING => self.on_ping(&mut msg, sender),
            core_messages::PONG => self.on_pong(&mut msg, sender, now),
            core_messages::HEARTBEAT => self.on_heartbeat(&mut msg, sender, now),
            core_messages::JOIN_REQUEST => self.on_join_request(&mut msg, sender, now),
            core_messages::JOIN_DENY => self.on_join_deny(&mut msg, sender),
            core_messages::JOIN_ACCEPT => self.on_join_accept(&mut msg, sender, now),
            core_messages::NEW_CONNECTION => self.on_new_connection(&mut msg, sender, now),
            core_messages::JOIN_FINISHED => self.on_join_finished(sender),
            core_messages::UPDATE_CONN_STATE => self.on_update_conn_state(&mut msg, sender),
            core_messages::HANGUP => self.on_hangup(sender),
            core_messages::PEER_LEFT => self.on_peer_left(&mut msg, sender),
            index => match self.registry.dispatch(&mut msg, sender) {
                Some(sends) => self.deliver(sends, sender),
                None => tracing::trace!("No handler for message {} from {}", index, sender.address),
            },
        }
    }

    fn deliver(&mut self, sends: Vec<(Destination, NetMessage)>, sender: &NetSender) {
        for (destination, msg) in sends {
            let result = match destination {
                Destination::Reply if msg.is_connectionless() => {
                    self.send_connectionless(sender.address, msg)
                }
                Destination::Reply => match sender.connection_index {
                    Some(index) => self.send_to(index, msg),
                    None => Err(NetError::NotConnectionless(msg.index())),
                },
                Destination::Connection(index) => self.send_to(index, msg),
                Destination::Address(address) => self.send_connectionless(address, msg),
                Destination::Broadcast => self.broadcast(msg).map(|_| ()),
            };
            if let Err(e) = result {
                tracing::debug!("Handler reply to {:?} dropped: {}", destination, e);
            }
        }
    }

    // -- session message handlers -----------------------------------------

    fn on_ping(&mut self, msg: &mut NetMessage, sender: &NetSender) {
        let text = core_messages::read_text(msg).unwrap_or_default();
        let Some(mut pong) = self.registry.create(core_messages::PONG) else {
            return;
        };
        if core_messages::write_text(&mut pong, &text).is_ok()
            && let Err(e) = self.send_connectionless(sender.address, pong)
        {
            tracing::debug!("pong to {} failed: {}", sender.address, e);
        }
    }

    fn on_pong(&mut self, msg: &mut NetMessage, sender: &NetSender, now: Instant) {
        let text = core_messages::read_text(msg).unwrap_or_default();
        let rtt = self
            .pending_pings
            .remove(&sender.address)
            .map(|sent| now.saturating_duration_since(sent));
        tracing::info!("Pong from {}: '{}' ({:?})", sender.address, text, rtt);
        self.events.push_back(SessionEvent::Pong {
            from: sender.address,
            text,
            rtt,
        });
    }

    fn on_heartbeat(&mut self, msg: &mut NetMessage, sender: &NetSender, now: Instant) {
        let Ok(host_time) = core_messages::read_heartbeat(msg) else {
            return;
        };
        let from_host = sender.connection_id.is_some() && sender.connection_id == self.host_connection;
        if self.is_host() || !from_host {
            return;
        }
        let rtt = self.host_connection().map(NetConnection::rtt).unwrap_or_default();
        self.clock.on_host_time(host_time, rtt, now);
    }

    fn on_join_request(&mut self, msg: &mut NetMessage, sender: &NetSender, now: Instant) {
        let Ok(JoinRequest { peer_id, stamp }) = JoinRequest::read(msg) else {
            return;
        };
        if !self.is_host() || self.state != SessionState::Ready {
            self.send_deny(sender.address, "not hosting");
            return;
        }

        if let Some(existing) = self.find_by_address(sender.address) {
            let ready = self.connections.get(&existing).is_some_and(NetConnection::is_ready);
            if ready {
                self.send_deny(sender.address, "already connected");
            } else {
                self.send_accept(existing, stamp, now);
            }
            return;
        }

        let Some(index) = self.free_index() else {
            self.send_deny(sender.address, "session full");
            return;
        };
        let id = self.insert_connection(sender.address, ConnectionState::Connected, false, now);
        if let Err(e) = self.bind_connection(index, id) {
            tracing::warn!("Could not bind joiner {}: {}", sender.address, e);
            self.destroy_connection(id);
            return;
        }
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.set_peer_id(peer_id.as_str());
            conn.set_state(ConnectionState::Connected);
        }
        tracing::info!("Accepted '{}' from {} at index {}", peer_id, sender.address, index);
        self.send_accept(id, stamp, now);
    }

    fn on_join_deny(&mut self, msg: &mut NetMessage, sender: &NetSender) {
        let joining_from_sender = self.state == SessionState::Connecting
            && self.join.as_ref().is_some_and(|j| j.host_address == sender.address);
        if !joining_from_sender {
            return;
        }
        let reason = core_messages::read_text(msg).unwrap_or_default();
        tracing::warn!("Join denied by {}: {}", sender.address, reason);
        self.events.push_back(SessionEvent::JoinDenied {
            reason: reason.clone(),
        });
        self.disconnect_with(&format!("join denied: {reason}"));
    }

    fn on_join_accept(&mut self, msg: &mut NetMessage, sender: &NetSender, now: Instant) {
        let Some(join) = self.join.as_ref() else {
            return;
        };
        if self.state != SessionState::Connecting || join.host_address != sender.address {
            return;
        }
        let Ok(accept) = JoinAccept::read(msg) else {
            return;
        };
        let rtt = join.rtt_for(accept.request_stamp, now);

        if usize::from(accept.index) >= MAX_CONNECTIONS || accept.index == HOST_INDEX {
            tracing::warn!("Host assigned invalid index {}", accept.index);
            return;
        }
        let Some(host) = self.host_connection else {
            return;
        };
        if let Some(conn) = self.connections.get_mut(&host) {
            conn.set_peer_id(accept.host_id.as_str());
            conn.set_state(ConnectionState::Connected);
            conn.add_rtt_sample(rtt);
        }

        let address = self.local_address().unwrap_or(NetAddress::loopback(0));
        let me = self.insert_connection(address, ConnectionState::Ready, true, now);
        if let Err(e) = self.bind_connection(accept.index, me) {
            tracing::warn!("Could not take assigned index {}: {}", accept.index, e);
            self.destroy_connection(me);
            return;
        }
        if let Some(conn) = self.connections.get_mut(&me) {
            conn.set_peer_id(self.local_id.as_str());
            conn.set_state(ConnectionState::Ready);
        }
        self.my_connection = Some(me);
        self.clock.seed(accept.host_time_ms, rtt, now);

        if let Some(finished) = self.registry.create(core_messages::JOIN_FINISHED)
            && let Some(conn) = self.connections.get_mut(&host)
        {
            conn.send(finished);
        }
        self.state = SessionState::Joining;
        tracing::info!(
            "Join accepted by '{}' at index {} (rtt {:?})",
            accept.host_id,
            accept.index,
            rtt
        );
        self.events.push_back(SessionEvent::JoinAccepted {
            index: accept.index,
            host_id: accept.host_id,
        });
    }

    fn on_join_finished(&mut self, sender: &NetSender) {
        if !self.is_host() {
            return;
        }
        let Some(id) = sender.connection_id else {
            return;
        };
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.is_ready() {
            return;
        }
        conn.set_state(ConnectionState::Ready);
        let (index, peer_id) = (conn.index().unwrap_or(HOST_INDEX), conn.peer_id().to_owned());
        tracing::info!("'{}' finished joining at index {}", peer_id, index);

        let others: Vec<ConnectionId> = self
            .ready_connections()
            .map(NetConnection::id)
            .filter(|&other| other != id)
            .collect();
        for other in others {
            self.send_new_connection(other, id);
            self.send_new_connection(id, other);
        }
        self.events.push_back(SessionEvent::ConnectionJoined { id, index, peer_id });
    }

    fn on_new_connection(&mut self, msg: &mut NetMessage, sender: &NetSender, now: Instant) {
        let from_host = sender.connection_id.is_some() && sender.connection_id == self.host_connection;
        if self.is_host() || !from_host {
            return;
        }
        let Ok(info) = NewConnection::read(msg) else {
            return;
        };
        if Some(info.index) == self.my_index() || usize::from(info.index) >= MAX_CONNECTIONS {
            return;
        }
        if let Some(existing) = self.slots[usize::from(info.index)] {
            if self.connections.get(&existing).is_some_and(|c| c.address() == info.address) {
                return;
            }
            self.destroy_connection(existing);
        }

        let id = self.insert_connection(info.address, ConnectionState::Connected, false, now);
        if let Err(e) = self.bind_connection(info.index, id) {
            tracing::warn!("Could not bind peer '{}': {}", info.peer_id, e);
            self.destroy_connection(id);
            return;
        }
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.set_peer_id(info.peer_id.as_str());
            conn.set_state(ConnectionState::Connected);
        }
        tracing::info!("Connecting to peer '{}' at {} (index {})", info.peer_id, info.address, info.index);
        self.send_conn_state(id, ConnectionState::Ready);
    }

    fn on_update_conn_state(&mut self, msg: &mut NetMessage, sender: &NetSender) {
        let Ok(Some(state)) = core_messages::read_conn_state(msg) else {
            return;
        };
        let Some(id) = sender.connection_id else {
            return;
        };
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        match state {
            ConnectionState::Ready if !conn.is_ready() => {
                conn.set_state(ConnectionState::Ready);
                let event = SessionEvent::ConnectionJoined {
                    id,
                    index: conn.index().unwrap_or(HOST_INDEX),
                    peer_id: conn.peer_id().to_owned(),
                };
                self.events.push_back(event);
            }
            ConnectionState::Disconnected => conn.disconnect(),
            _ => {}
        }
    }

    fn on_hangup(&mut self, sender: &NetSender) {
        let Some(id) = sender.connection_id else {
            return;
        };
        if !self.is_host() && Some(id) == self.host_connection {
            self.disconnect_with("host hung up");
            return;
        }
        if let Some(conn) = self.connections.get_mut(&id) {
            tracing::info!("'{}' hung up", conn.peer_id());
            conn.disconnect();
        }
    }

    /// The host dropped another peer; stop waiting for it to time out here.
    fn on_peer_left(&mut self, msg: &mut NetMessage, sender: &NetSender) {
        let from_host = sender.connection_id.is_some() && sender.connection_id == self.host_connection;
        if self.is_host() || !from_host {
            return;
        }
        let Ok(index) = core_messages::read_peer_left(msg) else {
            return;
        };
        if index == HOST_INDEX || Some(index) == self.my_index() {
            return;
        }
        let Some(id) = self.slots.get(usize::from(index)).copied().flatten() else {
            return;
        };
        if let Some(conn) = self.connections.get_mut(&id) {
            tracing::info!("Host reports '{}' left", conn.peer_id());
            conn.disconnect();
        }
    }

    /// Tell the remaining ready peers that the peer at `index` is gone.
    fn send_peer_left(&mut self, index: u8) {
        let targets: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| !c.is_local() && c.is_ready())
            .map(NetConnection::id)
            .collect();
        for id in targets {
            let Some(mut msg) = self.registry.create(core_messages::PEER_LEFT) else {
                return;
            };
            if core_messages::write_peer_left(&mut msg, index).is_ok()
                && let Some(conn) = self.connections.get_mut(&id)
            {
                conn.send(msg);
            }
        }
    }

    fn check_join_complete(&mut self) {
        if self.state != SessionState::Joining {
            return;
        }
        let Some(host) = self.host_connection.and_then(|id| self.connections.get_mut(&id)) else {
            return;
        };
        if host.has_pending_reliables() {
            return;
        }
        host.set_state(ConnectionState::Ready);
        self.state = SessionState::Ready;
        tracing::info!("Joined session as index {:?}", self.my_index());
        self.events.push_back(SessionEvent::Joined);
    }

    // -- outgoing ----------------------------------------------------------

    /// Sweep dead connections, drive the join, send heartbeats and flush.
    pub fn process_outgoing(&mut self) {
        self.process_outgoing_at(Instant::now());
    }

    pub fn process_outgoing_at(&mut self, now: Instant) {
        if self.socket.is_none() {
            return;
        }
        if !self.sweep_connections(now) {
            return;
        }
        if !self.drive_join(now) {
            return;
        }
        self.clock.update(now);
        self.check_join_complete();
        self.send_heartbeats(now);

        let tick_due = self
            .last_tick
            .is_none_or(|last| now.saturating_duration_since(last) >= self.tick_interval);
        if tick_due {
            self.last_tick = Some(now);
            self.flush_connections(now);
        }
    }

    /// Remove disconnected and timed-out connections. Returns `false` if the
    /// session itself went down.
    fn sweep_connections(&mut self, now: Instant) -> bool {
        let timeout = self.config.connection_timeout;
        let dead: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| {
                c.state() == ConnectionState::Disconnected
                    || (c.state() >= ConnectionState::Connected && c.is_timed_out(now, timeout))
            })
            .map(NetConnection::id)
            .collect();

        for id in dead {
            if !self.is_host() && Some(id) == self.host_connection {
                self.disconnect_with("lost connection to host");
                return false;
            }
            if let Some(conn) = self.destroy_connection(id) {
                tracing::info!("Connection '{}' ({}) removed", conn.peer_id(), conn.address());
                if self.is_host()
                    && !conn.is_local()
                    && let Some(index) = conn.index()
                {
                    self.send_peer_left(index);
                }
                self.events.push_back(SessionEvent::ConnectionLeft {
                    id,
                    index: conn.index(),
                    peer_id: conn.peer_id().to_owned(),
                });
            }
        }
        true
    }

    /// Resend `join_request` or give up. Returns `false` if the join timed out.
    fn drive_join(&mut self, now: Instant) -> bool {
        if self.state != SessionState::Connecting {
            return true;
        }
        let Some(join) = self.join.as_ref() else {
            return true;
        };
        if now.saturating_duration_since(join.started) > self.config.join_timeout {
            tracing::warn!("Join to {} timed out", join.host_address);
            self.disconnect_with("join timed out");
            return false;
        }
        let resend = join
            .last_request
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.join_resend_interval);
        if resend {
            self.send_join_request(now);
        }
        true
    }

    fn send_heartbeats(&mut self, now: Instant) {
        let host_time = self.clock.now_ms(now);
        let my_index = self.my_index();
        let Some(template) = self.registry.create(core_messages::HEARTBEAT) else {
            return;
        };
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        for conn in self.connections.values_mut() {
            if !conn.is_connected() || !conn.heartbeat_due(now) {
                continue;
            }
            let mut msg = template.clone();
            if core_messages::write_heartbeat(&mut msg, host_time).is_err() {
                continue;
            }
            conn.send(msg);
            conn.mark_heartbeat(now);
            if let Some(bytes) = conn.flush(now, my_index) {
                Self::send_datagram(socket, &mut self.counters, &bytes, conn.address());
            }
        }
    }

    fn flush_connections(&mut self, now: Instant) {
        let my_index = self.my_index();
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        for conn in self.connections.values_mut() {
            if conn.is_local() || !conn.is_connected() || !conn.send_timer_elapsed(now) {
                continue;
            }
            if let Some(bytes) = conn.flush(now, my_index) {
                Self::send_datagram(socket, &mut self.counters, &bytes, conn.address());
            }
        }
    }

    fn send_datagram(socket: &UdpSocketHandle, counters: &mut SessionCounters, bytes: &[u8], to: NetAddress) {
        match socket.send_to(bytes, to) {
            Ok(true) => counters.packets_sent += 1,
            Ok(false) => tracing::debug!("Send to {} would block, packet dropped", to),
            Err(e) => tracing::debug!("Send to {} failed: {}", to, e),
        }
    }
}

impl Default for NetSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Drop for NetSession {
    fn drop(&mut self) {
        self.disconnect_with("session dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_idle() {
        let session = NetSession::default();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.local_address().is_none());
        assert!(session.my_index().is_none());
    }

    #[test]
    fn test_join_rtt_times_the_answered_request() {
        let t0 = Instant::now();
        let mut join = JoinAttempt::new(NetAddress::loopback(DEFAULT_PORT), t0);
        let first = join.record_request(t0);
        let second = join.record_request(t0 + Duration::from_millis(100));
        assert_ne!(first, second);

        let now = t0 + Duration::from_millis(300);
        assert_eq!(join.rtt_for(first, now), Duration::from_millis(300));
        assert_eq!(join.rtt_for(second, now), Duration::from_millis(200));
        assert_eq!(join.last_request, Some(t0 + Duration::from_millis(100)));
    }

    #[test]
    fn test_join_rtt_falls_back_to_attempt_start() {
        let t0 = Instant::now();
        let mut join = JoinAttempt::new(NetAddress::loopback(DEFAULT_PORT), t0);
        for i in 0..TRACKED_JOIN_REQUESTS as u32 + 1 {
            join.record_request(t0 + Duration::from_millis(10) * i);
        }
        assert_eq!(join.sent.len(), TRACKED_JOIN_REQUESTS);
        // Stamp 0 was evicted.
        let now = t0 + Duration::from_secs(2);
        assert_eq!(join.rtt_for(0, now), Duration::from_secs(2));
    }

    #[test]
    fn test_host_creates_self_connection() {
        let mut session = NetSession::default();
        session.host("HOST", 0).unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.is_host());
        assert_eq!(session.my_index(), Some(HOST_INDEX));
        let me = session.connection(HOST_INDEX).unwrap();
        assert!(me.is_local());
        assert_eq!(me.peer_id(), "HOST");
        assert!(matches!(
            session.drain_events().next(),
            Some(SessionEvent::Hosted { .. })
        ));
    }

    #[test]
    fn test_host_twice_is_refused() {
        let mut session = NetSession::default();
        session.host("HOST", 0).unwrap();
        let err = session.host("HOST", 0).unwrap_err();
        assert!(matches!(
            err,
            NetError::InvalidState {
                operation: "host",
                state: SessionState::Ready
            }
        ));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut session = NetSession::default();
        session.disconnect();
        assert_eq!(session.drain_events().count(), 0);

        session.host("HOST", 0).unwrap();
        session.drain_events().for_each(drop);
        session.disconnect();
        session.disconnect();
        let events: Vec<SessionEvent> = session.drain_events().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.connection(HOST_INDEX).is_none());
    }

    #[test]
    fn test_reserved_message_index_rejected() {
        let mut session = NetSession::default();
        let err = session
            .register_message(core_messages::HANGUP, "mine", MessageOptions::empty(), 0, |_, _, _| {})
            .unwrap_err();
        assert!(matches!(err, NetError::ReservedIndex(core_messages::HANGUP)));
    }

    #[test]
    fn test_loopback_send_dispatches_to_self() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut session = NetSession::default();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        session
            .register_message(40, "note", MessageOptions::RELIABLE, 0, move |msg, sender, _| {
                sink.borrow_mut()
                    .push((msg.read_string().unwrap(), sender.connection_index));
            })
            .unwrap();
        session.host("HOST", 0).unwrap();

        let mut msg = session.create_message("note").unwrap();
        msg.write_string("hi me").unwrap();
        session.send_to(HOST_INDEX, msg).unwrap();
        session.process_incoming();

        assert_eq!(*seen.borrow(), vec![("hi me".to_string(), Some(HOST_INDEX))]);
    }

    #[test]
    fn test_connection_slots_hide_half_open() {
        let mut session = NetSession::default();
        let id = session.add_connection(NetAddress::loopback(4000), ConnectionState::Connecting);
        session.bind_connection(5, id).unwrap();
        assert!(session.connection(5).is_none());
        assert_eq!(session.connection_by_id(id).unwrap().index(), Some(5));

        let other = session.add_connection(NetAddress::loopback(4001), ConnectionState::Connected);
        assert!(matches!(session.bind_connection(5, other), Err(NetError::SlotInUse(5))));

        session.destroy_connection(id).unwrap();
        session.bind_connection(5, other).unwrap();
        assert_eq!(session.connection(5).unwrap().address(), NetAddress::loopback(4001));
    }

    #[test]
    fn test_send_to_unknown_index_fails() {
        let mut session = NetSession::default();
        session.host("HOST", 0).unwrap();
        let msg = NetMessage::new(40, MessageOptions::empty(), 0);
        assert!(matches!(session.send_to(9, msg), Err(NetError::NoConnection(9))));
    }

    #[test]
    fn test_connectionless_send_requires_flag() {
        let mut session = NetSession::default();
        session.host("HOST", 0).unwrap();
        let msg = NetMessage::new(40, MessageOptions::RELIABLE, 0);
        assert!(matches!(
            session.send_connectionless(NetAddress::loopback(1), msg),
            Err(NetError::NotConnectionless(40))
        ));
    }
}
