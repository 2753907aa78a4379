//! Per-peer reliability state machine.
//!
//! A [`NetConnection`] owns everything the session knows about one peer:
//! identity, lifecycle state, the ack bookkeeping in both directions, the
//! reliable retry queue, in-order channel sequencing and the timers that
//! decide when a packet is flushed.
//!
//! # Reliability
//!
//! Every packet is stamped with the next outgoing ack. The peer reports back
//! its newest received ack plus a 32-bit history (see [`AckWindow`]). A sent
//! packet is *confirmed* once any incoming header marks its ack as received
//! and *lost* once it falls out of that 32-ack window unconfirmed.
//!
//! Reliable messages get a reliable id when first transmitted and are then
//! written into every outgoing packet until a packet carrying them is
//! confirmed. At most [`RELIABLE_WINDOW`] ids may be outstanding; later
//! reliables wait in FIFO order. The receiver filters duplicate reliable ids
//! through a second sliding window.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use crate::ack::{ACK_WINDOW, AckRecord, AckWindow};
use crate::address::NetAddress;
use crate::diagnostics::{ConnectionStats, DiagnosticsTracker};
use crate::message::{MAX_CHANNELS, NetMessage};
use crate::packet::{PacketHeader, PacketWriter};
use crate::sequence::distance;

/// Reliable ids that may be unconfirmed at once.
pub const RELIABLE_WINDOW: u16 = 32;

/// Early in-order arrivals kept per channel.
const MAX_BUFFERED_PER_CHANNEL: usize = 2 * RELIABLE_WINDOW as usize;

/// Unconfirmed packets remembered before they are written off as lost.
const MAX_IN_FLIGHT: usize = 256;

/// Unreliable messages kept while waiting for a flush; the oldest are dropped.
const MAX_QUEUED_UNRELIABLE: usize = 512;

// ---------------------------------------------------------------------------
// Identity and state
// ---------------------------------------------------------------------------

/// Stable handle to a connection, never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a connection. Ordered, so `state >= Connected` reads as
/// "usable for traffic".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// Terminal. The session destroys the connection on its next sweep.
    #[default]
    Disconnected = 0,
    /// Has a slot index but no handshake yet.
    Bound = 1,
    /// Handshake in progress.
    Connecting = 2,
    /// Handshake done; traffic flows.
    Connected = 3,
    /// Peer has finished joining.
    Ready = 4,
}

impl ConnectionState {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Disconnected,
            1 => Self::Bound,
            2 => Self::Connecting,
            3 => Self::Connected,
            4 => Self::Ready,
            _ => return None,
        })
    }
}

/// Per-connection timing.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Packets per second this connection may flush. Default: 20.
    pub send_rate_hz: f32,
    /// Idle interval after which a heartbeat is sent. Default: 500ms.
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_rate_hz: 20.0,
            heartbeat_interval: Duration::from_millis(500),
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
// In-order channel
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct InOrderChannel {
    next_send: u16,
    next_expected: u16,
    buffered: HashMap<u16, NetMessage>,
}

impl InOrderChannel {
    fn assign(&mut self) -> u16 {
        let seq = self.next_send;
        self.next_send = self.next_send.wrapping_add(1);
        seq
    }

    /// Accept an arrival, pushing everything now deliverable onto `out`.
    fn receive(&mut self, msg: NetMessage, out: &mut Vec<NetMessage>) {
        let ahead = distance(self.next_expected, msg.sequence_id);
        if ahead < 0 {
            tracing::trace!("Dropping stale in-order sequence {}", msg.sequence_id);
            return;
        }
        if ahead > 0 {
            if ahead as usize > MAX_BUFFERED_PER_CHANNEL {
                tracing::debug!("In-order sequence {} too far ahead, dropped", msg.sequence_id);
                return;
            }
            self.buffered.entry(msg.sequence_id).or_insert(msg);
            return;
        }

        out.push(msg);
        self.next_expected = self.next_expected.wrapping_add(1);
        while let Some(next) = self.buffered.remove(&self.next_expected) {
            out.push(next);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
    }
}

/// A sent packet awaiting confirmation.
#[derive(Debug)]
struct SentPacket {
    ack: u16,
    sent_at: Instant,
    reliable_ids: Vec<u16>,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One peer of the session, or the session's own loopback entry.
#[derive(Debug)]
pub struct NetConnection {
    id: ConnectionId,
    index: Option<u8>,
    address: NetAddress,
    peer_id: String,
    state: ConnectionState,
    is_local: bool,
    loopback: VecDeque<NetMessage>,

    // Outgoing packet acks and the peer's view of them.
    next_ack: u16,
    in_flight: VecDeque<SentPacket>,
    last_confirmed_ack: Option<u16>,

    // Incoming packet acks, reported back in every header.
    received: AckWindow,
    pending_ack: bool,

    // Reliable delivery.
    next_reliable_id: u16,
    queued_reliables: VecDeque<NetMessage>,
    unconfirmed: Vec<NetMessage>,
    received_reliables: AckWindow,

    unreliables: VecDeque<NetMessage>,
    channels: [InOrderChannel; MAX_CHANNELS as usize],

    // Timing.
    send_interval: Duration,
    heartbeat_interval: Duration,
    created_at: Instant,
    last_send: Option<Instant>,
    last_flush_tick: Option<Instant>,
    last_heartbeat: Instant,
    last_recv: Instant,

    stats: DiagnosticsTracker,
}

impl NetConnection {
    /// Create a connection to `address` in state [`ConnectionState::Disconnected`].
    pub fn new(id: ConnectionId, address: NetAddress, config: &ConnectionConfig, now: Instant) -> Self {
        Self {
            id,
            index: None,
            address,
            peer_id: String::new(),
            state: ConnectionState::Disconnected,
            is_local: false,
            loopback: VecDeque::new(),
            next_ack: 0,
            in_flight: VecDeque::new(),
            last_confirmed_ack: None,
            received: AckWindow::default(),
            pending_ack: false,
            next_reliable_id: 0,
            queued_reliables: VecDeque::new(),
            unconfirmed: Vec::new(),
            received_reliables: AckWindow::default(),
            unreliables: VecDeque::new(),
            channels: Default::default(),
            send_interval: rate_to_interval(config.send_rate_hz),
            heartbeat_interval: config.heartbeat_interval,
            created_at: now,
            last_send: None,
            last_flush_tick: None,
            last_heartbeat: now,
            last_recv: now,
            stats: DiagnosticsTracker::default(),
        }
    }

    /// The session's own entry: sends to it are delivered locally.
    pub fn new_local(id: ConnectionId, address: NetAddress, config: &ConnectionConfig, now: Instant) -> Self {
        Self {
            is_local: true,
            ..Self::new(id, address, config, now)
        }
    }

    // -- identity --------------------------------------------------------

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Slot index on this session, `None` until bound.
    pub fn index(&self) -> Option<u8> {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: Option<u8>) {
        self.index = index;
    }

    pub fn address(&self) -> NetAddress {
        self.address
    }

    /// The peer address formatted as `ip:port`.
    pub fn address_string(&self) -> String {
        self.address.to_string()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn set_peer_id(&mut self, peer_id: impl Into<String>) {
        self.peer_id = peer_id.into();
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(
                "Connection {} ({}) {:?} -> {:?}",
                self.id,
                self.address,
                self.state,
                state
            );
            self.state = state;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Whether the connection may carry traffic.
    pub fn is_connected(&self) -> bool {
        self.state >= ConnectionState::Connected
    }

    /// Mark the connection dead and discard all pending delivery state.
    pub fn disconnect(&mut self) {
        self.set_state(ConnectionState::Disconnected);
        self.queued_reliables.clear();
        self.unconfirmed.clear();
        self.unreliables.clear();
        self.in_flight.clear();
        self.loopback.clear();
    }

    // -- ack accessors -----------------------------------------------------

    /// Ack that the next outgoing packet will carry.
    pub fn next_ack(&self) -> u16 {
        self.next_ack
    }

    /// Ack of the newest packet received from the peer.
    pub fn last_received_ack(&self) -> u16 {
        self.received.last
    }

    /// Bitfield of recently received acks, as reported to the peer.
    pub fn received_ack_bits(&self) -> u32 {
        self.received.bits
    }

    /// Newest of our packets the peer has confirmed.
    pub fn last_confirmed_ack(&self) -> Option<u16> {
        self.last_confirmed_ack
    }

    /// Reliable ids sent but not yet confirmed.
    pub fn unconfirmed_reliable_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.unconfirmed.iter().map(NetMessage::reliable_id)
    }

    /// Whether any reliable message is still queued or unconfirmed.
    pub fn has_pending_reliables(&self) -> bool {
        !self.queued_reliables.is_empty() || !self.unconfirmed.is_empty()
    }

    // -- timing ------------------------------------------------------------

    /// Smoothed round-trip time.
    pub fn rtt(&self) -> Duration {
        self.stats.rtt()
    }

    pub fn loss_rate(&self) -> f64 {
        self.stats.loss_rate()
    }

    pub(crate) fn add_rtt_sample(&mut self, rtt: Duration) {
        self.stats.add_rtt_sample(rtt);
    }

    pub fn set_send_rate(&mut self, hz: f32) {
        self.send_interval = rate_to_interval(hz);
    }

    pub fn send_interval(&self) -> Duration {
        self.send_interval
    }

    pub fn last_received_at(&self) -> Instant {
        self.last_recv
    }

    pub fn last_sent_at(&self) -> Option<Instant> {
        self.last_send
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Whether nothing has been received for longer than `timeout`.
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        !self.is_local && now.saturating_duration_since(self.last_recv) > timeout
    }

    /// Whether this connection's own send-rate timer has elapsed.
    pub fn send_timer_elapsed(&self, now: Instant) -> bool {
        self.last_flush_tick
            .is_none_or(|last| now.saturating_duration_since(last) >= self.send_interval)
    }

    /// Whether the link has been idle for a heartbeat interval.
    pub fn heartbeat_due(&self, now: Instant) -> bool {
        !self.is_local && now.saturating_duration_since(self.last_heartbeat) >= self.heartbeat_interval
    }

    pub(crate) fn mark_heartbeat(&mut self, now: Instant) {
        self.last_heartbeat = now;
    }

    // -- sending -----------------------------------------------------------

    /// Queue a message for the next flush.
    ///
    /// In-order messages get their channel sequence id here, so the send
    /// order of the caller is the delivery order at the peer.
    pub fn send(&mut self, mut msg: NetMessage) {
        if msg.is_in_order() {
            msg.sequence_id = self.channels[usize::from(msg.channel())].assign();
        }
        if self.is_local {
            self.loopback.push_back(msg);
        } else if msg.is_reliable() {
            self.queued_reliables.push_back(msg);
        } else {
            if self.unreliables.len() >= MAX_QUEUED_UNRELIABLE {
                self.unreliables.pop_front();
            }
            self.unreliables.push_back(msg);
        }
    }

    /// Messages sent to the local entry since the last call.
    pub(crate) fn drain_loopback(&mut self) -> Vec<NetMessage> {
        self.loopback.drain(..).collect()
    }

    fn has_unsent(&self) -> bool {
        self.has_pending_reliables() || !self.unreliables.is_empty() || self.pending_ack
    }

    fn reliable_window_open(&self) -> bool {
        match self.unconfirmed.first() {
            None => true,
            Some(oldest) => {
                distance(oldest.reliable_id, self.next_reliable_id) < RELIABLE_WINDOW as i16
            }
        }
    }

    /// Build the next packet for this peer, if there is anything to say.
    ///
    /// Unconfirmed reliables go first, then newly admitted reliables while
    /// the reliable window allows, then unreliables. Whatever does not fit
    /// stays queued.
    pub fn flush(&mut self, now: Instant, sender_index: Option<u8>) -> Option<Vec<u8>> {
        self.last_flush_tick = Some(now);
        if self.is_local || !self.has_unsent() {
            return None;
        }

        let ack = self.next_ack;
        self.next_ack = self.next_ack.wrapping_add(1);
        let mut writer = PacketWriter::new(PacketHeader {
            sender_index,
            ack,
            last_received_ack: self.received.last,
            received_ack_bits: self.received.bits,
            message_count: 0,
        });
        let mut reliable_ids = Vec::new();

        for msg in &self.unconfirmed {
            if writer.push(msg).is_err() {
                break;
            }
            reliable_ids.push(msg.reliable_id);
        }

        while self.reliable_window_open() {
            let Some(front) = self.queued_reliables.front() else {
                break;
            };
            if !writer.fits(front) {
                break;
            }
            let Some(mut msg) = self.queued_reliables.pop_front() else {
                break;
            };
            msg.reliable_id = self.next_reliable_id;
            msg.first_sent = Some(now);
            self.next_reliable_id = self.next_reliable_id.wrapping_add(1);
            if writer.push(&msg).is_ok() {
                reliable_ids.push(msg.reliable_id);
            }
            self.unconfirmed.push(msg);
        }

        while let Some(front) = self.unreliables.front() {
            if !writer.fits(front) {
                break;
            }
            if let Some(msg) = self.unreliables.pop_front() {
                let _ = writer.push(&msg);
            }
        }

        self.in_flight.push_back(SentPacket {
            ack,
            sent_at: now,
            reliable_ids,
        });
        while self.in_flight.len() > MAX_IN_FLIGHT {
            self.in_flight.pop_front();
            self.stats.on_packet_lost();
        }

        let bytes = writer.finish();
        self.pending_ack = false;
        self.last_send = Some(now);
        self.last_heartbeat = now;
        self.stats.on_packet_sent(bytes.len());
        Some(bytes)
    }

    // -- receiving ---------------------------------------------------------

    /// Apply the peer's report of which of our packets it has received.
    fn process_acks(&mut self, last: u16, bits: u32, now: Instant) {
        if bits == 0 {
            return;
        }
        let window = AckWindow { last, bits };

        let mut remaining = VecDeque::with_capacity(self.in_flight.len());
        let mut confirmed_ids = Vec::new();
        for packet in self.in_flight.drain(..) {
            if window.contains(packet.ack) {
                self.stats
                    .on_packet_acked(now.saturating_duration_since(packet.sent_at));
                confirmed_ids.extend_from_slice(&packet.reliable_ids);
                if self
                    .last_confirmed_ack
                    .is_none_or(|prev| distance(prev, packet.ack) > 0)
                {
                    self.last_confirmed_ack = Some(packet.ack);
                }
            } else if distance(packet.ack, last) >= ACK_WINDOW as i16 {
                self.stats.on_packet_lost();
            } else {
                remaining.push_back(packet);
            }
        }
        self.in_flight = remaining;

        if !confirmed_ids.is_empty() {
            self.unconfirmed
                .retain(|msg| !confirmed_ids.contains(&msg.reliable_id));
        }
    }

    /// Consume a parsed packet from the peer.
    ///
    /// Returns the messages that are ready for their handlers, in delivery
    /// order: duplicate packets and reliable ids are filtered, and in-order
    /// messages are held back until their predecessors have been delivered.
    pub fn process_packet(
        &mut self,
        header: &PacketHeader,
        messages: Vec<NetMessage>,
        bytes: usize,
        now: Instant,
    ) -> Vec<NetMessage> {
        self.last_recv = now;
        self.stats.on_packet_received(bytes);
        if !messages.is_empty() {
            self.pending_ack = true;
        }

        let record = self.received.record(header.ack);
        self.process_acks(header.last_received_ack, header.received_ack_bits, now);
        if record == AckRecord::Duplicate {
            tracing::trace!("Duplicate packet {} from {}", header.ack, self.address);
            return Vec::new();
        }

        let mut delivered = Vec::with_capacity(messages.len());
        for msg in messages {
            if msg.is_reliable() {
                if self.received_reliables.record(msg.reliable_id) != AckRecord::New {
                    continue;
                }
            } else if record == AckRecord::TooOld {
                continue;
            }

            if msg.is_in_order() {
                self.channels[usize::from(msg.channel())].receive(msg, &mut delivered);
            } else {
                delivered.push(msg);
            }
        }
        delivered
    }

    /// Snapshot for status displays.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            index: self.index,
            peer_id: self.peer_id.clone(),
            address: self.address,
            state: self.state,
            is_local: self.is_local,
            last_sent_ack: self.next_ack.wrapping_sub(1),
            last_received_ack: self.received.last,
            received_ack_bits: self.received.bits,
            unconfirmed_reliables: self.unconfirmed.len(),
            queued_reliables: self.queued_reliables.len(),
            link: self.stats.snapshot(),
        }
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
