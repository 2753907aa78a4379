use std::time::{Duration, Instant};

use super::*;
use crate::message::MessageOptions;
use crate::packet::NetPacket;
use crate::registry::MessageRegistry;

const RELIABLE: u8 = 40;
const ORDERED: u8 = 41;
const UNRELIABLE: u8 = 42;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn registry() -> MessageRegistry {
    let mut registry = MessageRegistry::new();
    registry
        .register(RELIABLE, "reliable", MessageOptions::RELIABLE, 0, |_, _, _| {})
        .unwrap();
    registry
        .register(ORDERED, "ordered", MessageOptions::RELIABLE_IN_ORDER, 1, |_, _, _| {})
        .unwrap();
    registry
        .register(UNRELIABLE, "unreliable", MessageOptions::empty(), 0, |_, _, _| {})
        .unwrap();
    registry
}

fn pair(now: Instant) -> (NetConnection, NetConnection) {
    let config = ConnectionConfig::default();
    let mut a = NetConnection::new(ConnectionId(1), NetAddress::loopback(5000), &config, now);
    let mut b = NetConnection::new(ConnectionId(2), NetAddress::loopback(5001), &config, now);
    a.set_state(ConnectionState::Connected);
    b.set_state(ConnectionState::Connected);
    (a, b)
}

fn numbered(registry: &MessageRegistry, index: u8, n: u16) -> NetMessage {
    let mut msg = registry.create(index).unwrap();
    msg.write(n).unwrap();
    msg
}

fn transmit(
    bytes: &[u8],
    to: &mut NetConnection,
    registry: &MessageRegistry,
    now: Instant,
) -> Vec<NetMessage> {
    let packet = NetPacket::decode(bytes, registry).unwrap();
    to.process_packet(&packet.header, packet.messages, bytes.len(), now)
}

fn values(msgs: Vec<NetMessage>) -> Vec<u16> {
    msgs.into_iter()
        .map(|mut msg| msg.read::<u16>().unwrap())
        .collect()
}

// ---------------------------------------------------------------------------
// Acks
// ---------------------------------------------------------------------------

#[test]
fn test_idle_connection_sends_nothing() {
    let now = Instant::now();
    let (mut a, _) = pair(now);
    assert!(a.flush(now, Some(1)).is_none());
    assert_eq!(a.next_ack(), 0);
}

#[test]
fn test_acks_strictly_increase() {
    let now = Instant::now();
    let registry = registry();
    let (mut a, _) = pair(now);

    let mut acks = Vec::new();
    for n in 0..3 {
        a.send(numbered(&registry, UNRELIABLE, n));
        let bytes = a.flush(now, Some(1)).unwrap();
        acks.push(PacketHeader::peek(&bytes).unwrap().ack);
    }
    assert_eq!(acks, vec![0, 1, 2]);
}

#[test]
fn test_last_received_ack_advances() {
    let now = Instant::now();
    let registry = registry();
    let (mut a, mut b) = pair(now);

    let mut seen = Vec::new();
    for n in 0..4 {
        a.send(numbered(&registry, UNRELIABLE, n));
        let bytes = a.flush(now, Some(1)).unwrap();
        transmit(&bytes, &mut b, &registry, now);
        seen.push(b.last_received_ack());
    }
    assert_eq!(seen, vec![0, 1, 2, 3]);
    assert_eq!(b.received_ack_bits(), 0b1111);
}

#[test]
fn test_duplicate_packet_is_ignored() {
    let now = Instant::now();
    let registry = registry();
    let (mut a, mut b) = pair(now);

    a.send(numbered(&registry, UNRELIABLE, 7));
    let bytes = a.flush(now, Some(1)).unwrap();
    assert_eq!(values(transmit(&bytes, &mut b, &registry, now)), vec![7]);
    assert!(transmit(&bytes, &mut b, &registry, now).is_empty());
}

#[test]
fn test_rtt_sampled_from_confirmation() {
    let t0 = Instant::now();
    let registry = registry();
    let (mut a, mut b) = pair(t0);

    a.send(numbered(&registry, UNRELIABLE, 1));
    let bytes = a.flush(t0, Some(1)).unwrap();
    transmit(&bytes, &mut b, &registry, t0 + Duration::from_millis(10));

    let reply = b.flush(t0 + Duration::from_millis(20), Some(0)).unwrap();
    transmit(&reply, &mut a, &registry, t0 + Duration::from_millis(40));

    assert_eq!(a.rtt(), Duration::from_millis(40));
    assert_eq!(a.last_confirmed_ack(), Some(0));
}

#[test]
fn test_packets_leaving_window_count_as_lost() {
    let now = Instant::now();
    let registry = registry();
    let (mut a, mut b) = pair(now);

    let mut last = Vec::new();
    for n in 0..40 {
        a.send(numbered(&registry, UNRELIABLE, n));
        last = a.flush(now, Some(1)).unwrap();
    }
    // Only packet 39 arrives; 0..=7 are now beyond the 32-ack window.
    transmit(&last, &mut b, &registry, now);
    let reply = b.flush(now, Some(0)).unwrap();
    transmit(&reply, &mut a, &registry, now);

    let stats = a.stats();
    assert_eq!(stats.link.packets_lost, 8);
    assert!((a.loss_rate() - 8.0 / 9.0).abs() < 1e-9);
}

// ---------------------------------------------------------------------------
// Reliable delivery
// ---------------------------------------------------------------------------

#[test]
fn test_reliable_resent_until_confirmed() {
    let now = Instant::now();
    let registry = registry();
    let (mut a, mut b) = pair(now);

    a.send(numbered(&registry, RELIABLE, 11));
    let lost = a.flush(now, Some(1)).unwrap();
    drop(lost);
    assert!(a.has_pending_reliables());

    // The message rides along in the next packet with the same reliable id.
    let retry = a.flush(now, Some(1)).unwrap();
    let delivered = transmit(&retry, &mut b, &registry, now);
    assert_eq!(delivered[0].reliable_id(), 0);
    assert_eq!(values(delivered), vec![11]);
    assert!(a.has_pending_reliables());

    let reply = b.flush(now, Some(0)).unwrap();
    transmit(&reply, &mut a, &registry, now);
    assert!(!a.has_pending_reliables());
    assert!(a.flush(now, Some(1)).is_none());
}

#[test]
fn test_reliable_delivered_once_across_packets() {
    let now = Instant::now();
    let registry = registry();
    let (mut a, mut b) = pair(now);

    a.send(numbered(&registry, RELIABLE, 5));
    let first = a.flush(now, Some(1)).unwrap();
    a.send(numbered(&registry, UNRELIABLE, 6));
    let second = a.flush(now, Some(1)).unwrap();

    assert_eq!(values(transmit(&first, &mut b, &registry, now)), vec![5]);
    assert_eq!(values(transmit(&second, &mut b, &registry, now)), vec![6]);
}

#[test]
fn test_unconfirmed_ids_are_subset_of_sent() {
    let now = Instant::now();
    let registry = registry();
    let (mut a, mut b) = pair(now);

    for n in 0..3 {
        a.send(numbered(&registry, RELIABLE, n));
    }
    let bytes = a.flush(now, Some(1)).unwrap();
    let ids: Vec<u16> = a.unconfirmed_reliable_ids().collect();
    assert_eq!(ids, vec![0, 1, 2]);

    transmit(&bytes, &mut b, &registry, now);
    a.send(numbered(&registry, RELIABLE, 3));
    let reply = b.flush(now, Some(0)).unwrap();
    transmit(&reply, &mut a, &registry, now);
    assert_eq!(a.unconfirmed_reliable_ids().count(), 0);

    a.flush(now, Some(1)).unwrap();
    let ids: Vec<u16> = a.unconfirmed_reliable_ids().collect();
    assert_eq!(ids, vec![3]);
}

#[test]
fn test_reliable_window_limits_outstanding() {
    let now = Instant::now();
    let registry = registry();
    let (mut a, mut b) = pair(now);

    for n in 0..40 {
        a.send(numbered(&registry, RELIABLE, n));
    }
    let bytes = a.flush(now, Some(1)).unwrap();
    let stats = a.stats();
    assert_eq!(stats.unconfirmed_reliables, RELIABLE_WINDOW as usize);
    assert_eq!(stats.queued_reliables, 8);

    assert_eq!(transmit(&bytes, &mut b, &registry, now).len(), 32);
    let reply = b.flush(now, Some(0)).unwrap();
    transmit(&reply, &mut a, &registry, now);

    let bytes = a.flush(now, Some(1)).unwrap();
    assert_eq!(a.stats().queued_reliables, 0);
    assert_eq!(
        values(transmit(&bytes, &mut b, &registry, now)),
        (32..40).collect::<Vec<u16>>()
    );
}

#[test]
fn test_reliable_survives_heavy_loss() {
    let now = Instant::now();
    let registry = registry();
    let (mut a, mut b) = pair(now);

    a.send(numbered(&registry, RELIABLE, 99));
    let mut delivered = Vec::new();
    for round in 0..10 {
        let bytes = a.flush(now, Some(1)).unwrap();
        // Every other packet is lost in each direction.
        if round % 2 == 1 {
            delivered.extend(values(transmit(&bytes, &mut b, &registry, now)));
        }
        if let Some(reply) = b.flush(now, Some(0))
            && round % 4 == 3
        {
            transmit(&reply, &mut a, &registry, now);
        }
        if !a.has_pending_reliables() {
            break;
        }
    }
    assert_eq!(delivered, vec![99]);
    assert!(!a.has_pending_reliables());
}

// ---------------------------------------------------------------------------
// In-order channels
// ---------------------------------------------------------------------------

#[test]
fn test_sequence_assigned_per_channel_at_send() {
    let now = Instant::now();
    let (mut a, _) = pair(now);

    a.send(NetMessage::new(ORDERED, MessageOptions::RELIABLE_IN_ORDER, 1));
    a.send(NetMessage::new(ORDERED, MessageOptions::RELIABLE_IN_ORDER, 1));
    a.send(NetMessage::new(ORDERED, MessageOptions::RELIABLE_IN_ORDER, 2));

    let seqs: Vec<(u8, u16)> = a
        .queued_reliables
        .iter()
        .map(|msg| (msg.channel(), msg.sequence_id()))
        .collect();
    assert_eq!(seqs, vec![(1, 0), (1, 1), (2, 0)]);
}

fn sequenced(seq: u16) -> NetMessage {
    let mut msg = NetMessage::new(ORDERED, MessageOptions::RELIABLE_IN_ORDER, 1);
    msg.sequence_id = seq;
    msg.write(seq).unwrap();
    msg
}

#[test]
fn test_channel_buffers_early_arrivals() {
    let mut channel = InOrderChannel::default();
    let mut out = Vec::new();

    channel.receive(sequenced(2), &mut out);
    channel.receive(sequenced(1), &mut out);
    assert!(out.is_empty());

    channel.receive(sequenced(0), &mut out);
    assert_eq!(values(out), vec![0, 1, 2]);
    assert_eq!(channel.next_expected, 3);
}

#[test]
fn test_channel_drops_duplicates() {
    let mut channel = InOrderChannel::default();
    let mut out = Vec::new();

    channel.receive(sequenced(0), &mut out);
    channel.receive(sequenced(0), &mut out);
    channel.receive(sequenced(2), &mut out);
    channel.receive(sequenced(2), &mut out);
    channel.receive(sequenced(1), &mut out);
    assert_eq!(values(out), vec![0, 1, 2]);
    assert!(channel.buffered.is_empty());
}

#[test]
fn test_channel_wraps_sequence() {
    let mut channel = InOrderChannel {
        next_expected: u16::MAX,
        ..Default::default()
    };
    let mut out = Vec::new();

    channel.receive(sequenced(0), &mut out);
    channel.receive(sequenced(u16::MAX), &mut out);
    assert_eq!(values(out), vec![u16::MAX, 0]);
}

#[test]
fn test_in_order_end_to_end_under_loss() {
    let now = Instant::now();
    let registry = registry();
    let (mut a, mut b) = pair(now);

    let mut delivered = Vec::new();
    for n in 0..6 {
        a.send(numbered(&registry, ORDERED, n));
        let bytes = a.flush(now, Some(1)).unwrap();
        if n % 3 != 0 {
            delivered.extend(values(transmit(&bytes, &mut b, &registry, now)));
        }
        if n % 2 == 1
            && let Some(reply) = b.flush(now, Some(0))
        {
            transmit(&reply, &mut a, &registry, now);
        }
    }
    // Drain what is still unconfirmed.
    while a.has_pending_reliables() {
        let bytes = a.flush(now, Some(1)).unwrap();
        delivered.extend(values(transmit(&bytes, &mut b, &registry, now)));
        let reply = b.flush(now, Some(0)).unwrap();
        transmit(&reply, &mut a, &registry, now);
    }
    assert_eq!(delivered, vec![0, 1, 2, 3, 4, 5]);
}

// ---------------------------------------------------------------------------
// Lifecycle and timers
// ---------------------------------------------------------------------------

#[test]
fn test_local_connection_loops_back() {
    let now = Instant::now();
    let registry = registry();
    let mut local = NetConnection::new_local(
        ConnectionId(0),
        NetAddress::loopback(5000),
        &ConnectionConfig::default(),
        now,
    );

    local.send(numbered(&registry, RELIABLE, 3));
    assert!(local.flush(now, Some(0)).is_none());
    assert!(!local.has_pending_reliables());
    assert_eq!(values(local.drain_loopback()), vec![3]);
    assert!(local.drain_loopback().is_empty());
}

#[test]
fn test_timeout_detection() {
    let now = Instant::now();
    let (a, _) = pair(now);
    let timeout = Duration::from_secs(10);
    assert!(!a.is_timed_out(now + Duration::from_secs(9), timeout));
    assert!(a.is_timed_out(now + Duration::from_secs(11), timeout));
}

#[test]
fn test_heartbeat_due_only_when_idle() {
    let now = Instant::now();
    let registry = registry();
    let (mut a, _) = pair(now);
    let interval = ConnectionConfig::default().heartbeat_interval;

    assert!(!a.heartbeat_due(now));
    a.send(numbered(&registry, UNRELIABLE, 1));
    a.flush(now + interval / 2, Some(1)).unwrap();
    assert!(!a.heartbeat_due(now + interval));
    assert!(a.heartbeat_due(now + interval / 2 + interval));
}

#[test]
fn test_send_rate_gates_flush_timer() {
    let now = Instant::now();
    let (mut a, _) = pair(now);
    a.set_send_rate(10.0);

    assert!(a.send_timer_elapsed(now));
    a.flush(now, Some(1));
    assert!(!a.send_timer_elapsed(now + Duration::from_millis(50)));
    assert!(a.send_timer_elapsed(now + Duration::from_millis(110)));
}

#[test]
fn test_disconnect_discards_pending_state() {
    let now = Instant::now();
    let registry = registry();
    let (mut a, _) = pair(now);

    a.send(numbered(&registry, RELIABLE, 1));
    a.flush(now, Some(1)).unwrap();
    a.send(numbered(&registry, RELIABLE, 2));
    a.disconnect();

    assert_eq!(a.state(), ConnectionState::Disconnected);
    assert!(!a.has_pending_reliables());
    assert!(a.flush(now, Some(1)).is_none());
}

#[test]
fn test_state_order_and_wire_value() {
    assert!(ConnectionState::Ready > ConnectionState::Connected);
    assert!(ConnectionState::Connecting < ConnectionState::Connected);
    assert_eq!(ConnectionState::from_u8(4), Some(ConnectionState::Ready));
    assert_eq!(ConnectionState::from_u8(9), None);
}
