//! Replication tests over two loopback sessions.

use super::*;
use nebula_net::{ConnectionConfig, NetAddress, SessionConfig};
use serde::Deserialize;

const SHIP: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ship {
    name: String,
    x: f32,
    velocity: f32,
}

#[derive(Debug, Default)]
struct World {
    ships: BTreeMap<u64, Ship>,
    next: u64,
    last_age: Option<Duration>,
    destroy_reasons: Vec<Option<String>>,
}

impl World {
    fn spawn(&mut self, ship: Ship) -> ObjectKey {
        self.next += 1;
        self.ships.insert(self.next, ship);
        ObjectKey(self.next)
    }

    fn ship(&self, key: ObjectKey) -> Option<&Ship> {
        self.ships.get(&key.0)
    }
}

struct ShipType;

impl NetObjectType<World> for ShipType {
    type CreateInfo = Ship;
    type DestroyInfo = String;
    type Snapshot = (f32, f32);

    fn create_info(&self, world: &World, key: ObjectKey) -> Option<Ship> {
        world.ship(key).cloned()
    }

    fn create(&mut self, world: &mut World, info: Ship) -> Option<ObjectKey> {
        Some(world.spawn(info))
    }

    fn destroy_info(&self, _world: &World, _key: ObjectKey) -> String {
        "scuttled".into()
    }

    fn destroy(&mut self, world: &mut World, key: ObjectKey, info: Option<String>) {
        world.ships.remove(&key.0);
        world.destroy_reasons.push(info);
    }

    fn snapshot(&self, world: &World, key: ObjectKey) -> Option<(f32, f32)> {
        world.ship(key).map(|s| (s.x, s.velocity))
    }

    fn apply_snapshot(&mut self, world: &mut World, key: ObjectKey, snapshot: (f32, f32), age: Duration) {
        if let Some(ship) = world.ships.get_mut(&key.0) {
            ship.x = snapshot.0;
            ship.velocity = snapshot.1;
        }
        world.last_age = Some(age);
    }
}

struct Peer {
    session: NetSession,
    objects: NetObjectSystem<World>,
    world: World,
}

impl Peer {
    fn new() -> Self {
        let mut session = NetSession::new(SessionConfig {
            tick_rate_hz: 100.0,
            connection: ConnectionConfig {
                send_rate_hz: 100.0,
                heartbeat_interval: Duration::from_millis(100),
            },
            ..SessionConfig::default()
        });
        let mut objects = NetObjectSystem::new(NetObjectConfig {
            snapshot_rate_hz: 50.0,
        });
        objects.attach(&mut session).unwrap();
        objects.register_type(SHIP, ShipType).unwrap();
        Self {
            session,
            objects,
            world: World::default(),
        }
    }

    fn step(&mut self) -> Vec<NetObjectEvent> {
        self.session.process_incoming();
        let events = self
            .objects
            .update(&mut self.session, &mut self.world, Instant::now());
        self.session.process_outgoing();
        events
    }

    fn host_address(&self) -> NetAddress {
        NetAddress::loopback(self.session.local_address().unwrap().port())
    }
}

fn pump_until(peers: &mut [&mut Peer], mut done: impl FnMut(&[&mut Peer]) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        for peer in peers.iter_mut() {
            peer.step();
        }
        if done(peers) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

fn hosted() -> Peer {
    let mut host = Peer::new();
    host.session.host("HOST", 0).unwrap();
    host
}

fn joined(host: &mut Peer, id: &str) -> Peer {
    let mut client = Peer::new();
    client.session.join(id, host.host_address()).unwrap();
    assert!(pump_until(&mut [host, &mut client], |p| p[1].session.is_ready()));
    client
}

fn ship(name: &str, x: f32) -> Ship {
    Ship {
        name: name.into(),
        x,
        velocity: 1.5,
    }
}

#[test]
fn test_synced_object_appears_on_client() {
    let mut host = hosted();
    let mut client = joined(&mut host, "CLIENT1");

    let key = host.world.spawn(ship("Aurora", 10.0));
    let id = host
        .objects
        .sync_object(&mut host.session, &host.world, SHIP, key)
        .unwrap();
    assert_eq!(host.objects.synced_id(key), Some(id));

    assert!(pump_until(&mut [&mut host, &mut client], |p| p[1].objects.remote_count() == 1));
    let remote_key = client.objects.remote_key(id).unwrap();
    assert_eq!(client.world.ship(remote_key).unwrap().name, "Aurora");
    assert_eq!(
        client.objects.remote_objects().collect::<Vec<_>>(),
        vec![(id, SHIP, remote_key)]
    );
}

#[test]
fn test_snapshots_follow_host_state() {
    let mut host = hosted();
    let mut client = joined(&mut host, "CLIENT1");
    let key = host.world.spawn(ship("Aurora", 0.0));
    let id = host
        .objects
        .sync_object(&mut host.session, &host.world, SHIP, key)
        .unwrap();
    assert!(pump_until(&mut [&mut host, &mut client], |p| p[1].objects.remote_count() == 1));

    host.world.ships.get_mut(&key.0).unwrap().x = 250.0;
    let moved = pump_until(&mut [&mut host, &mut client], |p| {
        let remote = p[1].objects.remote_key(id).unwrap();
        p[1].world.ship(remote).is_some_and(|s| s.x == 250.0)
    });
    assert!(moved, "snapshot never arrived");
    let age = client.world.last_age.unwrap();
    assert!(age < Duration::from_secs(1), "implausible snapshot age {age:?}");
}

#[test]
fn test_unsync_destroys_remote_copy() {
    let mut host = hosted();
    let mut client = joined(&mut host, "CLIENT1");
    let key = host.world.spawn(ship("Aurora", 0.0));
    host.objects
        .sync_object(&mut host.session, &host.world, SHIP, key)
        .unwrap();
    assert!(pump_until(&mut [&mut host, &mut client], |p| p[1].objects.remote_count() == 1));

    host.objects
        .unsync_object(&mut host.session, &host.world, key)
        .unwrap();
    assert_eq!(host.objects.synced_count(), 0);
    assert!(pump_until(&mut [&mut host, &mut client], |p| p[1].objects.remote_count() == 0));
    assert!(client.world.ships.is_empty());
    assert_eq!(client.world.destroy_reasons, vec![Some("scuttled".to_string())]);
}

#[test]
fn test_late_joiner_receives_existing_objects() {
    let mut host = hosted();
    let first = host.world.spawn(ship("Aurora", 1.0));
    let second = host.world.spawn(ship("Borealis", 2.0));
    for key in [first, second] {
        host.objects
            .sync_object(&mut host.session, &host.world, SHIP, key)
            .unwrap();
    }

    let mut client = joined(&mut host, "LATE");
    assert!(pump_until(&mut [&mut host, &mut client], |p| p[1].objects.remote_count() == 2));
    let mut names: Vec<&str> = client.world.ships.values().map(|s| s.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["Aurora", "Borealis"]);
}

#[test]
fn test_session_loss_destroys_remote_objects() {
    let mut host = hosted();
    let mut client = joined(&mut host, "CLIENT1");
    let key = host.world.spawn(ship("Aurora", 0.0));
    host.objects
        .sync_object(&mut host.session, &host.world, SHIP, key)
        .unwrap();
    assert!(pump_until(&mut [&mut host, &mut client], |p| p[1].objects.remote_count() == 1));

    client.session.disconnect();
    let events = client.step();
    assert!(matches!(events.as_slice(), [NetObjectEvent::Destroyed { .. }]));
    assert_eq!(client.objects.remote_count(), 0);
    assert!(client.world.ships.is_empty());
    assert_eq!(client.world.destroy_reasons, vec![None]);
}

#[test]
fn test_only_host_can_sync() {
    let mut host = hosted();
    let mut client = joined(&mut host, "CLIENT1");
    let key = client.world.spawn(ship("Rogue", 0.0));
    let err = client
        .objects
        .sync_object(&mut client.session, &client.world, SHIP, key)
        .unwrap_err();
    assert!(matches!(err, NetObjectError::NotHost));
}

#[test]
fn test_registration_errors() {
    let mut host = hosted();
    assert!(matches!(
        host.objects.register_type(SHIP, ShipType),
        Err(NetObjectError::DuplicateType(SHIP))
    ));

    let key = host.world.spawn(ship("Aurora", 0.0));
    assert!(matches!(
        host.objects.sync_object(&mut host.session, &host.world, 9, key),
        Err(NetObjectError::UnknownType(9))
    ));
    host.objects
        .sync_object(&mut host.session, &host.world, SHIP, key)
        .unwrap();
    assert!(matches!(
        host.objects.sync_object(&mut host.session, &host.world, SHIP, key),
        Err(NetObjectError::AlreadySynced(_))
    ));
    assert!(matches!(
        host.objects.unsync_object(&mut host.session, &host.world, ObjectKey(999)),
        Err(NetObjectError::NotSynced(ObjectKey(999)))
    ));
}
