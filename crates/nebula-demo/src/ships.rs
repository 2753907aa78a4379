//! The demo's replicated objects: ships drifting around a bounded arena.

use std::collections::BTreeMap;
use std::time::Duration;

use nebula_multiplayer::{NetObjectType, ObjectKey};
use serde::{Deserialize, Serialize};

/// Object type id ships are registered under.
pub const SHIP_TYPE: u8 = 1;

/// Half-width of the square arena ships bounce around in.
pub const ARENA_HALF_EXTENT: f32 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ship {
    /// Peer id of whoever spawned it.
    pub owner: String,
    pub position: [f32; 2],
    pub velocity: [f32; 2],
}

/// Motion state carried by snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShipSnapshot {
    pub position: [f32; 2],
    pub velocity: [f32; 2],
}

#[derive(Debug, Default)]
pub struct ShipWorld {
    ships: BTreeMap<u64, Ship>,
    next_key: u64,
}

impl ShipWorld {
    pub fn spawn(&mut self, ship: Ship) -> ObjectKey {
        self.next_key += 1;
        self.ships.insert(self.next_key, ship);
        ObjectKey(self.next_key)
    }

    pub fn remove(&mut self, key: ObjectKey) -> Option<Ship> {
        self.ships.remove(&key.0)
    }

    pub fn get(&self, key: ObjectKey) -> Option<&Ship> {
        self.ships.get(&key.0)
    }

    pub fn len(&self) -> usize {
        self.ships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ships.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectKey, &Ship)> {
        self.ships.iter().map(|(key, ship)| (ObjectKey(*key), ship))
    }

    /// Advance every ship by `dt`, bouncing off the arena walls.
    pub fn tick(&mut self, dt: Duration) {
        let dt = dt.as_secs_f32();
        for ship in self.ships.values_mut() {
            for axis in 0..2 {
                let mut p = ship.position[axis] + ship.velocity[axis] * dt;
                if p.abs() > ARENA_HALF_EXTENT {
                    p = p.clamp(-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT);
                    ship.velocity[axis] = -ship.velocity[axis];
                }
                ship.position[axis] = p;
            }
        }
    }
}

/// Replication glue for [`Ship`].
#[derive(Debug, Default)]
pub struct ShipType;

impl NetObjectType<ShipWorld> for ShipType {
    type CreateInfo = Ship;
    type DestroyInfo = String;
    type Snapshot = ShipSnapshot;

    fn create_info(&self, world: &ShipWorld, key: ObjectKey) -> Option<Ship> {
        world.get(key).cloned()
    }

    fn create(&mut self, world: &mut ShipWorld, info: Ship) -> Option<ObjectKey> {
        tracing::info!("{}'s ship arrived", info.owner);
        Some(world.spawn(info))
    }

    fn destroy_info(&self, world: &ShipWorld, key: ObjectKey) -> String {
        world
            .get(key)
            .map(|ship| ship.owner.clone())
            .unwrap_or_default()
    }

    fn destroy(&mut self, world: &mut ShipWorld, key: ObjectKey, info: Option<String>) {
        world.remove(key);
        match info {
            Some(owner) => tracing::info!("{owner}'s ship was removed"),
            None => tracing::debug!("Dropped replicated ship {:?}", key),
        }
    }

    fn snapshot(&self, world: &ShipWorld, key: ObjectKey) -> Option<ShipSnapshot> {
        world.get(key).map(|ship| ShipSnapshot {
            position: ship.position,
            velocity: ship.velocity,
        })
    }

    /// Extrapolate by the snapshot's age so the copy lines up with the host.
    fn apply_snapshot(
        &mut self,
        world: &mut ShipWorld,
        key: ObjectKey,
        snapshot: ShipSnapshot,
        age: Duration,
    ) {
        if let Some(ship) = world.ships.get_mut(&key.0) {
            let age = age.as_secs_f32();
            for axis in 0..2 {
                ship.position[axis] = (snapshot.position[axis] + snapshot.velocity[axis] * age)
                    .clamp(-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT);
            }
            ship.velocity = snapshot.velocity;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ship(position: [f32; 2], velocity: [f32; 2]) -> Ship {
        Ship {
            owner: "HOST".into(),
            position,
            velocity,
        }
    }

    #[test]
    fn test_tick_moves_ships() {
        let mut world = ShipWorld::default();
        let key = world.spawn(ship([0.0, 0.0], [10.0, -4.0]));
        world.tick(Duration::from_millis(500));
        assert_eq!(world.get(key).unwrap().position, [5.0, -2.0]);
    }

    #[test]
    fn test_ships_bounce_off_walls() {
        let mut world = ShipWorld::default();
        let key = world.spawn(ship([99.0, 0.0], [10.0, 0.0]));
        world.tick(Duration::from_secs(1));
        let s = world.get(key).unwrap();
        assert_eq!(s.position[0], ARENA_HALF_EXTENT);
        assert_eq!(s.velocity[0], -10.0);
    }

    #[test]
    fn test_snapshot_is_extrapolated_by_age() {
        let mut world = ShipWorld::default();
        let key = world.spawn(ship([0.0, 0.0], [0.0, 0.0]));
        let mut ty = ShipType;
        ty.apply_snapshot(
            &mut world,
            key,
            ShipSnapshot {
                position: [10.0, 10.0],
                velocity: [20.0, 0.0],
            },
            Duration::from_millis(250),
        );
        let s = world.get(key).unwrap();
        assert_eq!(s.position, [15.0, 10.0]);
        assert_eq!(s.velocity, [20.0, 0.0]);
    }

    #[test]
    fn test_destroy_info_names_owner() {
        let mut world = ShipWorld::default();
        let key = world.spawn(ship([0.0, 0.0], [0.0, 0.0]));
        let ty = ShipType;
        assert_eq!(ty.destroy_info(&world, key), "HOST");
        assert_eq!(ty.destroy_info(&world, ObjectKey(99)), "");
    }
}
