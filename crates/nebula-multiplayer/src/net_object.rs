//! Object replication riding on [`NetSession`] messages.
//!
//! The host decides which game objects are shared. [`NetObjectSystem::sync_object`]
//! gives an object a [`NetObjectId`] and tells every ready peer to create a
//! local copy; from then on a snapshot of the object is broadcast at the
//! snapshot rate until [`NetObjectSystem::unsync_object`] sends a destroy.
//! Peers that finish joining later receive a create for every object that is
//! already synced.
//!
//! Snapshots travel unreliably and carry the host time at capture. Receivers
//! apply them together with their age so the game can simulate the object
//! forward by the transit time.
//!
//! Incoming messages are forwarded by the session's handlers into a channel
//! and consumed in [`NetObjectSystem::update`], where the game world is
//! available.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use nebula_net::{
    ConnectionId, HOST_INDEX, MessageError, MessageOptions, NetError, NetMessage, NetSession,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Message index of `net_object_create`.
pub const NET_OBJECT_CREATE: u8 = 16;
/// Message index of `net_object_destroy`.
pub const NET_OBJECT_DESTROY: u8 = 17;
/// Message index of `net_object_snapshot`.
pub const NET_OBJECT_SNAPSHOT: u8 = 18;
/// In-order channel carrying creates and destroys.
pub const OBJECT_CHANNEL: u8 = 1;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Session-wide id of a replicated object, assigned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetObjectId(pub u16);

/// The game's own handle for an object in its world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey(pub u64);

// ---------------------------------------------------------------------------
// Object types
// ---------------------------------------------------------------------------

/// Glue between replication and one kind of game object living in `W`.
pub trait NetObjectType<W> {
    /// Everything a peer needs to construct its copy.
    type CreateInfo: Serialize + DeserializeOwned;
    /// Sent along with the destroy.
    type DestroyInfo: Serialize + DeserializeOwned;
    /// Periodic state.
    type Snapshot: Serialize + DeserializeOwned;

    /// Describe an existing object for creation elsewhere.
    fn create_info(&self, world: &W, key: ObjectKey) -> Option<Self::CreateInfo>;

    /// Construct the local copy of a remote object.
    fn create(&mut self, world: &mut W, info: Self::CreateInfo) -> Option<ObjectKey>;

    fn destroy_info(&self, world: &W, key: ObjectKey) -> Self::DestroyInfo;

    /// Remove the local copy. `info` is `None` when the object goes away
    /// because the session was lost.
    fn destroy(&mut self, world: &mut W, key: ObjectKey, info: Option<Self::DestroyInfo>);

    /// Capture the current state of an object.
    fn snapshot(&self, world: &W, key: ObjectKey) -> Option<Self::Snapshot>;

    /// Apply a snapshot captured `age` ago on the host.
    fn apply_snapshot(
        &mut self,
        world: &mut W,
        key: ObjectKey,
        snapshot: Self::Snapshot,
        age: Duration,
    );
}

/// Byte-level view of a [`NetObjectType`], so types with different
/// associated types can share one table.
trait ErasedObjectType<W> {
    fn write_create(&self, world: &W, key: ObjectKey, msg: &mut NetMessage) -> Result<bool, MessageError>;
    fn read_create(&mut self, world: &mut W, msg: &mut NetMessage) -> Result<Option<ObjectKey>, MessageError>;
    fn write_destroy(&self, world: &W, key: ObjectKey, msg: &mut NetMessage) -> Result<(), MessageError>;
    fn read_destroy(&mut self, world: &mut W, key: ObjectKey, msg: &mut NetMessage) -> Result<(), MessageError>;
    fn destroy_silently(&mut self, world: &mut W, key: ObjectKey);
    fn write_snapshot(&self, world: &W, key: ObjectKey, msg: &mut NetMessage) -> Result<bool, MessageError>;
    fn read_snapshot(
        &mut self,
        world: &mut W,
        key: ObjectKey,
        msg: &mut NetMessage,
        age: Duration,
    ) -> Result<(), MessageError>;
}

impl<W, T: NetObjectType<W>> ErasedObjectType<W> for T {
    fn write_create(&self, world: &W, key: ObjectKey, msg: &mut NetMessage) -> Result<bool, MessageError> {
        match self.create_info(world, key) {
            Some(info) => msg.write_serde(&info).map(|()| true),
            None => Ok(false),
        }
    }

    fn read_create(&mut self, world: &mut W, msg: &mut NetMessage) -> Result<Option<ObjectKey>, MessageError> {
        let info = msg.read_serde::<T::CreateInfo>()?;
        Ok(self.create(world, info))
    }

    fn write_destroy(&self, world: &W, key: ObjectKey, msg: &mut NetMessage) -> Result<(), MessageError> {
        msg.write_serde(&self.destroy_info(world, key))
    }

    fn read_destroy(&mut self, world: &mut W, key: ObjectKey, msg: &mut NetMessage) -> Result<(), MessageError> {
        let info = msg.read_serde::<T::DestroyInfo>()?;
        self.destroy(world, key, Some(info));
        Ok(())
    }

    fn destroy_silently(&mut self, world: &mut W, key: ObjectKey) {
        self.destroy(world, key, None);
    }

    fn write_snapshot(&self, world: &W, key: ObjectKey, msg: &mut NetMessage) -> Result<bool, MessageError> {
        match self.snapshot(world, key) {
            Some(snapshot) => msg.write_serde(&snapshot).map(|()| true),
            None => Ok(false),
        }
    }

    fn read_snapshot(
        &mut self,
        world: &mut W,
        key: ObjectKey,
        msg: &mut NetMessage,
        age: Duration,
    ) -> Result<(), MessageError> {
        let snapshot = msg.read_serde::<T::Snapshot>()?;
        self.apply_snapshot(world, key, snapshot, age);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Errors, config, events
// ---------------------------------------------------------------------------

/// Errors returned by [`NetObjectSystem`] operations.
#[derive(Debug, thiserror::Error)]
pub enum NetObjectError {
    #[error("object type {0} is not registered")]
    UnknownType(u8),

    #[error("object type {0} is already registered")]
    DuplicateType(u8),

    /// Only a ready host may sync or unsync objects.
    #[error("only the host can sync objects")]
    NotHost,

    #[error("object {0:?} is already synced")]
    AlreadySynced(ObjectKey),

    #[error("object {0:?} is not synced")]
    NotSynced(ObjectKey),

    /// The object type could not describe this object.
    #[error("object {0:?} has no create info")]
    MissingObject(ObjectKey),

    #[error("all object ids are in use")]
    OutOfIds,

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Net(#[from] NetError),
}

/// Replication settings.
#[derive(Debug, Clone)]
pub struct NetObjectConfig {
    /// Snapshot broadcasts per second. Default: 10.
    pub snapshot_rate_hz: f32,
}

impl Default for NetObjectConfig {
    fn default() -> Self {
        Self {
            snapshot_rate_hz: 10.0,
        }
    }
}

/// What [`NetObjectSystem::update`] did to the local world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetObjectEvent {
    /// A remote object was created locally.
    Created {
        id: NetObjectId,
        type_id: u8,
        key: ObjectKey,
    },
    /// A remote object was destroyed locally.
    Destroyed { id: NetObjectId, key: ObjectKey },
}

#[derive(Debug)]
struct Inbound {
    from: Option<u8>,
    msg: NetMessage,
}

#[derive(Debug, Clone, Copy)]
struct SyncedObject {
    type_id: u8,
    key: ObjectKey,
}

#[derive(Debug, Clone, Copy)]
struct RemoteObject {
    type_id: u8,
    key: ObjectKey,
    last_capture: Option<u32>,
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

/// Replicates objects of world type `W` across a [`NetSession`].
pub struct NetObjectSystem<W> {
    types: HashMap<u8, Box<dyn ErasedObjectType<W>>>,
    synced: BTreeMap<NetObjectId, SyncedObject>,
    synced_by_key: HashMap<ObjectKey, NetObjectId>,
    remote: BTreeMap<NetObjectId, RemoteObject>,
    announced: HashSet<ConnectionId>,
    next_id: u16,
    snapshot_interval: Duration,
    last_snapshot: Option<Instant>,
    inbox: Receiver<Inbound>,
    outlet: Sender<Inbound>,
}

impl<W> NetObjectSystem<W> {
    pub fn new(config: NetObjectConfig) -> Self {
        let (outlet, inbox) = unbounded();
        let snapshot_interval = if config.snapshot_rate_hz > 0.0 {
            Duration::from_secs_f32(1.0 / config.snapshot_rate_hz)
        } else {
            Duration::ZERO
        };
        Self {
            types: HashMap::new(),
            synced: BTreeMap::new(),
            synced_by_key: HashMap::new(),
            remote: BTreeMap::new(),
            announced: HashSet::new(),
            next_id: 0,
            snapshot_interval,
            last_snapshot: None,
            inbox,
            outlet,
        }
    }

    /// Register the replication messages on `session`.
    pub fn attach(&self, session: &mut NetSession) -> Result<(), NetError> {
        let messages = [
            (NET_OBJECT_CREATE, "net_object_create", MessageOptions::RELIABLE_IN_ORDER, OBJECT_CHANNEL),
            (NET_OBJECT_DESTROY, "net_object_destroy", MessageOptions::RELIABLE_IN_ORDER, OBJECT_CHANNEL),
            (NET_OBJECT_SNAPSHOT, "net_object_snapshot", MessageOptions::empty(), 0),
        ];
        for (index, name, options, channel) in messages {
            let outlet = self.outlet.clone();
            session.register_message(index, name, options, channel, move |msg, sender, _| {
                let _ = outlet.send(Inbound {
                    from: sender.connection_index,
                    msg: msg.clone(),
                });
            })?;
        }
        Ok(())
    }

    /// Add an object type under `type_id`.
    pub fn register_type<T>(&mut self, type_id: u8, object_type: T) -> Result<(), NetObjectError>
    where
        T: NetObjectType<W> + 'static,
    {
        if self.types.contains_key(&type_id) {
            return Err(NetObjectError::DuplicateType(type_id));
        }
        self.types.insert(type_id, Box::new(object_type));
        Ok(())
    }

    pub fn synced_count(&self) -> usize {
        self.synced.len()
    }

    /// The id a synced local object was given.
    pub fn synced_id(&self, key: ObjectKey) -> Option<NetObjectId> {
        self.synced_by_key.get(&key).copied()
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    /// Local key of the copy of remote object `id`.
    pub fn remote_key(&self, id: NetObjectId) -> Option<ObjectKey> {
        self.remote.get(&id).map(|r| r.key)
    }

    /// Remote objects as `(id, type_id, key)`.
    pub fn remote_objects(&self) -> impl Iterator<Item = (NetObjectId, u8, ObjectKey)> + '_ {
        self.remote.iter().map(|(&id, r)| (id, r.type_id, r.key))
    }

    fn allocate_id(&mut self) -> Option<NetObjectId> {
        for _ in 0..=u16::MAX {
            let id = NetObjectId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if !self.synced.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn build_create(
        &self,
        session: &NetSession,
        world: &W,
        id: NetObjectId,
        object: SyncedObject,
    ) -> Result<NetMessage, NetObjectError> {
        let object_type = self
            .types
            .get(&object.type_id)
            .ok_or(NetObjectError::UnknownType(object.type_id))?;
        let mut msg = session.create_message("net_object_create")?;
        msg.write(object.type_id)?;
        msg.write(id.0)?;
        if !object_type.write_create(world, object.key, &mut msg)? {
            return Err(NetObjectError::MissingObject(object.key));
        }
        Ok(msg)
    }

    fn send_to_announced(&self, session: &mut NetSession, msg: &NetMessage) {
        let targets: Vec<u8> = self
            .announced
            .iter()
            .filter_map(|&id| session.connection_by_id(id).and_then(|c| c.index()))
            .collect();
        for index in targets {
            if let Err(e) = session.send_to(index, msg.clone()) {
                tracing::debug!("Object message to {} dropped: {}", index, e);
            }
        }
    }

    /// Start replicating the local object `key` of type `type_id`.
    pub fn sync_object(
        &mut self,
        session: &mut NetSession,
        world: &W,
        type_id: u8,
        key: ObjectKey,
    ) -> Result<NetObjectId, NetObjectError> {
        if !session.is_host() || !session.is_ready() {
            return Err(NetObjectError::NotHost);
        }
        if !self.types.contains_key(&type_id) {
            return Err(NetObjectError::UnknownType(type_id));
        }
        if self.synced_by_key.contains_key(&key) {
            return Err(NetObjectError::AlreadySynced(key));
        }
        let id = self.allocate_id().ok_or(NetObjectError::OutOfIds)?;
        let object = SyncedObject { type_id, key };
        let msg = self.build_create(session, world, id, object)?;

        self.synced.insert(id, object);
        self.synced_by_key.insert(key, id);
        self.send_to_announced(session, &msg);
        tracing::debug!("Synced object {:?} (type {}) as {:?}", key, type_id, id);
        Ok(id)
    }

    /// Stop replicating `key` and destroy it on every peer.
    pub fn unsync_object(
        &mut self,
        session: &mut NetSession,
        world: &W,
        key: ObjectKey,
    ) -> Result<(), NetObjectError> {
        let id = self.synced_by_key.remove(&key).ok_or(NetObjectError::NotSynced(key))?;
        let Some(object) = self.synced.remove(&id) else {
            return Err(NetObjectError::NotSynced(key));
        };
        if !session.is_ready() {
            return Ok(());
        }

        let object_type = self
            .types
            .get(&object.type_id)
            .ok_or(NetObjectError::UnknownType(object.type_id))?;
        let mut msg = session.create_message("net_object_destroy")?;
        msg.write(id.0)?;
        object_type.write_destroy(world, key, &mut msg)?;
        self.send_to_announced(session, &msg);
        tracing::debug!("Unsynced object {:?} ({:?})", key, id);
        Ok(())
    }

    /// Process received object messages and, on the host, announce objects
    /// to new peers and broadcast snapshots when due.
    pub fn update(&mut self, session: &mut NetSession, world: &mut W, now: Instant) -> Vec<NetObjectEvent> {
        let mut events = Vec::new();
        if !session.is_ready() {
            self.inbox.try_iter().for_each(drop);
            self.announced.clear();
            self.last_snapshot = None;
            self.destroy_all_remote(world, &mut events);
            return events;
        }

        while let Ok(inbound) = self.inbox.try_recv() {
            self.receive(session, world, inbound, now, &mut events);
        }

        if session.is_host() {
            self.announce(session, world);
            let due = self
                .last_snapshot
                .is_none_or(|last| now.saturating_duration_since(last) >= self.snapshot_interval);
            if due {
                self.last_snapshot = Some(now);
                self.broadcast_snapshots(session, world, now);
            }
        }
        events
    }

    fn destroy_all_remote(&mut self, world: &mut W, events: &mut Vec<NetObjectEvent>) {
        if self.remote.is_empty() {
            return;
        }
        tracing::info!("Session lost, destroying {} remote objects", self.remote.len());
        for (id, remote) in std::mem::take(&mut self.remote) {
            if let Some(object_type) = self.types.get_mut(&remote.type_id) {
                object_type.destroy_silently(world, remote.key);
            }
            events.push(NetObjectEvent::Destroyed { id, key: remote.key });
        }
    }

    /// Send a create for every synced object to peers that became ready
    /// since the last update.
    fn announce(&mut self, session: &mut NetSession, world: &W) {
        let ready: Vec<(ConnectionId, u8)> = session
            .ready_connections()
            .filter_map(|c| Some((c.id(), c.index()?)))
            .collect();
        self.announced.retain(|id| ready.iter().any(|(r, _)| r == id));

        for (conn, index) in ready {
            if !self.announced.insert(conn) {
                continue;
            }
            tracing::debug!("Announcing {} objects to connection {}", self.synced.len(), index);
            for (&id, &object) in &self.synced {
                let sent = match self.build_create(session, world, id, object) {
                    Ok(msg) => session.send_to(index, msg).map_err(NetObjectError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    tracing::warn!("Could not announce {:?} to {}: {}", id, index, e);
                }
            }
        }
    }

    fn broadcast_snapshots(&self, session: &mut NetSession, world: &W, now: Instant) {
        if self.announced.is_empty() {
            return;
        }
        let capture = session.host_time_at(now);
        for (&id, &object) in &self.synced {
            match self.build_snapshot(session, world, id, object, capture) {
                Ok(Some(msg)) => self.send_to_announced(session, &msg),
                Ok(None) => {}
                Err(e) => tracing::warn!("Snapshot of {:?} failed: {}", id, e),
            }
        }
    }

    fn build_snapshot(
        &self,
        session: &NetSession,
        world: &W,
        id: NetObjectId,
        object: SyncedObject,
        capture: u32,
    ) -> Result<Option<NetMessage>, NetObjectError> {
        let object_type = self
            .types
            .get(&object.type_id)
            .ok_or(NetObjectError::UnknownType(object.type_id))?;
        let mut msg = session.create_message("net_object_snapshot")?;
        msg.write(id.0)?;
        msg.write(capture)?;
        let written = object_type.write_snapshot(world, object.key, &mut msg)?;
        Ok(written.then_some(msg))
    }

    fn receive(
        &mut self,
        session: &NetSession,
        world: &mut W,
        mut inbound: Inbound,
        now: Instant,
        events: &mut Vec<NetObjectEvent>,
    ) {
        if session.is_host() || inbound.from != Some(HOST_INDEX) {
            tracing::trace!("Ignoring object message from {:?}", inbound.from);
            return;
        }
        let msg = &mut inbound.msg;
        let result = match msg.index() {
            NET_OBJECT_CREATE => self.on_create(world, msg, events),
            NET_OBJECT_DESTROY => self.on_destroy(world, msg, events),
            NET_OBJECT_SNAPSHOT => self.on_snapshot(session, world, msg, now),
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::debug!("Malformed object message {}: {}", msg.index(), e);
        }
    }

    fn on_create(
        &mut self,
        world: &mut W,
        msg: &mut NetMessage,
        events: &mut Vec<NetObjectEvent>,
    ) -> Result<(), NetObjectError> {
        let type_id = msg.read::<u8>()?;
        let id = NetObjectId(msg.read::<u16>()?);
        if self.remote.contains_key(&id) {
            return Ok(());
        }
        let object_type = self
            .types
            .get_mut(&type_id)
            .ok_or(NetObjectError::UnknownType(type_id))?;
        let Some(key) = object_type.read_create(world, msg)? else {
            tracing::warn!("Object type {} refused to create {:?}", type_id, id);
            return Ok(());
        };
        self.remote.insert(
            id,
            RemoteObject {
                type_id,
                key,
                last_capture: None,
            },
        );
        events.push(NetObjectEvent::Created { id, type_id, key });
        Ok(())
    }

    fn on_destroy(
        &mut self,
        world: &mut W,
        msg: &mut NetMessage,
        events: &mut Vec<NetObjectEvent>,
    ) -> Result<(), NetObjectError> {
        let id = NetObjectId(msg.read::<u16>()?);
        let Some(remote) = self.remote.remove(&id) else {
            return Ok(());
        };
        let object_type = self
            .types
            .get_mut(&remote.type_id)
            .ok_or(NetObjectError::UnknownType(remote.type_id))?;
        if let Err(e) = object_type.read_destroy(world, remote.key, msg) {
            tracing::debug!("Bad destroy info for {:?}: {}", id, e);
            object_type.destroy_silently(world, remote.key);
        }
        events.push(NetObjectEvent::Destroyed { id, key: remote.key });
        Ok(())
    }

    fn on_snapshot(
        &mut self,
        session: &NetSession,
        world: &mut W,
        msg: &mut NetMessage,
        now: Instant,
    ) -> Result<(), NetObjectError> {
        let id = NetObjectId(msg.read::<u16>()?);
        let capture = msg.read::<u32>()?;
        let Some(remote) = self.remote.get_mut(&id) else {
            return Ok(());
        };
        // Unreliable: an older capture may arrive after a newer one.
        if remote
            .last_capture
            .is_some_and(|last| capture.wrapping_sub(last) as i32 <= 0)
        {
            return Ok(());
        }
        remote.last_capture = Some(capture);

        let elapsed = session.host_time_at(now).wrapping_sub(capture) as i32;
        let age = Duration::from_millis(u64::from(elapsed.max(0).unsigned_abs()));
        let object_type = self
            .types
            .get_mut(&remote.type_id)
            .ok_or(NetObjectError::UnknownType(remote.type_id))?;
        object_type.read_snapshot(world, remote.key, msg, age)?;
        Ok(())
    }
}

impl<W> Default for NetObjectSystem<W> {
    fn default() -> Self {
        Self::new(NetObjectConfig::default())
    }
}

#[cfg(test)]
#[path = "net_object_tests.rs"]
mod tests;
