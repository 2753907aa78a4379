//! Multiplayer on top of the session layer: replication of game objects
//! from the host to every peer.

pub mod net_object;

pub use net_object::{
    NET_OBJECT_CREATE, NET_OBJECT_DESTROY, NET_OBJECT_SNAPSHOT, NetObjectConfig, NetObjectError,
    NetObjectEvent, NetObjectId, NetObjectSystem, NetObjectType, OBJECT_CHANNEL, ObjectKey,
};
