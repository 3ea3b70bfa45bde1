//! Media Resource Manager.
//!
//! Owns, per peer, the send/recv transports and the producers and consumers
//! created on them:
//!
//! - [`codecs`] - the fixed codec set offered by every router
//! - [`peer`] - peer state (`Peer`, `PeerInfo`, `TransportDirection`)
//! - [`resources`] - `MediaResourceManager`, the operations on a room's peers

pub mod codecs;
pub mod peer;
pub mod resources;

pub use codecs::supported_codecs;
pub use peer::{Peer, PeerInfo, PeerTransport, TransportDirection};
pub use resources::{notify_others, MediaResourceManager, PeerMap};
