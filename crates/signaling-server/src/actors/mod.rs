//! Actor model implementation for the signaling server.
//!
//! ```text
//! WorkerPoolActor (singleton)
//! └── owns N media workers, broadcasts worker loss
//!
//! RoomRegistryActor (singleton)
//! ├── acquires workers from the pool
//! └── supervises N RoomActors
//!     └── RoomActor (one per active room)
//!         ├── owns the router and the peer map
//!         └── pushes RoomEvents to each peer's connection
//! ```
//!
//! # Key Design Decisions
//!
//! - **Per-room serialization**: every mutation of a room runs on its actor task
//! - **No upward calls**: room actors never call the registry, and the pool reaches
//!   the registry only through a broadcast
//! - **Non-blocking registry**: the registry never awaits a room actor or the engine
//!   inside its mailbox loop, so a stalled room cannot hold up other rooms
//! - **CancellationToken propagation**: parent actors pass child tokens for shutdown
//! - **Mailbox monitoring**: depth thresholds with metrics (Room/Registry: 100/500, Pool: 50/200)
//!
//! # Modules
//!
//! - [`pool`] - `WorkerPoolActor`, round-robin worker assignment and death recovery
//! - [`registry`] - `RoomRegistryActor`, room lifecycle and deferred closure
//! - [`room`] - `RoomActor`, peers and media of one room
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod messages;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod room;

// Re-export primary types
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use pool::WorkerPoolHandle;
pub use registry::{RegistrySettings, RoomRegistryHandle};
pub use room::{RoomActor, RoomActorHandle};
