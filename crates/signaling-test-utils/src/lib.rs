//! # Signaling Test Utilities
//!
//! Shared test utilities for the SFU signaling server.
//!
//! ## Modules
//!
//! - `flaky_engine` - Media engine wrapper that fails worker creation on demand
//! - `fixtures` - Peers, RTP parameters and capability builders
//! - `harness` - `TestSfu`, a wired pool + registry + dispatcher, and `TestClient`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use signaling_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let sfu = TestSfu::builder().max_peers(2).build().await;
//!
//!     let mut alice = sfu.client();
//!     alice.join("standup", &TestPeer::new("alice")).await;
//!
//!     let producer_id = alice.publish(MediaKind::Video).await;
//!     // ...
//! }
//! ```

pub mod fixtures;
pub mod flaky_engine;
pub mod harness;

// Re-export commonly used items
pub use fixtures::*;
pub use flaky_engine::*;
pub use harness::*;
