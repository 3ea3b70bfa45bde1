//! SFU Signaling Server Library
//!
//! Control plane for a Selective Forwarding Unit. Media packets are handled by
//! an external media engine; this crate decides which engine objects exist:
//!
//! - a pool of media workers, with replacement on worker death
//! - rooms of peers, each bound to one worker's router
//! - per-peer transports, producers and consumers
//! - JSON signaling over WebSocket, plus a status API for operators
//!
//! # Architecture
//!
//! ```text
//! WebSocket connection ──► SignalingDispatcher
//!                              │
//!                              ├──► RoomRegistryActor ──► WorkerPoolActor ──► MediaEngine
//!                              │          │
//!                              └──────────┴──► RoomActor (per room)
//!                                                  └── MediaResourceManager
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Worker pool, room registry and room actors
//! - [`config`] - Service configuration from environment
//! - [`engine`] - Media engine capability traits and the in-process engine
//! - [`errors`] - Error taxonomy shared by signaling and the status API
//! - [`http`] - Axum routes (WebSocket, status API, health, metrics)
//! - [`media`] - Media Resource Manager (transports, producers, consumers)
//! - [`observability`] - Health probes and Prometheus metrics
//! - [`signaling`] - Signaling protocol, sessions and dispatcher

pub mod actors;
pub mod config;
pub mod engine;
pub mod errors;
pub mod http;
pub mod media;
pub mod observability;
pub mod signaling;
