//! Signaling Dispatcher.
//!
//! - [`protocol`] - JSON request/response/push framing
//! - [`session`] - per-connection peer id and room tag
//! - [`dispatcher`] - `SignalingDispatcher`, request routing onto the actors
//! - [`websocket`] - the `GET /ws` upgrade and connection loop

pub mod dispatcher;
pub mod protocol;
pub mod session;
pub mod websocket;

pub use dispatcher::SignalingDispatcher;
pub use protocol::{Request, Response};
pub use session::Session;
pub use websocket::ws_handler;
