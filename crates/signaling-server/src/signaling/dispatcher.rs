//! `SignalingDispatcher` - maps signaling requests onto registry and room operations.
//!
//! The dispatcher holds no per-connection state of its own; everything about a
//! connection lives in its [`Session`]. Every frame gets exactly one [`Response`].

use crate::actors::{MediaAction, RoomActorHandle, RoomEvent, RoomRegistryHandle, StatsTarget};
use crate::errors::SignalingError;
use crate::observability::metrics as prom;

use super::protocol::{parse_frame, Request, Response};
use super::session::Session;

use serde::Serialize;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Routes signaling requests for all connections.
#[derive(Clone)]
pub struct SignalingDispatcher {
    registry: RoomRegistryHandle,
}

impl SignalingDispatcher {
    #[must_use]
    pub fn new(registry: RoomRegistryHandle) -> Self {
        Self { registry }
    }

    /// Handle one text frame and produce its reply.
    pub async fn handle_frame(&self, session: &mut Session, text: &str) -> Response {
        let (id, request) = match parse_frame(text) {
            Ok(parsed) => parsed,
            Err((id, err)) => {
                debug!(
                    target: "sfu.signaling",
                    peer_id = %session.peer_id(),
                    error = %err,
                    "Rejected malformed frame"
                );
                prom::record_error(err.error_type_label());
                return Response::error(id, &err);
            }
        };

        let method = request.method();
        let start = Instant::now();
        let result = self.dispatch(session, request).await;
        let elapsed = start.elapsed();

        match result {
            Ok(data) => {
                prom::record_signaling_request(method, "success", elapsed);
                Response::ok(id, data)
            }
            Err(err) => {
                prom::record_signaling_request(method, "error", elapsed);
                prom::record_error(err.error_type_label());
                debug!(
                    target: "sfu.signaling",
                    peer_id = %session.peer_id(),
                    method,
                    error = %err,
                    "Request failed"
                );
                Response::error(id, &err)
            }
        }
    }

    /// Run a parsed request against the session.
    pub async fn dispatch(
        &self,
        session: &mut Session,
        request: Request,
    ) -> Result<Value, SignalingError> {
        if let Request::JoinRoom(join) = request {
            if let Some(current) = session.room_id() {
                return Err(SignalingError::AlreadyInRoom(current.to_string()));
            }

            let (room, result) = self
                .registry
                .join(
                    join.room_id,
                    session.peer_id().to_string(),
                    join.peer_info,
                    session.events(),
                )
                .await?;

            info!(
                target: "sfu.signaling",
                peer_id = %session.peer_id(),
                room_id = %room.room_id(),
                "Peer joined room"
            );
            session.enter(room);
            return to_data(&result);
        }

        if matches!(request, Request::LeaveRoom) {
            self.leave(session).await?;
            return Ok(json!({}));
        }

        let room = session.room().cloned().ok_or(SignalingError::NotInRoom)?;
        let peer_id = session.peer_id().to_string();

        match request {
            Request::GetCapabilities => to_data(&room.get_capabilities(peer_id).await?),
            Request::CreateTransport(data) => {
                to_data(&room.create_transport(peer_id, data.direction).await?)
            }
            Request::ConnectTransport(data) => {
                room.connect_transport(peer_id, data.transport_id, data.dtls_parameters)
                    .await?;
                Ok(json!({}))
            }
            Request::Produce(data) => {
                let producer_id = room
                    .produce(peer_id, data.transport_id, data.kind, data.rtp_parameters)
                    .await?;
                Ok(json!({ "id": producer_id }))
            }
            Request::Consume(data) => to_data(
                &room
                    .consume(
                        peer_id,
                        data.transport_id,
                        data.producer_id,
                        data.rtp_capabilities,
                    )
                    .await?,
            ),
            Request::PauseProducer(r) => {
                media(&room, peer_id, MediaAction::PauseProducer(r.producer_id)).await
            }
            Request::ResumeProducer(r) => {
                media(&room, peer_id, MediaAction::ResumeProducer(r.producer_id)).await
            }
            Request::CloseProducer(r) => {
                media(&room, peer_id, MediaAction::CloseProducer(r.producer_id)).await
            }
            Request::PauseConsumer(r) => {
                media(&room, peer_id, MediaAction::PauseConsumer(r.consumer_id)).await
            }
            Request::ResumeConsumer(r) => {
                media(&room, peer_id, MediaAction::ResumeConsumer(r.consumer_id)).await
            }
            Request::CloseConsumer(r) => {
                media(&room, peer_id, MediaAction::CloseConsumer(r.consumer_id)).await
            }
            Request::GetTransportStats(r) => {
                to_data(&room.stats(peer_id, StatsTarget::Transport(r.id)).await?)
            }
            Request::GetProducerStats(r) => {
                to_data(&room.stats(peer_id, StatsTarget::Producer(r.id)).await?)
            }
            Request::GetConsumerStats(r) => {
                to_data(&room.stats(peer_id, StatsTarget::Consumer(r.id)).await?)
            }
            Request::GetRoomStats => to_data(&room.room_stats().await?),
            Request::JoinRoom(_) | Request::LeaveRoom => Err(SignalingError::Internal(
                "membership request reached room dispatch".to_string(),
            )),
        }
    }

    /// Observe an event before it is pushed to the session's client.
    ///
    /// A `room-closed` for the session's room untags the connection so the
    /// client can join again.
    pub fn on_event(&self, session: &mut Session, event: &RoomEvent) {
        if let RoomEvent::RoomClosed { room_id, reason } = event {
            if session.room_id() == Some(room_id.as_str()) {
                session.leave();
                info!(
                    target: "sfu.signaling",
                    peer_id = %session.peer_id(),
                    room_id = %room_id,
                    reason = %reason,
                    "Room closed under peer"
                );
            }
        }
    }

    /// Connection lost: leave whatever room the session is in.
    pub async fn disconnect(&self, session: &mut Session) {
        if let Err(e) = self.leave(session).await {
            warn!(
                target: "sfu.signaling",
                peer_id = %session.peer_id(),
                error = %e,
                "Failed to remove disconnected peer"
            );
        }
    }

    async fn leave(&self, session: &mut Session) -> Result<(), SignalingError> {
        let Some(room) = session.leave() else {
            return Ok(());
        };

        self.registry
            .remove_peer(room.room_id().to_string(), session.peer_id().to_string())
            .await?;

        info!(
            target: "sfu.signaling",
            peer_id = %session.peer_id(),
            room_id = %room.room_id(),
            "Peer left room"
        );
        Ok(())
    }
}

async fn media(
    room: &RoomActorHandle,
    peer_id: String,
    action: MediaAction,
) -> Result<Value, SignalingError> {
    room.media(peer_id, action).await?;
    Ok(json!({}))
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, SignalingError> {
    serde_json::to_value(value)
        .map_err(|e| SignalingError::Internal(format!("response serialization failed: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::actors::{ActorMetrics, RegistrySettings, WorkerPoolHandle};
    use crate::engine::{ListenIp, LocalEngine, TransportOptions, WorkerLogLevel, WorkerSettings};
    use crate::errors::ErrorKind;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    async fn dispatcher(max_peers: usize) -> SignalingDispatcher {
        let token = CancellationToken::new();
        let metrics = ActorMetrics::new();
        let (pool, _pool_task) = WorkerPoolHandle::initialize(
            Arc::new(LocalEngine::new()),
            1,
            WorkerSettings {
                log_level: WorkerLogLevel::None,
                rtc_min_port: 44000,
                rtc_max_port: 44100,
            },
            token.child_token(),
            Arc::clone(&metrics),
        )
        .await
        .unwrap();

        let (registry, _task) = RoomRegistryHandle::spawn(
            pool,
            RegistrySettings {
                max_peers,
                close_grace: Duration::from_secs(30),
                transport_options: TransportOptions {
                    listen_ips: vec![ListenIp {
                        ip: "0.0.0.0".to_string(),
                        announced_ip: Some("127.0.0.1".to_string()),
                    }],
                    enable_udp: true,
                    enable_tcp: true,
                    prefer_udp: true,
                    max_incoming_bitrate: None,
                    max_outgoing_bitrate: None,
                },
            },
            token.child_token(),
            metrics,
        );
        SignalingDispatcher::new(registry)
    }

    async fn call(
        dispatcher: &SignalingDispatcher,
        session: &mut Session,
        id: u64,
        method: &str,
        data: Value,
    ) -> Response {
        let frame = json!({"id": id, "method": method, "data": data}).to_string();
        dispatcher.handle_frame(session, &frame).await
    }

    fn error_kind(response: &Response) -> Option<ErrorKind> {
        response.error.as_ref().map(|e| e.kind)
    }

    fn drain(rx: &mut mpsc::Receiver<RoomEvent>) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_room_requests_require_join() {
        let dispatcher = dispatcher(4).await;
        let (mut session, _rx) = Session::new();

        let response = call(&dispatcher, &mut session, 1, "get-capabilities", json!({})).await;
        assert!(!response.success);
        assert_eq!(response.id, 1);
        assert_eq!(error_kind(&response), Some(ErrorKind::NotInRoom));
    }

    #[tokio::test]
    async fn test_join_replies_with_capabilities() {
        let dispatcher = dispatcher(4).await;
        let (mut session, _rx) = Session::new();

        let response = call(
            &dispatcher,
            &mut session,
            7,
            "join-room",
            json!({"roomId": "standup", "peerInfo": {"name": "Ada"}}),
        )
        .await;

        assert!(response.success, "{response:?}");
        let data = response.data.unwrap();
        assert_eq!(data["roomId"], "standup");
        assert_eq!(data["peerId"], session.peer_id());
        assert!(!data["routerRtpCapabilities"]["codecs"]
            .as_array()
            .unwrap()
            .is_empty());
        assert_eq!(data["existingProducers"], json!([]));
        assert_eq!(session.room_id(), Some("standup"));
    }

    #[tokio::test]
    async fn test_second_join_is_rejected() {
        let dispatcher = dispatcher(4).await;
        let (mut session, _rx) = Session::new();

        call(&dispatcher, &mut session, 1, "join-room", json!({"roomId": "a"})).await;
        let response = call(&dispatcher, &mut session, 2, "join-room", json!({"roomId": "b"})).await;

        assert_eq!(error_kind(&response), Some(ErrorKind::InvalidRequest));
        assert_eq!(session.room_id(), Some("a"));
    }

    #[tokio::test]
    async fn test_unknown_method_gets_reply() {
        let dispatcher = dispatcher(4).await;
        let (mut session, _rx) = Session::new();

        let response = call(&dispatcher, &mut session, 11, "warp", json!({})).await;
        assert_eq!(response.id, 11);
        assert_eq!(error_kind(&response), Some(ErrorKind::InvalidRequest));
    }

    #[tokio::test]
    async fn test_leave_notifies_others_and_untags() {
        let dispatcher = dispatcher(4).await;
        let (mut a, _rx_a) = Session::new();
        let (mut b, mut rx_b) = Session::new();

        call(&dispatcher, &mut a, 1, "join-room", json!({"roomId": "r"})).await;
        call(&dispatcher, &mut b, 1, "join-room", json!({"roomId": "r"})).await;
        drain(&mut rx_b);

        let response = call(&dispatcher, &mut a, 2, "leave-room", json!({})).await;
        assert!(response.success);
        assert!(a.room_id().is_none());

        let events = drain(&mut rx_b);
        assert_eq!(
            events,
            vec![RoomEvent::PeerLeft {
                peer_id: a.peer_id().to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_leave_without_room_succeeds() {
        let dispatcher = dispatcher(4).await;
        let (mut session, _rx) = Session::new();

        let response = call(&dispatcher, &mut session, 3, "leave-room", json!({})).await;
        assert!(response.success);
    }

    #[tokio::test]
    async fn test_capacity_error_keeps_session_untagged() {
        let dispatcher = dispatcher(1).await;
        let (mut a, _rx_a) = Session::new();
        let (mut b, _rx_b) = Session::new();

        call(&dispatcher, &mut a, 1, "join-room", json!({"roomId": "r"})).await;
        let response = call(&dispatcher, &mut b, 1, "join-room", json!({"roomId": "r"})).await;

        assert_eq!(error_kind(&response), Some(ErrorKind::Capacity));
        assert!(b.room_id().is_none());
    }

    #[tokio::test]
    async fn test_room_closed_event_untags_session() {
        let dispatcher = dispatcher(4).await;
        let (mut session, _rx) = Session::new();
        call(&dispatcher, &mut session, 1, "join-room", json!({"roomId": "r"})).await;

        dispatcher.on_event(
            &mut session,
            &RoomEvent::RoomClosed {
                room_id: "other".to_string(),
                reason: "closed-by-admin".to_string(),
            },
        );
        assert_eq!(session.room_id(), Some("r"));

        dispatcher.on_event(
            &mut session,
            &RoomEvent::RoomClosed {
                room_id: "r".to_string(),
                reason: "closed-by-admin".to_string(),
            },
        );
        assert!(session.room_id().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_removes_peer() {
        let dispatcher = dispatcher(4).await;
        let (mut a, _rx_a) = Session::new();
        let (mut b, mut rx_b) = Session::new();

        call(&dispatcher, &mut a, 1, "join-room", json!({"roomId": "r"})).await;
        call(&dispatcher, &mut b, 1, "join-room", json!({"roomId": "r"})).await;
        drain(&mut rx_b);

        dispatcher.disconnect(&mut a).await;

        let response = call(&dispatcher, &mut b, 2, "get-room-stats", json!({})).await;
        assert_eq!(response.data.unwrap()["peerCount"], 1);
        assert_eq!(
            drain(&mut rx_b),
            vec![RoomEvent::PeerLeft {
                peer_id: a.peer_id().to_string()
            }]
        );
    }
}
