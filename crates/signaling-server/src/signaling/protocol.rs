//! Signaling wire format.
//!
//! JSON text frames:
//!
//! ```text
//! request   {"id": 7, "method": "produce", "data": {...}}
//! response  {"id": 7, "success": true,  "data": {...}}
//!           {"id": 7, "success": false, "error": {"kind": "not-found", "message": "..."}}
//! push      {"event": "new-producer", "data": {...}}
//! ```
//!
//! Pushes are [`RoomEvent`](crate::actors::RoomEvent) values serialized as-is.

use crate::engine::{MediaKind, RtpCapabilities, RtpParameters};
use crate::errors::{ErrorBody, SignalingError};
use crate::media::{PeerInfo, TransportDirection};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request envelope before method dispatch.
#[derive(Debug, Deserialize)]
struct RawRequest {
    id: u64,
    method: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomData {
    pub room_id: String,
    #[serde(default)]
    pub peer_info: PeerInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTransportData {
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportData {
    pub transport_id: String,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceData {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeData {
    pub transport_id: String,
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRef {
    pub producer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    pub consumer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsRef {
    pub id: String,
}

/// A parsed signaling request.
#[derive(Debug, Clone)]
pub enum Request {
    JoinRoom(JoinRoomData),
    LeaveRoom,
    GetCapabilities,
    CreateTransport(CreateTransportData),
    ConnectTransport(ConnectTransportData),
    Produce(ProduceData),
    Consume(ConsumeData),
    PauseProducer(ProducerRef),
    ResumeProducer(ProducerRef),
    CloseProducer(ProducerRef),
    PauseConsumer(ConsumerRef),
    ResumeConsumer(ConsumerRef),
    CloseConsumer(ConsumerRef),
    GetTransportStats(StatsRef),
    GetProducerStats(StatsRef),
    GetConsumerStats(StatsRef),
    GetRoomStats,
}

impl Request {
    /// Build a request from its method name and payload.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for an unknown method or a payload that does not match it.
    pub fn parse(method: &str, data: Value) -> Result<Self, SignalingError> {
        let request = match method {
            "join-room" => Request::JoinRoom(payload(method, data)?),
            "leave-room" => Request::LeaveRoom,
            "get-capabilities" => Request::GetCapabilities,
            "create-transport" => Request::CreateTransport(payload(method, data)?),
            "connect-transport" => Request::ConnectTransport(payload(method, data)?),
            "produce" => Request::Produce(payload(method, data)?),
            "consume" => Request::Consume(payload(method, data)?),
            "pause-producer" => Request::PauseProducer(payload(method, data)?),
            "resume-producer" => Request::ResumeProducer(payload(method, data)?),
            "close-producer" => Request::CloseProducer(payload(method, data)?),
            "pause-consumer" => Request::PauseConsumer(payload(method, data)?),
            "resume-consumer" => Request::ResumeConsumer(payload(method, data)?),
            "close-consumer" => Request::CloseConsumer(payload(method, data)?),
            "get-transport-stats" => Request::GetTransportStats(payload(method, data)?),
            "get-producer-stats" => Request::GetProducerStats(payload(method, data)?),
            "get-consumer-stats" => Request::GetConsumerStats(payload(method, data)?),
            "get-room-stats" => Request::GetRoomStats,
            other => {
                return Err(SignalingError::InvalidRequest(format!(
                    "Unknown method: {other}"
                )))
            }
        };

        if let Request::JoinRoom(join) = &request {
            if join.room_id.trim().is_empty() {
                return Err(SignalingError::InvalidRequest(
                    "roomId must not be empty".to_string(),
                ));
            }
        }

        Ok(request)
    }

    /// Wire name of the method (also the metrics label).
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Request::JoinRoom(_) => "join-room",
            Request::LeaveRoom => "leave-room",
            Request::GetCapabilities => "get-capabilities",
            Request::CreateTransport(_) => "create-transport",
            Request::ConnectTransport(_) => "connect-transport",
            Request::Produce(_) => "produce",
            Request::Consume(_) => "consume",
            Request::PauseProducer(_) => "pause-producer",
            Request::ResumeProducer(_) => "resume-producer",
            Request::CloseProducer(_) => "close-producer",
            Request::PauseConsumer(_) => "pause-consumer",
            Request::ResumeConsumer(_) => "resume-consumer",
            Request::CloseConsumer(_) => "close-consumer",
            Request::GetTransportStats(_) => "get-transport-stats",
            Request::GetProducerStats(_) => "get-producer-stats",
            Request::GetConsumerStats(_) => "get-consumer-stats",
            Request::GetRoomStats => "get-room-stats",
        }
    }
}

fn payload<T: DeserializeOwned>(method: &str, data: Value) -> Result<T, SignalingError> {
    serde_json::from_value(data)
        .map_err(|e| SignalingError::InvalidRequest(format!("Invalid data for {method}: {e}")))
}

/// Parse one text frame.
///
/// On failure, returns the request id if one could be recovered (0 otherwise)
/// so the client still gets a correlated reply.
pub fn parse_frame(text: &str) -> Result<(u64, Request), (u64, SignalingError)> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| (0, SignalingError::InvalidRequest(format!("Malformed JSON: {e}"))))?;

    let id = value.get("id").and_then(Value::as_u64).unwrap_or(0);

    let raw: RawRequest = serde_json::from_value(value)
        .map_err(|e| (id, SignalingError::InvalidRequest(format!("Malformed request: {e}"))))?;

    Request::parse(&raw.method, raw.data)
        .map(|request| (raw.id, request))
        .map_err(|e| (raw.id, e))
}

/// Reply to one request.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    #[must_use]
    pub fn ok(id: u64, data: Value) -> Self {
        Self {
            id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn error(id: u64, err: &SignalingError) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(ErrorBody::from(err)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_parse_join_room() {
        let (id, request) = parse_frame(
            r#"{"id": 3, "method": "join-room", "data": {"roomId": "standup", "peerInfo": {"name": "Ada"}}}"#,
        )
        .unwrap();

        assert_eq!(id, 3);
        assert_eq!(request.method(), "join-room");
        if let Request::JoinRoom(join) = request {
            assert_eq!(join.room_id, "standup");
            assert_eq!(join.peer_info.name.as_deref(), Some("Ada"));
        }
    }

    #[test]
    fn test_parse_without_data() {
        let (_, request) = parse_frame(r#"{"id": 1, "method": "leave-room"}"#).unwrap();
        assert!(matches!(request, Request::LeaveRoom));
    }

    #[test]
    fn test_unknown_method_keeps_request_id() {
        let (id, err) = parse_frame(r#"{"id": 9, "method": "teleport", "data": {}}"#).unwrap_err();
        assert_eq!(id, 9);
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn test_bad_payload_is_invalid_request() {
        let (id, err) = parse_frame(
            r#"{"id": 4, "method": "create-transport", "data": {"direction": "sideways"}}"#,
        )
        .unwrap_err();
        assert_eq!(id, 4);
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_malformed_json_replies_with_id_zero() {
        let (id, err) = parse_frame("{not json").unwrap_err();
        assert_eq!(id, 0);
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_empty_room_id_rejected() {
        let (_, err) =
            parse_frame(r#"{"id": 2, "method": "join-room", "data": {"roomId": " "}}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_response_shapes() {
        let ok = serde_json::to_value(Response::ok(5, json!({"id": "t1"}))).unwrap();
        assert_eq!(ok, json!({"id": 5, "success": true, "data": {"id": "t1"}}));

        let err = serde_json::to_value(Response::error(6, &SignalingError::NotInRoom)).unwrap();
        assert_eq!(
            err,
            json!({
                "id": 6,
                "success": false,
                "error": {"kind": "not-in-room", "message": "Not in a room"}
            })
        );
    }
}
