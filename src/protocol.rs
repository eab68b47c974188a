use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const ERR_INVALID_MESSAGE: &str = "INVALID_MESSAGE";
pub const ERR_INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
pub const ERR_UNKNOWN_TYPE: &str = "UNKNOWN_TYPE";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "device:online")]
    DeviceOnline,
    #[serde(rename = "device:offline")]
    DeviceOffline,
    #[serde(rename = "device:list")]
    DeviceList,
    #[serde(rename = "stream:start")]
    StreamStart,
    #[serde(rename = "stream:end")]
    StreamEnd,
    #[serde(rename = "webrtc:offer")]
    Offer,
    #[serde(rename = "webrtc:answer")]
    Answer,
    #[serde(rename = "webrtc:candidate")]
    Candidate,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::DeviceOnline => "device:online",
            MessageType::DeviceOffline => "device:offline",
            MessageType::DeviceList => "device:list",
            MessageType::StreamStart => "stream:start",
            MessageType::StreamEnd => "stream:end",
            MessageType::Offer => "webrtc:offer",
            MessageType::Answer => "webrtc:answer",
            MessageType::Candidate => "webrtc:candidate",
            MessageType::Error => "error",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let typ = match raw {
            "device:online" => MessageType::DeviceOnline,
            "device:offline" => MessageType::DeviceOffline,
            "device:list" => MessageType::DeviceList,
            "stream:start" => MessageType::StreamStart,
            "stream:end" => MessageType::StreamEnd,
            "webrtc:offer" => MessageType::Offer,
            "webrtc:answer" => MessageType::Answer,
            "webrtc:candidate" => MessageType::Candidate,
            "error" => MessageType::Error,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            _ => return None,
        };
        Some(typ)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound envelope. `payload` is omitted entirely for ping/pong.
#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    pub typ: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<&'a T>,
}

// Inbound frames keep the tag as a string so unknown types can be echoed back.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    typ: String,
    #[serde(default)]
    payload: Option<Value>,
}

/// Immutable snapshot of a device taken when its connection registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: Uuid,
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    #[serde(default)]
    pub has_camera: bool,
    #[serde(default)]
    pub has_microphone: bool,
    #[serde(default)]
    pub is_online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceOnlinePayload {
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceOfflinePayload {
    pub device_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceListPayload {
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStartPayload {
    pub stream_id: Uuid,
    pub source_device_id: Uuid,
    pub stream_type: String,
    pub quality: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEndPayload {
    pub stream_id: Uuid,
}

/// Offer and answer share one shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(default)]
    pub from_device_id: Uuid,
    #[serde(default)]
    pub to_device_id: Uuid,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePayload {
    #[serde(default)]
    pub from_device_id: Uuid,
    #[serde(default)]
    pub to_device_id: Uuid,
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sdp_mid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Client frames the server acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ping,
    Offer(SdpPayload),
    Answer(SdpPayload),
    Candidate(CandidatePayload),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to parse message: {0}")]
    InvalidMessage(#[source] serde_json::Error),
    #[error("invalid {typ} payload: {source}")]
    InvalidPayload {
        typ: MessageType,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::InvalidMessage(_) => ERR_INVALID_MESSAGE,
            ProtocolError::InvalidPayload { .. } => ERR_INVALID_PAYLOAD,
            ProtocolError::UnknownType(_) => ERR_UNKNOWN_TYPE,
        }
    }

    /// Text sent back to the client; parser internals stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ProtocolError::InvalidMessage(_) => "failed to parse message".to_string(),
            ProtocolError::InvalidPayload { typ, .. } => {
                let name = match typ {
                    MessageType::Offer => "offer",
                    MessageType::Answer => "answer",
                    MessageType::Candidate => "candidate",
                    other => other.as_str(),
                };
                format!("invalid {name} payload")
            }
            ProtocolError::UnknownType(t) => format!("unknown message type: {t}"),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            message: self.client_message(),
        }
    }
}

pub fn encode<T: Serialize>(typ: MessageType, payload: &T) -> serde_json::Result<String> {
    serde_json::to_string(&Envelope {
        typ,
        payload: Some(payload),
    })
}

pub fn encode_empty(typ: MessageType) -> serde_json::Result<String> {
    serde_json::to_string(&Envelope::<()> { typ, payload: None })
}

pub fn encode_error(code: &str, message: &str) -> serde_json::Result<String> {
    encode(
        MessageType::Error,
        &ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        },
    )
}

pub fn decode_inbound(raw: &str) -> Result<Inbound, ProtocolError> {
    let env: RawEnvelope = serde_json::from_str(raw).map_err(ProtocolError::InvalidMessage)?;
    let typ = MessageType::parse(&env.typ);
    let payload = env.payload.unwrap_or(Value::Null);
    match typ {
        Some(MessageType::Ping) => Ok(Inbound::Ping),
        Some(t @ MessageType::Offer) => parse_payload(t, payload).map(Inbound::Offer),
        Some(t @ MessageType::Answer) => parse_payload(t, payload).map(Inbound::Answer),
        Some(t @ MessageType::Candidate) => parse_payload(t, payload).map(Inbound::Candidate),
        _ => Err(ProtocolError::UnknownType(env.typ)),
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    typ: MessageType,
    payload: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::InvalidPayload { typ, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_and_pong_envelopes_omit_payload() {
        assert_eq!(decode_inbound(r#"{"type":"ping"}"#).unwrap(), Inbound::Ping);
        assert_eq!(encode_empty(MessageType::Pong).unwrap(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn offer_decodes_and_ignores_missing_sender() {
        let to = Uuid::new_v4();
        let raw = format!(r#"{{"type":"webrtc:offer","payload":{{"to_device_id":"{to}","sdp":"v=0"}}}}"#);
        match decode_inbound(&raw).unwrap() {
            Inbound::Offer(p) => {
                assert_eq!(p.to_device_id, to);
                assert_eq!(p.from_device_id, Uuid::nil());
                assert_eq!(p.sdp, "v=0");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn candidate_keeps_optional_line_fields() {
        let to = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"webrtc:candidate","payload":{{"to_device_id":"{to}","candidate":"candidate:1 1 udp","sdp_mline_index":0,"sdp_mid":"0"}}}}"#
        );
        let Inbound::Candidate(c) = decode_inbound(&raw).unwrap() else {
            panic!("expected candidate");
        };
        assert_eq!(c.sdp_mline_index, Some(0));
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));

        let out = encode(MessageType::Candidate, &CandidatePayload {
            sdp_mline_index: None,
            sdp_mid: None,
            ..c
        })
        .unwrap();
        assert!(!out.contains("sdp_mid"));
        assert!(out.starts_with(r#"{"type":"webrtc:candidate","payload":"#));
    }

    #[test]
    fn malformed_and_unknown_frames_map_to_error_codes() {
        let err = decode_inbound("not json").unwrap_err();
        assert_eq!(err.code(), ERR_INVALID_MESSAGE);
        assert_eq!(err.client_message(), "failed to parse message");

        let err = decode_inbound(r#"{"type":"webrtc:answer","payload":{"sdp":42}}"#).unwrap_err();
        assert_eq!(err.code(), ERR_INVALID_PAYLOAD);
        assert_eq!(err.client_message(), "invalid answer payload");

        let err = decode_inbound(r#"{"type":"webrtc:offer"}"#).unwrap_err();
        assert_eq!(err.code(), ERR_INVALID_PAYLOAD);

        let err = decode_inbound(r#"{"type":"chat:message","payload":{}}"#).unwrap_err();
        assert_eq!(err.code(), ERR_UNKNOWN_TYPE);
        assert_eq!(err.client_message(), "unknown message type: chat:message");

        // Server-originated events are not accepted from clients.
        let err = decode_inbound(r#"{"type":"device:list","payload":{"devices":[]}}"#).unwrap_err();
        assert_eq!(err.code(), ERR_UNKNOWN_TYPE);
    }

    #[test]
    fn message_type_names_round_trip_through_serde() {
        for typ in [
            MessageType::DeviceOnline,
            MessageType::StreamEnd,
            MessageType::Candidate,
            MessageType::Pong,
        ] {
            let json = serde_json::to_string(&typ).unwrap();
            assert_eq!(json, format!("\"{}\"", typ.as_str()));
            assert_eq!(MessageType::parse(typ.as_str()), Some(typ));
        }
    }
}
