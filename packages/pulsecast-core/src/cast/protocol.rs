//! JSON payloads of the cast sub-protocols.
//!
//! Four namespaces are spoken. The connection and heartbeat namespaces keep
//! a virtual connection alive, the receiver namespace drives application
//! lifecycle on the device, and the wsapp namespace is the control protocol
//! of the Pulsecast receiver application itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const NS_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
pub const NS_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
pub const NS_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";
pub const NS_STREAM_APP: &str = "urn:x-cast:com.p2004a.chromecast-receiver.wsapp";

/// Virtual connection management messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionMessage {
    Connect,
    Close,
}

/// Heartbeat messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeartbeatMessage {
    Ping,
    Pong,
}

/// Requests on the receiver namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiverRequest {
    #[serde(rename_all = "camelCase")]
    Launch { app_id: String, request_id: i64 },
    #[serde(rename_all = "camelCase")]
    GetStatus { request_id: i64 },
    #[serde(rename_all = "camelCase")]
    Stop { session_id: String, request_id: i64 },
}

/// Replies on the receiver namespace.
///
/// `RECEIVER_STATUS` also arrives unsolicited (requestId 0), so the id is
/// optional on the way in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiverReply {
    #[serde(rename_all = "camelCase")]
    ReceiverStatus {
        #[serde(default)]
        request_id: i64,
        status: ReceiverStatus,
    },
    #[serde(rename_all = "camelCase")]
    LaunchError {
        #[serde(default)]
        request_id: i64,
        #[serde(default)]
        reason: Option<String>,
    },
}

/// The `status` object of a `RECEIVER_STATUS` reply.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStatus {
    #[serde(default)]
    pub applications: Vec<ApplicationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Value>,
}

/// One running application in a receiver status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    pub transport_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Requests on the Pulsecast receiver application namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppRequest {
    #[serde(rename_all = "camelCase")]
    StartStream {
        request_id: i64,
        addresses: Vec<String>,
        device_name: String,
    },
}

/// Replies on the Pulsecast receiver application namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppReply {
    #[serde(rename_all = "camelCase")]
    Ok {
        request_id: i64,
        #[serde(default)]
        data: Value,
    },
    #[serde(rename_all = "camelCase")]
    Error { request_id: i64, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connect_message_shape() {
        let encoded = serde_json::to_value(ConnectionMessage::Connect).unwrap();
        assert_eq!(encoded, json!({"type": "CONNECT"}));
    }

    #[test]
    fn heartbeat_roundtrip() {
        let encoded = serde_json::to_string(&HeartbeatMessage::Ping).unwrap();
        assert_eq!(encoded, r#"{"type":"PING"}"#);
        let decoded: HeartbeatMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, HeartbeatMessage::Ping);
    }

    #[test]
    fn launch_request_shape() {
        let request = ReceiverRequest::Launch {
            app_id: "2B0D60E4".into(),
            request_id: 623453,
        };
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(
            encoded,
            json!({"type": "LAUNCH", "appId": "2B0D60E4", "requestId": 623453})
        );
        let decoded: ReceiverRequest = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn receiver_status_extracts_applications() {
        let reply: ReceiverReply = serde_json::from_value(json!({
            "type": "RECEIVER_STATUS",
            "requestId": 7,
            "status": {
                "applications": [
                    {"transportId": "T", "sessionId": "S", "appId": "2B0D60E4"}
                ]
            }
        }))
        .unwrap();
        match reply {
            ReceiverReply::ReceiverStatus { request_id, status } => {
                assert_eq!(request_id, 7);
                assert_eq!(status.applications[0].transport_id, "T");
                assert_eq!(status.applications[0].session_id, "S");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn unsolicited_status_defaults_request_id() {
        let reply: ReceiverReply = serde_json::from_value(json!({
            "type": "RECEIVER_STATUS",
            "status": {"applications": []}
        }))
        .unwrap();
        match reply {
            ReceiverReply::ReceiverStatus { request_id, .. } => assert_eq!(request_id, 0),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn start_stream_shape() {
        let request = AppRequest::StartStream {
            request_id: 1,
            addresses: vec!["ws://192.0.2.1:40123".into()],
            device_name: "CC-Kitchen".into(),
        };
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(
            encoded,
            json!({
                "type": "START_STREAM",
                "requestId": 1,
                "addresses": ["ws://192.0.2.1:40123"],
                "deviceName": "CC-Kitchen"
            })
        );
    }

    #[test]
    fn app_replies_roundtrip() {
        let ok: AppReply =
            serde_json::from_value(json!({"type": "OK", "requestId": 3, "data": {}})).unwrap();
        assert_eq!(
            ok,
            AppReply::Ok {
                request_id: 3,
                data: json!({})
            }
        );

        let error: AppReply =
            serde_json::from_value(json!({"type": "ERROR", "requestId": 4, "message": "nope"}))
                .unwrap();
        assert_eq!(
            error,
            AppReply::Error {
                request_id: 4,
                message: "nope".into()
            }
        );
    }
}
