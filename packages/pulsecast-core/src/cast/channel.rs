//! Logical channels multiplexed over one Chromecast connection.
//!
//! A connection carries several (source, destination) conversations at once.
//! Each logical channel filters inbound frames by peer, speaks the shared
//! connection/heartbeat namespaces, and correlates its own requests with
//! replies via monotonically increasing request ids.
//!
//! The owning device task serialises all access, so channels are plain
//! state machines: inbound frames go through `handle`, which returns a typed
//! event when a frame completes one of our requests.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::protocol::{
    AppReply, AppRequest, ConnectionMessage, HeartbeatMessage, ReceiverReply, ReceiverRequest,
    ReceiverStatus, NS_CONNECTION, NS_HEARTBEAT, NS_RECEIVER, NS_STREAM_APP,
};
use super::wire::{CastMessage, PayloadType};

/// Outbound path into the owning connection's write queue.
pub type MessageSender = mpsc::UnboundedSender<CastMessage>;

/// State shared by every logical channel: the id pair and outbound path.
struct ChannelCore {
    local: String,
    remote: String,
    tx: MessageSender,
}

impl ChannelCore {
    fn send_json<T: Serialize>(&self, namespace: &str, payload: &T) {
        match serde_json::to_string(payload) {
            Ok(json) => {
                let message =
                    CastMessage::string(self.local.clone(), self.remote.clone(), namespace, json);
                // The send only fails when the connection is already gone;
                // the disconnect surfaces through the connection events.
                let _ = self.tx.send(message);
            }
            Err(e) => log::error!("[Channel {}] Failed to encode payload: {}", self.local, e),
        }
    }

    /// Applies the inbound filter: peer check, STRING payload, JSON parse.
    fn accept(&self, message: &CastMessage) -> Option<Value> {
        if message.source_id != self.remote && message.destination_id != "*" {
            log::warn!(
                "[Channel {}] Got message from unexpected sender '{}'",
                self.local,
                message.source_id
            );
            return None;
        }
        if message.payload_type != PayloadType::String {
            log::warn!("[Channel {}] Got BINARY payload type", self.local);
            return None;
        }
        match serde_json::from_str(&message.payload_utf8) {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!(
                    "[Channel {}] Couldn't parse message payload as JSON",
                    self.local
                );
                None
            }
        }
    }

    /// Handles the connection and heartbeat namespaces common to every
    /// channel. Returns true when the frame was consumed.
    fn handle_basic(&self, message: &CastMessage, payload: &Value) -> bool {
        match message.namespace.as_str() {
            NS_CONNECTION => {
                match serde_json::from_value::<ConnectionMessage>(payload.clone()) {
                    Ok(ConnectionMessage::Connect) => {
                        log::debug!("[Channel {}] Got unexpected CONNECT message", self.local);
                    }
                    Ok(ConnectionMessage::Close) => {
                        // The TLS connection reports the real disconnect; a
                        // virtual CLOSE on its own is only worth a warning.
                        log::warn!("[Channel {}] Ignoring CLOSE from peer", self.local);
                    }
                    Err(_) => log::warn!(
                        "[Channel {}] Connection message didn't have expected fields",
                        self.local
                    ),
                }
                true
            }
            NS_HEARTBEAT => {
                match serde_json::from_value::<HeartbeatMessage>(payload.clone()) {
                    Ok(HeartbeatMessage::Ping) => {
                        self.send_json(NS_HEARTBEAT, &HeartbeatMessage::Pong);
                    }
                    Ok(HeartbeatMessage::Pong) => {}
                    Err(_) => log::warn!(
                        "[Channel {}] Heartbeat message didn't have expected fields",
                        self.local
                    ),
                }
                true
            }
            _ => false,
        }
    }

    fn warn_unknown_namespace(&self, message: &CastMessage) {
        if message.destination_id != "*" {
            log::warn!(
                "[Channel {}] Unexpected namespace '{}'",
                self.local,
                message.namespace
            );
        }
    }
}

/// What a pending receiver-namespace request was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingReceiver {
    Launch,
    Status,
    StopApp,
}

/// Events produced by the [`MainChannel`].
#[derive(Debug, Clone, PartialEq)]
pub enum MainChannelEvent {
    /// Our LAUNCH completed; the application is addressable.
    AppLaunched {
        transport_id: String,
        session_id: String,
    },
    /// Our LAUNCH failed, or succeeded without a running application.
    LaunchFailed { reason: Option<String> },
    /// A GET_STATUS or STOP request completed.
    Status(ReceiverStatus),
}

/// The platform conversation with a device: virtual connection, heartbeat
/// and the receiver namespace (LAUNCH / GET_STATUS / STOP).
pub struct MainChannel {
    core: ChannelCore,
    next_request_id: i64,
    pending: HashMap<i64, PendingReceiver>,
}

impl MainChannel {
    pub fn new(local: impl Into<String>, remote: impl Into<String>, tx: MessageSender) -> Self {
        Self {
            core: ChannelCore {
                local: local.into(),
                remote: remote.into(),
                tx,
            },
            // Seed away from zero so our ids never collide with the
            // requestId the device uses for unsolicited status broadcasts.
            next_request_id: 623_453,
            pending: HashMap::new(),
        }
    }

    /// Local id of this channel, used to route inbound frames.
    #[must_use]
    pub fn local_id(&self) -> &str {
        &self.core.local
    }

    /// Opens the virtual connection and sends the first heartbeat.
    pub fn start(&mut self) {
        self.core.send_json(NS_CONNECTION, &ConnectionMessage::Connect);
        self.ping();
    }

    /// Sends one heartbeat PING. Driven by the owner's heartbeat timer.
    pub fn ping(&mut self) {
        self.core.send_json(NS_HEARTBEAT, &HeartbeatMessage::Ping);
    }

    /// Asks the device to launch the receiver application.
    pub fn launch(&mut self, app_id: &str) {
        let request_id = self.alloc_request_id();
        self.pending.insert(request_id, PendingReceiver::Launch);
        self.core.send_json(
            NS_RECEIVER,
            &ReceiverRequest::Launch {
                app_id: app_id.to_string(),
                request_id,
            },
        );
    }

    /// Requests a receiver status report.
    pub fn get_status(&mut self) {
        let request_id = self.alloc_request_id();
        self.pending.insert(request_id, PendingReceiver::Status);
        self.core
            .send_json(NS_RECEIVER, &ReceiverRequest::GetStatus { request_id });
    }

    /// Stops a running application session.
    pub fn stop_app(&mut self, session_id: &str) {
        let request_id = self.alloc_request_id();
        self.pending.insert(request_id, PendingReceiver::StopApp);
        self.core.send_json(
            NS_RECEIVER,
            &ReceiverRequest::Stop {
                session_id: session_id.to_string(),
                request_id,
            },
        );
    }

    /// Dispatches one inbound frame addressed to this channel.
    pub fn handle(&mut self, message: &CastMessage) -> Option<MainChannelEvent> {
        let payload = self.core.accept(message)?;
        if self.core.handle_basic(message, &payload) {
            return None;
        }
        if message.namespace != NS_RECEIVER {
            self.core.warn_unknown_namespace(message);
            return None;
        }

        let reply: ReceiverReply = match serde_json::from_value(payload) {
            Ok(reply) => reply,
            Err(_) => {
                log::warn!("[MainChannel] Receiver message didn't have expected fields");
                return None;
            }
        };

        match reply {
            ReceiverReply::ReceiverStatus { request_id, status } => {
                match self.pending.remove(&request_id) {
                    Some(PendingReceiver::Launch) => Some(match status.applications.first() {
                        Some(app) => MainChannelEvent::AppLaunched {
                            transport_id: app.transport_id.clone(),
                            session_id: app.session_id.clone(),
                        },
                        None => MainChannelEvent::LaunchFailed { reason: None },
                    }),
                    Some(_) => Some(MainChannelEvent::Status(status)),
                    None => {
                        log::trace!("[MainChannel] Unsolicited receiver status");
                        None
                    }
                }
            }
            ReceiverReply::LaunchError { request_id, reason } => {
                match self.pending.remove(&request_id) {
                    Some(_) => Some(MainChannelEvent::LaunchFailed { reason }),
                    None => {
                        log::warn!("[MainChannel] LAUNCH_ERROR with unknown requestId");
                        None
                    }
                }
            }
        }
    }

    fn alloc_request_id(&mut self) -> i64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }
}

/// Result of a request on the application channel.
#[derive(Debug, Clone, PartialEq)]
pub enum AppChannelEvent {
    /// Request succeeded; carries the reply's data object.
    Ok(Value),
    /// Request failed with an error message from the receiver.
    Error(String),
}

/// The conversation with the launched receiver application (wsapp
/// namespace), addressed at its transport id.
pub struct AppChannel {
    core: ChannelCore,
    next_request_id: i64,
    pending: HashSet<i64>,
}

impl AppChannel {
    pub fn new(local: impl Into<String>, remote: impl Into<String>, tx: MessageSender) -> Self {
        Self {
            core: ChannelCore {
                local: local.into(),
                remote: remote.into(),
                tx,
            },
            next_request_id: 1,
            pending: HashSet::new(),
        }
    }

    /// Local id of this channel, used to route inbound frames.
    #[must_use]
    pub fn local_id(&self) -> &str {
        &self.core.local
    }

    /// Opens the virtual connection to the application and sends the first
    /// heartbeat.
    pub fn start(&mut self) {
        self.core.send_json(NS_CONNECTION, &ConnectionMessage::Connect);
        self.ping();
    }

    /// Sends one heartbeat PING. Driven by the owner's heartbeat timer.
    pub fn ping(&mut self) {
        self.core.send_json(NS_HEARTBEAT, &HeartbeatMessage::Ping);
    }

    /// Tells the receiver application to start pulling PCM from one of the
    /// given websocket endpoints.
    pub fn start_stream(&mut self, addresses: &[String], device_name: &str) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.pending.insert(request_id);
        self.core.send_json(
            NS_STREAM_APP,
            &AppRequest::StartStream {
                request_id,
                addresses: addresses.to_vec(),
                device_name: device_name.to_string(),
            },
        );
    }

    /// Dispatches one inbound frame addressed to this channel.
    pub fn handle(&mut self, message: &CastMessage) -> Option<AppChannelEvent> {
        let payload = self.core.accept(message)?;
        if self.core.handle_basic(message, &payload) {
            return None;
        }
        if message.namespace != NS_STREAM_APP {
            self.core.warn_unknown_namespace(message);
            return None;
        }

        let reply: AppReply = match serde_json::from_value(payload) {
            Ok(reply) => reply,
            Err(_) => {
                log::error!("[AppChannel] App message didn't have expected fields");
                return None;
            }
        };

        let (request_id, event) = match reply {
            AppReply::Ok { request_id, data } => (request_id, AppChannelEvent::Ok(data)),
            AppReply::Error {
                request_id,
                message,
            } => (request_id, AppChannelEvent::Error(message)),
        };
        if self.pending.remove(&request_id) {
            Some(event)
        } else {
            log::error!("[AppChannel] Unexpected requestId '{}'", request_id);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn drain(rx: &mut UnboundedReceiver<CastMessage>) -> Vec<CastMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn payload_json(message: &CastMessage) -> Value {
        serde_json::from_str(&message.payload_utf8).unwrap()
    }

    fn reply(source: &str, destination: &str, namespace: &str, payload: Value) -> CastMessage {
        CastMessage::string(source, destination, namespace, payload.to_string())
    }

    #[test]
    fn start_sends_connect_then_ping() {
        let (tx, mut rx) = unbounded_channel();
        let mut channel = MainChannel::new("sender-0", "receiver-0", tx);
        channel.start();

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].namespace, NS_CONNECTION);
        assert_eq!(payload_json(&sent[0]), json!({"type": "CONNECT"}));
        assert_eq!(sent[1].namespace, NS_HEARTBEAT);
        assert_eq!(payload_json(&sent[1]), json!({"type": "PING"}));
        assert!(sent.iter().all(|m| m.source_id == "sender-0"));
        assert!(sent.iter().all(|m| m.destination_id == "receiver-0"));
    }

    #[test]
    fn launch_correlates_receiver_status_exactly_once() {
        let (tx, mut rx) = unbounded_channel();
        let mut channel = MainChannel::new("sender-0", "receiver-0", tx);
        channel.launch("2B0D60E4");

        let sent = drain(&mut rx);
        let request_id = payload_json(&sent[0])["requestId"].as_i64().unwrap();

        let status = reply(
            "receiver-0",
            "sender-0",
            NS_RECEIVER,
            json!({
                "type": "RECEIVER_STATUS",
                "requestId": request_id,
                "status": {"applications": [{"transportId": "T", "sessionId": "S"}]}
            }),
        );

        assert_eq!(
            channel.handle(&status),
            Some(MainChannelEvent::AppLaunched {
                transport_id: "T".into(),
                session_id: "S".into(),
            })
        );
        // The resolver ran; a replay must not run it again.
        assert_eq!(channel.handle(&status), None);
    }

    #[test]
    fn launch_without_application_fails() {
        let (tx, mut rx) = unbounded_channel();
        let mut channel = MainChannel::new("sender-0", "receiver-0", tx);
        channel.launch("2B0D60E4");
        let request_id = payload_json(&drain(&mut rx)[0])["requestId"].as_i64().unwrap();

        let status = reply(
            "receiver-0",
            "sender-0",
            NS_RECEIVER,
            json!({"type": "RECEIVER_STATUS", "requestId": request_id, "status": {}}),
        );
        assert_eq!(
            channel.handle(&status),
            Some(MainChannelEvent::LaunchFailed { reason: None })
        );
    }

    #[test]
    fn messages_from_unexpected_senders_are_dropped() {
        let (tx, mut rx) = unbounded_channel();
        let mut channel = MainChannel::new("sender-0", "receiver-0", tx);
        channel.launch("2B0D60E4");
        let request_id = payload_json(&drain(&mut rx)[0])["requestId"].as_i64().unwrap();

        let spoofed = reply(
            "receiver-9",
            "sender-0",
            NS_RECEIVER,
            json!({
                "type": "RECEIVER_STATUS",
                "requestId": request_id,
                "status": {"applications": [{"transportId": "T", "sessionId": "S"}]}
            }),
        );
        assert_eq!(channel.handle(&spoofed), None);
    }

    #[test]
    fn broadcast_destination_is_accepted() {
        let (tx, _rx) = unbounded_channel();
        let mut channel = MainChannel::new("sender-0", "receiver-0", tx);
        let broadcast = reply(
            "anyone",
            "*",
            NS_HEARTBEAT,
            json!({"type": "PONG"}),
        );
        // Accepted (no warning path) and consumed by the heartbeat handler.
        assert_eq!(channel.handle(&broadcast), None);
    }

    #[test]
    fn incoming_ping_gets_a_pong() {
        let (tx, mut rx) = unbounded_channel();
        let mut channel = MainChannel::new("sender-0", "receiver-0", tx);
        let ping = reply("receiver-0", "sender-0", NS_HEARTBEAT, json!({"type": "PING"}));
        assert_eq!(channel.handle(&ping), None);

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(payload_json(&sent[0]), json!({"type": "PONG"}));
    }

    #[test]
    fn close_is_ignored() {
        let (tx, mut rx) = unbounded_channel();
        let mut channel = MainChannel::new("sender-0", "receiver-0", tx);
        let close = reply("receiver-0", "sender-0", NS_CONNECTION, json!({"type": "CLOSE"}));
        assert_eq!(channel.handle(&close), None);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn binary_payloads_are_dropped() {
        let (tx, _rx) = unbounded_channel();
        let mut channel = MainChannel::new("sender-0", "receiver-0", tx);
        let mut message = CastMessage::string("receiver-0", "sender-0", NS_RECEIVER, "");
        message.payload_type = PayloadType::Binary;
        assert_eq!(channel.handle(&message), None);
    }

    #[test]
    fn start_stream_carries_addresses_and_device_name() {
        let (tx, mut rx) = unbounded_channel();
        let mut channel = AppChannel::new("app-controller-0", "T", tx);
        channel.start_stream(
            &["ws://192.0.2.1:40123".to_string(), "ws://192.0.2.2:40123".to_string()],
            "CC-Kitchen",
        );

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].namespace, NS_STREAM_APP);
        assert_eq!(sent[0].destination_id, "T");
        assert_eq!(
            payload_json(&sent[0]),
            json!({
                "type": "START_STREAM",
                "requestId": 1,
                "addresses": ["ws://192.0.2.1:40123", "ws://192.0.2.2:40123"],
                "deviceName": "CC-Kitchen"
            })
        );
    }

    #[test]
    fn app_replies_resolve_pending_requests() {
        let (tx, mut rx) = unbounded_channel();
        let mut channel = AppChannel::new("app-controller-0", "T", tx);
        channel.start_stream(&["ws://192.0.2.1:1".to_string()], "CC");
        let request_id = payload_json(&drain(&mut rx)[0])["requestId"].as_i64().unwrap();

        let ok = reply(
            "T",
            "app-controller-0",
            NS_STREAM_APP,
            json!({"type": "OK", "requestId": request_id, "data": {}}),
        );
        assert_eq!(channel.handle(&ok), Some(AppChannelEvent::Ok(json!({}))));
        // Resolved once; the id is gone.
        assert_eq!(channel.handle(&ok), None);
    }

    #[test]
    fn app_error_reply_carries_message() {
        let (tx, mut rx) = unbounded_channel();
        let mut channel = AppChannel::new("app-controller-0", "T", tx);
        channel.start_stream(&["ws://192.0.2.1:1".to_string()], "CC");
        let request_id = payload_json(&drain(&mut rx)[0])["requestId"].as_i64().unwrap();

        let error = reply(
            "T",
            "app-controller-0",
            NS_STREAM_APP,
            json!({"type": "ERROR", "requestId": request_id, "message": "no audio context"}),
        );
        assert_eq!(
            channel.handle(&error),
            Some(AppChannelEvent::Error("no audio context".into()))
        );
    }

    #[test]
    fn unknown_app_reply_type_is_dropped() {
        let (tx, _rx) = unbounded_channel();
        let mut channel = AppChannel::new("app-controller-0", "T", tx);
        let odd = reply(
            "T",
            "app-controller-0",
            NS_STREAM_APP,
            json!({"type": "PROGRESS", "requestId": 1}),
        );
        assert_eq!(channel.handle(&odd), None);
    }
}
