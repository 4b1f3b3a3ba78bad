//! WebSocket PCM broadcaster.
//!
//! The receiver application on each Chromecast connects here and sends a
//! `{"type":"SUBSCRIBE","name":...}` text frame; the orchestrator then
//! binds the connection's sample sink into the matching device, and from
//! that point every captured PCM buffer goes out as one binary frame.
//!
//! PCM is realtime: a connection that stops draining gets frames dropped,
//! never buffered without bound.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

use crate::error::BroadcasterError;

/// Binary frames queued per connection before PCM gets dropped.
const SEND_QUEUE_DEPTH: usize = 32;

/// A subscription request from a websocket client.
#[derive(Debug)]
pub struct Subscription {
    /// Chromecast service name the client wants PCM for.
    pub name: String,
    /// Where to send that sink's PCM.
    pub sink: SampleSink,
}

/// Opaque per-connection handle PCM is pushed through.
///
/// Cheap to clone; all clones feed the same connection. Once the connection
/// is gone, sends silently do nothing.
#[derive(Debug, Clone)]
pub struct SampleSink {
    tx: mpsc::Sender<Bytes>,
}

impl SampleSink {
    /// Queues one PCM buffer as a binary frame. Frames are dropped when the
    /// connection cannot keep up.
    pub fn send_samples(&self, pcm: &[u8]) {
        match self.tx.try_send(Bytes::copy_from_slice(pcm)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::trace!("[WebsocketBroadcaster] Dropping PCM frame, client is behind");
            }
            // Connection gone; the subscription will be replaced or removed.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Incoming control messages (text frames only).
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum ClientMessage {
    Subscribe { name: String },
}

/// WebSocket server on an ephemeral port.
pub struct WebsocketBroadcaster {
    port: u16,
    cancel: CancellationToken,
}

impl WebsocketBroadcaster {
    /// Binds to `0.0.0.0` on an ephemeral port and starts accepting.
    /// Subscriptions flow into `subscriptions`.
    pub async fn start(
        subscriptions: mpsc::UnboundedSender<Subscription>,
    ) -> Result<Self, BroadcasterError> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        log::info!("[WebsocketBroadcaster] Listening on port {}", port);

        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(listener, subscriptions, cancel.clone()));
        Ok(Self { port, cancel })
    }

    /// The bound port, for building `ws://` endpoints.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stops accepting and closes every connection with a normal close
    /// frame. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WebsocketBroadcaster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    subscriptions: mpsc::UnboundedSender<Subscription>,
    cancel: CancellationToken,
) {
    let connections: Arc<DashMap<u64, ()>> = Arc::new(DashMap::new());
    let mut next_id = 0u64;
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    log::warn!("[WebsocketBroadcaster] Failed to set TCP_NODELAY: {}", e);
                }
                next_id += 1;
                let id = next_id;
                connections.insert(id, ());
                let connections = Arc::clone(&connections);
                let subscriptions = subscriptions.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    handle_connection(stream, peer, &subscriptions, &cancel).await;
                    connections.remove(&id);
                    log::trace!("[WebsocketBroadcaster] Closed connection from {}", peer);
                });
            }
            Err(e) => {
                log::error!("[WebsocketBroadcaster] Accept failed: {}", e);
                return;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    subscriptions: &mpsc::UnboundedSender<Subscription>,
    cancel: &CancellationToken,
) {
    let websocket = match tokio_tungstenite::accept_async(stream).await {
        Ok(websocket) => websocket,
        Err(e) => {
            log::warn!("[WebsocketBroadcaster] Handshake with {} failed: {}", peer, e);
            return;
        }
    };
    log::trace!("[WebsocketBroadcaster] New connection from {}", peer);

    let (mut outbound, mut inbound) = websocket.split();
    let (pcm_tx, mut pcm_rx) = mpsc::channel::<Bytes>(SEND_QUEUE_DEPTH);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Server shutdown: normal close on every connection.
                let _ = outbound.send(Message::Close(None)).await;
                return;
            }
            pcm = pcm_rx.recv() => {
                let Some(pcm) = pcm else { return };
                if let Err(e) = outbound.send(Message::Binary(pcm.to_vec())).await {
                    if !is_disconnect(&e) {
                        log::error!("[WebsocketBroadcaster] Couldn't send data: {}", e);
                    }
                    return;
                }
            }
            received = inbound.next() => {
                match received {
                    Some(Ok(Message::Text(payload))) => {
                        handle_text(&payload, &pcm_tx, subscriptions);
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {
                        log::warn!("[WebsocketBroadcaster] Got non text message, ignoring");
                    }
                    Some(Err(e)) => {
                        if !is_disconnect(&e) {
                            log::warn!("[WebsocketBroadcaster] Receive failed: {}", e);
                        }
                        return;
                    }
                }
            }
        }
    }
}

fn handle_text(
    payload: &str,
    pcm_tx: &mpsc::Sender<Bytes>,
    subscriptions: &mpsc::UnboundedSender<Subscription>,
) {
    log::trace!("[WebsocketBroadcaster] Got message: {}", payload);
    match serde_json::from_str::<ClientMessage>(payload) {
        Ok(ClientMessage::Subscribe { name }) => {
            log::debug!("[WebsocketBroadcaster] Chromecast {} subscribed", name);
            let _ = subscriptions.send(Subscription {
                name,
                sink: SampleSink { tx: pcm_tx.clone() },
            });
        }
        Err(_) => {
            log::warn!("[WebsocketBroadcaster] Failed to parse message from connection");
        }
    }
}

fn is_disconnect(error: &tokio_tungstenite::tungstenite::Error) -> bool {
    use tokio_tungstenite::tungstenite::Error;
    matches!(
        error,
        Error::ConnectionClosed | Error::AlreadyClosed | Error::Protocol(_) | Error::Io(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn subscribe_and_receive_pcm() {
        let (subscription_tx, mut subscription_rx) = unbounded_channel();
        let broadcaster = WebsocketBroadcaster::start(subscription_tx).await.unwrap();
        assert_ne!(broadcaster.port(), 0);

        let url = format!("ws://127.0.0.1:{}", broadcaster.port());
        let (mut client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        client
            .send(Message::Text(
                r#"{"type":"SUBSCRIBE","name":"CC-Kitchen"}"#.to_string(),
            ))
            .await
            .unwrap();

        let subscription = subscription_rx.recv().await.unwrap();
        assert_eq!(subscription.name, "CC-Kitchen");

        subscription.sink.send_samples(&[1, 2, 3, 4]);
        match client.next().await.unwrap().unwrap() {
            Message::Binary(pcm) => assert_eq!(pcm, vec![1, 2, 3, 4]),
            other => panic!("unexpected frame: {other:?}"),
        }

        broadcaster.stop();
    }

    #[tokio::test]
    async fn malformed_subscribe_is_tolerated() {
        let (subscription_tx, mut subscription_rx) = unbounded_channel();
        let broadcaster = WebsocketBroadcaster::start(subscription_tx).await.unwrap();

        let url = format!("ws://127.0.0.1:{}", broadcaster.port());
        let (mut client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        client
            .send(Message::Text("{\"type\":\"DANCE\"}".to_string()))
            .await
            .unwrap();
        client
            .send(Message::Text(
                r#"{"type":"SUBSCRIBE","name":"CC"}"#.to_string(),
            ))
            .await
            .unwrap();

        // The bad frame is skipped; the good one still lands.
        let subscription = subscription_rx.recv().await.unwrap();
        assert_eq!(subscription.name, "CC");
        broadcaster.stop();
    }

    #[tokio::test]
    async fn shutdown_closes_clients_normally() {
        let (subscription_tx, _subscription_rx) = unbounded_channel();
        let broadcaster = WebsocketBroadcaster::start(subscription_tx).await.unwrap();

        let url = format!("ws://127.0.0.1:{}", broadcaster.port());
        let (mut client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        broadcaster.stop();

        // The client observes a close frame (or clean end of stream).
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    }

    #[test]
    fn send_samples_after_disconnect_is_silent() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = SampleSink { tx };
        sink.send_samples(&[0u8; 4]);
    }
}
