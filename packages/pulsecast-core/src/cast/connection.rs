//! One TCP+TLS control connection to a Chromecast.
//!
//! The connection owns two tasks: a writer draining the outbound queue (so
//! at most one write is ever in flight) and a reader running the continuous
//! frame loop. Observable events:
//!
//! - `Connected(true)` exactly once, after the TLS handshake.
//! - `Message` per inbound frame.
//! - `Connected(false)` exactly once iff the peer closed an open connection
//!   (TCP EOF and TLS truncation collapse to this).
//! - `Error` for everything else fatal. `Error` and `Connected(false)` are
//!   mutually exclusive, and neither fires for a local `stop()`.
//!
//! Chromecasts present self-signed certificates, so the TLS client accepts
//! invalid certificates and hostnames.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_native_tls::TlsStream;
use tokio_util::sync::CancellationToken;

use super::wire::{read_frame, write_frame, CastMessage, FrameError, FrameRead};
use crate::error::ChannelError;

/// Observable connection events, delivered to the owning device task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Handshake completed (`true`) or the peer closed an open connection
    /// (`false`).
    Connected(bool),
    /// One inbound frame.
    Message(CastMessage),
    /// Fatal failure; the connection is gone.
    Error(ChannelError),
}

/// Handle to a live (or connecting) control connection.
///
/// Dropping the handle cancels all connection I/O; teardown runs on the
/// connection's own tasks and takes the shortest valid close path for the
/// current state (plain TCP close before the handshake, TLS shutdown after).
pub struct CastConnection {
    tx: mpsc::UnboundedSender<CastMessage>,
    cancel: CancellationToken,
}

impl CastConnection {
    /// Starts connecting to `peer` and returns immediately.
    pub fn open(
        peer: SocketAddr,
        connect_timeout: Duration,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_connection(
            peer,
            connect_timeout,
            rx,
            events,
            cancel.clone(),
        ));
        Self { tx, cancel }
    }

    /// Queues one message for sending. Messages queued after `stop()` are
    /// dropped silently.
    pub fn send(&self, message: CastMessage) {
        let _ = self.tx.send(message);
    }

    /// A clonable handle into the write queue, for logical channels.
    #[must_use]
    pub fn sender(&self) -> mpsc::UnboundedSender<CastMessage> {
        self.tx.clone()
    }

    /// Cancels the connection. Idempotent, non-blocking, silent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for CastConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Routes terminal events so that exactly one of `Error` /
/// `Connected(false)` is ever delivered.
struct EventReporter {
    events: mpsc::UnboundedSender<ConnectionEvent>,
    terminal: AtomicBool,
}

impl EventReporter {
    fn new(events: mpsc::UnboundedSender<ConnectionEvent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            terminal: AtomicBool::new(false),
        })
    }

    fn message(&self, message: CastMessage) {
        let _ = self.events.send(ConnectionEvent::Message(message));
    }

    fn error(&self, error: ChannelError) {
        if !self.terminal.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ConnectionEvent::Error(error));
        }
    }

    fn disconnected(&self) {
        if !self.terminal.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ConnectionEvent::Connected(false));
        }
    }
}

async fn run_connection(
    peer: SocketAddr,
    connect_timeout: Duration,
    send_rx: mpsc::UnboundedReceiver<CastMessage>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    cancel: CancellationToken,
) {
    log::trace!("[Connection] Connecting to {}", peer);
    let established = tokio::select! {
        // stop() before the handshake finished: close the socket, say nothing.
        _ = cancel.cancelled() => return,
        result = establish(peer, connect_timeout) => result,
    };
    let stream = match established {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(ConnectionEvent::Error(e));
            return;
        }
    };

    let _ = events.send(ConnectionEvent::Connected(true));
    let reporter = EventReporter::new(events);

    let (reader, writer) = tokio::io::split(stream);
    let io_cancel = cancel.child_token();
    let writer_task = tokio::spawn(write_loop(
        writer,
        send_rx,
        Arc::clone(&reporter),
        io_cancel.clone(),
    ));

    read_loop(reader, &reporter, &io_cancel).await;

    // Whatever ended the read loop ends the connection; wake the writer so
    // it performs the TLS shutdown and releases the socket.
    io_cancel.cancel();
    let _ = writer_task.await;
    log::trace!("[Connection] Closed {}", peer);
}

/// TCP connect plus TLS client handshake under one deadline.
async fn establish(
    peer: SocketAddr,
    connect_timeout: Duration,
) -> Result<TlsStream<TcpStream>, ChannelError> {
    let connect = async {
        let tcp = TcpStream::connect(peer)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| ChannelError::Handshake(e.to_string()))?;
        tokio_native_tls::TlsConnector::from(connector)
            .connect(&peer.ip().to_string(), tcp)
            .await
            .map_err(|e| ChannelError::Handshake(e.to_string()))
    };
    timeout(connect_timeout, connect)
        .await
        .map_err(|_| ChannelError::Connect(format!("timed out after {connect_timeout:?}")))?
}

/// Drains the write queue one frame at a time.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut send_rx: mpsc::UnboundedReceiver<CastMessage>,
    reporter: Arc<EventReporter>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            queued = send_rx.recv() => match queued {
                Some(message) => {
                    if let Err(e) = write_frame(&mut writer, &message).await {
                        if !cancel.is_cancelled() {
                            reporter.error(ChannelError::Io(format!(
                                "writing data to socket failed: {e}"
                            )));
                        }
                        cancel.cancel();
                        break;
                    }
                }
                // All senders dropped; the owner is gone.
                None => break,
            },
        }
    }
    // Best-effort TLS close_notify; the peer may already be gone.
    let _ = writer.shutdown().await;
}

/// The continuous header/body read loop.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    reporter: &EventReporter,
    cancel: &CancellationToken,
) {
    loop {
        let result = tokio::select! {
            // A read aborted by stop() is not an error.
            _ = cancel.cancelled() => return,
            result = read_frame(&mut reader) => result,
        };
        match result {
            Ok(FrameRead::Message(message)) => reporter.message(message),
            Ok(FrameRead::PeerClosed) => {
                reporter.disconnected();
                return;
            }
            Err(FrameError::Oversized(len)) => {
                reporter.error(ChannelError::OversizedFrame(len));
                return;
            }
            Err(FrameError::Decode(e)) => {
                reporter.error(ChannelError::Protocol(e.to_string()));
                return;
            }
            Err(FrameError::Io(e)) => {
                reporter.error(ChannelError::Io(format!("read operation failed: {e}")));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc::unbounded_channel;

    fn ping() -> CastMessage {
        CastMessage::string(
            "sender-0",
            "receiver-0",
            "urn:x-cast:com.google.cast.tp.heartbeat",
            "{\"type\":\"PING\"}",
        )
    }

    #[tokio::test]
    async fn read_loop_delivers_messages_then_peer_close_once() {
        let (mut peer, local) = tokio::io::duplex(4096);
        let (events_tx, mut events_rx) = unbounded_channel();
        let reporter = EventReporter::new(events_tx);
        let cancel = CancellationToken::new();

        write_frame(&mut peer, &ping()).await.unwrap();
        drop(peer);
        read_loop(local, &reporter, &cancel).await;

        match events_rx.recv().await {
            Some(ConnectionEvent::Message(message)) => assert_eq!(message, ping()),
            other => panic!("unexpected event: {other:?}"),
        }
        match events_rx.recv().await {
            Some(ConnectionEvent::Connected(false)) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_loop_reports_oversized_frames_as_errors() {
        let (mut peer, local) = tokio::io::duplex(64);
        let (events_tx, mut events_rx) = unbounded_channel();
        let reporter = EventReporter::new(events_tx);
        let cancel = CancellationToken::new();

        peer.write_all(&0x0020_0000u32.to_be_bytes()).await.unwrap();
        read_loop(local, &reporter, &cancel).await;

        match events_rx.recv().await {
            Some(ConnectionEvent::Error(ChannelError::OversizedFrame(len))) => {
                assert_eq!(len, 0x0020_0000);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // A peer close after the fatal error must not surface.
        drop(peer);
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancelled_read_is_silent() {
        let (_peer, local) = tokio::io::duplex(64);
        let (events_tx, mut events_rx) = unbounded_channel();
        let reporter = EventReporter::new(events_tx);
        let cancel = CancellationToken::new();
        cancel.cancel();

        read_loop(local, &reporter, &cancel).await;
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn writer_serialises_queued_frames_in_order() {
        let (local, mut peer) = tokio::io::duplex(4096);
        let (events_tx, _events_rx) = unbounded_channel();
        let reporter = EventReporter::new(events_tx);
        let cancel = CancellationToken::new();
        let (tx, rx) = unbounded_channel();

        let mut first = ping();
        first.payload_utf8 = "{\"type\":\"PING\",\"n\":1}".into();
        let mut second = ping();
        second.payload_utf8 = "{\"type\":\"PING\",\"n\":2}".into();
        tx.send(first.clone()).unwrap();
        tx.send(second.clone()).unwrap();
        drop(tx);

        write_loop(local, rx, reporter, cancel).await;

        match read_frame(&mut peer).await.unwrap() {
            FrameRead::Message(message) => assert_eq!(message, first),
            other => panic!("unexpected read: {other:?}"),
        }
        match read_frame(&mut peer).await.unwrap() {
            FrameRead::Message(message) => assert_eq!(message, second),
            other => panic!("unexpected read: {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminal_events_are_mutually_exclusive() {
        let (events_tx, mut events_rx) = unbounded_channel();
        let reporter = EventReporter::new(events_tx);
        reporter.disconnected();
        reporter.error(ChannelError::Io("late write failure".into()));
        reporter.disconnected();

        match events_rx.recv().await {
            Some(ConnectionEvent::Connected(false)) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events_rx.try_recv().is_err());
    }
}
