//! Centralized error types for the Pulsecast core library.
//!
//! Each subsystem has its own error enum; anything that escapes a subsystem
//! is wrapped into [`PulsecastError`] with the subsystem name attached, the
//! same way the daemon logs it.

use thiserror::Error;

/// Errors from DNS-SD discovery.
#[derive(Debug, Error)]
pub enum FinderError {
    /// The mDNS service daemon could not be created or died.
    #[error("mDNS daemon failed: {0}")]
    Daemon(String),

    /// Browsing for the cast service type failed.
    #[error("failed to browse for Chromecasts: {0}")]
    Browse(String),
}

/// Errors from the PulseAudio sink manager.
#[derive(Debug, Error)]
pub enum AudioError {
    /// Connection to the PulseAudio server failed or was lost.
    #[error("connection to PulseAudio server failed: {0}")]
    Connection(String),

    /// The PulseAudio mainloop could not be started.
    #[error("PulseAudio mainloop failed: {0}")]
    Mainloop(String),
}

/// Errors from a Chromecast TLS control channel.
///
/// Only fatal conditions are represented here; peer close and cancellation
/// are ordinary events on the connection, not errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// TCP connect failed or timed out.
    #[error("failed to connect to Chromecast: {0}")]
    Connect(String),

    /// TLS client handshake failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// A read or write on the open channel failed.
    #[error("channel I/O failed: {0}")]
    Io(String),

    /// The peer announced a frame larger than the 1 MiB cap.
    #[error("received too big message: {0} bytes")]
    OversizedFrame(u32),

    /// The peer sent a frame that does not decode as a CastMessage.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Errors from the websocket broadcaster.
#[derive(Debug, Error)]
pub enum BroadcasterError {
    /// Binding the listen socket failed.
    #[error("failed to bind websocket listener: {0}")]
    Bind(#[from] std::io::Error),
}

/// Application-wide error type, tagging each subsystem error with its origin.
#[derive(Debug, Error)]
pub enum PulsecastError {
    #[error("ChromecastFinder: {0}")]
    Finder(#[from] FinderError),

    #[error("AudioSinksManager: {0}")]
    Audio(#[from] AudioError),

    #[error("WebsocketBroadcaster: {0}")]
    Broadcaster(#[from] BroadcasterError),

    #[error("network: {0}")]
    Network(String),
}

/// Convenient Result alias for application-wide operations.
pub type PulsecastResult<T> = Result<T, PulsecastError>;
