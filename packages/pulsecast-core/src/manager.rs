//! Chromecast orchestration.
//!
//! [`ChromecastsManager`] wires the subsystems together: discovery updates
//! create and destroy per-device actors, audio events drive each device's
//! activation, and websocket subscriptions connect the receiver application
//! back to the right sink.
//!
//! Each device actor walks one state machine: discovered -> sink created ->
//! idle <-> active. Activation opens the TLS channel, launches the receiver
//! application and tells it which websocket endpoints to pull PCM from;
//! deactivation (or a channel failure) tears the channel down again. A
//! failing device only ever takes down its own subgraph.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioEvent, AudioSinksManager, SinkHandle};
use crate::broadcaster::{SampleSink, Subscription, WebsocketBroadcaster};
use crate::cast::channel::{AppChannel, AppChannelEvent, MainChannel, MainChannelEvent};
use crate::cast::connection::{CastConnection, ConnectionEvent};
use crate::cast::wire::CastMessage;
use crate::context;
use crate::error::{PulsecastError, PulsecastResult};
use crate::finder::{ChromecastFinder, ChromecastInfo, FinderUpdate, UpdateKind};
use crate::state::Config;

/// Reconnect backoff while a device stays activated, capped at the last
/// entry. Reset by a successful stream start.
const RECONNECT_DELAYS: [u64; 4] = [1, 2, 5, 10];

fn reconnect_delay(attempt: usize) -> Duration {
    let index = attempt.min(RECONNECT_DELAYS.len() - 1);
    Duration::from_secs(RECONNECT_DELAYS[index])
}

/// Called when a subsystem reports a fatal error and a handler is set.
pub type ErrorHandler = Box<dyn Fn(&PulsecastError) + Send>;

/// Clonable handle for stopping a running manager.
#[derive(Clone)]
pub struct ManagerHandle {
    cancel: CancellationToken,
}

impl ManagerHandle {
    /// Requests a clean stop of all subsystems. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Top-level coordinator owning every subsystem.
pub struct ChromecastsManager {
    config: Config,
    finder: ChromecastFinder,
    sinks: AudioSinksManager,
    broadcaster: WebsocketBroadcaster,
    finder_rx: mpsc::UnboundedReceiver<FinderUpdate>,
    audio_rx: mpsc::UnboundedReceiver<AudioEvent>,
    subscription_rx: mpsc::UnboundedReceiver<Subscription>,
    error_rx: mpsc::UnboundedReceiver<PulsecastError>,
    error_handler: Option<ErrorHandler>,
    devices: HashMap<String, DeviceHandle>,
    cancel: CancellationToken,
}

impl ChromecastsManager {
    /// Starts discovery, the audio sink manager and the broadcaster.
    pub async fn start(config: Config) -> PulsecastResult<Self> {
        let (finder_tx, finder_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let (subscription_tx, subscription_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        let broadcaster = WebsocketBroadcaster::start(subscription_tx).await?;
        let sinks =
            AudioSinksManager::start(config.pulse_server.clone(), audio_tx, error_tx.clone());
        let finder = ChromecastFinder::start(finder_tx, error_tx);

        Ok(Self {
            config,
            finder,
            sinks,
            broadcaster,
            finder_rx,
            audio_rx,
            subscription_rx,
            error_rx,
            error_handler: None,
            devices: HashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Installs the error handler. Without one, the first subsystem error
    /// stops everything and propagates out of [`run`](Self::run).
    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = Some(handler);
    }

    /// Handle for stopping the manager from elsewhere.
    #[must_use]
    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Routes events between subsystems until stopped or a subsystem error
    /// propagates.
    pub async fn run(mut self) -> PulsecastResult<()> {
        enum Tick {
            Stopped,
            Finder(Option<FinderUpdate>),
            Audio(Option<AudioEvent>),
            Subscription(Option<Subscription>),
            Error(Option<PulsecastError>),
        }

        loop {
            let tick = tokio::select! {
                _ = self.cancel.cancelled() => Tick::Stopped,
                update = self.finder_rx.recv() => Tick::Finder(update),
                event = self.audio_rx.recv() => Tick::Audio(event),
                subscription = self.subscription_rx.recv() => Tick::Subscription(subscription),
                error = self.error_rx.recv() => Tick::Error(error),
            };
            match tick {
                Tick::Stopped => {
                    self.shutdown().await;
                    return Ok(());
                }
                Tick::Finder(Some((kind, info))) => self.handle_finder_update(kind, info),
                Tick::Audio(Some(event)) => self.handle_audio_event(event),
                Tick::Subscription(Some(subscription)) => self.handle_subscription(subscription),
                Tick::Error(Some(error)) => match &self.error_handler {
                    Some(handler) => handler(&error),
                    None => {
                        self.shutdown().await;
                        return Err(error);
                    }
                },
                // A closed channel means its subsystem is gone; anything
                // fatal about that arrives on the error channel.
                Tick::Finder(None) | Tick::Audio(None) | Tick::Subscription(None)
                | Tick::Error(None) => {}
            }
        }
    }

    fn handle_finder_update(&mut self, kind: UpdateKind, info: ChromecastInfo) {
        match kind {
            UpdateKind::New => {
                log::info!("New Chromecast '{}'", info.name);
                let sink = self
                    .sinks
                    .create_sink(&info.name, info.display_name());
                let device = DeviceHandle::spawn(
                    info,
                    sink,
                    DeviceContext {
                        app_id: self.config.app_id.clone(),
                        broadcaster_port: self.broadcaster.port(),
                        heartbeat: self.config.heartbeat(),
                        connect_timeout: self.config.connect_deadline(),
                    },
                );
                self.devices.insert(device.name.clone(), device);
            }
            UpdateKind::Update => {
                if let Some(device) = self.devices.get(&info.name) {
                    device.send(DeviceCommand::UpdateInfo(info));
                }
            }
            UpdateKind::Remove => {
                log::info!("Chromecast '{}' removed", info.name);
                // Dropping the handle cancels the actor, which tears down
                // the channel and releases the sink.
                self.devices.remove(&info.name);
            }
        }
    }

    fn handle_audio_event(&mut self, event: AudioEvent) {
        match event {
            AudioEvent::Activation { name, activated } => {
                if let Some(device) = self.devices.get(&name) {
                    device.send(DeviceCommand::Activation(activated));
                }
            }
            AudioEvent::Volume {
                name,
                left,
                right,
                muted,
            } => {
                if let Some(device) = self.devices.get(&name) {
                    device.send(DeviceCommand::Volume { left, right, muted });
                }
            }
        }
    }

    fn handle_subscription(&mut self, subscription: Subscription) {
        match self.devices.get(&subscription.name) {
            Some(device) => device.send(DeviceCommand::Subscribe(subscription.sink)),
            None => log::warn!(
                "(ChromecastsManager) Chromecast {} subscribed but is not known in manager",
                subscription.name
            ),
        }
    }

    async fn shutdown(&mut self) {
        log::info!("Stopping all subsystems");
        self.finder.stop();
        self.broadcaster.stop();
        self.devices.clear();
        self.sinks.stop();
        // Wait for the audio thread so the null-sink modules are unloaded
        // before the process exits.
        if let Some(thread) = self.sinks.take_thread() {
            let _ = tokio::task::spawn_blocking(move || {
                let _ = thread.join();
            })
            .await;
        }
    }
}

// ─── Per-device actor ────────────────────────────────────────────────────

struct DeviceContext {
    app_id: String,
    broadcaster_port: u16,
    heartbeat: Duration,
    connect_timeout: Duration,
}

enum DeviceCommand {
    UpdateInfo(ChromecastInfo),
    Activation(bool),
    Volume { left: f64, right: f64, muted: bool },
    Subscribe(SampleSink),
}

struct DeviceHandle {
    name: String,
    commands: mpsc::UnboundedSender<DeviceCommand>,
    cancel: CancellationToken,
}

impl DeviceHandle {
    fn spawn(info: ChromecastInfo, sink: SinkHandle, ctx: DeviceContext) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let name = info.name.clone();
        tokio::spawn(run_device(info, sink, ctx, command_rx, cancel.clone()));
        Self {
            name,
            commands,
            cancel,
        }
    }

    fn send(&self, command: DeviceCommand) {
        let _ = self.commands.send(command);
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The control channel and logical channels of one active device.
struct Link {
    connection: CastConnection,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    main: MainChannel,
    app: Option<AppChannel>,
    connected: bool,
    session_id: Option<String>,
    streaming: bool,
}

/// What a dispatched message asks the device loop to do with its link.
enum LinkAction {
    Nothing,
    /// START_STREAM acknowledged; streaming is up.
    StreamStarted,
    /// The link is no longer usable; drop it and retry while activated.
    Drop,
}

async fn run_device(
    mut info: ChromecastInfo,
    sink: SinkHandle,
    ctx: DeviceContext,
    mut commands: mpsc::UnboundedReceiver<DeviceCommand>,
    cancel: CancellationToken,
) {
    let name = info.name.clone();
    let mut activated = false;
    let mut link: Option<Link> = None;
    let mut reconnect_at: Option<Instant> = None;
    let mut attempt = 0usize;
    let mut heartbeat = tokio::time::interval(ctx.heartbeat);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    enum Tick {
        Cancelled,
        Command(Option<DeviceCommand>),
        Connection(Option<ConnectionEvent>),
        Heartbeat,
        Reconnect,
    }

    loop {
        let tick = tokio::select! {
            _ = cancel.cancelled() => Tick::Cancelled,
            command = commands.recv() => Tick::Command(command),
            event = recv_link_event(&mut link) => Tick::Connection(event),
            _ = heartbeat.tick() => Tick::Heartbeat,
            _ = wait_until(&reconnect_at) => Tick::Reconnect,
        };

        match tick {
            Tick::Cancelled | Tick::Command(None) => break,
            Tick::Command(Some(command)) => match command {
                DeviceCommand::UpdateInfo(new_info) => info = new_info,
                DeviceCommand::Activation(true) => {
                    if !activated {
                        log::info!("(Chromecast '{}') Activated!", name);
                        activated = true;
                        if link.is_none() {
                            link = open_link(&info, &ctx);
                        }
                    }
                }
                DeviceCommand::Activation(false) => {
                    if activated {
                        log::info!("(Chromecast '{}') Deactivated!", name);
                    }
                    if let Some(session_id) = link.as_ref().and_then(|l| l.session_id.as_deref()) {
                        log::debug!("(Chromecast '{}') Abandoning session {}", name, session_id);
                    }
                    activated = false;
                    link = None;
                    reconnect_at = None;
                    attempt = 0;
                }
                DeviceCommand::Volume { left, right, muted } => {
                    #[allow(clippy::float_cmp)]
                    if left != right {
                        log::warn!(
                            "(Chromecast '{}') left volume {} != right volume {}",
                            name,
                            left,
                            right
                        );
                    }
                    log::info!(
                        "(Chromecast '{}') [{}] volume {}",
                        name,
                        if muted { "M" } else { " " },
                        left
                    );
                }
                DeviceCommand::Subscribe(sample_sink) => {
                    log::debug!("(Chromecast '{}') Websocket client attached", name);
                    sink.set_samples_callback(Box::new(move |pcm| {
                        sample_sink.send_samples(pcm);
                    }));
                }
            },
            Tick::Connection(None) => {
                // The connection task went away without a terminal event;
                // treat it like a failure.
                if link.take().is_some() && activated {
                    schedule_reconnect(&name, &mut reconnect_at, &mut attempt);
                }
            }
            Tick::Connection(Some(event)) => match event {
                ConnectionEvent::Connected(true) => {
                    log::info!("(Chromecast '{}') Connected, launching receiver app", name);
                    if let Some(l) = &mut link {
                        l.connected = true;
                        l.main.start();
                        l.main.launch(&ctx.app_id);
                    }
                }
                ConnectionEvent::Connected(false) => {
                    if link.as_ref().is_some_and(|l| l.streaming) {
                        log::info!("(Chromecast '{}') Stream interrupted by peer close", name);
                    } else {
                        log::info!("(Chromecast '{}') Peer closed the connection", name);
                    }
                    link = None;
                    if activated {
                        schedule_reconnect(&name, &mut reconnect_at, &mut attempt);
                    }
                }
                ConnectionEvent::Error(e) => {
                    log::error!("(Chromecast '{}') connection error: {}", name, e);
                    link = None;
                    if activated {
                        schedule_reconnect(&name, &mut reconnect_at, &mut attempt);
                    }
                }
                ConnectionEvent::Message(message) => {
                    let action = match &mut link {
                        Some(l) => dispatch_message(l, &message, &info, &ctx),
                        None => LinkAction::Nothing,
                    };
                    match action {
                        LinkAction::Nothing => {}
                        LinkAction::StreamStarted => attempt = 0,
                        LinkAction::Drop => {
                            link = None;
                            if activated {
                                schedule_reconnect(&name, &mut reconnect_at, &mut attempt);
                            }
                        }
                    }
                }
            },
            Tick::Heartbeat => {
                if let Some(l) = &mut link {
                    if l.connected {
                        l.main.ping();
                        if let Some(app) = &mut l.app {
                            app.ping();
                        }
                    }
                }
            }
            Tick::Reconnect => {
                reconnect_at = None;
                if activated && link.is_none() {
                    log::info!("(Chromecast '{}') Reconnecting", name);
                    link = open_link(&info, &ctx);
                }
            }
        }
    }

    sink.clear_samples_callback();
    log::debug!("(Chromecast '{}') Actor stopped", name);
}

/// Opens the control connection to the instance's first endpoint.
fn open_link(info: &ChromecastInfo, ctx: &DeviceContext) -> Option<Link> {
    let Some(endpoint) = info.endpoints.iter().next().copied() else {
        log::warn!("(Chromecast '{}') No endpoints to connect to", info.name);
        return None;
    };
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let connection = CastConnection::open(endpoint, ctx.connect_timeout, events_tx);
    let main = MainChannel::new("sender-0", "receiver-0", connection.sender());
    Some(Link {
        connection,
        events: events_rx,
        main,
        app: None,
        connected: false,
        session_id: None,
        streaming: false,
    })
}

/// Routes one inbound frame to the logical channel it addresses.
fn dispatch_message(
    link: &mut Link,
    message: &CastMessage,
    info: &ChromecastInfo,
    ctx: &DeviceContext,
) -> LinkAction {
    let destination = message.destination_id.as_str();
    let mut action = LinkAction::Nothing;

    if destination == link.main.local_id() || destination == "*" {
        if let Some(event) = link.main.handle(message) {
            action = handle_main_event(link, event, info, ctx);
        }
    }
    let to_app = link
        .app
        .as_ref()
        .is_some_and(|app| destination == app.local_id() || destination == "*");
    if to_app {
        let event = link.app.as_mut().and_then(|app| app.handle(message));
        if let Some(event) = event {
            action = handle_app_event(link, event, info);
        }
    }
    action
}

fn handle_main_event(
    link: &mut Link,
    event: MainChannelEvent,
    info: &ChromecastInfo,
    ctx: &DeviceContext,
) -> LinkAction {
    match event {
        MainChannelEvent::AppLaunched {
            transport_id,
            session_id,
        } => {
            log::info!(
                "(Chromecast '{}') Receiver app running, session {}",
                info.name,
                session_id
            );
            link.session_id = Some(session_id);
            let mut app = AppChannel::new("app-controller-0", transport_id, link.connection.sender());
            app.start();
            match context::websocket_endpoints(ctx.broadcaster_port) {
                Ok(addresses) => app.start_stream(&addresses, &info.name),
                Err(e) => {
                    log::error!(
                        "(Chromecast '{}') Couldn't list local addresses: {}",
                        info.name,
                        e
                    );
                }
            }
            link.app = Some(app);
            LinkAction::Nothing
        }
        MainChannelEvent::LaunchFailed { reason } => {
            log::error!(
                "(Chromecast '{}') Failed to launch receiver app: {}",
                info.name,
                reason.as_deref().unwrap_or("unknown reason")
            );
            LinkAction::Drop
        }
        MainChannelEvent::Status(_) => LinkAction::Nothing,
    }
}

fn handle_app_event(link: &mut Link, event: AppChannelEvent, info: &ChromecastInfo) -> LinkAction {
    match event {
        AppChannelEvent::Ok(_) => {
            log::info!("(Chromecast '{}') Streaming!", info.name);
            link.streaming = true;
            LinkAction::StreamStarted
        }
        AppChannelEvent::Error(message) => {
            log::error!(
                "(Chromecast '{}') Receiver app refused the stream: {}",
                info.name,
                message
            );
            LinkAction::Drop
        }
    }
}

fn schedule_reconnect(name: &str, reconnect_at: &mut Option<Instant>, attempt: &mut usize) {
    let delay = reconnect_delay(*attempt);
    *attempt += 1;
    log::info!(
        "(Chromecast '{}') Will reconnect in {}s",
        name,
        delay.as_secs()
    );
    *reconnect_at = Some(Instant::now() + delay);
}

async fn recv_link_event(link: &mut Option<Link>) -> Option<ConnectionEvent> {
    match link {
        Some(l) => l.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(at: &Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(*at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_backoff_is_bounded() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(2), Duration::from_secs(5));
        assert_eq!(reconnect_delay(3), Duration::from_secs(10));
        // Stays capped however long the device keeps failing.
        assert_eq!(reconnect_delay(50), Duration::from_secs(10));
    }
}
