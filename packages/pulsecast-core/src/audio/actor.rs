//! The PulseAudio thread.
//!
//! One thread owns the threaded mainloop, the context and all sink records.
//! PulseAudio callbacks only post messages back into the same command
//! channel the public handles use, so every state transition happens here,
//! serially. Pulse objects are touched either from this thread under the
//! mainloop lock or from mainloop callbacks (which run with that lock
//! held), never concurrently.
//!
//! Sink lifecycle: NONE -> STARTED (module load in flight) -> LOADED
//! (module index known) -> RECORDING (monitor stream attached) -> DEAD.
//! Transitions are strictly forward; `free()` from any state converges on
//! unloading the module and unregistering the record.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

use libpulse_binding as pulse;
use pulse::callbacks::ListResult;
use pulse::context::subscribe::{Facility, InterestMaskSet};
use pulse::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use pulse::def::BufferAttr;
use pulse::mainloop::threaded::Mainloop;
use pulse::proplist::Proplist;
use pulse::sample::{Format, Spec};
use pulse::stream::{FlagSet as StreamFlagSet, PeekResult, State as StreamState, Stream};
use tokio::sync::mpsc::UnboundedSender;

use super::tracker::{ActivationTracker, VolumeTracker};
use super::{AudioEvent, SampleSlot};
use crate::error::{AudioError, PulsecastError};
use crate::utils::escape_sink_description;

/// Bytes per interleaved stereo S16LE frame.
const FRAME_BYTES: usize = 4;

/// Capture format: what the receiver application expects, verbatim.
const SAMPLE_SPEC: Spec = Spec {
    format: Format::S16le,
    channels: 2,
    rate: 48_000,
};

/// Record buffer fragment size: roughly 20 ms of audio.
const FRAGSIZE: u32 = (SAMPLE_SPEC.rate as u32 * FRAME_BYTES as u32) / 50;

/// Everything the audio thread reacts to: public commands and loopbacks
/// from PulseAudio callbacks.
pub(super) enum Command {
    Create {
        id: String,
        name: String,
        display_name: String,
        slot: Arc<SampleSlot>,
    },
    Free {
        id: String,
    },
    Stop,

    // Loopbacks posted by PulseAudio callbacks.
    ContextStateChanged,
    SubscriptionEvent {
        facility: Option<Facility>,
    },
    ModuleLoaded {
        id: String,
        index: u32,
    },
    ModuleUnloaded {
        id: String,
        success: bool,
    },
    StreamStateChanged {
        id: String,
    },
    ServerInfo {
        default_sink: Option<String>,
    },
    SinkInfo {
        id: String,
        index: u32,
        left: f64,
        right: f64,
        muted: bool,
    },
    SinkInputs {
        counts: HashMap<u32, u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    None,
    Started,
    Loaded,
    Recording,
    Dead,
}

impl SinkState {
    fn name(self) -> &'static str {
        match self {
            SinkState::None => "NONE",
            SinkState::Started => "STARTED",
            SinkState::Loaded => "LOADED",
            SinkState::Recording => "RECORDING",
            SinkState::Dead => "DEAD",
        }
    }
}

struct SinkRecord {
    id: String,
    name: String,
    display_name: String,
    slot: Arc<SampleSlot>,
    state: SinkState,
    module_index: Option<u32>,
    sink_index: Option<u32>,
    stream: Option<Rc<RefCell<Stream>>>,
    /// `free()` arrived while the module load was still in flight.
    free_requested: bool,
    /// Module unload already issued.
    unloading: bool,
    activation: ActivationTracker,
    volume: VolumeTracker,
}

/// Thread entry point.
pub(super) fn run(
    server: Option<String>,
    commands: Receiver<Command>,
    internal_tx: Sender<Command>,
    events: UnboundedSender<AudioEvent>,
    errors: UnboundedSender<PulsecastError>,
) {
    let mut actor = match PulseActor::connect(server, internal_tx, events, errors.clone()) {
        Ok(actor) => actor,
        Err(e) => {
            let _ = errors.send(e.into());
            return;
        }
    };
    actor.main_loop(commands);
    actor.mainloop.borrow_mut().stop();
    log::debug!("[AudioSinksManager] Stopped running");
}

struct PulseActor {
    mainloop: Rc<RefCell<Mainloop>>,
    context: Rc<RefCell<Context>>,
    internal_tx: Sender<Command>,
    events: UnboundedSender<AudioEvent>,
    errors: UnboundedSender<PulsecastError>,
    error_fired: bool,
    ready: bool,
    stopping: bool,
    sinks: HashMap<String, SinkRecord>,
    default_sink: Option<String>,
}

impl PulseActor {
    fn connect(
        server: Option<String>,
        internal_tx: Sender<Command>,
        events: UnboundedSender<AudioEvent>,
        errors: UnboundedSender<PulsecastError>,
    ) -> Result<Self, AudioError> {
        let mut proplist =
            Proplist::new().ok_or_else(|| AudioError::Mainloop("proplist allocation".into()))?;
        proplist
            .set_str(pulse::proplist::properties::APPLICATION_NAME, "pulsecast")
            .map_err(|_| AudioError::Mainloop("proplist setup".into()))?;

        let mainloop = Rc::new(RefCell::new(Mainloop::new().ok_or_else(|| {
            AudioError::Mainloop("failed to create mainloop".into())
        })?));
        let context = Rc::new(RefCell::new(
            Context::new_with_proplist(&*mainloop.borrow(), "pulsecast", &proplist)
                .ok_or_else(|| AudioError::Connection("failed to create context".into()))?,
        ));

        {
            let tx = internal_tx.clone();
            context
                .borrow_mut()
                .set_state_callback(Some(Box::new(move || {
                    let _ = tx.send(Command::ContextStateChanged);
                })));
        }

        context
            .borrow_mut()
            .connect(server.as_deref(), ContextFlagSet::NOAUTOSPAWN, None)
            .map_err(|e| AudioError::Connection(format!("{e:?}")))?;
        mainloop
            .borrow_mut()
            .start()
            .map_err(|e| AudioError::Mainloop(format!("{e:?}")))?;

        Ok(Self {
            mainloop,
            context,
            internal_tx,
            events,
            errors,
            error_fired: false,
            ready: false,
            stopping: false,
            sinks: HashMap::new(),
            default_sink: None,
        })
    }

    fn main_loop(&mut self, commands: Receiver<Command>) {
        while let Ok(command) = commands.recv() {
            let exit = match command {
                Command::ContextStateChanged => self.handle_context_state(),
                Command::Create {
                    id,
                    name,
                    display_name,
                    slot,
                } => {
                    self.handle_create(id, name, display_name, slot);
                    false
                }
                Command::Free { id } => {
                    self.free_sink(&id);
                    false
                }
                Command::Stop => {
                    self.handle_stop();
                    false
                }
                Command::SubscriptionEvent { facility } => {
                    self.handle_subscription(facility);
                    false
                }
                Command::ModuleLoaded { id, index } => {
                    self.handle_module_loaded(&id, index);
                    false
                }
                Command::ModuleUnloaded { id, success } => {
                    self.handle_module_unloaded(&id, success);
                    false
                }
                Command::StreamStateChanged { id } => {
                    self.handle_stream_state(&id);
                    false
                }
                Command::ServerInfo { default_sink } => {
                    self.handle_server_info(default_sink);
                    false
                }
                Command::SinkInfo {
                    id,
                    index,
                    left,
                    right,
                    muted,
                } => {
                    self.handle_sink_info(&id, index, left, right, muted);
                    false
                }
                Command::SinkInputs { counts } => {
                    self.handle_sink_inputs(&counts);
                    false
                }
            };
            if exit {
                break;
            }
        }
    }

    fn lock(&self) {
        self.mainloop.borrow_mut().lock();
    }

    fn unlock(&self) {
        self.mainloop.borrow_mut().unlock();
    }

    /// Reports a fatal manager error. Fires at most once; afterwards the
    /// manager counts as stopped.
    fn report_error(&mut self, error: AudioError) {
        if !self.error_fired {
            self.error_fired = true;
            let _ = self.errors.send(error.into());
        }
    }

    fn pa_error(&self) -> String {
        self.lock();
        let errno = self.context.borrow().errno();
        self.unlock();
        format!("{errno:?}")
    }

    // ─── Context lifecycle ───────────────────────────────────────────────

    /// Returns true when the thread should exit.
    fn handle_context_state(&mut self) -> bool {
        self.lock();
        let state = self.context.borrow().get_state();
        self.unlock();
        log::debug!("[AudioSinksManager] PA state change: {state:?}");

        match state {
            ContextState::Ready => {
                log::info!("[AudioSinksManager] Connected to PulseAudio server");
                self.ready = true;
                if self.stopping {
                    // Stop raced with the connection coming up.
                    self.handle_stop_ready();
                    return false;
                }
                self.install_subscription();
                let pending: Vec<String> = self
                    .sinks
                    .values()
                    .filter(|record| record.state == SinkState::None)
                    .map(|record| record.id.clone())
                    .collect();
                for id in pending {
                    self.start_sink(&id);
                }
                self.query_server_info();
                self.query_sink_inputs();
                false
            }
            ContextState::Failed => {
                let detail = self.pa_error();
                self.report_error(AudioError::Connection(format!(
                    "connection to PulseAudio server failed: {detail}"
                )));
                true
            }
            ContextState::Terminated => {
                if !self.stopping {
                    self.report_error(AudioError::Connection(
                        "PulseAudio context terminated unexpectedly".into(),
                    ));
                }
                true
            }
            _ => false,
        }
    }

    fn install_subscription(&mut self) {
        self.lock();
        {
            let tx = self.internal_tx.clone();
            self.context
                .borrow_mut()
                .set_subscribe_callback(Some(Box::new(move |facility, _operation, _index| {
                    let _ = tx.send(Command::SubscriptionEvent { facility });
                })));
        }
        self.context.borrow_mut().subscribe(
            InterestMaskSet::SINK | InterestMaskSet::SINK_INPUT | InterestMaskSet::SERVER,
            |success| {
                if !success {
                    log::error!("[AudioSinksManager] Subscribing to server events failed");
                }
            },
        );
        self.unlock();
    }

    fn handle_subscription(&mut self, facility: Option<Facility>) {
        match facility {
            Some(Facility::Server) => self.query_server_info(),
            Some(Facility::Sink) => self.query_sink_infos(),
            Some(Facility::SinkInput) => self.query_sink_inputs(),
            _ => {}
        }
    }

    // ─── Introspection queries ───────────────────────────────────────────

    fn query_server_info(&self) {
        let tx = self.internal_tx.clone();
        self.lock();
        let introspect = self.context.borrow().introspect();
        introspect.get_server_info(move |info| {
            let default_sink = info.default_sink_name.as_ref().map(|n| n.to_string());
            let _ = tx.send(Command::ServerInfo { default_sink });
        });
        self.unlock();
    }

    fn query_sink_infos(&self) {
        let ids: Vec<String> = self
            .sinks
            .values()
            .filter(|record| {
                matches!(record.state, SinkState::Loaded | SinkState::Recording)
            })
            .map(|record| record.id.clone())
            .collect();
        for id in ids {
            self.query_sink_info(&id);
        }
    }

    fn query_sink_info(&self, id: &str) {
        let tx = self.internal_tx.clone();
        let id_owned = id.to_string();
        self.lock();
        let introspect = self.context.borrow().introspect();
        introspect.get_sink_info_by_name(id, move |result| {
            if let ListResult::Item(item) = result {
                let norm = pulse::volume::Volume::NORMAL.0 as f64;
                let volumes = item.volume.get();
                let left = volumes.first().map_or(0.0, |v| v.0 as f64 / norm);
                let right = volumes.get(1).map_or(left, |v| v.0 as f64 / norm);
                let _ = tx.send(Command::SinkInfo {
                    id: id_owned.clone(),
                    index: item.index,
                    left,
                    right,
                    muted: item.mute,
                });
            }
        });
        self.unlock();
    }

    fn query_sink_inputs(&self) {
        let tx = self.internal_tx.clone();
        let mut counts: HashMap<u32, u32> = HashMap::new();
        self.lock();
        let introspect = self.context.borrow().introspect();
        introspect.get_sink_input_info_list(move |result| match result {
            ListResult::Item(item) => {
                *counts.entry(item.sink).or_insert(0) += 1;
            }
            ListResult::End | ListResult::Error => {
                let _ = tx.send(Command::SinkInputs {
                    counts: std::mem::take(&mut counts),
                });
            }
        });
        self.unlock();
    }

    // ─── Activation and volume bookkeeping ───────────────────────────────

    fn handle_server_info(&mut self, default_sink: Option<String>) {
        if self.default_sink == default_sink {
            return;
        }
        self.default_sink = default_sink;
        let default = self.default_sink.clone();
        for record in self.sinks.values_mut() {
            let is_default = default.as_deref() == Some(record.id.as_str());
            if let Some(activated) = record.activation.set_default(is_default) {
                record.slot.set_active(activated);
                let _ = self.events.send(AudioEvent::Activation {
                    name: record.name.clone(),
                    activated,
                });
            }
        }
    }

    fn handle_sink_info(&mut self, id: &str, index: u32, left: f64, right: f64, muted: bool) {
        let Some(record) = self.sinks.get_mut(id) else {
            return;
        };
        record.sink_index = Some(index);
        if let Some((left, right, muted)) = record.volume.update(left, right, muted) {
            let _ = self.events.send(AudioEvent::Volume {
                name: record.name.clone(),
                left,
                right,
                muted,
            });
        }
    }

    fn handle_sink_inputs(&mut self, counts: &HashMap<u32, u32>) {
        for record in self.sinks.values_mut() {
            let count = record
                .sink_index
                .and_then(|index| counts.get(&index).copied())
                .unwrap_or(0);
            if let Some(activated) = record.activation.set_input_count(count) {
                record.slot.set_active(activated);
                let _ = self.events.send(AudioEvent::Activation {
                    name: record.name.clone(),
                    activated,
                });
            }
        }
    }

    // ─── Sink lifecycle ──────────────────────────────────────────────────

    fn handle_create(&mut self, id: String, name: String, display_name: String, slot: Arc<SampleSlot>) {
        if self.stopping {
            return;
        }
        log::trace!("[AudioSinksManager] Registering audio sink '{name}'");
        self.sinks.insert(
            id.clone(),
            SinkRecord {
                id: id.clone(),
                name,
                display_name,
                slot,
                state: SinkState::None,
                module_index: None,
                sink_index: None,
                stream: None,
                free_requested: false,
                unloading: false,
                activation: ActivationTracker::default(),
                volume: VolumeTracker::default(),
            },
        );
        if self.ready {
            self.start_sink(&id);
        }
    }

    fn start_sink(&mut self, id: &str) {
        let args = {
            let Some(record) = self.sinks.get_mut(id) else {
                return;
            };
            log::trace!("[AudioSink '{}'] Starting sink", record.name);
            record.state = SinkState::Started;
            format!(
                "sink_name={} sink_properties=device.description=\"{}\"",
                record.id,
                escape_sink_description(&record.display_name)
            )
        };

        let tx = self.internal_tx.clone();
        let id_owned = id.to_string();
        self.lock();
        let mut introspect = self.context.borrow().introspect();
        introspect.load_module("module-null-sink", &args, move |index| {
            let _ = tx.send(Command::ModuleLoaded {
                id: id_owned.clone(),
                index,
            });
        });
        self.unlock();
    }

    fn handle_module_loaded(&mut self, id: &str, index: u32) {
        // The C API reports failure as the invalid index.
        if index == u32::MAX {
            let detail = self.pa_error();
            if let Some(record) = self.sinks.get_mut(id) {
                log::error!("[AudioSink '{}'] Failed to load module: {detail}", record.name);
                record.state = SinkState::Dead;
            }
            self.unregister(id);
            return;
        }

        let freed = {
            let Some(record) = self.sinks.get_mut(id) else {
                return;
            };
            log::debug!(
                "[AudioSink '{}'] Loaded module idx: {index}, name: {}",
                record.name,
                record.id
            );
            record.module_index = Some(index);
            record.free_requested
        };
        if freed {
            // Freed while the load was in flight.
            self.unload_module(id);
            return;
        }
        if let Some(record) = self.sinks.get_mut(id) {
            record.state = SinkState::Loaded;
        }
        self.start_recording(id);
        self.query_server_info();
        self.query_sink_info(id);
        self.query_sink_inputs();
    }

    fn start_recording(&mut self, id: &str) {
        let (name, slot) = match self.sinks.get(id) {
            Some(record) => (record.name.clone(), Arc::clone(&record.slot)),
            None => return,
        };

        self.lock();
        let stream = Stream::new(
            &mut self.context.borrow_mut(),
            &format!("{id}_record_stream"),
            &SAMPLE_SPEC,
            None,
        );
        let Some(stream) = stream else {
            self.unlock();
            log::error!("[AudioSink '{name}'] Failed to create record stream");
            self.unload_module(id);
            return;
        };
        let stream = Rc::new(RefCell::new(stream));

        {
            let tx = self.internal_tx.clone();
            let id_owned = id.to_string();
            stream
                .borrow_mut()
                .set_state_callback(Some(Box::new(move || {
                    let _ = tx.send(Command::StreamStateChanged {
                        id: id_owned.clone(),
                    });
                })));
        }
        {
            // The read callback holds the stream weakly: once the record is
            // torn down the upgrade fails and the callback goes quiet.
            let weak: Weak<RefCell<Stream>> = Rc::downgrade(&stream);
            let sink_name = name.clone();
            stream
                .borrow_mut()
                .set_read_callback(Some(Box::new(move |_length| {
                    if let Some(stream) = weak.upgrade() {
                        read_stream(&mut stream.borrow_mut(), &slot, &sink_name);
                    }
                })));
        }

        let attrs = BufferAttr {
            maxlength: u32::MAX,
            tlength: u32::MAX,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: FRAGSIZE,
        };
        let flags = StreamFlagSet::DONT_MOVE
            | StreamFlagSet::ADJUST_LATENCY
            | StreamFlagSet::AUTO_TIMING_UPDATE
            | StreamFlagSet::INTERPOLATE_TIMING
            | StreamFlagSet::START_UNMUTED;
        let connected = stream
            .borrow_mut()
            .connect_record(Some(&format!("{id}.monitor")), Some(&attrs), flags);
        self.unlock();

        match connected {
            Ok(()) => {
                if let Some(record) = self.sinks.get_mut(id) {
                    record.stream = Some(stream);
                    record.state = SinkState::Recording;
                }
            }
            Err(e) => {
                log::error!("[AudioSink '{name}'] Failed to connect record stream: {e:?}");
                self.unload_module(id);
            }
        }
    }

    fn handle_stream_state(&mut self, id: &str) {
        let (name, stream) = match self.sinks.get(id) {
            Some(record) => match &record.stream {
                Some(stream) => (record.name.clone(), Rc::clone(stream)),
                None => return,
            },
            None => return,
        };
        self.lock();
        let state = stream.borrow().get_state();
        self.unlock();
        log::debug!("[AudioSink '{name}'] Stream new state: {state:?}");

        match state {
            StreamState::Failed => {
                let detail = self.pa_error();
                log::error!("[AudioSink '{name}'] Stream failed: {detail}");
                if let Some(record) = self.sinks.get_mut(id) {
                    record.state = SinkState::Dead;
                }
                drop(stream);
                self.drop_stream(id);
                self.unload_module(id);
            }
            StreamState::Terminated => {
                drop(stream);
                self.drop_stream(id);
                self.unload_module(id);
            }
            _ => {}
        }
    }

    /// Releases a record stream. The unref has to happen under the mainloop
    /// lock; the read callback only holds a weak reference and goes quiet.
    fn drop_stream(&mut self, id: &str) {
        let stream = self.sinks.get_mut(id).and_then(|record| record.stream.take());
        if let Some(stream) = stream {
            self.lock();
            drop(stream);
            self.unlock();
        }
    }

    /// The `free()` path: converges any state on DEAD, releasing the stream
    /// and module along the way.
    fn free_sink(&mut self, id: &str) {
        let (name, state) = match self.sinks.get(id) {
            Some(record) => (record.name.clone(), record.state),
            None => return,
        };
        log::trace!("[AudioSink '{name}'] Freeing, state: {}", state.name());

        match state {
            SinkState::None => {
                if let Some(record) = self.sinks.get_mut(id) {
                    record.state = SinkState::Dead;
                }
                self.unregister(id);
            }
            SinkState::Started => {
                // The module-load callback finishes the teardown.
                if let Some(record) = self.sinks.get_mut(id) {
                    record.free_requested = true;
                    record.state = SinkState::Dead;
                }
            }
            SinkState::Loaded => self.unload_module(id),
            SinkState::Recording => {
                let stream = self
                    .sinks
                    .get_mut(id)
                    .and_then(|record| {
                        record.state = SinkState::Dead;
                        record.stream.clone()
                    });
                if let Some(stream) = stream {
                    self.lock();
                    let disconnected = stream.borrow_mut().disconnect();
                    self.unlock();
                    drop(stream);
                    if let Err(e) = disconnected {
                        log::error!(
                            "[AudioSink '{name}'] Failed to start disconnecting stream: {e:?}"
                        );
                        self.drop_stream(id);
                        self.unload_module(id);
                    }
                    // Success: the TERMINATED state callback unloads.
                } else {
                    self.unload_module(id);
                }
            }
            SinkState::Dead => {}
        }
    }

    fn unload_module(&mut self, id: &str) {
        let (name, index) = match self.sinks.get_mut(id) {
            Some(record) => {
                if record.unloading {
                    return;
                }
                record.unloading = true;
                record.state = SinkState::Dead;
                (record.name.clone(), record.module_index)
            }
            None => return,
        };
        let Some(index) = index else {
            self.unregister(id);
            return;
        };

        log::trace!("[AudioSink '{name}'] Unloading module {index}");
        let tx = self.internal_tx.clone();
        let id_owned = id.to_string();
        self.lock();
        let mut introspect = self.context.borrow().introspect();
        introspect.unload_module(index, move |success| {
            let _ = tx.send(Command::ModuleUnloaded {
                id: id_owned.clone(),
                success,
            });
        });
        self.unlock();
    }

    fn handle_module_unloaded(&mut self, id: &str, success: bool) {
        if let Some(record) = self.sinks.get(id) {
            if success {
                log::debug!("[AudioSink '{}'] Unloaded module", record.name);
            } else {
                log::error!(
                    "[AudioSink '{}'] Failed to unload module: {}",
                    record.name,
                    self.pa_error()
                );
            }
        }
        self.unregister(id);
    }

    fn unregister(&mut self, id: &str) {
        if let Some(record) = self.sinks.remove(id) {
            log::trace!("[AudioSinksManager] Unregistering audio sink '{}'", record.name);
            record.slot.set_active(false);
        }
        if self.stopping && self.sinks.is_empty() {
            self.disconnect_context();
        }
    }

    // ─── Stop protocol ───────────────────────────────────────────────────

    fn handle_stop(&mut self) {
        if self.stopping {
            return;
        }
        log::trace!("[AudioSinksManager] Stopping");
        self.stopping = true;
        if !self.ready {
            // Still connecting; the Ready/Failed state callback completes
            // the teardown.
            return;
        }
        self.handle_stop_ready();
    }

    fn handle_stop_ready(&mut self) {
        if self.sinks.is_empty() {
            self.disconnect_context();
        } else {
            let ids: Vec<String> = self.sinks.keys().cloned().collect();
            for id in ids {
                self.free_sink(&id);
            }
        }
    }

    fn disconnect_context(&mut self) {
        log::trace!("[AudioSinksManager] Disconnecting context");
        self.lock();
        self.context.borrow_mut().disconnect();
        self.unlock();
    }
}

/// Record-stream read path. Runs on the mainloop thread.
///
/// Holes are logged and skipped; a read that is not a whole number of
/// frames is a warning, with the remainder dropped.
fn read_stream(stream: &mut Stream, slot: &SampleSlot, name: &str) {
    loop {
        // The peeked slice borrows the stream, so the fragment has to be
        // fully consumed before the matching discard.
        let consumed = match stream.peek() {
            Ok(PeekResult::Empty) => return,
            Ok(PeekResult::Hole(_)) => {
                log::trace!("[AudioSink '{name}'] There is a hole in the record stream!");
                true
            }
            Ok(PeekResult::Data(data)) => {
                if data.len() % FRAME_BYTES != 0 {
                    log::warn!("[AudioSink '{name}'] Not rounded sample data in buffer");
                }
                let usable = data.len() - data.len() % FRAME_BYTES;
                if usable > 0 {
                    slot.deliver(&data[..usable]);
                }
                true
            }
            Err(e) => {
                log::error!("[AudioSink '{name}'] Failed to read data from stream: {e:?}");
                return;
            }
        };
        if consumed {
            let _ = stream.discard();
        }
    }
}
