//! PulseAudio sink management.
//!
//! For every Chromecast the manager loads a `module-null-sink` and records
//! from its monitor source. All PulseAudio state lives on one dedicated
//! thread driving a threaded mainloop; the public handles only post
//! commands to it, so a handle outliving the manager is harmless - its
//! sends simply go nowhere.
//!
//! PCM leaves the audio thread through a per-sink samples slot: a callback
//! installed by the orchestrator behind one small mutex, invoked directly
//! from the record-stream read callback and gated on the sink's activation
//! flag. Everything else crosses threads as messages.

mod actor;
mod tracker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use parking_lot::Mutex;

use crate::error::PulsecastError;
use crate::utils::generate_sink_id;

/// Receives interleaved S16LE stereo PCM on the audio thread.
pub type SamplesCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Events surfaced to the orchestrator, keyed by the sink's logical name
/// (the Chromecast service name).
#[derive(Debug)]
pub enum AudioEvent {
    /// The sink crossed an activation edge.
    Activation { name: String, activated: bool },
    /// The sink's volume or mute state changed.
    Volume {
        name: String,
        left: f64,
        right: f64,
        muted: bool,
    },
}

/// The samples delivery slot shared between the audio thread and the
/// orchestrator.
pub struct SampleSlot {
    callback: Mutex<Option<SamplesCallback>>,
    active: AtomicBool,
}

impl SampleSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(None),
            active: AtomicBool::new(false),
        })
    }

    /// Delivers one PCM buffer if the sink is activated and a callback is
    /// installed. Runs on the audio thread.
    pub(crate) fn deliver(&self, pcm: &[u8]) {
        if !self.active.load(Ordering::Relaxed) {
            return;
        }
        if let Some(callback) = self.callback.lock().as_mut() {
            callback(pcm);
        }
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }
}

/// Owns the PulseAudio thread and hands out sink handles.
pub struct AudioSinksManager {
    commands: mpsc::Sender<actor::Command>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AudioSinksManager {
    /// Connects to the PulseAudio server (default lookup when `server` is
    /// `None`) on a dedicated thread.
    ///
    /// Fatal failures - connection refused, mainloop death - are reported
    /// once through `errors`, after which the manager is inert.
    pub fn start(
        server: Option<String>,
        events: tokio::sync::mpsc::UnboundedSender<AudioEvent>,
        errors: tokio::sync::mpsc::UnboundedSender<PulsecastError>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel();
        let internal_tx = commands.clone();
        let thread = std::thread::Builder::new()
            .name("pulse-sinks".into())
            .spawn(move || actor::run(server, command_rx, internal_tx, events, errors))
            .ok();
        if thread.is_none() {
            log::error!("[AudioSinksManager] Failed to spawn the PulseAudio thread");
        }
        Self { commands, thread }
    }

    /// Creates a sink for `name`, shown to users as `display_name`.
    ///
    /// The module is loaded as soon as the server connection allows it.
    /// Dropping the returned handle frees the sink.
    pub fn create_sink(&self, name: &str, display_name: &str) -> SinkHandle {
        let id = generate_sink_id();
        let slot = SampleSlot::new();
        let _ = self.commands.send(actor::Command::Create {
            id: id.clone(),
            name: name.to_string(),
            display_name: display_name.to_string(),
            slot: Arc::clone(&slot),
        });
        SinkHandle {
            id,
            name: name.to_string(),
            commands: self.commands.clone(),
            slot,
        }
    }

    /// Frees every sink, unloads the modules and disconnects. Idempotent
    /// and non-blocking; use [`join`](Self::join) to wait for completion.
    pub fn stop(&self) {
        let _ = self.commands.send(actor::Command::Stop);
    }

    /// Waits for the PulseAudio thread to finish tearing down.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Detaches the thread handle so the caller can join it elsewhere (for
    /// example on a blocking-friendly task during async shutdown).
    pub(crate) fn take_thread(&mut self) -> Option<std::thread::JoinHandle<()>> {
        self.thread.take()
    }
}

/// Client handle to one sink. Dropping it schedules the sink's teardown on
/// the audio thread.
pub struct SinkHandle {
    id: String,
    name: String,
    commands: mpsc::Sender<actor::Command>,
    slot: Arc<SampleSlot>,
}

impl SinkHandle {
    /// The logical sink name (the Chromecast service name).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Installs the samples callback. Replaces any previous callback.
    pub fn set_samples_callback(&self, callback: SamplesCallback) {
        *self.slot.callback.lock() = Some(callback);
    }

    /// Removes the samples callback.
    pub fn clear_samples_callback(&self) {
        *self.slot.callback.lock() = None;
    }
}

impl Drop for SinkHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(actor::Command::Free {
            id: self.id.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_gates_delivery_on_activation() {
        let slot = SampleSlot::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        *slot.callback.lock() = Some(Box::new(move |pcm| sink.lock().extend_from_slice(pcm)));

        // Data arriving while deactivated is ignored.
        slot.deliver(&[1, 2, 3, 4]);
        assert!(received.lock().is_empty());

        slot.set_active(true);
        slot.deliver(&[1, 2, 3, 4]);
        assert_eq!(received.lock().as_slice(), &[1, 2, 3, 4]);

        slot.set_active(false);
        slot.deliver(&[5, 6, 7, 8]);
        assert_eq!(received.lock().as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn slot_without_callback_is_silent() {
        let slot = SampleSlot::new();
        slot.set_active(true);
        // Nothing installed; must not panic.
        slot.deliver(&[0, 0, 0, 0]);
    }
}
