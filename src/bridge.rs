//! The IPC bridge: the per-process façade a camera filter or a writer
//! embeds to talk to the broker and the shared preferences store (C6).
//!
//! [`IpcBridge`] is a cheap handle — cloning it shares the same
//! connection pool, pump table and subscriptions, the way [`MessageClient`]
//! shares a port. Construction makes sure the broker is reachable
//! (spawning it if not), then opens the three long-lived subscriptions
//! that drive the `*_changed` callbacks: `DEVICES_UPDATED`,
//! `PICTURE_UPDATED`, and one `CONTROLS_UPDATED` per currently known
//! device, recomputed whenever the catalogue changes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::client::{MessageClient, SendFuture};
use crate::control::DEFAULT_CONTROLS;
use crate::error::{Error, Result};
use crate::format::VideoFormat;
use crate::frame::VideoFrame;
use crate::message::{
    self, ClientType, Message, MsgBroadcast, MsgClients, MsgFrameReady, MsgListen, MsgStatus,
    MsgUpdateControls, MsgUpdatePicture,
};
use crate::preferences::Preferences;

const BROKER_EXECUTABLE: &str = "vcamcore-broker";

/// Which direction a started pump moves frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamType {
    /// This process produces frames for the device (a "virtual webcam").
    Input,
    /// This process consumes frames from the device (a viewer).
    Output,
}

/// The mutating operations [`IpcBridge::is_busy_for`] is asked about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    AddDevice,
    RemoveDevice,
    AddFormat,
    RemoveFormat,
    SetControls,
}

/// Maps a `loglevel` preference value to the `log` crate's filter, per
/// the documented table: negative and `0` silence everything, `7` and
/// above is as verbose as it gets.
fn log_level_to_filter(level: i32) -> log::LevelFilter {
    match level {
        i32::MIN..=0 => log::LevelFilter::Off,
        1..=2 => log::LevelFilter::Error,
        3 => log::LevelFilter::Warn,
        4..=5 => log::LevelFilter::Info,
        6 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// An `Input` pump's single-slot mailbox: one mutex guards both the
/// frame and whether it is still unsent, so the condvar the producer
/// waits on is always tied to the same lock that `write()` takes. The
/// legacy bridge waited on a condvar guarded by a *different* mutex than
/// the one protecting the frame, which could miss a wakeup.
struct Mailbox {
    state: Mutex<MailboxState>,
    changed: Condvar,
}

struct MailboxState {
    frame: VideoFrame,
    available: bool,
}

impl Mailbox {
    fn new() -> Self {
        Mailbox {
            state: Mutex::new(MailboxState {
                frame: VideoFrame::empty(),
                available: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn write(&self, frame: VideoFrame) {
        let mut state = self.state.lock().unwrap();
        state.frame = frame;
        state.available = true;
        self.changed.notify_all();
    }
}

struct Pump {
    stream_type: StreamType,
    mailbox: Option<Arc<Mailbox>>,
    run: Arc<AtomicBool>,
    future: SendFuture,
}

#[derive(Default)]
struct Subscriptions {
    devices: Option<(Arc<AtomicBool>, SendFuture)>,
    picture: Option<(Arc<AtomicBool>, SendFuture)>,
    controls: HashMap<String, (Arc<AtomicBool>, SendFuture)>,
}

struct Inner {
    pid: u64,
    client: MessageClient,
    preferences: Preferences,
    pumps: Mutex<HashMap<String, Pump>>,
    next_query_id: AtomicU64,
    devices_changed: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    picture_changed: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
    controls_changed: Mutex<Option<Box<dyn Fn(&str, &BTreeMap<String, i64>) + Send + Sync>>>,
    frame_ready: Mutex<Option<Box<dyn Fn(&str, &VideoFrame, bool) + Send + Sync>>>,
    subscriptions: Mutex<Subscriptions>,
}

impl Inner {
    fn next_query_id(&self) -> u64 {
        self.next_query_id.fetch_add(1, Ordering::SeqCst)
    }

    fn multicast(&self, message: Message, kind: &str) {
        if let Err(e) = self.client.send_fire_and_forget(&message) {
            warn!("failed to multicast {kind}: {e}");
        }
    }

    /// Opens the long-lived `DEVICES_UPDATED` subscription: repeatedly
    /// long-polls `UPDATE_DEVICES` and, each time the broker answers
    /// (either because the catalogue changed or the 1s wait elapsed),
    /// invokes the callback and recomputes the per-device control
    /// subscriptions against the current catalogue.
    fn subscribe_devices(inner: &Arc<Inner>) {
        let run = Arc::new(AtomicBool::new(true));
        let run_consumer = Arc::clone(&run);
        let callback_inner = Arc::clone(inner);
        let resync_inner = Arc::clone(inner);
        let message = message::update_devices_message(0);
        let future = inner.client.send_fixed(message, move |_in_message| {
            if let Some(callback) = callback_inner.devices_changed.lock().unwrap().as_ref() {
                callback();
            }
            Inner::resync_control_subscriptions(&resync_inner);
            run_consumer.load(Ordering::SeqCst)
        });
        inner.subscriptions.lock().unwrap().devices = Some((run, future));
    }

    fn subscribe_picture(inner: &Arc<Inner>) {
        let run = Arc::new(AtomicBool::new(true));
        let run_consumer = Arc::clone(&run);
        let callback_inner = Arc::clone(inner);
        let message = MsgUpdatePicture::default().to_message(0);
        let future = inner.client.send_fixed(message, move |_in_message| {
            // The wire body only ever echoes what a mutator last sent;
            // the authoritative value always comes from preferences.
            let path = callback_inner.preferences.picture();
            if let Some(callback) = callback_inner.picture_changed.lock().unwrap().as_ref() {
                callback(&path);
            }
            run_consumer.load(Ordering::SeqCst)
        });
        inner.subscriptions.lock().unwrap().picture = Some((run, future));
    }

    fn subscribe_controls(inner: &Arc<Inner>, device_id: &str) {
        let run = Arc::new(AtomicBool::new(true));
        let run_consumer = Arc::clone(&run);
        let callback_inner = Arc::clone(inner);
        let device_id_owned = device_id.to_string();
        let message = MsgUpdateControls {
            device_id: device_id.to_string(),
        }
        .to_message(0);
        let future = inner.client.send_fixed(message, move |_in_message| {
            let controls = callback_inner.preferences.controls(&device_id_owned);
            if let Some(callback) = callback_inner.controls_changed.lock().unwrap().as_ref() {
                callback(&device_id_owned, &controls);
            }
            run_consumer.load(Ordering::SeqCst)
        });
        inner
            .subscriptions
            .lock()
            .unwrap()
            .controls
            .insert(device_id.to_string(), (run, future));
    }

    /// Tears down control subscriptions for devices that no longer
    /// exist and opens fresh ones for devices that appeared since the
    /// last resync.
    fn resync_control_subscriptions(inner: &Arc<Inner>) {
        let current: HashSet<String> = inner.preferences.devices().into_iter().collect();

        let missing: Vec<String> = {
            let mut subs = inner.subscriptions.lock().unwrap();
            subs.controls.retain(|device_id, (run, _future)| {
                let keep = current.contains(device_id);
                if !keep {
                    run.store(false, Ordering::SeqCst);
                }
                keep
            });
            current
                .into_iter()
                .filter(|device_id| !subs.controls.contains_key(device_id))
                .collect()
        };

        for device_id in missing {
            Inner::subscribe_controls(inner, &device_id);
        }
    }
}

/// Polls `is_up(port)` once a second until the broker answers or
/// `preferences.service_timeout()` seconds pass, spawning the broker
/// executable first if nothing is listening yet. Never blocks past the
/// configured timeout.
fn ensure_service_running(preferences: &Preferences, port: u16) -> Result<()> {
    if MessageClient::is_up(port) {
        return Ok(());
    }

    info!("broker not reachable on port {port}; launching it");
    if let Err(e) = std::process::Command::new(BROKER_EXECUTABLE).spawn() {
        warn!("failed to launch {BROKER_EXECUTABLE}: {e}");
    }

    let timeout = preferences.service_timeout();
    for _ in 0..timeout {
        thread::sleep(Duration::from_secs(1));
        if MessageClient::is_up(port) {
            return Ok(());
        }
    }
    Err(Error::ServiceUnreachable(port))
}

fn spawn_input_pump(inner: &Arc<Inner>, device_id: &str, mailbox: Arc<Mailbox>, run: Arc<AtomicBool>) -> SendFuture {
    let device_id = device_id.to_string();
    let pid = inner.pid;
    inner.client.send(
        move |out| {
            if !run.load(Ordering::SeqCst) {
                return false;
            }
            let mut state = mailbox.state.lock().unwrap();
            if !state.available {
                let (guard, _timeout) = mailbox.changed.wait_timeout(state, Duration::from_secs(1)).unwrap();
                state = guard;
            }
            if !run.load(Ordering::SeqCst) {
                return false;
            }
            // No new frame arrived within the second: re-send the last
            // one rather than stall the device, matching the broker's
            // own "keep the latest value" semantics.
            let frame = state.frame.clone();
            state.available = false;
            drop(state);
            *out = MsgBroadcast::new(device_id.clone(), pid, frame).to_message(0);
            true
        },
        |in_message| MsgStatus::decode(&in_message.data).status == 0,
    )
}

fn spawn_output_pump(inner: &Arc<Inner>, device_id: &str, run: Arc<AtomicBool>) -> SendFuture {
    let pid = inner.pid;
    let message = MsgListen::new(device_id, pid).to_message(0);
    let frame_ready_inner = Arc::clone(inner);
    let device_id_owned = device_id.to_string();
    inner.client.send_fixed(message, move |in_message| {
        if !run.load(Ordering::SeqCst) {
            return false;
        }
        let ready = MsgFrameReady::decode(&in_message.data);
        if let Some(callback) = frame_ready_inner.frame_ready.lock().unwrap().as_ref() {
            callback(&device_id_owned, &ready.frame, ready.is_active);
        }
        run.load(Ordering::SeqCst)
    })
}

/// The per-process façade over the broker connection and the shared
/// preferences store.
#[derive(Clone)]
pub struct IpcBridge {
    inner: Arc<Inner>,
}

impl IpcBridge {
    /// Connects (spawning and waiting for the broker if it is not up
    /// yet) and opens the change-notification subscriptions. Never
    /// fails outright: a broker that never comes up just leaves this
    /// bridge unable to reach it, logged once as a warning, rather than
    /// blocking forever or panicking.
    pub fn new(preferences: Preferences) -> Self {
        match Self::connect(preferences) {
            Ok(bridge) => bridge,
            Err((preferences, e)) => {
                warn!("{e}");
                Self::from_preferences(preferences)
            }
        }
    }

    /// Like [`new`](Self::new), but surfaces the broker-unreachable
    /// error instead of degrading to a warning, for callers that want
    /// to treat it strictly.
    pub fn connect(preferences: Preferences) -> std::result::Result<Self, (Preferences, Error)> {
        let port = preferences.service_port();
        match ensure_service_running(&preferences, port) {
            Ok(()) => Ok(Self::from_preferences(preferences)),
            Err(e) => Err((preferences, e)),
        }
    }

    fn from_preferences(preferences: Preferences) -> Self {
        let port = preferences.service_port();
        let inner = Arc::new(Inner {
            pid: std::process::id() as u64,
            client: MessageClient::new(port),
            preferences,
            pumps: Mutex::new(HashMap::new()),
            next_query_id: AtomicU64::new(1),
            devices_changed: Mutex::new(None),
            picture_changed: Mutex::new(None),
            controls_changed: Mutex::new(None),
            frame_ready: Mutex::new(None),
            subscriptions: Mutex::new(Subscriptions::default()),
        });

        Inner::subscribe_devices(&inner);
        Inner::subscribe_picture(&inner);
        Inner::resync_control_subscriptions(&inner);

        IpcBridge { inner }
    }

    // ---- still picture -------------------------------------------------

    pub fn picture(&self) -> String {
        self.inner.preferences.picture()
    }

    /// No-op (returns `false`) if `path` is already the current
    /// picture; otherwise stores it and multicasts `UPDATE_PICTURE`.
    pub fn set_picture(&self, path: &str) -> bool {
        if self.inner.preferences.picture() == path {
            return false;
        }
        if !self.inner.preferences.set_picture(path) {
            return false;
        }
        let message = MsgUpdatePicture {
            picture: path.to_string(),
        }
        .to_message(self.inner.next_query_id());
        self.inner.multicast(message, "UPDATE_PICTURE");
        true
    }

    // ---- logging ---------------------------------------------------------

    pub fn log_level(&self) -> i32 {
        self.inner.preferences.log_level()
    }

    /// Stores the new level and reconfigures the process-wide logger
    /// immediately, so the change is visible without a restart.
    pub fn set_log_level(&self, level: i32) -> bool {
        if !self.inner.preferences.set_log_level(level) {
            return false;
        }
        log::set_max_level(log_level_to_filter(level));
        true
    }

    // ---- device catalogue ------------------------------------------------

    pub fn devices(&self) -> Vec<String> {
        self.inner.preferences.devices()
    }

    pub fn description(&self, device_id: &str) -> Option<String> {
        self.inner.preferences.description(device_id)
    }

    pub fn set_description(&self, device_id: &str, description: &str) -> bool {
        self.inner.preferences.set_description(device_id, description)
    }

    pub fn formats(&self, device_id: &str) -> Vec<VideoFormat> {
        self.inner.preferences.formats(device_id)
    }

    pub fn set_formats(&self, device_id: &str, formats: &[VideoFormat]) -> bool {
        if !self.inner.preferences.set_formats(device_id, formats) {
            return false;
        }
        self.update_devices();
        true
    }

    pub fn controls(&self, device_id: &str) -> BTreeMap<String, i64> {
        self.inner.preferences.controls(device_id)
    }

    /// Multicasts `UPDATE_CONTROLS` only if the map actually differs
    /// from what is stored.
    pub fn set_controls(&self, device_id: &str, controls: &BTreeMap<String, i64>) -> bool {
        if self.inner.preferences.controls(device_id) == *controls {
            return false;
        }
        if !self.inner.preferences.set_controls(device_id, controls) {
            return false;
        }
        let message = MsgUpdateControls {
            device_id: device_id.to_string(),
        }
        .to_message(self.inner.next_query_id());
        self.inner.multicast(message, "UPDATE_CONTROLS");
        true
    }

    /// Reserves a device id with the default control catalogue and
    /// multicasts `UPDATE_DEVICES`. Returns the empty string on failure
    /// (id already taken, or the allocator space is exhausted).
    pub fn add_device(&self, description: &str, device_id: &str) -> String {
        let id = self.inner.preferences.add_device(description, device_id);
        if id.is_empty() {
            return id;
        }
        let defaults: BTreeMap<String, i64> = DEFAULT_CONTROLS
            .iter()
            .map(|control| (control.id.to_string(), control.default_value as i64))
            .collect();
        self.inner.preferences.set_controls(&id, &defaults);
        self.update_devices();
        id
    }

    pub fn remove_device(&self, device_id: &str) -> bool {
        if !self.inner.preferences.remove_device(device_id) {
            return false;
        }
        self.update_devices();
        true
    }

    /// Inserts `format` at `index` (appending if `index` is out of
    /// range or `None`), then multicasts `UPDATE_DEVICES`.
    pub fn add_format(&self, device_id: &str, format: VideoFormat, index: Option<usize>) -> bool {
        if self.inner.preferences.camera_index(device_id).is_none() {
            return false;
        }
        let mut formats = self.inner.preferences.formats(device_id);
        match index {
            Some(i) if i <= formats.len() => formats.insert(i, format),
            _ => formats.push(format),
        }
        if !self.inner.preferences.set_formats(device_id, &formats) {
            return false;
        }
        self.update_devices();
        true
    }

    pub fn remove_format(&self, device_id: &str, index: usize) -> bool {
        let mut formats = self.inner.preferences.formats(device_id);
        if index >= formats.len() {
            return false;
        }
        formats.remove(index);
        if !self.inner.preferences.set_formats(device_id, &formats) {
            return false;
        }
        self.update_devices();
        true
    }

    /// Multicasts `UPDATE_DEVICES` directly. `add_device`, `remove_device`,
    /// `add_format` and `remove_format` each already call this themselves;
    /// exposed for callers that changed the catalogue through some other
    /// path (e.g. a bulk `Preferences::add_camera`) and need to announce it.
    pub fn update_devices(&self) {
        let message = message::update_devices_message(self.inner.next_query_id());
        self.inner.multicast(message, "UPDATE_DEVICES");
    }

    // ---- peers -------------------------------------------------------

    /// The pids of every other virtual-camera client currently connected
    /// to the broker (this process's own pid is excluded).
    pub fn clients_pids(&self) -> Vec<u64> {
        let request = MsgClients::new(ClientType::VCams, Vec::new()).to_message(self.inner.next_query_id());
        match self.inner.client.send_one(&request) {
            Ok(response) => {
                let decoded = MsgClients::decode(&response.data);
                decoded.pids.into_iter().filter(|&pid| pid != self.inner.pid).collect()
            }
            Err(e) => {
                warn!("CLIENTS request failed: {e}");
                Vec::new()
            }
        }
    }

    /// `true` if `op` would conflict with another connected client —
    /// currently: any client connected at all, since every `Operation`
    /// variant mutates shared device state.
    pub fn is_busy_for(&self, op: Operation) -> bool {
        let _ = op;
        !self.clients_pids().is_empty()
    }

    // ---- pumps -------------------------------------------------------

    /// Starts a pump for `device_id` in the given direction. Fails
    /// (`false`) if a pump is already running for that id.
    pub fn device_start(&self, stream_type: StreamType, device_id: &str) -> bool {
        let mut pumps = self.inner.pumps.lock().unwrap();
        if pumps.contains_key(device_id) {
            return false;
        }

        let run = Arc::new(AtomicBool::new(true));
        let pump = match stream_type {
            StreamType::Input => {
                let mailbox = Arc::new(Mailbox::new());
                let future = spawn_input_pump(&self.inner, device_id, Arc::clone(&mailbox), Arc::clone(&run));
                Pump {
                    stream_type,
                    mailbox: Some(mailbox),
                    run,
                    future,
                }
            }
            StreamType::Output => {
                let future = spawn_output_pump(&self.inner, device_id, Arc::clone(&run));
                Pump {
                    stream_type,
                    mailbox: None,
                    run,
                    future,
                }
            }
        };

        pumps.insert(device_id.to_string(), pump);
        true
    }

    /// Stops the pump for `device_id`, waiting for its worker thread to
    /// exit. A no-op (`false`) for an id with no running pump.
    pub fn device_stop(&self, device_id: &str) -> bool {
        let pump = self.inner.pumps.lock().unwrap().remove(device_id);
        let Some(pump) = pump else {
            return false;
        };

        pump.run.store(false, Ordering::SeqCst);
        if let Some(mailbox) = &pump.mailbox {
            let guard = mailbox.state.lock().unwrap();
            drop(guard);
            mailbox.changed.notify_all();
        }
        pump.future.join();
        true
    }

    /// Writes `frame` into the mailbox of `device_id`'s `Input` pump.
    /// Fails immediately for an unknown id or an `Output` pump — it
    /// never creates a phantom entry the way the legacy bridge's
    /// `write()` did on a miss.
    pub fn write(&self, device_id: &str, frame: VideoFrame) -> bool {
        let pumps = self.inner.pumps.lock().unwrap();
        match pumps.get(device_id) {
            Some(pump) if pump.stream_type == StreamType::Input => match &pump.mailbox {
                Some(mailbox) => {
                    mailbox.write(frame);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    // ---- application callbacks ----------------------------------------

    pub fn on_devices_changed(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.inner.devices_changed.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn on_picture_changed(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.inner.picture_changed.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn on_controls_changed(&self, callback: impl Fn(&str, &BTreeMap<String, i64>) + Send + Sync + 'static) {
        *self.inner.controls_changed.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn on_frame_ready(&self, callback: impl Fn(&str, &VideoFrame, bool) + Send + Sync + 'static) {
        *self.inner.frame_ready.lock().unwrap() = Some(Box::new(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_table_matches_spec_boundaries() {
        assert_eq!(log_level_to_filter(-1), log::LevelFilter::Off);
        assert_eq!(log_level_to_filter(0), log::LevelFilter::Off);
        assert_eq!(log_level_to_filter(1), log::LevelFilter::Error);
        assert_eq!(log_level_to_filter(2), log::LevelFilter::Error);
        assert_eq!(log_level_to_filter(3), log::LevelFilter::Warn);
        assert_eq!(log_level_to_filter(4), log::LevelFilter::Info);
        assert_eq!(log_level_to_filter(5), log::LevelFilter::Info);
        assert_eq!(log_level_to_filter(6), log::LevelFilter::Debug);
        assert_eq!(log_level_to_filter(7), log::LevelFilter::Trace);
        assert_eq!(log_level_to_filter(99), log::LevelFilter::Trace);
    }

    #[test]
    fn set_picture_is_a_no_op_when_unchanged() {
        let bridge = IpcBridge::from_preferences(Preferences::memory());
        assert!(bridge.set_picture("/tmp/a.bmp"));
        assert!(!bridge.set_picture("/tmp/a.bmp"));
        assert_eq!(bridge.picture(), "/tmp/a.bmp");
    }

    #[test]
    fn add_device_seeds_default_controls() {
        let bridge = IpcBridge::from_preferences(Preferences::memory());
        let id = bridge.add_device("cam", "");
        assert!(!id.is_empty());
        let controls = bridge.controls(&id);
        assert_eq!(controls.get("hflip"), Some(&0));
    }

    #[test]
    fn write_on_unknown_device_never_creates_a_phantom_pump() {
        let bridge = IpcBridge::from_preferences(Preferences::memory());
        assert!(!bridge.write("AkVCamVideoDevice0", VideoFrame::empty()));
        assert!(bridge.inner.pumps.lock().unwrap().is_empty());
    }

    #[test]
    fn device_stop_on_unknown_id_is_a_no_op() {
        let bridge = IpcBridge::from_preferences(Preferences::memory());
        assert!(!bridge.device_stop("AkVCamVideoDevice0"));
    }

    #[test]
    fn starting_an_already_started_device_fails() {
        let bridge = IpcBridge::from_preferences(Preferences::memory());
        assert!(bridge.device_start(StreamType::Input, "AkVCamVideoDevice0"));
        assert!(!bridge.device_start(StreamType::Output, "AkVCamVideoDevice0"));
        bridge.device_stop("AkVCamVideoDevice0");
    }
}
