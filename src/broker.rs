//! The broker service: owns the per-device slot table and the three
//! broker handlers (C5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::debug;

use crate::error::Result;
use crate::frame::VideoFrame;
use crate::message::{
    self, id, ClientType, Message, MsgBroadcast, MsgClients, MsgListen, MsgStatus,
    MsgUpdateControls, MsgUpdatePicture,
};
use crate::peer::Peer;
use crate::preferences::Preferences;
use crate::server::MessageServer;

const NOTIFY_WAIT: Duration = Duration::from_secs(1);

/// State behind the three "announce a change, wake anyone waiting on it"
/// channels (`UPDATE_DEVICES`, `UPDATE_PICTURE`, `UPDATE_CONTROLS`).
///
/// A request whose sender has already seen the current version (a
/// subscriber's long-poll, repeating the same request on a persistent
/// connection) takes the *wait* path: it blocks on the condvar, without
/// touching the version itself, for up to a second waiting for someone
/// else to bump it. A request from a sender with no last-seen entry at
/// all (a mutator's one-shot multicast, or a subscriber's very first
/// iteration) takes the *announce* path instead: it bumps the version
/// and returns immediately, never waiting. Bumping the version is this
/// cheap a cost exactly once per distinct connection, not once per
/// long-poll iteration, which is what actually lets the wait path block:
/// a subscriber's own repeated poll no longer counts as a change.
#[derive(Default)]
struct Notify {
    gate: Mutex<()>,
    changed: Condvar,
    devices_version: AtomicU64,
    devices_seen: Mutex<HashMap<u64, u64>>,
    picture_version: AtomicU64,
    picture_seen: Mutex<HashMap<u64, u64>>,
    controls_version: Mutex<HashMap<String, u64>>,
    controls_seen: Mutex<HashMap<(u64, String), u64>>,
}

impl Notify {
    /// If `client_id` already saw the current `devices_version`, waits up
    /// to a second for someone else to bump it; otherwise bumps it and
    /// returns immediately. Returns the version the caller should
    /// remember for its next call.
    fn touch_devices(&self, client_id: u64) -> u64 {
        let previous = self.devices_version.load(Ordering::SeqCst);
        let last = self.devices_seen.lock().unwrap().get(&client_id).copied();

        if last == Some(previous) {
            let guard = self.gate.lock().unwrap();
            let _ = self.changed.wait_timeout(guard, NOTIFY_WAIT);
        } else {
            self.devices_version.fetch_add(1, Ordering::SeqCst);
            self.changed.notify_all();
        }

        let current = self.devices_version.load(Ordering::SeqCst);
        self.devices_seen.lock().unwrap().insert(client_id, current);
        current
    }

    fn touch_picture(&self, client_id: u64) -> u64 {
        let previous = self.picture_version.load(Ordering::SeqCst);
        let last = self.picture_seen.lock().unwrap().get(&client_id).copied();

        if last == Some(previous) {
            let guard = self.gate.lock().unwrap();
            let _ = self.changed.wait_timeout(guard, NOTIFY_WAIT);
        } else {
            self.picture_version.fetch_add(1, Ordering::SeqCst);
            self.changed.notify_all();
        }

        let current = self.picture_version.load(Ordering::SeqCst);
        self.picture_seen.lock().unwrap().insert(client_id, current);
        current
    }

    fn touch_controls(&self, client_id: u64, device_id: &str) -> u64 {
        let key = (client_id, device_id.to_string());
        let current_version = |notify: &Notify| *notify.controls_version.lock().unwrap().get(device_id).unwrap_or(&0);

        let previous = current_version(self);
        let last = self.controls_seen.lock().unwrap().get(&key).copied();

        if last == Some(previous) {
            let guard = self.gate.lock().unwrap();
            let _ = self.changed.wait_timeout(guard, NOTIFY_WAIT);
        } else {
            let mut versions = self.controls_version.lock().unwrap();
            *versions.entry(device_id.to_string()).or_insert(0) += 1;
            drop(versions);
            self.changed.notify_all();
        }

        let current = current_version(self);
        self.controls_seen.lock().unwrap().insert(key, current);
        current
    }
}

/// One device's producer/consumer state, as held by the broker.
///
/// Invariants (enforced by [`Service`]'s handlers, never by this type
/// alone): at most one broadcaster; a slot with no broadcaster and no
/// listeners is removed from the table rather than left empty.
#[derive(Default)]
struct BroadcastSlot {
    broadcaster: Peer,
    listeners: Vec<Peer>,
    frame: VideoFrame,
}

struct Shared {
    broadcasts: Mutex<HashMap<String, BroadcastSlot>>,
    frame_available: Condvar,
    notify: Notify,
}

/// The broker daemon: accepts connections on the configured port and
/// serves `CLIENTS`, `BROADCAST`, `LISTEN`, and the three change-notify
/// requests against a shared slot table.
pub struct Service {
    server: Arc<MessageServer>,
    shared: Arc<Shared>,
}

impl Service {
    pub fn new(preferences: &Preferences) -> Self {
        Self::with_port(preferences.service_port())
    }

    pub fn with_port(port: u16) -> Self {
        let server = Arc::new(MessageServer::new(port));
        let shared = Arc::new(Shared {
            broadcasts: Mutex::new(HashMap::new()),
            frame_available: Condvar::new(),
            notify: Notify::default(),
        });

        {
            let shared = Arc::clone(&shared);
            server.subscribe(
                id::CLIENTS,
                Arc::new(move |client_id, msg| handle_clients(&shared, client_id, msg)),
            );
        }
        {
            let shared = Arc::clone(&shared);
            server.subscribe(
                id::BROADCAST,
                Arc::new(move |client_id, msg| handle_broadcast(&shared, client_id, msg)),
            );
        }
        {
            let shared = Arc::clone(&shared);
            server.subscribe(
                id::LISTEN,
                Arc::new(move |client_id, msg| handle_listen(&shared, client_id, msg)),
            );
        }
        {
            let shared = Arc::clone(&shared);
            server.subscribe(
                id::UPDATE_DEVICES,
                Arc::new(move |client_id, msg| handle_update_devices(&shared, client_id, msg)),
            );
        }
        {
            let shared = Arc::clone(&shared);
            server.subscribe(
                id::UPDATE_PICTURE,
                Arc::new(move |client_id, msg| handle_update_picture(&shared, client_id, msg)),
            );
        }
        {
            let shared = Arc::clone(&shared);
            server.subscribe(
                id::UPDATE_CONTROLS,
                Arc::new(move |client_id, msg| handle_update_controls(&shared, client_id, msg)),
            );
        }
        {
            let shared = Arc::clone(&shared);
            server.connect_connection_closed(move |client_id| remove_client_by_id(&shared, client_id));
        }

        Service { server, shared }
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn run(&self) -> Result<()> {
        self.server.run()
    }

    pub fn stop(&self) {
        self.server.stop();
    }
}

fn handle_clients(shared: &Shared, _client_id: u64, in_message: &Message) -> (Message, bool) {
    let request = MsgClients::decode(&in_message.data);
    let client_type = request.client_type.unwrap_or(ClientType::Any);
    let mut pids = Vec::new();

    let broadcasts = shared.broadcasts.lock().unwrap();
    for slot in broadcasts.values() {
        // The broadcaster's own pid is only reported under the `Any`
        // filter; `VCams` reports listener pids only. This mirrors the
        // legacy broker's `clients()` handler exactly — it is a
        // deliberate asymmetry (a `VCams` query is "who is consuming
        // this device", not "who is producing it"), not an oversight.
        if client_type == ClientType::Any && !slot.broadcaster.is_none() && !pids.contains(&slot.broadcaster.pid) {
            pids.push(slot.broadcaster.pid);
        }
        for listener in &slot.listeners {
            if !pids.contains(&listener.pid) {
                pids.push(listener.pid);
            }
        }
    }
    drop(broadcasts);

    let response = MsgClients::new(client_type, pids).to_message(in_message.query_id);
    (response, true)
}

fn handle_broadcast(shared: &Shared, client_id: u64, in_message: &Message) -> (Message, bool) {
    let request = MsgBroadcast::decode(&in_message.data);
    let mut status = -1;

    {
        let mut broadcasts = shared.broadcasts.lock().unwrap();
        let is_new = !broadcasts.contains_key(&request.device_id);
        debug!("device {} is broadcasting?: {}", request.device_id, !is_new);

        if is_new {
            broadcasts.insert(
                request.device_id.clone(),
                BroadcastSlot {
                    broadcaster: Peer::new(client_id, request.pid),
                    listeners: Vec::new(),
                    frame: VideoFrame::empty(),
                },
            );
        }

        let slot = broadcasts.get_mut(&request.device_id).expect("just inserted if absent");

        if slot.broadcaster.is_none() {
            slot.broadcaster = Peer::new(client_id, request.pid);
        }

        if slot.broadcaster.pid == request.pid && slot.broadcaster.client_id == client_id {
            slot.frame = request.frame;
            status = 0;
            shared.frame_available.notify_all();
        }
    }

    let response = MsgStatus { status }.to_message(in_message.query_id);
    // A conflicting broadcaster (status != 0) also closes the connection:
    // it must reconnect rather than retry on the same socket.
    (response, status == 0)
}

fn handle_listen(shared: &Shared, client_id: u64, in_message: &Message) -> (Message, bool) {
    let request = MsgListen::decode(&in_message.data);

    let mut broadcasts = shared.broadcasts.lock().unwrap();
    let slot = broadcasts
        .entry(request.device_id.clone())
        .or_insert_with(BroadcastSlot::default);
    slot.listeners.push(Peer::new(client_id, request.pid));

    if slot.frame.is_empty() {
        let (guard, _timeout) = shared
            .frame_available
            .wait_timeout(broadcasts, Duration::from_secs(1))
            .unwrap();
        broadcasts = guard;
    }

    let slot = broadcasts.get_mut(&request.device_id).expect("inserted above");
    let frame = std::mem::replace(&mut slot.frame, VideoFrame::empty());
    let is_active = !slot.broadcaster.is_none();
    drop(broadcasts);

    let response =
        message::MsgFrameReady::new(request.device_id, frame, is_active).to_message(in_message.query_id);
    (response, true)
}

/// `UPDATE_DEVICES` (0x301): both the mutator's "something changed"
/// announcement and the subscriber's long-poll request share this one
/// handler — see [`Notify`].
fn handle_update_devices(shared: &Shared, client_id: u64, in_message: &Message) -> (Message, bool) {
    shared.notify.touch_devices(client_id);
    (message::devices_updated_message(in_message.query_id), true)
}

fn handle_update_picture(shared: &Shared, client_id: u64, in_message: &Message) -> (Message, bool) {
    let request = MsgUpdatePicture::decode(&in_message.data);
    shared.notify.touch_picture(client_id);
    let response = message::MsgPictureUpdated {
        picture: request.picture,
        updated: true,
    }
    .to_message(in_message.query_id);
    (response, true)
}

fn handle_update_controls(shared: &Shared, client_id: u64, in_message: &Message) -> (Message, bool) {
    let request = MsgUpdateControls::decode(&in_message.data);
    shared.notify.touch_controls(client_id, &request.device_id);
    let response = message::MsgControlsUpdated {
        device_id: request.device_id,
        updated: true,
    }
    .to_message(in_message.query_id);
    (response, true)
}

fn remove_client_by_id(shared: &Shared, client_id: u64) {
    debug!("removing client: {client_id}");
    let mut broadcasts = shared.broadcasts.lock().unwrap();
    let mut to_remove = Vec::new();

    // Scan every slot, not just the first match: one client id can hold
    // roles (broadcaster on one device, listener on another) in more
    // than one slot at once.
    for (device_id, slot) in broadcasts.iter_mut() {
        if slot.broadcaster.client_id == client_id && !slot.broadcaster.is_none() {
            slot.broadcaster = Peer::NONE;
        }
        slot.listeners.retain(|peer| peer.client_id != client_id);

        if slot.broadcaster.is_none() && slot.listeners.is_empty() {
            to_remove.push(device_id.clone());
        }
    }

    for device_id in to_remove {
        broadcasts.remove(&device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FourCc, VideoFormat};
    use crate::fraction::Fraction;

    #[test]
    fn empty_broker_clients_round_trip() {
        let shared = Arc::new(Shared {
            broadcasts: Mutex::new(HashMap::new()),
            frame_available: Condvar::new(),
            notify: Notify::default(),
        });
        let request = MsgClients::new(ClientType::Any, vec![]).to_message(1);
        let (response, cont) = handle_clients(&shared, 1, &request);
        assert!(cont);
        let decoded = MsgClients::decode(&response.data);
        assert!(decoded.pids.is_empty());
        assert_eq!(response.query_id, 1);
    }

    #[test]
    fn conflicting_broadcaster_is_rejected_and_closes_connection() {
        let shared = Arc::new(Shared {
            broadcasts: Mutex::new(HashMap::new()),
            frame_available: Condvar::new(),
            notify: Notify::default(),
        });
        let fmt = VideoFormat::new(FourCc::new("RGB3"), 4, 4, vec![Fraction::new(30, 1)]);
        let frame = VideoFrame::new(fmt.clone(), vec![0xff; 48]);

        let first = MsgBroadcast::new("AkVCamVideoDevice0", 1001, frame.clone()).to_message(7);
        let (resp, cont) = handle_broadcast(&shared, 1, &first);
        assert!(cont);
        assert_eq!(MsgStatus::decode(&resp.data).status, 0);

        let second = MsgBroadcast::new("AkVCamVideoDevice0", 2002, frame).to_message(8);
        let (resp2, cont2) = handle_broadcast(&shared, 2, &second);
        assert!(!cont2);
        assert_eq!(MsgStatus::decode(&resp2.data).status, -1);
    }

    #[test]
    fn listen_clears_frame_after_delivery() {
        let shared = Arc::new(Shared {
            broadcasts: Mutex::new(HashMap::new()),
            frame_available: Condvar::new(),
            notify: Notify::default(),
        });
        let fmt = VideoFormat::new(FourCc::new("RGB3"), 4, 4, vec![Fraction::new(30, 1)]);
        let frame = VideoFrame::new(fmt, vec![0xaa; 48]);

        let broadcast = MsgBroadcast::new("AkVCamVideoDevice0", 1001, frame).to_message(7);
        handle_broadcast(&shared, 1, &broadcast);

        let listen = MsgListen::new("AkVCamVideoDevice0", 1002).to_message(8);
        let (resp, _) = handle_listen(&shared, 2, &listen);
        let ready = message::MsgFrameReady::decode(&resp.data);
        assert!(!ready.frame.is_empty());
        assert!(ready.is_active);

        let slot_empty = shared.broadcasts.lock().unwrap().get("AkVCamVideoDevice0").unwrap().frame.is_empty();
        assert!(slot_empty);
    }

    #[test]
    fn disconnect_removes_client_from_every_slot() {
        let shared = Arc::new(Shared {
            broadcasts: Mutex::new(HashMap::new()),
            frame_available: Condvar::new(),
            notify: Notify::default(),
        });
        let fmt = VideoFormat::new(FourCc::new("RGB3"), 1, 1, vec![Fraction::new(1, 1)]);

        // client 1 broadcasts device A, listens on device B.
        let ba = MsgBroadcast::new("A", 10, VideoFrame::new(fmt.clone(), vec![0; 1])).to_message(1);
        handle_broadcast(&shared, 1, &ba);
        let lb = MsgListen::new("B", 10).to_message(2);
        handle_listen(&shared, 1, &lb);

        remove_client_by_id(&shared, 1);

        let broadcasts = shared.broadcasts.lock().unwrap();
        assert!(!broadcasts.contains_key("A"));
        assert!(!broadcasts.contains_key("B"));
    }

    #[test]
    fn orphaned_slot_reports_inactive() {
        let shared = Arc::new(Shared {
            broadcasts: Mutex::new(HashMap::new()),
            frame_available: Condvar::new(),
            notify: Notify::default(),
        });
        // A listener arrives on a device nobody is broadcasting.
        let listen = MsgListen::new("AkVCamVideoDevice0", 99).to_message(1);
        let (resp, _) = handle_listen(&shared, 5, &listen);
        let ready = message::MsgFrameReady::decode(&resp.data);
        assert!(!ready.is_active);
    }

    #[test]
    fn a_fresh_connections_first_update_devices_never_blocks() {
        let shared = Arc::new(Shared {
            broadcasts: Mutex::new(HashMap::new()),
            frame_available: Condvar::new(),
            notify: Notify::default(),
        });
        let request = message::update_devices_message(1);
        let start = std::time::Instant::now();
        let (resp, cont) = handle_update_devices(&shared, 1, &request);
        assert!(cont);
        assert_eq!(resp.id, id::DEVICES_UPDATED);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn update_picture_echoes_the_path_and_acks() {
        let shared = Arc::new(Shared {
            broadcasts: Mutex::new(HashMap::new()),
            frame_available: Condvar::new(),
            notify: Notify::default(),
        });
        let request = message::MsgUpdatePicture {
            picture: "/tmp/still.bmp".to_string(),
        }
        .to_message(1);
        let (resp, cont) = handle_update_picture(&shared, 1, &request);
        assert!(cont);
        let decoded = message::MsgPictureUpdated::decode(&resp.data);
        assert_eq!(decoded.picture, "/tmp/still.bmp");
        assert!(decoded.updated);
    }

    #[test]
    fn update_controls_tracks_versions_per_device() {
        let shared = Arc::new(Shared {
            broadcasts: Mutex::new(HashMap::new()),
            frame_available: Condvar::new(),
            notify: Notify::default(),
        });
        let v1 = shared.notify.touch_controls(1, "AkVCamVideoDevice0");
        let v2 = shared.notify.touch_controls(2, "AkVCamVideoDevice1");
        // Independent devices get independent version counters.
        assert_eq!(v1, 1);
        assert_eq!(v2, 1);
    }
}
