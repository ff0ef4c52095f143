//! The wire message envelope and per-kind payload codecs (C1).
//!
//! A [`Message`] is the envelope every request and response shares: a
//! message id, a client-chosen query id echoed back for full-duplex
//! pipelining, and an opaque data buffer. The `Msg*` types in this module
//! are typed views over that buffer for one message kind each; encoding
//! produces the buffer, decoding validates it is *exactly* the declared
//! size for that kind before interpreting it (§4.1) — a mismatch never
//! panics or errors, it yields the kind's default value, matching the
//! "Decode" failure mode documented in the error handling design.

use std::io::Cursor;

use crate::fraction::Fraction;
use crate::format::{FourCc, VideoFormat};
use crate::frame::VideoFrame;
use crate::wire;

/// Message ids, in the hex form the protocol documents them as.
pub mod id {
    pub const CLIENTS: i32 = 0x001;
    pub const STATUS: i32 = 0x101;
    pub const FRAME_READY: i32 = 0x102;
    pub const BROADCAST: i32 = 0x201;
    pub const LISTEN: i32 = 0x202;
    pub const UPDATE_DEVICES: i32 = 0x301;
    pub const DEVICES_UPDATED: i32 = 0x302;
    pub const UPDATE_CONTROLS: i32 = 0x401;
    pub const CONTROLS_UPDATED: i32 = 0x402;
    pub const UPDATE_PICTURE: i32 = 0x501;
    pub const PICTURE_UPDATED: i32 = 0x502;
}

/// Returns a human-readable name for a known message id, for logging.
pub fn id_name(message_id: i32) -> &'static str {
    match message_id {
        id::CLIENTS => "CLIENTS",
        id::STATUS => "STATUS",
        id::FRAME_READY => "FRAME_READY",
        id::BROADCAST => "BROADCAST",
        id::LISTEN => "LISTEN",
        id::UPDATE_DEVICES => "UPDATE_DEVICES",
        id::DEVICES_UPDATED => "DEVICES_UPDATED",
        id::UPDATE_CONTROLS => "UPDATE_CONTROLS",
        id::CONTROLS_UPDATED => "CONTROLS_UPDATED",
        id::UPDATE_PICTURE => "UPDATE_PICTURE",
        id::PICTURE_UPDATED => "PICTURE_UPDATED",
        _ => "UNKNOWN",
    }
}

/// The envelope every frame on the wire shares (§4.1, §6).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub id: i32,
    pub query_id: u64,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(id: i32, query_id: u64, data: Vec<u8>) -> Self {
        Message { id, query_id, data }
    }
}

/// Which peer population a [`MsgClients`] request/response concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientType {
    /// Every connected peer, broadcaster or listener.
    Any = 0,
    /// Only peers participating as virtual cameras (listeners, plus
    /// broadcasters under the `Any` branch — see [`MsgClients`] docs).
    VCams = 1,
}

impl ClientType {
    fn from_i32(v: i32) -> ClientType {
        if v == ClientType::VCams as i32 {
            ClientType::VCams
        } else {
            ClientType::Any
        }
    }
}

/// `STATUS` (0x101): a bare status code. `0` means success.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsgStatus {
    pub status: i32,
}

impl MsgStatus {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_i32(&mut buf, self.status).expect("writing to a Vec never fails");
        buf
    }

    pub fn decode(data: &[u8]) -> MsgStatus {
        if data.len() != 4 {
            return MsgStatus::default();
        }
        let mut cursor = Cursor::new(data);
        let status = wire::read_i32(&mut cursor).unwrap_or_default();
        MsgStatus { status }
    }

    pub fn to_message(&self, query_id: u64) -> Message {
        Message::new(id::STATUS, query_id, self.encode())
    }
}

/// `CLIENTS` (0x001): a client-type filter paired with a pid list.
///
/// Used both as the request (pid list empty, ignored by the broker) and
/// as the response (pid list is the result).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgClients {
    pub client_type: Option<ClientType>,
    pub pids: Vec<u64>,
}

impl MsgClients {
    pub fn new(client_type: ClientType, pids: Vec<u64>) -> Self {
        MsgClients {
            client_type: Some(client_type),
            pids,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let client_type = self.client_type.unwrap_or(ClientType::Any);
        wire::write_i32(&mut buf, client_type as i32).unwrap();
        wire::write_u64(&mut buf, self.pids.len() as u64).unwrap();
        for pid in &self.pids {
            wire::write_u64(&mut buf, *pid).unwrap();
        }
        buf
    }

    pub fn decode(data: &[u8]) -> MsgClients {
        if data.len() < 12 {
            return MsgClients::default();
        }
        let mut cursor = Cursor::new(data);
        let client_type = match wire::read_i32(&mut cursor) {
            Ok(v) => v,
            Err(_) => return MsgClients::default(),
        };
        let count = match wire::read_u64(&mut cursor) {
            Ok(v) => v as usize,
            Err(_) => return MsgClients::default(),
        };
        if data.len() != 4 + 8 + count * 8 {
            return MsgClients::default();
        }
        let mut pids = Vec::with_capacity(count);
        for _ in 0..count {
            match wire::read_u64(&mut cursor) {
                Ok(pid) => pids.push(pid),
                Err(_) => return MsgClients::default(),
            }
        }
        MsgClients {
            client_type: Some(ClientType::from_i32(client_type)),
            pids,
        }
    }

    pub fn to_message(&self, query_id: u64) -> Message {
        Message::new(id::CLIENTS, query_id, self.encode())
    }
}

/// `UPDATE_PICTURE` (0x501): announces a new still-picture path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgUpdatePicture {
    pub picture: String,
}

impl MsgUpdatePicture {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_length_prefixed_str(&mut buf, &self.picture).unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> MsgUpdatePicture {
        let mut cursor = Cursor::new(data);
        let picture = match wire::read_length_prefixed_string(&mut cursor) {
            Ok(s) if cursor.position() as usize == data.len() => s,
            _ => return MsgUpdatePicture::default(),
        };
        MsgUpdatePicture { picture }
    }

    pub fn to_message(&self, query_id: u64) -> Message {
        Message::new(id::UPDATE_PICTURE, query_id, self.encode())
    }
}

/// `PICTURE_UPDATED` (0x502): acknowledges a picture change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgPictureUpdated {
    pub picture: String,
    pub updated: bool,
}

impl MsgPictureUpdated {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_length_prefixed_str(&mut buf, &self.picture).unwrap();
        wire::write_bool(&mut buf, self.updated).unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> MsgPictureUpdated {
        let mut cursor = Cursor::new(data);
        let picture = match wire::read_length_prefixed_string(&mut cursor) {
            Ok(s) => s,
            Err(_) => return MsgPictureUpdated::default(),
        };
        let updated = match wire::read_bool(&mut cursor) {
            Ok(b) if cursor.position() as usize == data.len() => b,
            _ => return MsgPictureUpdated::default(),
        };
        MsgPictureUpdated { picture, updated }
    }

    pub fn to_message(&self, query_id: u64) -> Message {
        Message::new(id::PICTURE_UPDATED, query_id, self.encode())
    }
}

/// `UPDATE_CONTROLS` (0x401): announces that a device's controls changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgUpdateControls {
    pub device_id: String,
}

impl MsgUpdateControls {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_length_prefixed_str(&mut buf, &self.device_id).unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> MsgUpdateControls {
        let mut cursor = Cursor::new(data);
        let device_id = match wire::read_length_prefixed_string(&mut cursor) {
            Ok(s) if cursor.position() as usize == data.len() => s,
            _ => return MsgUpdateControls::default(),
        };
        MsgUpdateControls { device_id }
    }

    pub fn to_message(&self, query_id: u64) -> Message {
        Message::new(id::UPDATE_CONTROLS, query_id, self.encode())
    }
}

/// `CONTROLS_UPDATED` (0x402): acknowledges a control change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgControlsUpdated {
    pub device_id: String,
    pub updated: bool,
}

impl MsgControlsUpdated {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_length_prefixed_str(&mut buf, &self.device_id).unwrap();
        wire::write_bool(&mut buf, self.updated).unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> MsgControlsUpdated {
        let mut cursor = Cursor::new(data);
        let device_id = match wire::read_length_prefixed_string(&mut cursor) {
            Ok(s) => s,
            Err(_) => return MsgControlsUpdated::default(),
        };
        let updated = match wire::read_bool(&mut cursor) {
            Ok(b) if cursor.position() as usize == data.len() => b,
            _ => return MsgControlsUpdated::default(),
        };
        MsgControlsUpdated { device_id, updated }
    }

    pub fn to_message(&self, query_id: u64) -> Message {
        Message::new(id::CONTROLS_UPDATED, query_id, self.encode())
    }
}

/// `FRAME_READY` (0x102): the broker's response to `LISTEN`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MsgFrameReady {
    pub device_id: String,
    pub frame: VideoFrame,
    pub is_active: bool,
}

impl MsgFrameReady {
    pub fn new(device_id: impl Into<String>, frame: VideoFrame, is_active: bool) -> Self {
        MsgFrameReady {
            device_id: device_id.into(),
            frame,
            is_active,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_length_prefixed_str(&mut buf, &self.device_id).unwrap();
        wire::write_u32(&mut buf, self.frame.format().fourcc().as_u32()).unwrap();
        wire::write_i32(&mut buf, self.frame.format().width()).unwrap();
        wire::write_i32(&mut buf, self.frame.format().height()).unwrap();
        wire::write_length_prefixed(&mut buf, self.frame.data()).unwrap();
        wire::write_bool(&mut buf, self.is_active).unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> MsgFrameReady {
        let mut cursor = Cursor::new(data);
        let decoded = (|| -> crate::error::Result<MsgFrameReady> {
            let device_id = wire::read_length_prefixed_string(&mut cursor)?;
            let fourcc = FourCc::from_u32(wire::read_u32(&mut cursor)?);
            let width = wire::read_i32(&mut cursor)?;
            let height = wire::read_i32(&mut cursor)?;
            let bytes = wire::read_length_prefixed(&mut cursor)?;
            let is_active = wire::read_bool(&mut cursor)?;
            if cursor.position() as usize != data.len() {
                return Err(crate::error::Error::MalformedMessage(id::FRAME_READY));
            }
            let format = VideoFormat::new(fourcc, width, height, vec![Fraction::new(0, 1)]);
            Ok(MsgFrameReady {
                device_id,
                frame: VideoFrame::new(format, bytes),
                is_active,
            })
        })();
        decoded.unwrap_or_else(|_| MsgFrameReady {
            device_id: String::new(),
            frame: VideoFrame::empty(),
            is_active: false,
        })
    }

    pub fn to_message(&self, query_id: u64) -> Message {
        Message::new(id::FRAME_READY, query_id, self.encode())
    }
}

/// `BROADCAST` (0x201): a producer pushing one frame for a device.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MsgBroadcast {
    pub device_id: String,
    pub pid: u64,
    pub frame: VideoFrame,
}

impl MsgBroadcast {
    pub fn new(device_id: impl Into<String>, pid: u64, frame: VideoFrame) -> Self {
        MsgBroadcast {
            device_id: device_id.into(),
            pid,
            frame,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_length_prefixed_str(&mut buf, &self.device_id).unwrap();
        wire::write_u64(&mut buf, self.pid).unwrap();
        wire::write_u32(&mut buf, self.frame.format().fourcc().as_u32()).unwrap();
        wire::write_i32(&mut buf, self.frame.format().width()).unwrap();
        wire::write_i32(&mut buf, self.frame.format().height()).unwrap();
        wire::write_length_prefixed(&mut buf, self.frame.data()).unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> MsgBroadcast {
        let mut cursor = Cursor::new(data);
        let decoded = (|| -> crate::error::Result<MsgBroadcast> {
            let device_id = wire::read_length_prefixed_string(&mut cursor)?;
            let pid = wire::read_u64(&mut cursor)?;
            let fourcc = FourCc::from_u32(wire::read_u32(&mut cursor)?);
            let width = wire::read_i32(&mut cursor)?;
            let height = wire::read_i32(&mut cursor)?;
            let bytes = wire::read_length_prefixed(&mut cursor)?;
            if cursor.position() as usize != data.len() {
                return Err(crate::error::Error::MalformedMessage(id::BROADCAST));
            }
            let format = VideoFormat::new(fourcc, width, height, vec![Fraction::new(0, 1)]);
            Ok(MsgBroadcast {
                device_id,
                pid,
                frame: VideoFrame::new(format, bytes),
            })
        })();
        decoded.unwrap_or_default()
    }

    pub fn to_message(&self, query_id: u64) -> Message {
        Message::new(id::BROADCAST, query_id, self.encode())
    }
}

/// `LISTEN` (0x202): a consumer asking for the current frame of a device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgListen {
    pub device_id: String,
    pub pid: u64,
}

impl MsgListen {
    pub fn new(device_id: impl Into<String>, pid: u64) -> Self {
        MsgListen {
            device_id: device_id.into(),
            pid,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_length_prefixed_str(&mut buf, &self.device_id).unwrap();
        wire::write_u64(&mut buf, self.pid).unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> MsgListen {
        let mut cursor = Cursor::new(data);
        let decoded = (|| -> crate::error::Result<MsgListen> {
            let device_id = wire::read_length_prefixed_string(&mut cursor)?;
            let pid = wire::read_u64(&mut cursor)?;
            if cursor.position() as usize != data.len() {
                return Err(crate::error::Error::MalformedMessage(id::LISTEN));
            }
            Ok(MsgListen { device_id, pid })
        })();
        decoded.unwrap_or_default()
    }

    pub fn to_message(&self, query_id: u64) -> Message {
        Message::new(id::LISTEN, query_id, self.encode())
    }
}

/// `UPDATE_DEVICES` (0x301) / `DEVICES_UPDATED` (0x302): empty-bodied
/// announcements that the device catalogue changed.
pub fn update_devices_message(query_id: u64) -> Message {
    Message::new(id::UPDATE_DEVICES, query_id, Vec::new())
}

pub fn devices_updated_message(query_id: u64) -> Message {
    Message::new(id::DEVICES_UPDATED, query_id, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        let msg = MsgStatus { status: -1 };
        assert_eq!(MsgStatus::decode(&msg.encode()), msg);
    }

    #[test]
    fn clients_round_trips() {
        let msg = MsgClients::new(ClientType::VCams, vec![1001, 2002]);
        let decoded = MsgClients::decode(&msg.encode());
        assert_eq!(decoded.pids, msg.pids);
        assert_eq!(decoded.client_type, Some(ClientType::VCams));
    }

    #[test]
    fn clients_wrong_length_decodes_to_default() {
        assert_eq!(MsgClients::decode(&[1, 2, 3]), MsgClients::default());
    }

    #[test]
    fn listen_round_trips() {
        let msg = MsgListen::new("AkVCamVideoDevice0", 1002);
        assert_eq!(MsgListen::decode(&msg.encode()), msg);
    }

    #[test]
    fn broadcast_round_trips() {
        let fmt = VideoFormat::new(FourCc::new("RGB3"), 4, 4, vec![Fraction::new(30, 1)]);
        let frame = VideoFrame::new(fmt, vec![0xffu8; 48]);
        let msg = MsgBroadcast::new("AkVCamVideoDevice0", 1001, frame);
        let decoded = MsgBroadcast::decode(&msg.encode());
        assert_eq!(decoded.device_id, msg.device_id);
        assert_eq!(decoded.pid, msg.pid);
        assert_eq!(decoded.frame.data(), msg.frame.data());
    }

    #[test]
    fn frame_ready_decode_rejects_truncated_body() {
        let mut data = MsgFrameReady::new("d", VideoFrame::empty(), true).encode();
        data.pop();
        let decoded = MsgFrameReady::decode(&data);
        assert!(decoded.device_id.is_empty());
        assert!(!decoded.is_active);
    }
}
