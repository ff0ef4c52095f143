//! The shared key/value preferences store (C2).
//!
//! Keys are dot-separated string paths (`cameras.0.description`); values
//! are UTF-8 strings or native integers/doubles. The canonical key
//! layout is documented on [`Preferences`]. Storage itself is behind the
//! [`PreferencesBackend`] trait so the OS-specific registry/CFPreferences
//! backend a desktop build would plug in stays a platform shim outside
//! this crate (§1); [`MemoryBackend`] and [`FileBackend`] are the two
//! portable backends shipped here.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::warn;

use crate::fraction::Fraction;
use crate::format::{FourCc, VideoFormat};

const MAX_DEVICE_INDEX: u32 = 64;
const DEVICE_ID_PREFIX: &str = "AkVCamVideoDevice";

/// One stored value. Preferences values are always one of these three
/// shapes; a key with no value is simply absent.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Double(f64),
}

impl Value {
    fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Int(i) => Some(*i as f64),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn to_wire_string(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Double(d) => d.to_string(),
        }
    }
}

/// Storage strategy behind [`Preferences`]. All methods are infallible
/// from the caller's point of view at the `Preferences` layer: a backend
/// failure degrades to `false`/a default value, per the error design.
pub trait PreferencesBackend: Send + Sync {
    fn keys(&self) -> Vec<String>;
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> bool;
    fn delete_key(&self, key: &str) -> bool;
    /// Flushes pending writes. A backend whose writes are already durable
    /// (e.g. an OS registry) may make this a no-op.
    fn sync(&self) -> bool;
}

/// An in-memory backend. `sync()` is a no-op since nothing here is ever
/// written through to disk; suitable for embedding and for tests.
#[derive(Default)]
pub struct MemoryBackend {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferencesBackend for MemoryBackend {
    fn keys(&self) -> Vec<String> {
        self.values.lock().unwrap().keys().cloned().collect()
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> bool {
        self.values.lock().unwrap().insert(key.to_string(), value);
        true
    }

    fn delete_key(&self, key: &str) -> bool {
        self.values.lock().unwrap().remove(key).is_some()
    }

    fn sync(&self) -> bool {
        true
    }
}

/// A file-backed backend: one `key\ttype\tvalue` line per entry, sorted
/// by key. Writes accumulate in memory and only hit disk on
/// [`sync`](PreferencesBackend::sync), which is this backend's
/// durability point — matching the "durable via an explicit sync()"
/// requirement without pulling in a serialization framework this simple
/// a format doesn't need.
pub struct FileBackend {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl FileBackend {
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let mut values = BTreeMap::new();
        if let Ok(contents) = fs::read_to_string(&path) {
            for line in contents.lines() {
                if let Some((key, rest)) = line.split_once('\t') {
                    if let Some((kind, raw)) = rest.split_once('\t') {
                        let value = match kind {
                            "i" => raw.parse().ok().map(Value::Int),
                            "d" => raw.parse().ok().map(Value::Double),
                            _ => Some(Value::Str(raw.to_string())),
                        };
                        if let Some(value) = value {
                            values.insert(key.to_string(), value);
                        }
                    }
                }
            }
        }
        Ok(FileBackend {
            path,
            values: Mutex::new(values),
        })
    }
}

impl PreferencesBackend for FileBackend {
    fn keys(&self) -> Vec<String> {
        self.values.lock().unwrap().keys().cloned().collect()
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> bool {
        self.values.lock().unwrap().insert(key.to_string(), value);
        true
    }

    fn delete_key(&self, key: &str) -> bool {
        self.values.lock().unwrap().remove(key).is_some()
    }

    fn sync(&self) -> bool {
        let values = self.values.lock().unwrap();
        let mut contents = String::new();
        for (key, value) in values.iter() {
            let (kind, raw) = match value {
                Value::Str(s) => ("s", s.clone()),
                Value::Int(i) => ("i", i.to_string()),
                Value::Double(d) => ("d", d.to_string()),
            };
            contents.push_str(key);
            contents.push('\t');
            contents.push_str(kind);
            contents.push('\t');
            contents.push_str(&raw);
            contents.push('\n');
        }
        match fs::write(&self.path, contents) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to sync preferences to {}: {e}", self.path.display());
                false
            }
        }
    }
}

/// The typed accessor surface over a [`PreferencesBackend`], implementing
/// the canonical key layout (§4.2).
pub struct Preferences {
    backend: Box<dyn PreferencesBackend>,
}

impl Preferences {
    pub fn new(backend: impl PreferencesBackend + 'static) -> Self {
        Preferences {
            backend: Box::new(backend),
        }
    }

    pub fn memory() -> Self {
        Preferences::new(MemoryBackend::new())
    }

    pub fn file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Preferences::new(FileBackend::open(path.as_ref())?))
    }

    pub fn keys(&self) -> Vec<String> {
        self.backend.keys()
    }

    pub fn read_string(&self, key: &str, default: &str) -> String {
        self.backend
            .get(key)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| default.to_string())
    }

    pub fn read_int(&self, key: &str, default: i64) -> i64 {
        self.backend.get(key).and_then(|v| v.as_int()).unwrap_or(default)
    }

    pub fn read_double(&self, key: &str, default: f64) -> f64 {
        self.backend.get(key).and_then(|v| v.as_double()).unwrap_or(default)
    }

    /// Comma-split list read. Matches the legacy accessor's quirk of
    /// *appending* to the caller-supplied default rather than replacing
    /// it when the key is present: the default is the seed, not a
    /// fallback-only value.
    pub fn read_string_list(&self, key: &str, default: Vec<String>) -> Vec<String> {
        let mut result = default;
        if let Some(value) = self.backend.get(key).and_then(|v| v.as_str().map(str::to_string)) {
            if !value.is_empty() {
                result.extend(value.split(',').map(str::to_string));
            }
        }
        result
    }

    pub fn write_string(&self, key: &str, value: &str) -> bool {
        self.backend.set(key, Value::Str(value.to_string()))
    }

    pub fn write_int(&self, key: &str, value: i64) -> bool {
        self.backend.set(key, Value::Int(value))
    }

    pub fn write_double(&self, key: &str, value: f64) -> bool {
        self.backend.set(key, Value::Double(value))
    }

    pub fn write_string_list(&self, key: &str, values: &[String]) -> bool {
        self.backend.set(key, Value::Str(values.join(",")))
    }

    pub fn delete_key(&self, key: &str) -> bool {
        self.backend.delete_key(key)
    }

    /// Deletes every key equal to `prefix` or starting with `prefix.`.
    pub fn delete_all_keys(&self, prefix: &str) -> bool {
        let mut any = false;
        for key in self.matching_keys(prefix) {
            any |= self.backend.delete_key(&key);
        }
        any
    }

    /// Rewrites every key beginning with `from` (or equal to it) to
    /// start with `to` instead.
    pub fn move_all(&self, from: &str, to: &str) {
        for key in self.matching_keys(from) {
            if let Some(value) = self.backend.get(&key) {
                let new_key = if key == from {
                    to.to_string()
                } else {
                    format!("{to}{}", &key[from.len()..])
                };
                self.backend.set(&new_key, value);
                self.backend.delete_key(&key);
            }
        }
    }

    fn matching_keys(&self, prefix: &str) -> Vec<String> {
        self.backend
            .keys()
            .into_iter()
            .filter(|k| k == prefix || k.starts_with(&format!("{prefix}.")))
            .collect()
    }

    pub fn sync(&self) -> bool {
        self.backend.sync()
    }

    // ---- Canonical schema accessors ----------------------------------

    pub fn service_port(&self) -> u16 {
        self.read_int("servicePort", 17205) as u16
    }

    pub fn set_service_port(&self, port: u16) -> bool {
        self.write_int("servicePort", port as i64)
    }

    pub fn service_timeout(&self) -> u64 {
        self.read_int("serviceTimeout", 30).max(0) as u64
    }

    pub fn set_service_timeout(&self, seconds: u64) -> bool {
        self.write_int("serviceTimeout", seconds as i64)
    }

    pub fn log_level(&self) -> i32 {
        self.read_int("loglevel", -1) as i32
    }

    pub fn set_log_level(&self, level: i32) -> bool {
        self.write_int("loglevel", level as i64)
    }

    pub fn picture(&self) -> String {
        self.read_string("picture", "")
    }

    pub fn set_picture(&self, path: &str) -> bool {
        self.write_string("picture", path)
    }

    pub fn cameras_count(&self) -> usize {
        self.read_int("cameras", 0).max(0) as usize
    }

    /// Returns the device id stored at catalogue index `i`, if any.
    pub fn camera_id(&self, index: usize) -> Option<String> {
        self.backend
            .get(&format!("cameras.{index}.id"))
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Linear scan for the catalogue index of `device_id`; `None` if
    /// absent.
    pub fn camera_index(&self, device_id: &str) -> Option<usize> {
        (0..self.cameras_count()).find(|&i| self.camera_id(i).as_deref() == Some(device_id))
    }

    pub fn device_id_taken(&self, device_id: &str) -> bool {
        self.camera_index(device_id).is_some()
    }

    /// Every currently registered device id, in catalogue order.
    pub fn devices(&self) -> Vec<String> {
        (0..self.cameras_count()).filter_map(|i| self.camera_id(i)).collect()
    }

    pub fn description(&self, device_id: &str) -> Option<String> {
        let i = self.camera_index(device_id)?;
        self.backend
            .get(&format!("cameras.{i}.description"))
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn set_description(&self, device_id: &str, description: &str) -> bool {
        match self.camera_index(device_id) {
            Some(i) => self.write_string(&format!("cameras.{i}.description"), description),
            None => false,
        }
    }

    /// The smallest `n` in `[0, 64)` for which `AkVCamVideoDevice<n>` is
    /// not currently taken, or `None` if the space is exhausted.
    pub fn create_device_id(&self) -> Option<String> {
        (0..MAX_DEVICE_INDEX)
            .map(|n| format!("{DEVICE_ID_PREFIX}{n}"))
            .find(|candidate| !self.device_id_taken(candidate))
    }

    /// Reserves `device_id` (or allocates a fresh one if empty) with the
    /// given description, no formats attached. Returns the empty string
    /// if `device_id` is already taken, or if allocation failed because
    /// the id space is exhausted.
    pub fn add_device(&self, description: &str, device_id: &str) -> String {
        let id = if device_id.is_empty() {
            match self.create_device_id() {
                Some(id) => id,
                None => return String::new(),
            }
        } else {
            if self.device_id_taken(device_id) {
                return String::new();
            }
            device_id.to_string()
        };

        let index = self.cameras_count();
        self.write_string(&format!("cameras.{index}.id"), &id);
        self.write_string(&format!("cameras.{index}.description"), description);
        self.write_int(&format!("cameras.{index}.formats"), 0);
        self.write_int("cameras", (index + 1) as i64);
        self.sync();
        id
    }

    /// Bulk registration: writes the description and the full format
    /// table in one pass (distinct from [`add_device`](Self::add_device),
    /// which only reserves an id and expects `add_format` calls after).
    pub fn add_camera(&self, device_id: &str, description: &str, formats: &[VideoFormat]) -> String {
        let id = self.add_device(description, device_id);
        if id.is_empty() {
            return id;
        }
        let index = self.camera_index(&id).expect("just added");
        self.write_int(&format!("cameras.{index}.formats"), formats.len() as i64);
        for (j, format) in formats.iter().enumerate() {
            let base = format!("cameras.{index}.formats.{j}");
            self.write_string(&format!("{base}.format"), &format.fourcc().to_string());
            self.write_int(&format!("{base}.width"), format.width() as i64);
            self.write_int(&format!("{base}.height"), format.height() as i64);
            self.write_string(&format!("{base}.fps"), &format.minimum_frame_rate().to_string());
        }
        self.sync();
        id
    }

    pub fn formats(&self, device_id: &str) -> Vec<VideoFormat> {
        let Some(index) = self.camera_index(device_id) else {
            return Vec::new();
        };
        let count = self.read_int(&format!("cameras.{index}.formats"), 0).max(0) as usize;
        (0..count)
            .filter_map(|j| {
                let base = format!("cameras.{index}.formats.{j}");
                let fourcc = self.read_string(&format!("{base}.format"), "");
                if fourcc.is_empty() {
                    return None;
                }
                let width = self.read_int(&format!("{base}.width"), 0) as i32;
                let height = self.read_int(&format!("{base}.height"), 0) as i32;
                let fps = Fraction::parse(&self.read_string(&format!("{base}.fps"), "0/1"));
                Some(VideoFormat::new(FourCc::new(&fourcc), width, height, vec![fps]))
            })
            .collect()
    }

    pub fn set_formats(&self, device_id: &str, formats: &[VideoFormat]) -> bool {
        let Some(index) = self.camera_index(device_id) else {
            return false;
        };
        self.delete_all_keys(&format!("cameras.{index}.formats"));
        self.write_int(&format!("cameras.{index}.formats"), formats.len() as i64);
        for (j, format) in formats.iter().enumerate() {
            let base = format!("cameras.{index}.formats.{j}");
            self.write_string(&format!("{base}.format"), &format.fourcc().to_string());
            self.write_int(&format!("{base}.width"), format.width() as i64);
            self.write_int(&format!("{base}.height"), format.height() as i64);
            self.write_string(&format!("{base}.fps"), &format.minimum_frame_rate().to_string());
        }
        self.sync();
        true
    }

    pub fn controls(&self, device_id: &str) -> BTreeMap<String, i64> {
        let Some(index) = self.camera_index(device_id) else {
            return BTreeMap::new();
        };
        let prefix = format!("cameras.{index}.controls.");
        self.backend
            .keys()
            .into_iter()
            .filter_map(|k| {
                let suffix = k.strip_prefix(&prefix)?;
                let value = self.backend.get(&k)?.as_int()?;
                Some((suffix.to_string(), value))
            })
            .collect()
    }

    pub fn set_controls(&self, device_id: &str, controls: &BTreeMap<String, i64>) -> bool {
        let Some(index) = self.camera_index(device_id) else {
            return false;
        };
        for (key, value) in controls {
            self.write_int(&format!("cameras.{index}.controls.{key}"), *value);
        }
        self.sync();
        true
    }

    pub fn direct_mode(&self, device_id: &str) -> bool {
        let Some(index) = self.camera_index(device_id) else {
            return false;
        };
        self.read_int(&format!("cameras.{index}.direct_mode"), 0) != 0
    }

    pub fn set_direct_mode(&self, device_id: &str, enabled: bool) -> bool {
        let Some(index) = self.camera_index(device_id) else {
            return false;
        };
        self.write_int(&format!("cameras.{index}.direct_mode"), enabled as i64)
    }

    /// Removes `device_id`'s subtree and compacts the catalogue so
    /// indices stay contiguous: every device above the removed one
    /// shifts down by one, and the count is decremented (or the
    /// `cameras` key deleted entirely if the catalogue is now empty).
    pub fn remove_camera(&self, device_id: &str) -> bool {
        let Some(index) = self.camera_index(device_id) else {
            return false;
        };
        let count = self.cameras_count();

        self.delete_all_keys(&format!("cameras.{index}"));

        for k in (index + 1)..count {
            self.move_all(&format!("cameras.{k}"), &format!("cameras.{}", k - 1));
        }

        if count <= 1 {
            self.delete_key("cameras");
        } else {
            self.write_int("cameras", (count - 1) as i64);
        }

        self.sync();
        true
    }

    pub fn remove_device(&self, device_id: &str) -> bool {
        self.remove_camera(device_id)
    }
}

impl Default for Preferences {
    fn default() -> Self {
        Preferences::memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_allocation_and_collision() {
        let prefs = Preferences::memory();
        assert_eq!(prefs.add_device("cam0", ""), "AkVCamVideoDevice0");
        assert_eq!(prefs.add_device("cam1", "AkVCamVideoDevice0"), "");
        assert_eq!(prefs.add_device("cam2", ""), "AkVCamVideoDevice1");
    }

    #[test]
    fn allocator_exhaustion() {
        let prefs = Preferences::memory();
        for _ in 0..MAX_DEVICE_INDEX {
            assert_ne!(prefs.add_device("cam", ""), "");
        }
        assert_eq!(prefs.add_device("one-too-many", ""), "");
        assert_eq!(prefs.create_device_id(), None);
    }

    #[test]
    fn remove_camera_compacts_indices() {
        let prefs = Preferences::memory();
        let a = prefs.add_device("a", "");
        let b = prefs.add_device("b", "");
        let c = prefs.add_device("c", "");
        assert_eq!(prefs.cameras_count(), 3);

        assert!(prefs.remove_camera(&a));

        assert_eq!(prefs.cameras_count(), 2);
        assert_eq!(prefs.devices(), vec![b.clone(), c.clone()]);
        assert_eq!(prefs.description(&b), Some("b".to_string()));
        assert_eq!(prefs.description(&c), Some("c".to_string()));
    }

    #[test]
    fn remove_last_camera_deletes_count_key() {
        let prefs = Preferences::memory();
        let a = prefs.add_device("a", "");
        assert!(prefs.remove_camera(&a));
        assert_eq!(prefs.cameras_count(), 0);
        assert!(prefs.backend.get("cameras").is_none());
    }

    #[test]
    fn add_camera_round_trips_formats() {
        let prefs = Preferences::memory();
        let fmt = VideoFormat::new(FourCc::new("RGB3"), 640, 480, vec![Fraction::new(30, 1)]);
        let id = prefs.add_camera("cam", "", std::slice::from_ref(&fmt));
        assert!(!id.is_empty());
        let formats = prefs.formats(&id);
        assert_eq!(formats.len(), 1);
        assert_eq!(formats[0].width(), 640);
        assert_eq!(formats[0].minimum_frame_rate(), Fraction::new(30, 1));
    }

    #[test]
    fn read_string_list_appends_to_default() {
        let prefs = Preferences::memory();
        prefs.write_string("tags", "b,c");
        let list = prefs.read_string_list("tags", vec!["a".to_string()]);
        assert_eq!(list, vec!["a", "b", "c"]);
    }

    #[test]
    fn move_all_rewrites_prefix() {
        let prefs = Preferences::memory();
        prefs.write_string("cameras.2.id", "x");
        prefs.write_int("cameras.2.formats", 0);
        prefs.move_all("cameras.2", "cameras.1");
        assert_eq!(prefs.read_string("cameras.1.id", ""), "x");
        assert_eq!(prefs.read_int("cameras.1.formats", -1), 0);
        assert!(prefs.backend.get("cameras.2.id").is_none());
    }
}
