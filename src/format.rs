//! Video format descriptors.

use std::fmt;

use crate::fraction::Fraction;

/// A 4-character pixel-format tag (e.g. `"RGB24"`, `"YUY2"`, `"NV12"`).
///
/// Stored as the raw 4 bytes rather than a `String` so it is cheap to copy
/// and compare; [`Display`](fmt::Display) renders it as the ASCII text the
/// wire protocol and Preferences both use.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    /// Builds a tag from a 4-character ASCII string, padding with spaces
    /// if shorter and truncating if longer (the legacy format strings are
    /// occasionally shorter than 4 characters, e.g. `"I42"`).
    pub fn new(s: &str) -> Self {
        let mut bytes = [b' '; 4];
        for (slot, b) in bytes.iter_mut().zip(s.as_bytes()) {
            *slot = *b;
        }
        FourCc(bytes)
    }

    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    pub const fn as_u32(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub const fn from_u32(v: u32) -> Self {
        FourCc(v.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str().trim_end())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({:?})", self.as_str())
    }
}

/// Describes one video format a device can produce or accept: a pixel
/// format tag, a frame size, and the frame rates it supports.
///
/// Equality and hashing are structural on `(fourcc, width, height)` plus
/// the *minimum* frame rate — matching the wire and Preferences
/// representations, which only ever retain the first (lowest) rate in
/// `frame_rates` (§4.1, §4.7).
#[derive(Clone, Debug)]
pub struct VideoFormat {
    fourcc: FourCc,
    width: i32,
    height: i32,
    frame_rates: Vec<Fraction>,
}

impl VideoFormat {
    /// Builds a format. `frame_rates` must be nonempty; a single
    /// unspecified rate should be passed as `[Fraction::new(0, 1)]` by
    /// convention rather than an empty list, since an empty list has no
    /// "minimum" for the wire encoding to preserve.
    pub fn new(fourcc: FourCc, width: i32, height: i32, frame_rates: Vec<Fraction>) -> Self {
        VideoFormat {
            fourcc,
            width,
            height,
            frame_rates,
        }
    }

    pub fn fourcc(&self) -> FourCc {
        self.fourcc
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn frame_rates(&self) -> &[Fraction] {
        &self.frame_rates
    }

    /// `true` if `width > 0`, `height > 0`, and every frame rate has
    /// `den >= 1`.
    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && !self.frame_rates.is_empty()
            && self.frame_rates.iter().all(|f| f.den() >= 1)
    }

    /// The lowest of the declared frame rates — the only one preserved
    /// when this format crosses the wire or is written to Preferences.
    pub fn minimum_frame_rate(&self) -> Fraction {
        self.frame_rates
            .iter()
            .copied()
            .min()
            .unwrap_or(Fraction::INVALID)
    }

    /// Bytes per frame implied by this format, assuming a packed,
    /// non-planar layout of `bits_per_pixel` bits per sample. Used to
    /// validate [`VideoFrame`](crate::frame::VideoFrame) payload sizes.
    pub fn frame_size(&self, bits_per_pixel: u32) -> usize {
        (self.width as usize) * (self.height as usize) * (bits_per_pixel as usize) / 8
    }
}

impl PartialEq for VideoFormat {
    fn eq(&self, other: &Self) -> bool {
        self.fourcc == other.fourcc
            && self.width == other.width
            && self.height == other.height
            && self.minimum_frame_rate() == other.minimum_frame_rate()
    }
}

impl Eq for VideoFormat {}
