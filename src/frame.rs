//! Video frame buffers.

use crate::format::VideoFormat;

/// One frame of video: a format plus its raw pixel bytes.
///
/// An empty `data` buffer is the "no frame yet" sentinel, distinguishable
/// from a genuine zero-sized frame because a genuine frame's format is
/// always valid (`width > 0`, `height > 0`) — the sentinel pairs an empty
/// buffer with whatever format happens to be on hand, usually a
/// default/invalid one.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoFrame {
    format: VideoFormat,
    data: Vec<u8>,
}

impl VideoFrame {
    pub fn new(format: VideoFormat, data: Vec<u8>) -> Self {
        VideoFrame { format, data }
    }

    /// The "no frame yet" sentinel: an invalid format and no bytes.
    pub fn empty() -> Self {
        use crate::format::FourCc;
        VideoFrame {
            format: VideoFormat::new(FourCc::new(""), 0, 0, vec![crate::fraction::Fraction::INVALID]),
            data: Vec::new(),
        }
    }

    pub fn format(&self) -> &VideoFormat {
        &self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// `true` if this frame carries no bytes — the broker's "nothing
    /// produced yet" / "stream idle" marker.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Broadcasts `value` across every byte of the buffer, treating the
    /// whole buffer as a single plane. Multi-plane formats are outside
    /// this crate's scope (§1: no colour conversion, no scaling); callers
    /// needing per-plane fills should slice `data_mut()` themselves.
    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Default for VideoFrame {
    fn default() -> Self {
        VideoFrame::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FourCc;

    #[test]
    fn empty_is_empty() {
        assert!(VideoFrame::empty().is_empty());
    }

    #[test]
    fn fill_sets_every_byte() {
        let fmt = VideoFormat::new(FourCc::new("RGB3"), 2, 1, vec![crate::fraction::Fraction::new(30, 1)]);
        let mut frame = VideoFrame::new(fmt, vec![0; 6]);
        frame.fill(0x80);
        assert!(frame.data().iter().all(|&b| b == 0x80));
    }
}
