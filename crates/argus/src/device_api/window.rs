use std::sync::Arc;

use parking_lot::Mutex;

use argus_core::format::{Resolution, Rotation};

/// Errors surfaced by a preview sink.
///
/// Sink failures are session-local: delivery disconnects the sink and keeps
/// streaming, they never latch the device error state.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink disconnected")]
    Disconnected,
    #[error("frame too short for geometry: need {needed} bytes, got {got}")]
    Geometry { needed: usize, got: usize },
}

/// Destination for preview frames (a display surface, encoder input, ...).
///
/// `write_frame` receives the frame bytes together with the source geometry
/// and the rotation the session wants applied. Implementations own their
/// buffer queue; the delivery path calls this once per streamed frame.
pub trait PreviewSink: Send {
    fn write_frame(
        &mut self,
        bytes: &[u8],
        size: Resolution,
        rotation: Rotation,
    ) -> Result<(), SinkError>;
}

/// Rotate a 4:2:0 semi-planar frame by a quarter turn.
///
/// Input is a full Y plane followed by interleaved chroma pairs at half
/// resolution. Output length equals input length; for 90 and 270 degrees the
/// logical geometry is transposed.
///
/// # Example
/// ```rust
/// use argus::device_api::window::rotate_420sp;
/// use argus::prelude::{Resolution, Rotation};
///
/// let size = Resolution::new(4, 2).unwrap();
/// let frame: Vec<u8> = (0..12).collect();
/// let out = rotate_420sp(&frame, size, Rotation::Deg180);
/// assert_eq!(&out[..8], &[7, 6, 5, 4, 3, 2, 1, 0]);
/// ```
pub fn rotate_420sp(src: &[u8], size: Resolution, rotation: Rotation) -> Vec<u8> {
    let w = size.width.get() as usize;
    let h = size.height.get() as usize;
    let y_len = w * h;
    debug_assert!(src.len() >= y_len * 3 / 2);
    if rotation == Rotation::Deg0 {
        return src[..y_len * 3 / 2].to_vec();
    }

    let mut out = vec![0u8; y_len * 3 / 2];
    for y in 0..h {
        for x in 0..w {
            let (dx, dy, dw) = match rotation {
                Rotation::Deg90 => (h - 1 - y, x, h),
                Rotation::Deg180 => (w - 1 - x, h - 1 - y, w),
                Rotation::Deg270 => (y, w - 1 - x, h),
                Rotation::Deg0 => unreachable!(),
            };
            out[dy * dw + dx] = src[y * w + x];
        }
    }

    // Chroma pairs live on a half-resolution grid, two bytes per sample.
    let cw = w / 2;
    let ch = h / 2;
    for cy in 0..ch {
        for cx in 0..cw {
            let (dx, dy, dcw) = match rotation {
                Rotation::Deg90 => (ch - 1 - cy, cx, ch),
                Rotation::Deg180 => (cw - 1 - cx, ch - 1 - cy, cw),
                Rotation::Deg270 => (cy, cw - 1 - cx, ch),
                Rotation::Deg0 => unreachable!(),
            };
            let s = y_len + (cy * cw + cx) * 2;
            let d = y_len + (dy * dcw + dx) * 2;
            out[d] = src[s];
            out[d + 1] = src[s + 1];
        }
    }
    out
}

#[derive(Default)]
struct WindowState {
    frames: u64,
    last: Option<(Resolution, Vec<u8>)>,
    disconnected: bool,
}

/// In-memory preview sink for tests, demos, and headless consumers.
///
/// Clones share the same backing state, so one copy can be handed to the
/// session while another inspects what arrived.
///
/// # Example
/// ```rust,ignore
/// use argus::prelude::*;
///
/// let window = FrameWindow::new();
/// handle.set_preview_sink(Box::new(window.clone()));
/// // ... stream ...
/// println!("sink saw {} frames", window.frames());
/// ```
#[derive(Clone, Default)]
pub struct FrameWindow {
    state: Arc<Mutex<WindowState>>,
}

impl FrameWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames written so far.
    pub fn frames(&self) -> u64 {
        self.state.lock().frames
    }

    /// Most recent frame with its post-rotation geometry.
    pub fn last_frame(&self) -> Option<(Resolution, Vec<u8>)> {
        self.state.lock().last.clone()
    }

    /// Make every subsequent write fail, as a vanished surface would.
    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }
}

impl PreviewSink for FrameWindow {
    fn write_frame(
        &mut self,
        bytes: &[u8],
        size: Resolution,
        rotation: Rotation,
    ) -> Result<(), SinkError> {
        let needed = size.pixels() * 3 / 2;
        if bytes.len() < needed {
            return Err(SinkError::Geometry {
                needed,
                got: bytes.len(),
            });
        }
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(SinkError::Disconnected);
        }
        let (stored_size, stored) = if rotation == Rotation::Deg0 {
            (size, bytes[..needed].to_vec())
        } else {
            let rotated = rotate_420sp(&bytes[..needed], size, rotation);
            let stored_size = if rotation.is_transposed() {
                size.transposed()
            } else {
                size
            };
            (stored_size, rotated)
        };
        state.frames += 1;
        state.last = Some((stored_size, stored));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 4x2 frame: Y plane 0..8 row-major, then two chroma pairs.
    fn tiny_frame() -> (Resolution, Vec<u8>) {
        (Resolution::new(4, 2).unwrap(), (0..12).collect())
    }

    #[test]
    fn quarter_turn_moves_the_top_row_to_the_right_column() {
        let (size, frame) = tiny_frame();
        let out = rotate_420sp(&frame, size, Rotation::Deg90);
        assert_eq!(&out[..8], &[4, 0, 5, 1, 6, 2, 7, 3]);
        assert_eq!(&out[8..], &[8, 9, 10, 11]);
    }

    #[test]
    fn half_turn_reverses_both_planes() {
        let (size, frame) = tiny_frame();
        let out = rotate_420sp(&frame, size, Rotation::Deg180);
        assert_eq!(&out[..8], &[7, 6, 5, 4, 3, 2, 1, 0]);
        assert_eq!(&out[8..], &[10, 11, 8, 9]);
    }

    #[test]
    fn window_transposes_geometry_on_quarter_turns() {
        let (size, frame) = tiny_frame();
        let mut window = FrameWindow::new();
        window.write_frame(&frame, size, Rotation::Deg90).unwrap();
        let (stored_size, stored) = window.last_frame().unwrap();
        assert_eq!(stored_size, size.transposed());
        assert_eq!(stored.len(), frame.len());
        assert_eq!(window.frames(), 1);
    }

    #[test]
    fn window_rejects_short_frames_and_disconnects() {
        let (size, frame) = tiny_frame();
        let mut window = FrameWindow::new();
        assert_eq!(
            window.write_frame(&frame[..4], size, Rotation::Deg0),
            Err(SinkError::Geometry { needed: 12, got: 4 })
        );
        window.disconnect();
        assert_eq!(
            window.write_frame(&frame, size, Rotation::Deg0),
            Err(SinkError::Disconnected)
        );
    }
}
