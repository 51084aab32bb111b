use std::fmt;
use std::sync::Arc;

use argus_core::heap::FrameHandle;

/// Out-of-band notification delivered on the driver's event thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notify {
    /// Exposure has been committed for an in-flight capture.
    Shutter,
    /// An autofocus sweep finished.
    Focus { success: bool },
    /// A fault latched the session; `code` is a stable classification string.
    Error { code: &'static str },
}

pub type NotifyFn = dyn Fn(Notify) + Send + Sync;
pub type DataFn = dyn Fn(FrameHandle, &[u8]) + Send + Sync;
pub type VideoFn = dyn Fn(i64, FrameHandle, &[u8]) + Send + Sync;

/// Client callback registrations.
///
/// The table lives under the delivery lock and is snapshotted (cheap `Arc`
/// clones) before each invocation, so callbacks always run with no session
/// lock held and may call back into the handle.
///
/// # Example
/// ```rust,ignore
/// use argus::prelude::*;
///
/// let callbacks = CallbackTable::new()
///     .on_notify(|event| println!("notify: {event:?}"))
///     .on_compressed_image(|_frame, bytes| std::fs::write("still.jpg", bytes).unwrap());
/// ```
#[derive(Clone, Default)]
pub struct CallbackTable {
    pub(crate) notify: Option<Arc<NotifyFn>>,
    pub(crate) preview: Option<Arc<DataFn>>,
    pub(crate) raw: Option<Arc<DataFn>>,
    pub(crate) compressed: Option<Arc<DataFn>>,
    pub(crate) video: Option<Arc<VideoFn>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the notification callback (shutter, focus, error).
    pub fn on_notify(mut self, f: impl Fn(Notify) + Send + Sync + 'static) -> Self {
        self.notify = Some(Arc::new(f));
        self
    }

    /// Register the per-frame preview callback.
    pub fn on_preview_frame(mut self, f: impl Fn(FrameHandle, &[u8]) + Send + Sync + 'static) -> Self {
        self.preview = Some(Arc::new(f));
        self
    }

    /// Register the raw still callback.
    pub fn on_raw_image(mut self, f: impl Fn(FrameHandle, &[u8]) + Send + Sync + 'static) -> Self {
        self.raw = Some(Arc::new(f));
        self
    }

    /// Register the encoded still callback.
    pub fn on_compressed_image(
        mut self,
        f: impl Fn(FrameHandle, &[u8]) + Send + Sync + 'static,
    ) -> Self {
        self.compressed = Some(Arc::new(f));
        self
    }

    /// Register the timestamped recording callback.
    ///
    /// Frames handed to this callback stay client-owned until released with
    /// `release_recording_frame`.
    pub fn on_video_frame(
        mut self,
        f: impl Fn(i64, FrameHandle, &[u8]) + Send + Sync + 'static,
    ) -> Self {
        self.video = Some(Arc::new(f));
        self
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }
}

impl fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackTable")
            .field("notify", &self.notify.is_some())
            .field("preview", &self.preview.is_some())
            .field("raw", &self.raw.is_some())
            .field("compressed", &self.compressed.is_some())
            .field("video", &self.video.is_some())
            .finish()
    }
}
