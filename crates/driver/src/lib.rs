#![doc = include_str!("../README.md")]

use std::sync::Arc;

use argus_core::prelude::*;

pub mod sim;

/// Errors returned by driver entry points.
///
/// Completion failures do not show up here; they arrive asynchronously as
/// [`DriverEvent::Fault`].
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("driver is not streaming")]
    NotStreaming,
    #[error("driver is already streaming")]
    AlreadyStreaming,
    #[error("no capture pools installed")]
    NoCapturePools,
    #[error("preview buffer queue is full")]
    QueueFull,
    #[error("operation rejected: {0}")]
    Rejected(&'static str),
    #[error("heap: {0}")]
    Heap(#[from] HeapError),
}

impl DriverError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            DriverError::NotStreaming => "not_streaming",
            DriverError::AlreadyStreaming => "already_streaming",
            DriverError::NoCapturePools => "no_capture_pools",
            DriverError::QueueFull => "queue_full",
            DriverError::Rejected(_) => "rejected",
            DriverError::Heap(_) => "heap",
        }
    }

    /// Whether the error may succeed when retried.
    pub fn retryable(&self) -> bool {
        matches!(self, DriverError::QueueFull)
    }
}

/// Autofocus completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FocusOutcome {
    Focused,
    Failed,
}

/// Fatal fault classes a driver can report. All of them latch the device
/// into its error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FaultKind {
    /// The sensor pipeline aborted.
    Abort,
    /// The DSP side aborted mid-operation.
    DspAbort,
    /// The driver ran out of a hardware resource.
    Resource,
    /// A queued operation failed after being accepted.
    OpFailed,
}

/// One asynchronous driver completion.
///
/// Events are interpreted against the device state by the dispatcher; the
/// same variant can mean different things in different states (`Started`
/// acknowledges a preview start or a capture start).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// The last start request was accepted and is running.
    Started,
    /// Preview or an aborted capture has stopped.
    Stopped,
    /// One preview frame is filled and ready.
    PreviewFrame(FrameHandle),
    /// The capture path is fully finished.
    CaptureDone,
    /// The raw capture frame is filled and ready.
    RawReady(FrameHandle),
    /// One piece of encoder output, appended to the staging buffer.
    JpegFragment { bytes: Vec<u8>, last: bool },
    /// Complete encoder output in one piece, raw stage skipped.
    JpegDone { bytes: Vec<u8> },
    /// Autofocus finished.
    FocusDone(FocusOutcome),
    /// Fatal fault; the device must be torn down.
    Fault(FaultKind),
    /// Final teardown acknowledgement.
    StopDone,
}

impl DriverEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DriverEvent::Started => "started",
            DriverEvent::Stopped => "stopped",
            DriverEvent::PreviewFrame(_) => "preview_frame",
            DriverEvent::CaptureDone => "capture_done",
            DriverEvent::RawReady(_) => "raw_ready",
            DriverEvent::JpegFragment { .. } => "jpeg_fragment",
            DriverEvent::JpegDone { .. } => "jpeg_done",
            DriverEvent::FocusDone(_) => "focus_done",
            DriverEvent::Fault(_) => "fault",
            DriverEvent::StopDone => "stop_done",
        }
    }
}

/// Callback a driver reports events through. Registered once at
/// construction; invoked from driver-owned threads.
pub type EventSink = Box<dyn Fn(DriverEvent) + Send + Sync>;

/// Capture-side pools installed before `take_picture`.
#[derive(Clone)]
pub struct CapturePools {
    pub raw: Arc<FramePool>,
    pub jpeg_staging: Arc<FramePool>,
    /// Zoom/interpolation scratch; absent when the session needs none.
    pub scratch: Option<Arc<FramePool>>,
}

/// Fixed inventory entry for one camera device.
///
/// # Example
/// ```rust
/// use argus_driver::prelude::*;
///
/// let front = enumerate()[1];
/// assert_eq!(front.facing, Facing::Front);
/// assert_eq!(front.mount, Rotation::Deg270);
/// assert!(front.facing.is_mirrored());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    pub id: u32,
    pub facing: Facing,
    /// Sensor mount angle relative to the display.
    pub mount: Rotation,
    /// Whether raw captures size from the large tier table.
    pub large_raw: bool,
}

/// The two fixed devices this control plane manages.
pub fn enumerate() -> [DeviceInfo; 2] {
    [
        DeviceInfo {
            id: 0,
            facing: Facing::Back,
            mount: Rotation::Deg90,
            large_raw: true,
        },
        DeviceInfo {
            id: 1,
            facing: Facing::Front,
            mount: Rotation::Deg270,
            large_raw: false,
        },
    ]
}

/// The seam between the control plane and a concrete camera driver.
///
/// Entry points return once the request is accepted; completion arrives on
/// the event sink. Implementations own their event threads and must never
/// call back into the control plane's client operations.
pub trait CameraDriver: Send + Sync {
    fn descriptor(&self) -> &DeviceInfo;

    /// Begin streaming preview frames out of `pool`. Buffers are handed to
    /// the driver one by one via [`CameraDriver::queue_preview_buffer`].
    fn start_preview(&self, pool: Arc<FramePool>) -> Result<(), DriverError>;

    fn stop_preview(&self) -> Result<(), DriverError>;

    /// Return a preview buffer to the driver for refilling.
    fn queue_preview_buffer(&self, frame: FrameHandle) -> Result<(), DriverError>;

    /// Install the raw/staging/scratch pools the next capture fills.
    fn set_capture_pools(&self, pools: CapturePools) -> Result<(), DriverError>;

    fn take_picture(&self) -> Result<(), DriverError>;

    fn cancel_capture(&self) -> Result<(), DriverError>;

    fn auto_focus(&self) -> Result<(), DriverError>;

    fn cancel_auto_focus(&self) -> Result<(), DriverError>;

    /// Push one validated control value.
    fn push_control(&self, key: ControlKey, value: ControlCode) -> Result<(), DriverError>;

    fn set_focus_zones(&self, zones: &[FocusZone]) -> Result<(), DriverError>;

    /// Attach a capture location to subsequent pictures.
    fn set_position(&self, position: &GpsPosition) -> Result<(), DriverError>;

    /// Final teardown; acknowledged with [`DriverEvent::StopDone`].
    fn stop(&self) -> Result<(), DriverError>;
}

pub mod prelude {
    pub use crate::sim::{SimDriver, SimKnobs};
    pub use crate::{
        CameraDriver, CapturePools, DeviceInfo, DriverError, DriverEvent, EventSink, FaultKind,
        FocusOutcome, enumerate,
    };
    pub use argus_core::prelude::*;
}
