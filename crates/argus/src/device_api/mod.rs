//! The device control plane: open a camera, stream preview, record, and
//! capture stills through one blocking [`CameraHandle`].
//!
//! A session splits across three layers. The handle runs client operations
//! and blocks on a shared [`DeviceState`] cell; the dispatcher turns driver
//! completions into state settlements; delivery routes frames to callbacks
//! and the optional preview sink without ever blocking on an operation.
//!
//! # Example
//! ```rust,ignore
//! use argus::prelude::*;
//!
//! let handle = OpenRequest::new(0)
//!     .callbacks(CallbackTable::new().on_preview_frame(|_frame, bytes| {
//!         println!("frame: {} bytes", bytes.len());
//!     }))
//!     .open_sim()?;
//! handle.start_preview()?;
//! handle.take_picture()?;
//! handle.close();
//! # Ok::<(), argus::device_api::DeviceError>(())
//! ```

use std::sync::{Arc, OnceLock};

use argus_driver::{CameraDriver, DeviceInfo};

mod callbacks;
mod delivery;
mod dispatch;
mod handle;
mod request;
mod state;
mod tunables;
pub mod window;

pub use callbacks::{CallbackTable, Notify};
pub use delivery::DeliveryCounters;
pub use handle::{CMD_START_FACE_DETECTION, CameraHandle, DeviceStatus};
pub use request::{DeviceError, OpenRequest};
pub use state::DeviceState;
pub use tunables::{
    ArgusConfig, DEFAULT_PREVIEW_BUFFERS, DEFAULT_STATE_WAIT_MS, DeviceTunables,
    set_device_tunables,
};
pub use window::{FrameWindow, PreviewSink, SinkError};

/// State shared between the handle, the dispatcher, and delivery.
///
/// Lock order is strict: state cell before the delivery lock, and neither is
/// ever held across a driver call or a client callback.
pub(crate) struct DeviceShared {
    pub(crate) info: DeviceInfo,
    pub(crate) state: state::StateCell,
    pub(crate) delivery: parking_lot::Mutex<delivery::DeliveryState>,
    /// Installed right after construction; empty only inside `open` while
    /// the driver factory runs.
    pub(crate) driver: OnceLock<Arc<dyn CameraDriver>>,
}
