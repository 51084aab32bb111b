use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::info;
use parking_lot::Mutex;

use argus_core::format::{FpsRange, Resolution};
use argus_core::heap::HeapError;
use argus_core::params::{ParamError, ParamStore, keys};
use argus_driver::prelude::SimDriver;
use argus_driver::{CameraDriver, DeviceInfo, DriverError, EventSink, enumerate};

use super::callbacks::CallbackTable;
use super::delivery::DeliveryState;
use super::dispatch;
use super::handle::CameraHandle;
use super::state::{DeviceState, StateCell};
use super::window::PreviewSink;
use super::{DeviceShared, tunables};

/// Errors from opening a device or driving a session.
///
/// # Example
/// ```rust,ignore
/// use argus::prelude::*;
///
/// let err = OpenRequest::new(9).open_sim().err().expect("error");
/// eprintln!("open failed: {} ({})", err, err.code());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no device with id {0}")]
    UnknownDevice(u32),
    #[error("{op} not allowed in state {state}")]
    InvalidState {
        op: &'static str,
        state: DeviceState,
    },
    #[error("device fault during {op}")]
    Fault { op: &'static str },
    #[error("device is closed")]
    Closed,
    #[error("recording frame {index} rejected: {reason}")]
    BadRelease { index: usize, reason: &'static str },
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Params(#[from] ParamError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error("driver rejected the request: {0}")]
    Driver(#[from] DriverError),
}

impl DeviceError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            DeviceError::UnknownDevice(_) => "unknown_device",
            DeviceError::InvalidState { .. } => "invalid_state",
            DeviceError::Fault { .. } => "fault",
            DeviceError::Closed => "closed",
            DeviceError::BadRelease { .. } => "bad_release",
            DeviceError::Unsupported(_) => "unsupported",
            DeviceError::Params(_) => "invalid_params",
            DeviceError::Heap(_) => "alloc_failed",
            DeviceError::Driver(_) => "driver_rejected",
        }
    }

    /// Whether the error may succeed when retried.
    pub fn retryable(&self) -> bool {
        matches!(self, DeviceError::Driver(e) if e.retryable())
    }
}

/// Builder for opening a device session.
///
/// Starts from the per-facing parameter defaults; the setters below override
/// the common fields without hand-editing the store. The driver itself is
/// supplied by a factory so tests and embedders can wire their own.
///
/// # Example
/// ```rust,ignore
/// use argus::prelude::*;
///
/// let handle = OpenRequest::new(0)
///     .preview_size(Resolution::new(640, 480).unwrap())
///     .callbacks(CallbackTable::new().on_notify(|e| println!("{e:?}")))
///     .open_sim()?;
/// handle.start_preview()?;
/// # Ok::<(), argus::device_api::DeviceError>(())
/// ```
pub struct OpenRequest {
    device_id: u32,
    params: Option<ParamStore>,
    preview_size: Option<Resolution>,
    picture_size: Option<Resolution>,
    fps: Option<FpsRange>,
    rotation: Option<i32>,
    recording_hint: Option<bool>,
    callbacks: CallbackTable,
    sink: Option<Box<dyn PreviewSink>>,
    state_wait: Option<Duration>,
}

impl OpenRequest {
    /// Create a new request targeting a device id from [`enumerate`].
    pub fn new(device_id: u32) -> Self {
        Self {
            device_id,
            params: None,
            preview_size: None,
            picture_size: None,
            fps: None,
            rotation: None,
            recording_hint: None,
            callbacks: CallbackTable::new(),
            sink: None,
            state_wait: None,
        }
    }

    /// Replace the parameter store wholesale instead of starting from the
    /// facing defaults.
    pub fn parameters(mut self, params: ParamStore) -> Self {
        self.params = Some(params);
        self
    }

    pub fn preview_size(mut self, size: Resolution) -> Self {
        self.preview_size = Some(size);
        self
    }

    pub fn picture_size(mut self, size: Resolution) -> Self {
        self.picture_size = Some(size);
        self
    }

    pub fn fps_range(mut self, fps: FpsRange) -> Self {
        self.fps = Some(fps);
        self
    }

    /// Encode rotation in degrees, as a client would pass it.
    pub fn rotation(mut self, degrees: i32) -> Self {
        self.rotation = Some(degrees);
        self
    }

    /// Declare that the session is intended for video. Published through the
    /// parameter store so readers above the session can see the intent; the
    /// device itself keys nothing off it.
    pub fn recording_hint(mut self, hint: bool) -> Self {
        self.recording_hint = Some(hint);
        self
    }

    pub fn callbacks(mut self, callbacks: CallbackTable) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn preview_sink(mut self, sink: Box<dyn PreviewSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Override the blocking-wait bound for this handle only.
    ///
    /// The process-wide default comes from [`super::DeviceTunables`].
    pub fn state_wait(mut self, bound: Duration) -> Self {
        self.state_wait = Some(bound);
        self
    }

    /// Open against the in-process simulator driver.
    pub fn open_sim(self) -> Result<CameraHandle, DeviceError> {
        self.open(|info, sink| {
            let driver: Arc<dyn CameraDriver> = Arc::new(SimDriver::new(info, sink));
            driver
        })
    }

    /// Open the device: validate parameters, construct the driver with the
    /// session's event sink, and push the initial control block.
    ///
    /// Returns with the session settled in `Idle`.
    pub fn open<F>(self, factory: F) -> Result<CameraHandle, DeviceError>
    where
        F: FnOnce(DeviceInfo, EventSink) -> Arc<dyn CameraDriver>,
    {
        let info = enumerate()
            .into_iter()
            .find(|d| d.id == self.device_id)
            .ok_or(DeviceError::UnknownDevice(self.device_id))?;

        let mut store = self
            .params
            .unwrap_or_else(|| ParamStore::defaults(info.facing));
        if let Some(size) = self.preview_size {
            store.set(keys::PREVIEW_SIZE, size.to_string());
        }
        if let Some(size) = self.picture_size {
            store.set(keys::PICTURE_SIZE, size.to_string());
        }
        if let Some(fps) = self.fps {
            store.set(keys::PREVIEW_FPS_RANGE, fps.to_string());
        }
        if let Some(degrees) = self.rotation {
            store.set_int(keys::ROTATION, degrees);
        }
        if let Some(hint) = self.recording_hint {
            store.set(keys::RECORDING_HINT, if hint { "true" } else { "false" });
        }
        let config = store.to_session_config(info.mount, info.facing.is_mirrored())?;

        let shared = Arc::new(DeviceShared {
            info,
            state: StateCell::new(),
            delivery: Mutex::new(DeliveryState {
                callbacks: self.callbacks,
                sink: self.sink,
                rotation: config.copy_rotation(),
                ..Default::default()
            }),
            driver: OnceLock::new(),
        });
        let shared_for_events = Arc::clone(&shared);
        let event_sink: EventSink =
            Box::new(move |event| dispatch::on_event(&shared_for_events, event));
        let driver = factory(info, event_sink);
        let _ = shared.driver.set(Arc::clone(&driver));

        for (key, code) in config.control_pushes() {
            driver.push_control(key, code)?;
        }
        driver.set_focus_zones(&config.focus_zones)?;
        if let Some(gps) = &config.gps {
            driver.set_position(gps)?;
        }

        shared.state.set(DeviceState::Idle);
        info!(
            "device {} open: preview {}, picture {}",
            info.id, config.preview_size, config.picture_size
        );
        let state_wait = self.state_wait.unwrap_or_else(tunables::state_wait);
        Ok(CameraHandle::assemble(shared, driver, store, config, state_wait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_device_id_is_rejected() {
        let err = OpenRequest::new(9).open_sim().unwrap_err();
        assert!(matches!(err, DeviceError::UnknownDevice(9)));
        assert_eq!(err.code(), "unknown_device");
        assert!(!err.retryable());
    }

    #[test]
    fn invalid_parameters_fail_the_open() {
        let mut params = ParamStore::defaults(argus_core::format::Facing::Back);
        params.set(keys::PREVIEW_FPS_RANGE, "30000,5000");
        let err = OpenRequest::new(0)
            .parameters(params)
            .open_sim()
            .unwrap_err();
        assert_eq!(err.code(), "invalid_params");
    }

    #[test]
    fn queue_full_is_the_only_retryable_driver_error() {
        let retryable = DeviceError::Driver(DriverError::QueueFull);
        let terminal = DeviceError::Driver(DriverError::NotStreaming);
        assert!(retryable.retryable());
        assert!(!terminal.retryable());
    }

    #[test]
    fn recording_hint_lands_in_the_parameter_store() {
        let handle = OpenRequest::new(0).recording_hint(true).open_sim().unwrap();
        assert_eq!(handle.parameters().get(keys::RECORDING_HINT), Some("true"));
        handle.close();
    }
}
