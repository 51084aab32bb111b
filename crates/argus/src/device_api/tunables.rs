use std::sync::{Mutex, OnceLock};
use std::time::Duration;

/// Default preview pool depth (frames).
pub const DEFAULT_PREVIEW_BUFFERS: usize = 8;
/// Default bound on blocking state waits (milliseconds).
pub const DEFAULT_STATE_WAIT_MS: u64 = 10_000;

/// Tunables for device sessions.
///
/// # Example
/// ```rust,ignore
/// use argus::prelude::*;
///
/// set_device_tunables(DeviceTunables {
///     preview_buffers: 6,
///     state_wait_ms: 5_000,
/// });
/// ```
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DeviceTunables {
    pub preview_buffers: usize,
    pub state_wait_ms: u64,
}

impl Default for DeviceTunables {
    fn default() -> Self {
        Self {
            preview_buffers: DEFAULT_PREVIEW_BUFFERS,
            state_wait_ms: DEFAULT_STATE_WAIT_MS,
        }
    }
}

impl DeviceTunables {
    fn sanitized(self) -> Self {
        Self {
            preview_buffers: self.preview_buffers.max(2),
            state_wait_ms: self.state_wait_ms.max(10),
        }
    }
}

static DEVICE_TUNABLES: OnceLock<Mutex<DeviceTunables>> = OnceLock::new();

/// Override device tunables process-wide.
pub fn set_device_tunables(tunables: DeviceTunables) {
    let lock = DEVICE_TUNABLES.get_or_init(|| Mutex::new(DeviceTunables::default()));
    *lock.lock().unwrap() = tunables.sanitized();
}

pub(crate) fn preview_buffers() -> usize {
    DEVICE_TUNABLES
        .get()
        .and_then(|t| t.lock().ok().map(|v| v.preview_buffers))
        .unwrap_or(DEFAULT_PREVIEW_BUFFERS)
}

pub(crate) fn state_wait() -> Duration {
    let ms = DEVICE_TUNABLES
        .get()
        .and_then(|t| t.lock().ok().map(|v| v.state_wait_ms))
        .unwrap_or(DEFAULT_STATE_WAIT_MS);
    Duration::from_millis(ms)
}

/// Builder for process-wide Argus tunables.
///
/// # Example
/// ```rust,ignore
/// use argus::prelude::*;
///
/// ArgusConfig::new()
///     .preview_buffers(6)
///     .state_wait_ms(5_000)
///     .apply();
/// ```
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ArgusConfig {
    device: DeviceTunables,
}

impl ArgusConfig {
    /// Start building a new configuration with defaults.
    pub fn new() -> Self {
        Self {
            device: DeviceTunables::default(),
        }
    }

    /// Override the preview pool depth.
    pub fn preview_buffers(mut self, count: usize) -> Self {
        self.device.preview_buffers = count;
        self
    }

    /// Override the bound on blocking state waits.
    pub fn state_wait_ms(mut self, ms: u64) -> Self {
        self.device.state_wait_ms = ms;
        self
    }

    /// Apply the configuration to global tunables.
    pub fn apply(self) {
        set_device_tunables(self.device);
    }
}

impl Default for ArgusConfig {
    fn default() -> Self {
        Self::new()
    }
}
