use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{error, trace};

/// Lifecycle state of an open device.
///
/// Client operations store intent states (`PreviewStarting`, `RawRequested`,
/// `PreviewStopping`, ...) and block until the dispatcher settles them from
/// driver completions. `Error` is absorbing: only a close can leave it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceState {
    /// Driver initialized, session not configured.
    Init,
    /// Configured and quiescent between operations.
    Idle,
    /// Unrecoverable fault latched; only close leaves this state.
    Error,
    /// Preview submitted, waiting for the driver start ack.
    PreviewStarting,
    /// Preview frames flowing.
    PreviewRunning,
    /// Preview stop submitted, waiting for the stop ack.
    PreviewStopping,
    /// Capture submitted, waiting for the driver start ack.
    RawRequested,
    /// Capture acked, waiting for the raw frame.
    WaitingRaw,
    /// Raw delivered, waiting for the encoded payload.
    WaitingJpeg,
    /// Capture cancel submitted, waiting for it to settle.
    CaptureStopping,
    /// Device teardown submitted, waiting for the final ack.
    Stopping,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Init => "init",
            DeviceState::Idle => "idle",
            DeviceState::Error => "error",
            DeviceState::PreviewStarting => "preview-starting",
            DeviceState::PreviewRunning => "preview-running",
            DeviceState::PreviewStopping => "preview-stopping",
            DeviceState::RawRequested => "raw-requested",
            DeviceState::WaitingRaw => "waiting-raw",
            DeviceState::WaitingJpeg => "waiting-jpeg",
            DeviceState::CaptureStopping => "capture-stopping",
            DeviceState::Stopping => "stopping",
        }
    }

    /// Preview pipeline is live (submitted or streaming).
    pub fn preview_live(self) -> bool {
        matches!(
            self,
            DeviceState::PreviewStarting | DeviceState::PreviewRunning
        )
    }

    /// A still capture is in flight.
    pub fn capture_live(self) -> bool {
        matches!(
            self,
            DeviceState::RawRequested | DeviceState::WaitingRaw | DeviceState::WaitingJpeg
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared state slot with blocking waits.
///
/// At most one client operation waits at a time (operations are serialized by
/// the handle's operation lock), so every store signals with `notify_one`.
pub struct StateCell {
    slot: Mutex<DeviceState>,
    signal: Condvar,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(DeviceState::Init),
            signal: Condvar::new(),
        }
    }

    pub fn get(&self) -> DeviceState {
        *self.slot.lock().unwrap()
    }

    /// Store a state unconditionally and wake the waiter.
    pub fn set(&self, next: DeviceState) {
        {
            let mut slot = self.slot.lock().unwrap();
            trace!("state {} -> {next}", *slot);
            *slot = next;
        }
        self.signal.notify_one();
    }

    /// Store `next` only if the current state is `expected`.
    ///
    /// On mismatch the cell latches `Error` instead, so a stale or unexpected
    /// driver completion can never leave the session in a live state. Either
    /// way the waiter is woken.
    pub fn transition(&self, expected: DeviceState, next: DeviceState) -> bool {
        let matched;
        {
            let mut slot = self.slot.lock().unwrap();
            matched = *slot == expected;
            if matched {
                trace!("state {expected} -> {next}");
                *slot = next;
            } else {
                error!("state transition expected {expected}, found {}; latching error", *slot);
                *slot = DeviceState::Error;
            }
        }
        self.signal.notify_one();
        matched
    }

    /// Block until the state is one of `targets` or `Error`, bounded by
    /// `bound`. A timeout latches `Error` so a wedged driver cannot hang the
    /// client forever.
    pub(crate) fn wait_settled_for(
        &self,
        targets: &[DeviceState],
        bound: Duration,
    ) -> DeviceState {
        let deadline = Instant::now() + bound;
        let mut slot = self.slot.lock().unwrap();
        loop {
            if *slot == DeviceState::Error || targets.contains(&*slot) {
                return *slot;
            }
            let now = Instant::now();
            if now >= deadline {
                error!("state wait timed out in {}; latching error", *slot);
                *slot = DeviceState::Error;
                drop(slot);
                self.signal.notify_one();
                return DeviceState::Error;
            }
            let (guard, _timeout) = self.signal.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
