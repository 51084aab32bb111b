use log::{debug, error, trace, warn};

use argus_driver::{DriverEvent, FaultKind, FocusOutcome};

use super::callbacks::Notify;
use super::delivery;
use super::state::DeviceState;
use super::DeviceShared;

/// Stable classification string for a driver fault.
pub(crate) fn fault_code(kind: FaultKind) -> &'static str {
    match kind {
        FaultKind::Abort => "abort",
        FaultKind::DspAbort => "dsp_abort",
        FaultKind::Resource => "resource",
        FaultKind::OpFailed => "op_failed",
    }
}

fn notify_error(shared: &DeviceShared, code: &'static str) {
    let notify = shared.delivery.lock().callbacks.notify.clone();
    if let Some(cb) = notify {
        cb(Notify::Error { code });
    }
}

/// Route one driver completion against the session state.
///
/// Runs on the driver's event threads. Takes the state and delivery locks
/// only; never the handle's operation lock, so a blocked client operation can
/// always be settled from here.
pub(crate) fn on_event(shared: &DeviceShared, event: DriverEvent) {
    let state = shared.state.get();
    trace!("driver event {} in {state}", event.kind());
    if state == DeviceState::Error && !matches!(event, DriverEvent::StopDone) {
        warn!("swallowing {} while latched in error", event.kind());
        return;
    }
    match event {
        DriverEvent::Started => {
            if state == DeviceState::RawRequested {
                shared
                    .state
                    .transition(DeviceState::RawRequested, DeviceState::WaitingRaw);
            } else {
                shared
                    .state
                    .transition(DeviceState::PreviewStarting, DeviceState::PreviewRunning);
            }
        }
        DriverEvent::Stopped => match state {
            DeviceState::CaptureStopping => {
                shared
                    .state
                    .transition(DeviceState::CaptureStopping, DeviceState::Idle);
            }
            DeviceState::Stopping => {
                // A worker noticing teardown late; the final ack is StopDone.
                debug!("stop ack during teardown");
            }
            _ => {
                shared
                    .state
                    .transition(DeviceState::PreviewStopping, DeviceState::Idle);
            }
        },
        DriverEvent::PreviewFrame(frame) => {
            if state == DeviceState::PreviewRunning {
                delivery::on_preview_frame(shared, frame);
            } else {
                shared.delivery.lock().counters.dropped_frames += 1;
                trace!(
                    "preview frame {} outside streaming ({state}); recycled",
                    frame.index
                );
                delivery::requeue(shared, frame);
            }
        }
        DriverEvent::RawReady(frame) => match state {
            DeviceState::CaptureStopping => {
                debug!("raw frame {} dropped during capture stop", frame.index);
            }
            DeviceState::WaitingRaw => {
                delivery::on_raw(shared, frame);
                // Advance only once the client callback has returned.
                shared
                    .state
                    .transition(DeviceState::WaitingRaw, DeviceState::WaitingJpeg);
            }
            _ => {
                shared
                    .state
                    .transition(DeviceState::WaitingRaw, DeviceState::WaitingJpeg);
            }
        },
        DriverEvent::JpegFragment { bytes, last } => {
            delivery::on_jpeg_fragment(shared, &bytes);
            if last {
                delivery::finalize_jpeg(shared);
                shared
                    .state
                    .transition(DeviceState::WaitingJpeg, DeviceState::Idle);
            }
        }
        DriverEvent::JpegDone { bytes } => {
            delivery::on_jpeg_fragment(shared, &bytes);
            delivery::finalize_jpeg(shared);
            // The raw stage is skipped on the combined path, so the capture
            // may still be parked in WaitingRaw here.
            let from = if shared.state.get() == DeviceState::WaitingJpeg {
                DeviceState::WaitingJpeg
            } else {
                DeviceState::WaitingRaw
            };
            shared.state.transition(from, DeviceState::Idle);
        }
        DriverEvent::CaptureDone => match state {
            DeviceState::Idle => trace!("capture completion ack"),
            DeviceState::CaptureStopping => {
                // The capture completed before the cancel reached the driver.
                shared
                    .state
                    .transition(DeviceState::CaptureStopping, DeviceState::Idle);
            }
            other => {
                error!("capture done with no finalized payload in {other}");
                shared.state.set(DeviceState::Error);
                notify_error(shared, "capture_protocol");
            }
        },
        DriverEvent::FocusDone(outcome) => {
            // Focus failures are reported, never latched.
            let notify = shared.delivery.lock().callbacks.notify.clone();
            if let Some(cb) = notify {
                cb(Notify::Focus {
                    success: outcome == FocusOutcome::Focused,
                });
            }
        }
        DriverEvent::Fault(kind) => {
            let code = fault_code(kind);
            error!("driver fault: {code}");
            shared.state.set(DeviceState::Error);
            notify_error(shared, code);
        }
        DriverEvent::StopDone => {
            if state == DeviceState::Error {
                // Close from a latched session; Error stays absorbing.
                debug!("teardown ack while latched in error");
            } else {
                shared
                    .state
                    .transition(DeviceState::Stopping, DeviceState::Init);
            }
        }
    }
}
