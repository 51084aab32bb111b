use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, warn};

use argus_core::format::{Resolution, Rotation};
use argus_core::heap::{FrameHandle, FramePool, MetaPool, PoolId};

use super::callbacks::{CallbackTable, Notify};
use super::window::PreviewSink;
use super::{DeviceError, DeviceShared};

/// Per-session delivery counters, readable through `CameraHandle::status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeliveryCounters {
    /// Frames the driver handed back, including the start-up discard.
    pub preview_frames: u64,
    /// Frames recycled without client delivery.
    pub dropped_frames: u64,
    /// Recording frames the client returned.
    pub client_released: u64,
    /// Rejected recording releases (bad index, frame not held).
    pub client_release_errors: u64,
    /// Sink writes that failed and disconnected the sink.
    pub sink_errors: u64,
}

/// Pools owned by the active session.
#[derive(Default)]
pub(crate) struct SessionPools {
    pub(crate) preview: Option<Arc<FramePool>>,
    pub(crate) meta: Option<Arc<MetaPool>>,
    pub(crate) raw: Option<Arc<FramePool>>,
    pub(crate) jpeg: Option<Arc<FramePool>>,
    pub(crate) scratch: Option<Arc<FramePool>>,
}

/// Everything the delivery lock guards.
///
/// Held only for snapshots and counter updates; client callbacks and sink
/// writes always run with this lock released.
#[derive(Default)]
pub(crate) struct DeliveryState {
    pub(crate) callbacks: CallbackTable,
    pub(crate) sink: Option<Box<dyn PreviewSink>>,
    pub(crate) pools: SessionPools,
    pub(crate) counters: DeliveryCounters,
    pub(crate) recording: bool,
    pub(crate) metadata_mode: bool,
    /// Per preview slot: true while the client holds the frame for encoding.
    pub(crate) held: Vec<bool>,
    pub(crate) shutter_sent: bool,
    /// Append offset into the jpeg staging frame.
    pub(crate) jpeg_fill: usize,
    pub(crate) preview_size: Option<Resolution>,
    pub(crate) rotation: Rotation,
}

fn timestamp_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Hand a preview buffer back to the driver.
pub(crate) fn requeue(shared: &DeviceShared, frame: FrameHandle) {
    let Some(driver) = shared.driver.get() else {
        debug!("no driver installed; frame {} not requeued", frame.index);
        return;
    };
    if let Err(e) = driver.queue_preview_buffer(frame) {
        // Expected while a stop is in flight.
        debug!("requeue of frame {} failed: {e}", frame.index);
    }
}

/// Route one preview frame while the session is streaming.
pub(crate) fn on_preview_frame(shared: &DeviceShared, frame: FrameHandle) {
    let mut d = shared.delivery.lock();
    let Some(pool) = d.pools.preview.clone() else {
        drop(d);
        debug!("preview frame {} with no pool installed", frame.index);
        return;
    };
    if frame.index >= pool.count() {
        d.counters.dropped_frames += 1;
        error!(
            "preview frame index {} out of bounds ({} slots)",
            frame.index,
            pool.count()
        );
        return;
    }
    d.counters.preview_frames += 1;
    // The first frame after start carries stale sensor output; recycle it
    // without telling the client.
    if d.counters.preview_frames == 1 {
        d.counters.dropped_frames += 1;
        drop(d);
        requeue(shared, frame);
        return;
    }
    if d.metadata_mode
        && let Some(meta) = d.pools.meta.clone()
        && let Ok(phys) = pool.frame_phys(frame.index)
        && let Ok(virt) = pool.frame_virt(frame.index)
    {
        let _ = meta.write_record(frame.index, phys, virt);
    }
    let preview_cb = d.callbacks.preview.clone();
    let video_cb = d.callbacks.video.clone();
    let recording = d.recording;
    let metadata_mode = d.metadata_mode;
    let meta = d.pools.meta.clone();
    let size = d.preview_size;
    let rotation = d.rotation;
    let sink = d.sink.take();
    drop(d);

    let bytes = match pool.read_frame(frame.index, |buf| buf.to_vec()) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("preview frame {} read failed: {e}", frame.index);
            requeue(shared, frame);
            return;
        }
    };

    if let Some(mut sink) = sink {
        let wrote = match size {
            Some(size) => sink.write_frame(&bytes, size, rotation),
            None => Ok(()),
        };
        let mut d = shared.delivery.lock();
        match wrote {
            Ok(()) => {
                // The client may have swapped in a new sink meanwhile.
                if d.sink.is_none() {
                    d.sink = Some(sink);
                }
            }
            Err(e) => {
                d.counters.sink_errors += 1;
                warn!("preview sink write failed: {e}; sink disconnected");
            }
        }
    }

    if let Some(cb) = preview_cb {
        cb(frame, &bytes);
    }

    if recording && let Some(cb) = video_cb {
        // Mark the frame client-held before the callback so a release from
        // inside it is already valid.
        {
            let mut d = shared.delivery.lock();
            if frame.index < d.held.len() {
                d.held[frame.index] = true;
            }
        }
        let record = if metadata_mode {
            meta.and_then(|m| m.record(frame.index).ok())
        } else {
            None
        };
        let ts = timestamp_nanos();
        match record {
            Some(record) => cb(ts, frame, &record),
            None => cb(ts, frame, &bytes),
        }
    } else {
        requeue(shared, frame);
    }
}

/// Deliver the raw stage of a still capture.
pub(crate) fn on_raw(shared: &DeviceShared, frame: FrameHandle) {
    let mut d = shared.delivery.lock();
    let notify = d.callbacks.notify.clone();
    let raw_cb = d.callbacks.raw.clone();
    let pool = d.pools.raw.clone();
    let first_shutter = !d.shutter_sent;
    d.shutter_sent = true;
    // Zoom scratch is only needed up to the raw stage.
    let scratch = d.pools.scratch.take();
    drop(d);

    if first_shutter && let Some(cb) = &notify {
        cb(Notify::Shutter);
    }

    match pool {
        Some(pool) if frame.index < pool.count() => {
            if let Some(cb) = raw_cb
                && let Ok(bytes) = pool.read_frame(frame.index, |buf| buf.to_vec())
            {
                cb(frame, &bytes);
            }
        }
        Some(pool) => {
            error!(
                "raw frame index {} out of bounds ({} slots); skipping callback",
                frame.index,
                pool.count()
            );
        }
        None => error!("raw frame with no capture pool installed"),
    }

    if let Some(scratch) = scratch {
        scratch.free_all();
    }
}

/// Append encoder output to the staging frame.
pub(crate) fn on_jpeg_fragment(shared: &DeviceShared, bytes: &[u8]) {
    let (staging, offset) = {
        let d = shared.delivery.lock();
        (d.pools.jpeg.clone(), d.jpeg_fill)
    };
    let Some(staging) = staging else {
        error!("jpeg fragment with no staging pool installed");
        return;
    };
    match staging.write_at(0, offset, bytes) {
        Ok(written) => {
            if written < bytes.len() {
                error!(
                    "jpeg staging overflow: kept {written} of {} fragment bytes",
                    bytes.len()
                );
            }
            shared.delivery.lock().jpeg_fill = offset + written;
        }
        Err(e) => error!("jpeg staging write failed: {e}"),
    }
}

/// Complete a still capture: deliver the encoded payload and drop the
/// per-shot pools. The caller settles the state afterwards.
pub(crate) fn finalize_jpeg(shared: &DeviceShared) {
    let mut d = shared.delivery.lock();
    let staging = d.pools.jpeg.take();
    let raw = d.pools.raw.take();
    let scratch = d.pools.scratch.take();
    let len = d.jpeg_fill;
    d.jpeg_fill = 0;
    let first_shutter = !d.shutter_sent;
    d.shutter_sent = false;
    let notify = d.callbacks.notify.clone();
    let compressed = d.callbacks.compressed.clone();
    drop(d);

    // On the combined path the raw stage never ran, so the shutter is due now.
    if first_shutter && let Some(cb) = &notify {
        cb(Notify::Shutter);
    }

    match &staging {
        Some(staging) => match staging.copy_frame(0, len) {
            Ok(payload) => {
                if let Some(cb) = compressed {
                    let frame = FrameHandle {
                        pool: PoolId::JpegStaging,
                        index: 0,
                    };
                    cb(frame, &payload);
                }
            }
            Err(e) => error!("jpeg finalize read failed: {e}"),
        },
        None => error!("jpeg finalize with no staging pool installed"),
    }

    for pool in [staging, raw, scratch].into_iter().flatten() {
        pool.free_all();
    }
}

/// Return a recording frame the client has finished encoding.
pub(crate) fn release_recording(
    shared: &DeviceShared,
    index: usize,
) -> Result<(), DeviceError> {
    let mut d = shared.delivery.lock();
    let Some(pool) = d.pools.preview.clone() else {
        d.counters.client_release_errors += 1;
        error!("recording release of frame {index} with no preview session");
        return Err(DeviceError::BadRelease {
            index,
            reason: "no preview session",
        });
    };
    if index >= pool.count() || index >= d.held.len() {
        d.counters.client_release_errors += 1;
        error!(
            "recording release of frame {index} out of bounds ({} slots)",
            pool.count()
        );
        return Err(DeviceError::BadRelease {
            index,
            reason: "index out of bounds",
        });
    }
    if !d.held[index] {
        d.counters.client_release_errors += 1;
        error!("recording release of frame {index} that the client does not hold");
        return Err(DeviceError::BadRelease {
            index,
            reason: "frame not held",
        });
    }
    d.held[index] = false;
    d.counters.client_released += 1;
    drop(d);
    requeue(
        shared,
        FrameHandle {
            pool: PoolId::Preview,
            index,
        },
    );
    Ok(())
}

/// Drop preview-session resources and reset the per-session counters.
pub(crate) fn teardown_preview(d: &mut DeliveryState) {
    if let Some(pool) = d.pools.preview.take() {
        pool.free_all();
    }
    d.pools.meta = None;
    d.held.clear();
    d.preview_size = None;
    d.recording = false;
    d.counters = DeliveryCounters::default();
}

/// Drop per-shot capture resources.
pub(crate) fn teardown_capture(d: &mut DeliveryState) {
    for pool in [
        d.pools.raw.take(),
        d.pools.jpeg.take(),
        d.pools.scratch.take(),
    ]
    .into_iter()
    .flatten()
    {
        pool.free_all();
    }
    d.jpeg_fill = 0;
    d.shutter_sent = false;
}
