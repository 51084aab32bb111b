//! Deterministic in-process driver used to exercise the control plane.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use log::{debug, trace};
use parking_lot::Mutex;

use argus_core::prelude::*;

use crate::{
    CameraDriver, CapturePools, DeviceInfo, DriverError, DriverEvent, EventSink, FaultKind,
    FocusOutcome,
};

type SharedSink = Arc<dyn Fn(DriverEvent) + Send + Sync>;

/// Behavior knobs for [`SimDriver`].
#[derive(Debug, Clone)]
pub struct SimKnobs {
    /// Pacing between emitted frames and capture steps.
    pub frame_interval: Duration,
    /// Emit the whole payload as one `JpegDone` instead of fragments.
    pub combined_jpeg: bool,
    /// Total encoded payload length per capture.
    pub jpeg_len: usize,
    /// Fragment size on the fragment path.
    pub fragment_len: usize,
    /// Report autofocus as failed.
    pub fail_focus: bool,
    /// Emit this fault instead of acknowledging a preview start.
    pub fault_on_start: Option<FaultKind>,
    /// Emit this fault instead of running a capture.
    pub fault_on_capture: Option<FaultKind>,
    /// Accept operations but emit no completions at all. For exercising
    /// waiter timeouts.
    pub silent: bool,
}

impl Default for SimKnobs {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(2),
            combined_jpeg: false,
            jpeg_len: 2048,
            fragment_len: 512,
            fail_focus: false,
            fault_on_start: None,
            fault_on_capture: None,
            silent: false,
        }
    }
}

/// Whether a stopped worker acknowledges with `Stopped` or goes quietly.
/// Teardown stays quiet; `StopDone` is the only ack the close path wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    Ack,
    Quiet,
}

struct Worker {
    stop_tx: mpsc::Sender<StopMode>,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn stop(self, mode: StopMode) {
        let _ = self.stop_tx.send(mode);
        let _ = self.thread.join();
    }
}

struct PreviewSession {
    worker: Worker,
    queue: Arc<ArrayQueue<FrameHandle>>,
}

/// In-process driver with scripted completions.
///
/// Preview runs a paced fill thread: each queued buffer is filled with a
/// counter pattern and reported as `PreviewFrame`. Capture runs a scripted
/// thread through `Started`, `RawReady`, then either jpeg fragments or a
/// single `JpegDone`, then `CaptureDone`.
pub struct SimDriver {
    info: DeviceInfo,
    sink: SharedSink,
    knobs: SimKnobs,
    preview: Mutex<Option<PreviewSession>>,
    capture: Mutex<Option<Worker>>,
    pools: Mutex<Option<CapturePools>>,
    pushed: Mutex<Vec<(ControlKey, ControlCode)>>,
    zones: Mutex<Vec<FocusZone>>,
    position: Mutex<Option<GpsPosition>>,
    frame_seq: Arc<AtomicU64>,
    af_generation: Arc<AtomicU64>,
}

impl SimDriver {
    pub fn new(info: DeviceInfo, sink: EventSink) -> Self {
        Self::with_knobs(info, sink, SimKnobs::default())
    }

    pub fn with_knobs(info: DeviceInfo, sink: EventSink, knobs: SimKnobs) -> Self {
        Self {
            info,
            sink: Arc::from(sink),
            knobs,
            preview: Mutex::new(None),
            capture: Mutex::new(None),
            pools: Mutex::new(None),
            pushed: Mutex::new(Vec::new()),
            zones: Mutex::new(Vec::new()),
            position: Mutex::new(None),
            frame_seq: Arc::new(AtomicU64::new(0)),
            af_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Control values pushed so far, in push order.
    pub fn pushed_controls(&self) -> Vec<(ControlKey, ControlCode)> {
        self.pushed.lock().clone()
    }

    pub fn focus_zones(&self) -> Vec<FocusZone> {
        self.zones.lock().clone()
    }

    pub fn position(&self) -> Option<GpsPosition> {
        self.position.lock().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.preview.lock().is_some()
    }

    fn emit(&self, event: DriverEvent) {
        if self.knobs.silent {
            return;
        }
        trace!("sim event: {}", event.kind());
        (*self.sink)(event);
    }
}

impl CameraDriver for SimDriver {
    fn descriptor(&self) -> &DeviceInfo {
        &self.info
    }

    fn start_preview(&self, pool: Arc<FramePool>) -> Result<(), DriverError> {
        let mut preview = self.preview.lock();
        if preview.is_some() {
            return Err(DriverError::AlreadyStreaming);
        }
        let queue = Arc::new(ArrayQueue::<FrameHandle>::new(pool.count().max(1)));
        let (stop_tx, stop_rx) = mpsc::channel();
        let sink = Arc::clone(&self.sink);
        let seq = Arc::clone(&self.frame_seq);
        let queue_for_thread = Arc::clone(&queue);
        let knobs = self.knobs.clone();
        let thread = thread::spawn(move || {
            let silent = knobs.silent;
            let emit = move |event: DriverEvent| {
                if !silent {
                    trace!("sim event: {}", event.kind());
                    (*sink)(event);
                }
            };
            if let Some(kind) = knobs.fault_on_start {
                emit(DriverEvent::Fault(kind));
                return;
            }
            emit(DriverEvent::Started);
            loop {
                match stop_rx.try_recv() {
                    Ok(StopMode::Ack) => {
                        emit(DriverEvent::Stopped);
                        break;
                    }
                    Ok(StopMode::Quiet) | Err(mpsc::TryRecvError::Disconnected) => break,
                    Err(mpsc::TryRecvError::Empty) => {}
                }
                if let Some(frame) = queue_for_thread.pop() {
                    let n = seq.fetch_add(1, Ordering::Relaxed);
                    let fill = pool.fill_frame(frame.index, |buf| buf.fill((n % 256) as u8));
                    if fill.is_err() {
                        emit(DriverEvent::Fault(FaultKind::OpFailed));
                        break;
                    }
                    emit(DriverEvent::PreviewFrame(frame));
                }
                thread::sleep(knobs.frame_interval);
            }
        });
        *preview = Some(PreviewSession {
            worker: Worker { stop_tx, thread },
            queue,
        });
        Ok(())
    }

    fn stop_preview(&self) -> Result<(), DriverError> {
        let session = self
            .preview
            .lock()
            .take()
            .ok_or(DriverError::NotStreaming)?;
        session.worker.stop(StopMode::Ack);
        Ok(())
    }

    fn queue_preview_buffer(&self, frame: FrameHandle) -> Result<(), DriverError> {
        let preview = self.preview.lock();
        let session = preview.as_ref().ok_or(DriverError::NotStreaming)?;
        session
            .queue
            .push(frame)
            .map_err(|_| DriverError::QueueFull)
    }

    fn set_capture_pools(&self, pools: CapturePools) -> Result<(), DriverError> {
        *self.pools.lock() = Some(pools);
        Ok(())
    }

    fn take_picture(&self) -> Result<(), DriverError> {
        let pools = self
            .pools
            .lock()
            .clone()
            .ok_or(DriverError::NoCapturePools)?;
        let mut capture = self.capture.lock();
        if let Some(worker) = capture.take() {
            if !worker.thread.is_finished() {
                *capture = Some(worker);
                return Err(DriverError::Rejected("capture already in flight"));
            }
            let _ = worker.thread.join();
        }
        let (stop_tx, stop_rx) = mpsc::channel();
        let sink = Arc::clone(&self.sink);
        let seq = Arc::clone(&self.frame_seq);
        let knobs = self.knobs.clone();
        let thread = thread::spawn(move || run_capture(pools, sink, knobs, seq, stop_rx));
        *capture = Some(Worker { stop_tx, thread });
        Ok(())
    }

    fn cancel_capture(&self) -> Result<(), DriverError> {
        // Take the worker out before joining so the event thread can still
        // reach the driver while we wait for it.
        let worker = self.capture.lock().take();
        match worker {
            Some(worker) if !worker.thread.is_finished() => worker.stop(StopMode::Ack),
            Some(worker) => {
                // Completed before the cancel; reap it and ack ourselves.
                worker.stop(StopMode::Quiet);
                self.emit(DriverEvent::Stopped);
            }
            None => self.emit(DriverEvent::Stopped),
        }
        Ok(())
    }

    fn auto_focus(&self) -> Result<(), DriverError> {
        let sink = Arc::clone(&self.sink);
        let knobs = self.knobs.clone();
        let generation = Arc::clone(&self.af_generation);
        let started_at = generation.load(Ordering::Acquire);
        thread::spawn(move || {
            thread::sleep(knobs.frame_interval);
            if generation.load(Ordering::Acquire) != started_at {
                return;
            }
            if !knobs.silent {
                let outcome = if knobs.fail_focus {
                    FocusOutcome::Failed
                } else {
                    FocusOutcome::Focused
                };
                trace!("sim event: focus_done");
                (*sink)(DriverEvent::FocusDone(outcome));
            }
        });
        Ok(())
    }

    fn cancel_auto_focus(&self) -> Result<(), DriverError> {
        self.af_generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn push_control(&self, key: ControlKey, value: ControlCode) -> Result<(), DriverError> {
        debug!("sim control push {key:?} = {value}");
        self.pushed.lock().push((key, value));
        Ok(())
    }

    fn set_focus_zones(&self, zones: &[FocusZone]) -> Result<(), DriverError> {
        *self.zones.lock() = zones.to_vec();
        Ok(())
    }

    fn set_position(&self, position: &GpsPosition) -> Result<(), DriverError> {
        debug!(
            "sim position lat={} lon={} alt={}",
            position.latitude, position.longitude, position.altitude
        );
        *self.position.lock() = Some(position.clone());
        Ok(())
    }

    fn stop(&self) -> Result<(), DriverError> {
        let preview = self.preview.lock().take();
        if let Some(session) = preview {
            session.worker.stop(StopMode::Quiet);
        }
        let capture = self.capture.lock().take();
        if let Some(worker) = capture {
            worker.stop(StopMode::Quiet);
        }
        self.emit(DriverEvent::StopDone);
        Ok(())
    }
}

impl Drop for SimDriver {
    fn drop(&mut self) {
        if let Some(session) = self.preview.get_mut().take() {
            session.worker.stop(StopMode::Quiet);
        }
        if let Some(worker) = self.capture.get_mut().take() {
            worker.stop(StopMode::Quiet);
        }
    }
}

fn run_capture(
    pools: CapturePools,
    sink: SharedSink,
    knobs: SimKnobs,
    seq: Arc<AtomicU64>,
    stop_rx: mpsc::Receiver<StopMode>,
) {
    let silent = knobs.silent;
    let emit = move |event: DriverEvent| {
        if !silent {
            trace!("sim event: {}", event.kind());
            (*sink)(event);
        }
    };
    let stopped = |stop_rx: &mpsc::Receiver<StopMode>| match stop_rx.try_recv() {
        Ok(StopMode::Ack) => {
            emit(DriverEvent::Stopped);
            true
        }
        Ok(StopMode::Quiet) | Err(mpsc::TryRecvError::Disconnected) => true,
        Err(mpsc::TryRecvError::Empty) => false,
    };

    if let Some(kind) = knobs.fault_on_capture {
        emit(DriverEvent::Fault(kind));
        return;
    }
    emit(DriverEvent::Started);
    thread::sleep(knobs.frame_interval);
    if stopped(&stop_rx) {
        return;
    }
    let jpeg = sim_jpeg(knobs.jpeg_len, seq.fetch_add(1, Ordering::Relaxed));
    if knobs.combined_jpeg {
        emit(DriverEvent::JpegDone { bytes: jpeg });
    } else {
        let raw = FrameHandle {
            pool: PoolId::Raw,
            index: 0,
        };
        let n = seq.fetch_add(1, Ordering::Relaxed);
        let fill = pools.raw.fill_frame(raw.index, |buf| buf.fill((n % 256) as u8));
        if fill.is_err() {
            emit(DriverEvent::Fault(FaultKind::OpFailed));
            return;
        }
        emit(DriverEvent::RawReady(raw));
        thread::sleep(knobs.frame_interval);
        let step = knobs.fragment_len.max(1);
        let mut offset = 0;
        while offset < jpeg.len() {
            if stopped(&stop_rx) {
                return;
            }
            let end = (offset + step).min(jpeg.len());
            emit(DriverEvent::JpegFragment {
                bytes: jpeg[offset..end].to_vec(),
                last: end == jpeg.len(),
            });
            offset = end;
        }
    }
    if stopped(&stop_rx) {
        return;
    }
    emit(DriverEvent::CaptureDone);
}

/// Deterministic stand-in payload with SOI/EOI markers stamped on.
fn sim_jpeg(len: usize, seed: u64) -> Vec<u8> {
    let len = len.max(4);
    let mut bytes = vec![(seed % 256) as u8; len];
    bytes[0] = 0xFF;
    bytes[1] = 0xD8;
    bytes[len - 2] = 0xFF;
    bytes[len - 1] = 0xD9;
    bytes
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::Receiver;
    use std::time::Instant;

    use crate::enumerate;

    use super::*;

    fn channel_sink() -> (EventSink, Receiver<DriverEvent>) {
        let (tx, rx) = mpsc::channel();
        let sink: EventSink = Box::new(move |event| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    fn fast_knobs() -> SimKnobs {
        SimKnobs {
            frame_interval: Duration::from_millis(1),
            ..SimKnobs::default()
        }
    }

    fn preview_pool() -> Arc<FramePool> {
        let res = Resolution::new(176, 144).unwrap();
        Arc::new(FramePool::new(PoolId::Preview, 4, preview_frame_len(res)).unwrap())
    }

    fn capture_pools() -> CapturePools {
        let res = Resolution::new(640, 480).unwrap();
        let raw_len = raw_frame_len(res, false).unwrap();
        CapturePools {
            raw: Arc::new(FramePool::new(PoolId::Raw, 1, raw_len).unwrap()),
            jpeg_staging: Arc::new(
                FramePool::new(PoolId::JpegStaging, 1, jpeg_staging_len(res, false).unwrap())
                    .unwrap(),
            ),
            scratch: None,
        }
    }

    fn recv_until(
        rx: &Receiver<DriverEvent>,
        mut done: impl FnMut(&DriverEvent) -> bool,
    ) -> Vec<DriverEvent> {
        let mut events = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
                let hit = done(&event);
                events.push(event);
                if hit {
                    return events;
                }
            }
        }
        panic!("timed out waiting for events; got {events:?}");
    }

    #[test]
    fn preview_starts_frames_and_stops() {
        let (sink, rx) = channel_sink();
        let driver = SimDriver::with_knobs(enumerate()[0], sink, fast_knobs());
        let pool = preview_pool();
        driver.start_preview(Arc::clone(&pool)).unwrap();
        assert!(matches!(
            driver.start_preview(Arc::clone(&pool)),
            Err(DriverError::AlreadyStreaming)
        ));
        for frame in pool.claim_all() {
            driver.queue_preview_buffer(frame).unwrap();
        }
        let events = recv_until(&rx, |e| matches!(e, DriverEvent::PreviewFrame(_)));
        assert_eq!(events[0], DriverEvent::Started);
        driver.stop_preview().unwrap();
        let tail = recv_until(&rx, |e| matches!(e, DriverEvent::Stopped));
        assert_eq!(tail.last(), Some(&DriverEvent::Stopped));
        assert!(!driver.is_streaming());
    }

    #[test]
    fn fragment_capture_reassembles_the_payload() {
        let (sink, rx) = channel_sink();
        let driver = SimDriver::with_knobs(enumerate()[0], sink, fast_knobs());
        driver.set_capture_pools(capture_pools()).unwrap();
        driver.take_picture().unwrap();
        let events = recv_until(&rx, |e| matches!(e, DriverEvent::CaptureDone));
        assert_eq!(events[0], DriverEvent::Started);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, DriverEvent::RawReady(_)))
        );
        let mut payload = Vec::new();
        let mut finals = 0;
        for event in &events {
            if let DriverEvent::JpegFragment { bytes, last } = event {
                payload.extend_from_slice(bytes);
                finals += usize::from(*last);
            }
        }
        assert_eq!(finals, 1);
        assert_eq!(payload.len(), 2048);
        assert_eq!(&payload[..2], &[0xFF, 0xD8]);
        assert_eq!(&payload[2046..], &[0xFF, 0xD9]);
    }

    #[test]
    fn combined_capture_skips_the_raw_stage() {
        let (sink, rx) = channel_sink();
        let knobs = SimKnobs {
            combined_jpeg: true,
            ..fast_knobs()
        };
        let driver = SimDriver::with_knobs(enumerate()[0], sink, knobs);
        driver.set_capture_pools(capture_pools()).unwrap();
        driver.take_picture().unwrap();
        let events = recv_until(&rx, |e| matches!(e, DriverEvent::CaptureDone));
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, DriverEvent::RawReady(_)))
        );
        let whole = events
            .iter()
            .find_map(|e| match e {
                DriverEvent::JpegDone { bytes } => Some(bytes.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(whole.len(), 2048);
        assert_eq!(&whole[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn capture_without_pools_is_rejected() {
        let (sink, _rx) = channel_sink();
        let driver = SimDriver::with_knobs(enumerate()[0], sink, fast_knobs());
        assert!(matches!(
            driver.take_picture(),
            Err(DriverError::NoCapturePools)
        ));
    }

    #[test]
    fn fault_knob_preempts_the_capture() {
        let (sink, rx) = channel_sink();
        let knobs = SimKnobs {
            fault_on_capture: Some(FaultKind::DspAbort),
            ..fast_knobs()
        };
        let driver = SimDriver::with_knobs(enumerate()[0], sink, knobs);
        driver.set_capture_pools(capture_pools()).unwrap();
        driver.take_picture().unwrap();
        let events = recv_until(&rx, |e| matches!(e, DriverEvent::Fault(_)));
        assert_eq!(events, vec![DriverEvent::Fault(FaultKind::DspAbort)]);
    }

    #[test]
    fn focus_reports_the_knob_outcome() {
        let (sink, rx) = channel_sink();
        let knobs = SimKnobs {
            fail_focus: true,
            ..fast_knobs()
        };
        let driver = SimDriver::with_knobs(enumerate()[0], sink, knobs);
        driver.auto_focus().unwrap();
        let events = recv_until(&rx, |e| matches!(e, DriverEvent::FocusDone(_)));
        assert_eq!(
            events.last(),
            Some(&DriverEvent::FocusDone(FocusOutcome::Failed))
        );
    }

    #[test]
    fn cancelled_focus_stays_silent() {
        let (sink, rx) = channel_sink();
        let knobs = SimKnobs {
            frame_interval: Duration::from_millis(20),
            ..SimKnobs::default()
        };
        let driver = SimDriver::with_knobs(enumerate()[0], sink, knobs);
        driver.auto_focus().unwrap();
        driver.cancel_auto_focus().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn teardown_acks_quietly_with_stop_done() {
        let (sink, rx) = channel_sink();
        let driver = SimDriver::with_knobs(enumerate()[0], sink, fast_knobs());
        driver.start_preview(preview_pool()).unwrap();
        driver.stop().unwrap();
        let events = recv_until(&rx, |e| matches!(e, DriverEvent::StopDone));
        assert!(!events.contains(&DriverEvent::Stopped));
        assert_eq!(events.last(), Some(&DriverEvent::StopDone));
    }

    #[test]
    fn silent_knob_swallows_completions() {
        let (sink, rx) = channel_sink();
        let knobs = SimKnobs {
            silent: true,
            ..fast_knobs()
        };
        let driver = SimDriver::with_knobs(enumerate()[0], sink, knobs);
        let pool = preview_pool();
        driver.start_preview(Arc::clone(&pool)).unwrap();
        for frame in pool.claim_all() {
            driver.queue_preview_buffer(frame).unwrap();
        }
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn control_pushes_are_recorded_in_order() {
        let (sink, _rx) = channel_sink();
        let driver = SimDriver::with_knobs(enumerate()[0], sink, fast_knobs());
        driver.push_control(ControlKey::Zoom, 3).unwrap();
        driver.push_control(ControlKey::Brightness, 5).unwrap();
        assert_eq!(
            driver.pushed_controls(),
            vec![(ControlKey::Zoom, 3), (ControlKey::Brightness, 5)]
        );
    }
}
