use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use argus_core::heap::{
    FrameHandle, FramePool, MetaPool, PoolId, jpeg_staging_len, preview_frame_len, raw_frame_len,
    scratch_frame_len,
};
use argus_core::params::{ParamStore, SessionConfig};
use argus_driver::{CameraDriver, CapturePools, DeviceInfo};

use super::callbacks::CallbackTable;
use super::delivery::{self, DeliveryCounters};
use super::state::DeviceState;
use super::window::PreviewSink;
use super::{DeviceError, DeviceShared, tunables};

/// Legacy pass-through command: start face detection. The pipeline has no
/// detector, so this is the one command that is rejected rather than ignored.
pub const CMD_START_FACE_DETECTION: i32 = 6;

/// Point-in-time session snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceStatus {
    pub state: DeviceState,
    pub counters: DeliveryCounters,
    pub recording: bool,
    pub metadata_mode: bool,
    /// Preview slots currently claimed by the driver or the client.
    pub preview_in_flight: usize,
}

/// Blocking control-plane handle for one open device.
///
/// Operations are serialized by an internal operation lock and block until
/// the driver's completion settles the state machine. Frame traffic never
/// takes that lock, so delivery keeps flowing while an operation waits.
///
/// # Example
/// ```rust,ignore
/// use argus::prelude::*;
///
/// let handle = OpenRequest::new(0)
///     .callbacks(CallbackTable::new().on_compressed_image(|_f, jpeg| {
///         println!("still: {} bytes", jpeg.len());
///     }))
///     .open_sim()?;
/// handle.start_preview()?;
/// handle.take_picture()?;
/// handle.close();
/// # Ok::<(), argus::device_api::DeviceError>(())
/// ```
pub struct CameraHandle {
    shared: Arc<DeviceShared>,
    driver: Arc<dyn CameraDriver>,
    /// Serializes client operations; never touched by the dispatcher.
    op: Mutex<()>,
    params: Mutex<ParamStore>,
    config: Mutex<SessionConfig>,
    state_wait: Duration,
    closed: AtomicBool,
}

impl CameraHandle {
    pub(crate) fn assemble(
        shared: Arc<DeviceShared>,
        driver: Arc<dyn CameraDriver>,
        params: ParamStore,
        config: SessionConfig,
        state_wait: Duration,
    ) -> Self {
        Self {
            shared,
            driver,
            op: Mutex::new(()),
            params: Mutex::new(params),
            config: Mutex::new(config),
            state_wait,
            closed: AtomicBool::new(false),
        }
    }

    pub fn info(&self) -> DeviceInfo {
        self.shared.info
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.closed.load(Ordering::Acquire) {
            Err(DeviceError::Closed)
        } else {
            Ok(())
        }
    }

    fn wait_settled(
        &self,
        targets: &[DeviceState],
        op: &'static str,
    ) -> Result<DeviceState, DeviceError> {
        let settled = self.shared.state.wait_settled_for(targets, self.state_wait);
        if settled == DeviceState::Error {
            Err(DeviceError::Fault { op })
        } else {
            Ok(settled)
        }
    }

    /// Begin streaming preview frames. A no-op when preview already runs.
    pub fn start_preview(&self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let _op = self.op.lock();
        self.start_preview_locked()
    }

    fn start_preview_locked(&self) -> Result<(), DeviceError> {
        match self.shared.state.get() {
            DeviceState::PreviewRunning => return Ok(()),
            DeviceState::Idle => {}
            other => {
                return Err(DeviceError::InvalidState {
                    op: "start_preview",
                    state: other,
                });
            }
        }
        let config = self.config.lock().clone();
        let count = config.preview_buffer_count(tunables::preview_buffers());
        let frame_len = preview_frame_len(config.preview_size);
        let pool = Arc::new(FramePool::new(PoolId::Preview, count, frame_len)?);
        {
            let mut d = self.shared.delivery.lock();
            let meta = d
                .metadata_mode
                .then(|| Arc::new(MetaPool::new(count)));
            d.pools.preview = Some(Arc::clone(&pool));
            d.pools.meta = meta;
            d.held = vec![false; count];
            d.preview_size = Some(config.preview_size);
            d.rotation = config.copy_rotation();
            d.counters = DeliveryCounters::default();
        }
        debug!("preview pool: {count} slots x {frame_len} bytes");
        self.shared.state.set(DeviceState::PreviewStarting);
        if let Err(e) = self.driver.start_preview(Arc::clone(&pool)) {
            self.abort_preview_setup();
            return Err(e.into());
        }
        for frame in pool.claim_all() {
            if let Err(e) = self.driver.queue_preview_buffer(frame) {
                let _ = self.driver.stop_preview();
                self.abort_preview_setup();
                return Err(e.into());
            }
        }
        self.wait_settled(&[DeviceState::PreviewRunning], "start_preview")?;
        info!("preview running at {}", config.preview_size);
        Ok(())
    }

    fn abort_preview_setup(&self) {
        {
            let mut d = self.shared.delivery.lock();
            delivery::teardown_preview(&mut d);
        }
        self.shared.state.set(DeviceState::Error);
    }

    /// Stop preview streaming and release the preview pools.
    ///
    /// A no-op when preview is not live. Clears the per-session delivery
    /// counters.
    pub fn stop_preview(&self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let _op = self.op.lock();
        self.stop_preview_locked()
    }

    fn stop_preview_locked(&self) -> Result<(), DeviceError> {
        match self.shared.state.get() {
            DeviceState::PreviewStarting => {
                // Let the start ack land so the stop pairs with it.
                self.wait_settled(&[DeviceState::PreviewRunning], "stop_preview")?;
            }
            DeviceState::PreviewRunning => {}
            _ => return Ok(()),
        }
        self.shared.state.set(DeviceState::PreviewStopping);
        if let Err(e) = self.driver.stop_preview() {
            self.shared.state.set(DeviceState::Error);
            return Err(e.into());
        }
        self.wait_settled(&[DeviceState::Idle], "stop_preview")?;
        let mut d = self.shared.delivery.lock();
        delivery::teardown_preview(&mut d);
        Ok(())
    }

    /// Capture one still.
    ///
    /// Stops preview first when it is live, allocates the per-shot pools,
    /// and returns once the driver has accepted the capture; the payload
    /// arrives on the compressed-image callback.
    pub fn take_picture(&self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let _op = self.op.lock();
        self.take_picture_locked()
    }

    fn take_picture_locked(&self) -> Result<(), DeviceError> {
        if self.shared.state.get().preview_live() {
            self.stop_preview_locked()?;
        }
        if matches!(
            self.shared.state.get(),
            DeviceState::WaitingRaw | DeviceState::WaitingJpeg
        ) {
            // A previous capture is still settling.
            self.wait_settled(&[DeviceState::Idle], "take_picture")?;
        }
        match self.shared.state.get() {
            DeviceState::Idle => {}
            other => {
                return Err(DeviceError::InvalidState {
                    op: "take_picture",
                    state: other,
                });
            }
        }
        let config = self.config.lock().clone();
        let large_raw = self.shared.info.large_raw;
        let raw_len = raw_frame_len(config.picture_size, large_raw)?;
        let staging_len = jpeg_staging_len(config.picture_size, large_raw)?;
        let raw = Arc::new(FramePool::new(PoolId::Raw, 1, raw_len)?);
        let staging = Arc::new(FramePool::new(PoolId::JpegStaging, 1, staging_len)?);
        let scratch = if config.zoom_level > 0 {
            let len = scratch_frame_len(config.picture_size, config.zoom_level);
            Some(Arc::new(FramePool::new(PoolId::Scratch, 2, len)?))
        } else {
            None
        };
        if let Some(gps) = &config.gps {
            self.driver.set_position(gps)?;
        }
        raw.claim_all();
        staging.claim_all();
        {
            let mut d = self.shared.delivery.lock();
            d.pools.raw = Some(Arc::clone(&raw));
            d.pools.jpeg = Some(Arc::clone(&staging));
            d.pools.scratch = scratch.clone();
            d.jpeg_fill = 0;
            d.shutter_sent = false;
        }
        debug!("capture pools: raw {raw_len}, staging {staging_len}");
        self.shared.state.set(DeviceState::RawRequested);
        let submitted = self
            .driver
            .set_capture_pools(CapturePools {
                raw,
                jpeg_staging: staging,
                scratch,
            })
            .and_then(|()| self.driver.take_picture());
        if let Err(e) = submitted {
            {
                let mut d = self.shared.delivery.lock();
                delivery::teardown_capture(&mut d);
            }
            self.shared.state.set(DeviceState::Error);
            return Err(e.into());
        }
        self.wait_settled(
            &[
                DeviceState::WaitingRaw,
                DeviceState::WaitingJpeg,
                DeviceState::Idle,
            ],
            "take_picture",
        )?;
        Ok(())
    }

    /// Cancel an in-flight still capture. A no-op when none is in flight.
    pub fn cancel_picture(&self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let _op = self.op.lock();
        self.cancel_picture_locked()
    }

    fn cancel_picture_locked(&self) -> Result<(), DeviceError> {
        if !self.shared.state.get().capture_live() {
            return Ok(());
        }
        self.shared.state.set(DeviceState::CaptureStopping);
        if let Err(e) = self.driver.cancel_capture() {
            self.shared.state.set(DeviceState::Error);
            return Err(e.into());
        }
        self.wait_settled(&[DeviceState::Idle], "cancel_picture")?;
        let mut d = self.shared.delivery.lock();
        delivery::teardown_capture(&mut d);
        Ok(())
    }

    /// Enter recording mode, starting preview first when needed.
    ///
    /// While recording, frames handed to the video callback stay client-owned
    /// until [`CameraHandle::release_recording_frame`] returns them.
    pub fn start_recording(&self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let _op = self.op.lock();
        if self.shared.state.get() != DeviceState::PreviewRunning {
            self.start_preview_locked()?;
        }
        let stale: Vec<usize> = {
            let mut d = self.shared.delivery.lock();
            d.recording = true;
            d.held
                .iter_mut()
                .enumerate()
                .filter_map(|(index, held)| {
                    std::mem::take(held).then_some(index)
                })
                .collect()
        };
        // Frames a previous recording session left with the client go back
        // to the driver so the ring never starves.
        for index in stale {
            delivery::requeue(
                &self.shared,
                FrameHandle {
                    pool: PoolId::Preview,
                    index,
                },
            );
        }
        info!("recording started");
        Ok(())
    }

    /// Leave recording mode; preview keeps running.
    pub fn stop_recording(&self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let _op = self.op.lock();
        self.shared.delivery.lock().recording = false;
        info!("recording stopped");
        Ok(())
    }

    pub fn recording_enabled(&self) -> bool {
        self.shared.state.get() == DeviceState::PreviewRunning
            && self.shared.delivery.lock().recording
    }

    /// Return a recording frame the client has finished with.
    ///
    /// Deliberately takes no operation lock: encoders release from inside
    /// the video callback, which runs on the driver's event thread.
    pub fn release_recording_frame(&self, index: usize) -> Result<(), DeviceError> {
        self.ensure_open()?;
        delivery::release_recording(&self.shared, index)
    }

    /// Start an autofocus sweep; the outcome arrives as [`super::Notify::Focus`].
    pub fn auto_focus(&self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let _op = self.op.lock();
        let state = self.shared.state.get();
        if matches!(state, DeviceState::Error | DeviceState::Stopping) {
            return Err(DeviceError::InvalidState {
                op: "auto_focus",
                state,
            });
        }
        self.driver.auto_focus()?;
        Ok(())
    }

    /// Abandon an autofocus sweep; its callback is suppressed.
    pub fn cancel_auto_focus(&self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let _op = self.op.lock();
        self.driver.cancel_auto_focus()?;
        Ok(())
    }

    /// Validate and apply a parameter block.
    ///
    /// The store is published even when validation fails, so strict-mode
    /// resets (flash, focus) read back through [`CameraHandle::parameters`].
    /// On success the validated control block is pushed to the driver.
    pub fn set_parameters(&self, params: ParamStore) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let _op = self.op.lock();
        let mut store = params;
        let validated =
            store.to_session_config(self.shared.info.mount, self.shared.info.facing.is_mirrored());
        *self.params.lock() = store;
        let config = validated?;
        for (key, code) in config.control_pushes() {
            self.driver.push_control(key, code)?;
        }
        self.driver.set_focus_zones(&config.focus_zones)?;
        if let Some(gps) = &config.gps {
            self.driver.set_position(gps)?;
        }
        self.shared.delivery.lock().rotation = config.copy_rotation();
        *self.config.lock() = config;
        Ok(())
    }

    /// Current parameter block, including any strict-mode resets.
    pub fn parameters(&self) -> ParamStore {
        self.params.lock().clone()
    }

    /// Switch the video callback payload between frame bytes and packed
    /// buffer-descriptor records. Only allowed while preview is down.
    pub fn store_meta_data_in_buffers(&self, enabled: bool) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let _op = self.op.lock();
        let state = self.shared.state.get();
        if state.preview_live() {
            return Err(DeviceError::InvalidState {
                op: "store_meta_data_in_buffers",
                state,
            });
        }
        self.shared.delivery.lock().metadata_mode = enabled;
        Ok(())
    }

    /// Install or replace the preview sink.
    pub fn set_preview_sink(&self, sink: Box<dyn PreviewSink>) {
        self.shared.delivery.lock().sink = Some(sink);
    }

    pub fn clear_preview_sink(&self) {
        self.shared.delivery.lock().sink = None;
    }

    /// Replace the client callback table.
    pub fn set_callbacks(&self, callbacks: CallbackTable) {
        self.shared.delivery.lock().callbacks = callbacks;
    }

    /// Legacy command channel. Everything is accepted and ignored except
    /// face-detection start, which the pipeline cannot do.
    pub fn send_command(&self, command: i32, _arg1: i32, _arg2: i32) -> Result<(), DeviceError> {
        self.ensure_open()?;
        if command == CMD_START_FACE_DETECTION {
            return Err(DeviceError::Unsupported("face detection"));
        }
        Ok(())
    }

    /// Point-in-time snapshot of state and delivery counters.
    pub fn status(&self) -> DeviceStatus {
        let state = self.shared.state.get();
        let d = self.shared.delivery.lock();
        DeviceStatus {
            state,
            counters: d.counters,
            recording: d.recording,
            metadata_mode: d.metadata_mode,
            preview_in_flight: d
                .pools
                .preview
                .as_ref()
                .map(|p| p.in_use())
                .unwrap_or(0),
        }
    }

    /// Human-readable diagnostic dump.
    pub fn dump(&self) -> String {
        let status = self.status();
        let info = self.shared.info;
        let params = self.params.lock().flatten();
        format!(
            "device {} ({:?}, mount {})\n\
             state: {}\n\
             frames: {} preview, {} dropped, {} released, {} release errors, {} sink errors\n\
             recording: {}, metadata: {}, in flight: {}\n\
             params: {params}\n",
            info.id,
            info.facing,
            info.mount,
            status.state,
            status.counters.preview_frames,
            status.counters.dropped_frames,
            status.counters.client_released,
            status.counters.client_release_errors,
            status.counters.sink_errors,
            status.recording,
            status.metadata_mode,
            status.preview_in_flight,
        )
    }

    /// Tear the session down. Idempotent; every later operation returns
    /// `Closed`.
    pub fn close(&self) {
        let _op = self.op.lock();
        self.close_locked();
    }

    fn close_locked(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let state = self.shared.state.get();
        if state == DeviceState::Error {
            // Latched session: nothing to wait for, bring the driver down.
            let _ = self.driver.stop();
        } else {
            if state.capture_live() {
                let _ = self.cancel_picture_locked();
            }
            if self.shared.state.get().preview_live() {
                let _ = self.stop_preview_locked();
            }
            self.shared.state.set(DeviceState::Stopping);
            if self.driver.stop().is_err() {
                self.shared.state.set(DeviceState::Error);
            } else {
                let settled = self
                    .shared
                    .state
                    .wait_settled_for(&[DeviceState::Init], self.state_wait);
                if settled != DeviceState::Init {
                    warn!("close settled in {settled}");
                }
            }
        }
        let mut d = self.shared.delivery.lock();
        delivery::teardown_capture(&mut d);
        delivery::teardown_preview(&mut d);
        d.sink = None;
        // Dropping the table here releases anything the client captured in
        // its callbacks, including cycles back to this handle.
        d.callbacks = CallbackTable::default();
        drop(d);
        info!("device {} closed", self.shared.info.id);
    }
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        // Best-effort teardown when the consumer forgot to close.
        if !self.closed.load(Ordering::Acquire) {
            let _op = self.op.lock();
            self.close_locked();
        }
    }
}

impl fmt::Debug for CameraHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraHandle")
            .field("device", &self.shared.info.id)
            .field("state", &self.shared.state.get())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    use argus_core::format::{Facing, Resolution};
    use argus_core::params::{ControlKey, keys};
    use argus_driver::prelude::{SimDriver, SimKnobs};
    use argus_driver::FaultKind;

    use super::super::callbacks::Notify;
    use super::super::request::OpenRequest;
    use super::super::window::FrameWindow;
    use super::*;

    fn fast_knobs() -> SimKnobs {
        SimKnobs {
            frame_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn open_with(knobs: SimKnobs, callbacks: CallbackTable) -> CameraHandle {
        OpenRequest::new(0)
            .callbacks(callbacks)
            .open(move |info, sink| {
                let driver: Arc<dyn CameraDriver> =
                    Arc::new(SimDriver::with_knobs(info, sink, knobs));
                driver
            })
            .unwrap()
    }

    fn wait_for(deadline: Duration, mut pred: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    const DEADLINE: Duration = Duration::from_secs(2);

    #[test]
    fn preview_streams_and_discards_the_stale_first_frame() {
        let first_byte = Arc::new(StdMutex::new(None));
        let frames = Arc::new(AtomicUsize::new(0));
        let first_byte_for_cb = Arc::clone(&first_byte);
        let frames_for_cb = Arc::clone(&frames);
        let handle = open_with(
            fast_knobs(),
            CallbackTable::new().on_preview_frame(move |_frame, bytes| {
                first_byte_for_cb.lock().unwrap().get_or_insert(bytes[0]);
                frames_for_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        handle.start_preview().unwrap();
        // Idempotent while running.
        handle.start_preview().unwrap();
        assert!(wait_for(DEADLINE, || frames.load(Ordering::SeqCst) >= 3));

        let status = handle.status();
        assert_eq!(status.state, DeviceState::PreviewRunning);
        assert!(status.counters.dropped_frames >= 1);
        // The driver's first fill carries pattern byte 0 and is discarded;
        // the client's first frame is the second fill.
        assert_eq!(*first_byte.lock().unwrap(), Some(1));

        handle.stop_preview().unwrap();
        assert_eq!(handle.status().state, DeviceState::Idle);
        assert_eq!(handle.status().counters, DeliveryCounters::default());
        handle.stop_preview().unwrap();
        handle.close();
    }

    #[test]
    fn fragmented_capture_delivers_one_jpeg_after_one_shutter() {
        let stills = Arc::new(StdMutex::new(Vec::new()));
        let shutters = Arc::new(AtomicUsize::new(0));
        let stills_for_cb = Arc::clone(&stills);
        let shutters_for_cb = Arc::clone(&shutters);
        let handle = open_with(
            fast_knobs(),
            CallbackTable::new()
                .on_compressed_image(move |_frame, bytes| {
                    stills_for_cb.lock().unwrap().push(bytes.to_vec());
                })
                .on_notify(move |event| {
                    if event == Notify::Shutter {
                        shutters_for_cb.fetch_add(1, Ordering::SeqCst);
                    }
                }),
        );

        handle.start_preview().unwrap();
        handle.take_picture().unwrap();
        assert!(wait_for(DEADLINE, || !stills.lock().unwrap().is_empty()));
        assert!(wait_for(DEADLINE, || handle.status().state == DeviceState::Idle));

        let stills = stills.lock().unwrap();
        assert_eq!(stills.len(), 1);
        let jpeg = &stills[0];
        assert_eq!(jpeg.len(), 2048);
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
        assert_eq!(shutters.load(Ordering::SeqCst), 1);
        handle.close();
    }

    #[test]
    fn combined_capture_skips_the_raw_stage() {
        let stills = Arc::new(StdMutex::new(Vec::new()));
        let raws = Arc::new(AtomicUsize::new(0));
        let stills_for_cb = Arc::clone(&stills);
        let raws_for_cb = Arc::clone(&raws);
        let handle = open_with(
            SimKnobs {
                combined_jpeg: true,
                ..fast_knobs()
            },
            CallbackTable::new()
                .on_compressed_image(move |_frame, bytes| {
                    stills_for_cb.lock().unwrap().push(bytes.to_vec());
                })
                .on_raw_image(move |_frame, _bytes| {
                    raws_for_cb.fetch_add(1, Ordering::SeqCst);
                }),
        );

        handle.take_picture().unwrap();
        assert!(wait_for(DEADLINE, || !stills.lock().unwrap().is_empty()));
        assert!(wait_for(DEADLINE, || handle.status().state == DeviceState::Idle));

        assert_eq!(stills.lock().unwrap().len(), 1);
        assert_eq!(raws.load(Ordering::SeqCst), 0);
        handle.close();
    }

    #[test]
    fn capture_fault_unblocks_the_client_and_latches() {
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let errors_for_cb = Arc::clone(&errors);
        let handle = open_with(
            SimKnobs {
                fault_on_capture: Some(FaultKind::DspAbort),
                ..fast_knobs()
            },
            CallbackTable::new().on_notify(move |event| {
                if let Notify::Error { code } = event {
                    errors_for_cb.lock().unwrap().push(code);
                }
            }),
        );

        let err = handle.take_picture().unwrap_err();
        assert!(matches!(err, DeviceError::Fault { .. }));
        assert_eq!(handle.status().state, DeviceState::Error);
        assert!(wait_for(DEADLINE, || {
            errors.lock().unwrap().contains(&"dsp_abort")
        }));
        // The latch sticks until close.
        assert!(matches!(
            handle.start_preview(),
            Err(DeviceError::InvalidState { .. })
        ));
        handle.close();
    }

    #[test]
    fn recording_frames_release_exactly_once() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_for_cb = Arc::clone(&seen);
        let handle = open_with(
            fast_knobs(),
            CallbackTable::new().on_video_frame(move |ts, frame, _bytes| {
                seen_for_cb.lock().unwrap().push((ts, frame.index));
            }),
        );

        handle.start_recording().unwrap();
        assert!(handle.recording_enabled());
        assert!(wait_for(DEADLINE, || !seen.lock().unwrap().is_empty()));
        let (ts, first) = seen.lock().unwrap()[0];
        assert!(ts > 0);

        // Once the recorder stops, no new frame can become client-held, so
        // the held set is stable from here on.
        handle.stop_recording().unwrap();
        assert!(!handle.recording_enabled());
        let held: Vec<usize> = {
            let d = handle.shared.delivery.lock();
            d.held
                .iter()
                .enumerate()
                .filter_map(|(index, held)| held.then_some(index))
                .collect()
        };
        assert!(held.contains(&first));

        // Drain the encoder queue the way a real consumer would.
        for &index in &held {
            handle.release_recording_frame(index).unwrap();
        }
        assert!(matches!(
            handle.release_recording_frame(first),
            Err(DeviceError::BadRelease { .. })
        ));
        assert!(matches!(
            handle.release_recording_frame(999),
            Err(DeviceError::BadRelease { .. })
        ));
        let counters = handle.status().counters;
        assert_eq!(counters.client_released, held.len() as u64);
        assert_eq!(counters.client_release_errors, 2);

        // The ring recovered: frames keep flowing after the drain.
        let mark = handle.status().counters.preview_frames;
        assert!(wait_for(DEADLINE, || {
            handle.status().counters.preview_frames > mark
        }));

        handle.stop_preview().unwrap();
        handle.close();
    }

    #[test]
    fn metadata_mode_hands_out_descriptor_records() {
        let records = Arc::new(StdMutex::new(Vec::new()));
        let records_for_cb = Arc::clone(&records);
        let handle = open_with(
            fast_knobs(),
            CallbackTable::new().on_video_frame(move |_ts, frame, bytes| {
                records_for_cb
                    .lock()
                    .unwrap()
                    .push((frame.index, bytes.to_vec()));
            }),
        );

        handle.store_meta_data_in_buffers(true).unwrap();
        handle.start_recording().unwrap();
        assert!(wait_for(DEADLINE, || !records.lock().unwrap().is_empty()));
        let (index, record) = records.lock().unwrap()[0].clone();

        assert_eq!(record.len(), 12);
        let kind = u32::from_le_bytes(record[0..4].try_into().unwrap());
        let phys = u32::from_le_bytes(record[4..8].try_into().unwrap());
        let virt = u32::from_le_bytes(record[8..12].try_into().unwrap());
        assert_eq!(kind, 0);
        let pool = handle
            .shared
            .delivery
            .lock()
            .pools
            .preview
            .clone()
            .unwrap();
        assert_eq!(phys, pool.frame_phys(index).unwrap());
        assert_eq!(virt, pool.frame_virt(index).unwrap());

        // The switch is refused while preview is live.
        assert!(matches!(
            handle.store_meta_data_in_buffers(false),
            Err(DeviceError::InvalidState { .. })
        ));
        handle.close();
    }

    #[test]
    fn delivery_flows_while_an_operation_holds_the_lock() {
        let handle = open_with(fast_knobs(), CallbackTable::new());
        handle.start_preview().unwrap();
        let mark = handle.status().counters.preview_frames;

        let guard = handle.op.lock();
        let grew = wait_for(DEADLINE, || {
            handle.status().counters.preview_frames > mark + 3
        });
        drop(guard);

        assert!(grew, "dispatcher must not need the operation lock");
        handle.close();
    }

    #[test]
    fn wedged_driver_times_out_and_latches_the_error() {
        let knobs = SimKnobs {
            silent: true,
            ..fast_knobs()
        };
        let handle = OpenRequest::new(0)
            .state_wait(Duration::from_millis(60))
            .open(move |info, sink| {
                let driver: Arc<dyn CameraDriver> =
                    Arc::new(SimDriver::with_knobs(info, sink, knobs));
                driver
            })
            .unwrap();

        let err = handle.start_preview().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Fault {
                op: "start_preview"
            }
        ));
        assert_eq!(handle.status().state, DeviceState::Error);
        handle.close();
    }

    #[test]
    fn cancel_picture_always_settles_idle() {
        let handle = open_with(fast_knobs(), CallbackTable::new());
        // No capture in flight: a plain no-op.
        handle.cancel_picture().unwrap();

        handle.take_picture().unwrap();
        handle.cancel_picture().unwrap();
        assert!(wait_for(DEADLINE, || handle.status().state == DeviceState::Idle));

        // The session stays usable afterwards.
        let stills = Arc::new(AtomicUsize::new(0));
        let stills_for_cb = Arc::clone(&stills);
        handle.set_callbacks(CallbackTable::new().on_compressed_image(move |_f, _b| {
            stills_for_cb.fetch_add(1, Ordering::SeqCst);
        }));
        handle.take_picture().unwrap();
        assert!(wait_for(DEADLINE, || stills.load(Ordering::SeqCst) >= 1));
        assert!(wait_for(DEADLINE, || handle.status().state == DeviceState::Idle));
        handle.close();
    }

    #[test]
    fn sink_failures_disconnect_without_stopping_the_stream() {
        let window = FrameWindow::new();
        let handle = OpenRequest::new(0)
            .preview_sink(Box::new(window.clone()))
            .open(|info, sink| {
                let driver: Arc<dyn CameraDriver> =
                    Arc::new(SimDriver::with_knobs(info, sink, SimKnobs {
                        frame_interval: Duration::from_millis(1),
                        ..Default::default()
                    }));
                driver
            })
            .unwrap();

        handle.start_preview().unwrap();
        assert!(wait_for(DEADLINE, || window.frames() >= 2));
        let (size, _bytes) = window.last_frame().unwrap();
        assert_eq!(size, Resolution::new(640, 480).unwrap());

        window.disconnect();
        assert!(wait_for(DEADLINE, || {
            handle.status().counters.sink_errors == 1
        }));
        let mark = handle.status().counters.preview_frames;
        assert!(wait_for(DEADLINE, || {
            handle.status().counters.preview_frames > mark
        }));
        assert_eq!(handle.status().state, DeviceState::PreviewRunning);
        handle.close();
    }

    #[test]
    fn sensor_rotation_transposes_the_sink_copy() {
        let handle = open_with(fast_knobs(), CallbackTable::new());
        let mut params = handle.parameters();
        params.set(keys::SENSOR_ROTATION, "90");
        handle.set_parameters(params).unwrap();

        let window = FrameWindow::new();
        handle.set_preview_sink(Box::new(window.clone()));
        handle.start_preview().unwrap();
        assert!(wait_for(DEADLINE, || window.frames() >= 1));
        let (size, _bytes) = window.last_frame().unwrap();
        assert_eq!(size, Resolution::new(480, 640).unwrap());

        // Rotating sessions keep one spare slot in the ring.
        let pool = handle
            .shared
            .delivery
            .lock()
            .pools
            .preview
            .clone()
            .unwrap();
        assert_eq!(pool.count(), tunables::DEFAULT_PREVIEW_BUFFERS + 1);
        handle.close();
    }

    #[test]
    fn focus_outcome_is_reported_not_latched() {
        let outcomes = Arc::new(StdMutex::new(Vec::new()));
        let outcomes_for_cb = Arc::clone(&outcomes);
        let handle = open_with(
            SimKnobs {
                fail_focus: true,
                ..fast_knobs()
            },
            CallbackTable::new().on_notify(move |event| {
                if let Notify::Focus { success } = event {
                    outcomes_for_cb.lock().unwrap().push(success);
                }
            }),
        );

        handle.auto_focus().unwrap();
        assert!(wait_for(DEADLINE, || !outcomes.lock().unwrap().is_empty()));
        assert_eq!(*outcomes.lock().unwrap(), vec![false]);
        assert_eq!(handle.status().state, DeviceState::Idle);
        handle.close();
    }

    #[test]
    fn cancelled_focus_never_calls_back() {
        let outcomes = Arc::new(AtomicUsize::new(0));
        let outcomes_for_cb = Arc::clone(&outcomes);
        let handle = open_with(
            SimKnobs {
                frame_interval: Duration::from_millis(30),
                ..Default::default()
            },
            CallbackTable::new().on_notify(move |event| {
                if matches!(event, Notify::Focus { .. }) {
                    outcomes_for_cb.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        handle.auto_focus().unwrap();
        handle.cancel_auto_focus().unwrap();
        thread::sleep(Duration::from_millis(90));
        assert_eq!(outcomes.load(Ordering::SeqCst), 0);
        handle.close();
    }

    #[test]
    fn parameter_pushes_reach_the_driver() {
        let mut captured: Option<Arc<SimDriver>> = None;
        let handle = OpenRequest::new(0)
            .open(|info, sink| {
                let sim = Arc::new(SimDriver::new(info, sink));
                captured = Some(Arc::clone(&sim));
                let driver: Arc<dyn CameraDriver> = sim;
                driver
            })
            .unwrap();
        let sim = captured.unwrap();

        // The open pushed the full initial control block.
        let initial = sim.pushed_controls();
        assert_eq!(initial.len(), 19);
        assert_eq!(initial[0], (ControlKey::PreviewMode, 0));

        let mut params = handle.parameters();
        params.set(keys::WHITE_BALANCE, "incandescent");
        params.set(keys::FOCUS_AREAS, "(-800,-750,-650,0,1)");
        handle.set_parameters(params).unwrap();
        assert_eq!(sim.pushed_controls().len(), 38);
        let zones = sim.focus_zones();
        assert_eq!(zones.len(), 1);
        assert_eq!(
            (zones[0].x, zones[0].y, zones[0].width, zones[0].height),
            (240, 64, 180, 48)
        );

        // Strict flash validation resets the stored value before failing.
        let mut params = handle.parameters();
        params.set(keys::FLASH_MODE, "strobe");
        assert!(handle.set_parameters(params).is_err());
        let params = handle.parameters();
        assert_eq!(params.get(keys::FLASH_MODE), Some("off"));
        handle.close();
    }

    #[test]
    fn capture_attaches_the_stored_position() {
        let mut captured: Option<Arc<SimDriver>> = None;
        let handle = OpenRequest::new(0)
            .open(|info, sink| {
                let sim = Arc::new(SimDriver::with_knobs(
                    info,
                    sink,
                    SimKnobs {
                        frame_interval: Duration::from_millis(1),
                        ..Default::default()
                    },
                ));
                captured = Some(Arc::clone(&sim));
                let driver: Arc<dyn CameraDriver> = sim;
                driver
            })
            .unwrap();
        let sim = captured.unwrap();

        let mut params = handle.parameters();
        params.set(keys::GPS_LATITUDE, "37.42");
        params.set(keys::GPS_LONGITUDE, "-122.08");
        params.set(keys::GPS_ALTITUDE, "12.5");
        params.set(keys::GPS_TIMESTAMP, "0");
        params.set(keys::GPS_PROCESSING_METHOD, "network");
        handle.set_parameters(params).unwrap();

        handle.take_picture().unwrap();
        assert!(wait_for(DEADLINE, || handle.status().state == DeviceState::Idle));
        let position = sim.position().expect("position pushed");
        assert_eq!(position.latitude, 37.42);
        assert_eq!(position.longitude, -122.08);
        assert_eq!(position.process_method.as_deref(), Some("network"));
        // A zero client timestamp is replaced with the wall clock.
        assert!(position.timestamp > 0);
        handle.close();
    }

    #[test]
    fn close_is_idempotent_and_blocks_reuse() {
        let handle = open_with(fast_knobs(), CallbackTable::new());
        handle.start_preview().unwrap();
        handle.close();
        handle.close();
        assert_eq!(handle.status().state, DeviceState::Init);
        assert!(matches!(handle.start_preview(), Err(DeviceError::Closed)));
        assert!(matches!(
            handle.release_recording_frame(0),
            Err(DeviceError::Closed)
        ));
    }

    #[test]
    fn face_detection_is_the_only_rejected_command() {
        let handle = open_with(fast_knobs(), CallbackTable::new());
        assert!(matches!(
            handle.send_command(CMD_START_FACE_DETECTION, 0, 0),
            Err(DeviceError::Unsupported(_))
        ));
        handle.send_command(1, 0, 0).unwrap();
        handle.send_command(42, 7, -1).unwrap();
        handle.close();
    }

    #[test]
    fn dump_names_the_device_and_state() {
        let handle = open_with(fast_knobs(), CallbackTable::new());
        let dump = handle.dump();
        assert!(dump.contains("device 0"));
        assert!(dump.contains("state: idle"));
        assert!(dump.contains("preview-size=640x480"));
        handle.close();
    }

    #[test]
    fn front_device_opens_with_mirrored_defaults() {
        let handle = OpenRequest::new(1).open_sim().unwrap();
        assert_eq!(handle.info().facing, Facing::Front);
        let params = handle.parameters();
        assert_eq!(params.get(keys::FOCUS_MODE), Some("infinity"));
        handle.close();
    }
}
