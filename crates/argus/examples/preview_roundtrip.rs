use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use argus::prelude::*;

fn main() -> Result<(), DeviceError> {
    env_logger::init();

    let frames = Arc::new(AtomicUsize::new(0));
    let frames_for_cb = Arc::clone(&frames);
    let window = FrameWindow::new();

    let handle = OpenRequest::new(0)
        .callbacks(CallbackTable::new().on_preview_frame(move |frame, bytes| {
            let n = frames_for_cb.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= 3 {
                println!(
                    "frame #{n}: slot {} carrying {} bytes",
                    frame.index,
                    bytes.len()
                );
            }
        }))
        .preview_sink(Box::new(window.clone()))
        .open_sim()?;

    println!(
        "opened device {} ({:?}), state {}",
        handle.info().id,
        handle.info().facing,
        handle.status().state
    );

    handle.start_preview()?;
    thread::sleep(Duration::from_millis(50));
    let status = handle.status();
    handle.stop_preview()?;

    if let Some((size, bytes)) = window.last_frame() {
        println!(
            "sink saw {} frames, last one {size} ({} bytes)",
            window.frames(),
            bytes.len()
        );
    }
    println!(
        "client saw {} frames, driver delivered {} ({} recycled unseen)",
        frames.load(Ordering::SeqCst),
        status.counters.preview_frames,
        status.counters.dropped_frames
    );
    handle.close();
    Ok(())
}
