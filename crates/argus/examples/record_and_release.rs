use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use argus::prelude::*;

fn main() -> Result<(), DeviceError> {
    env_logger::init();

    let handle = Arc::new(OpenRequest::new(0).recording_hint(true).open_sim()?);
    // Hand the encoder buffer descriptors instead of frame copies.
    handle.store_meta_data_in_buffers(true)?;

    let encoded = Arc::new(AtomicU64::new(0));
    let encoded_for_cb = Arc::clone(&encoded);
    let handle_for_cb = Arc::clone(&handle);
    handle.set_callbacks(CallbackTable::new().on_video_frame(move |ts, frame, record| {
        if encoded_for_cb.fetch_add(1, Ordering::SeqCst) == 0 {
            let phys = u32::from_le_bytes(record[4..8].try_into().expect("record"));
            println!("first frame: ts={ts} slot={} phys=0x{phys:08X}", frame.index);
        }
        // A real encoder consumes the descriptor, then gives the slot back.
        if let Err(e) = handle_for_cb.release_recording_frame(frame.index) {
            eprintln!("release of slot {} failed: {e}", frame.index);
        }
    }));

    handle.start_recording()?;
    thread::sleep(Duration::from_millis(60));
    handle.stop_recording()?;

    let counters = handle.status().counters;
    handle.stop_preview()?;
    println!(
        "encoded {} frames, released {} back to the ring",
        encoded.load(Ordering::SeqCst),
        counters.client_released
    );

    handle.close();
    Ok(())
}
