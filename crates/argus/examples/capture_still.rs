use std::sync::mpsc;

use argus::prelude::*;

fn main() -> Result<(), DeviceError> {
    env_logger::init();

    let (jpeg_tx, jpeg_rx) = mpsc::channel();
    let handle = OpenRequest::new(0)
        .picture_size(Resolution::new(1280, 960).expect("size"))
        .callbacks(
            CallbackTable::new()
                .on_notify(|event| match event {
                    Notify::Shutter => println!("shutter"),
                    Notify::Focus { success } => println!("focus locked: {success}"),
                    Notify::Error { code } => eprintln!("fault: {code}"),
                })
                .on_compressed_image(move |_frame, bytes| {
                    let _ = jpeg_tx.send(bytes.to_vec());
                }),
        )
        .open_sim()?;

    handle.auto_focus()?;
    handle.take_picture()?;

    let jpeg = jpeg_rx.recv().expect("still payload");
    println!(
        "captured {} bytes, markers {:02X}{:02X}..{:02X}{:02X}",
        jpeg.len(),
        jpeg[0],
        jpeg[1],
        jpeg[jpeg.len() - 2],
        jpeg[jpeg.len() - 1]
    );

    handle.close();
    Ok(())
}
