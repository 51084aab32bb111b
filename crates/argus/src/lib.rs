#![doc = include_str!("../README.md")]

pub use argus_core as core;
pub use argus_driver as driver;

pub use thiserror;

pub mod device_api;

pub mod prelude {
    pub use crate::device_api::window::rotate_420sp;
    pub use crate::device_api::{
        ArgusConfig, CMD_START_FACE_DETECTION, CallbackTable, CameraHandle, DeliveryCounters,
        DeviceError, DeviceState, DeviceStatus, DeviceTunables, FrameWindow, Notify, OpenRequest,
        PreviewSink, SinkError, set_device_tunables,
    };
    #[allow(unused_imports)]
    pub use argus_driver::prelude::*;
}
