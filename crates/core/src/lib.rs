#![doc = include_str!("../README.md")]

pub mod format;
pub mod heap;
pub mod params;

pub mod prelude {
    pub use crate::{
        format::{Facing, FpsRange, Orientation, PixelFormat, Resolution, Rotation},
        heap::{
            DmaHeap, FrameHandle, FramePool, HeapError, MetaPool, PoolId, align_256, align_page,
            jpeg_staging_len, preview_frame_len, raw_frame_len, scratch_frame_len,
        },
        params::{
            ControlCode, ControlKey, FocusZone, GpsPosition, ParamError, ParamStore,
            SessionConfig, keys,
        },
    };
}
