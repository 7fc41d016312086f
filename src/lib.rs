//! UVC-Capture: a V4L2 streaming-capture library for embedded Linux
//!
//! This library negotiates a packed YUYV format with a `/dev/video<N>`
//! capture device, owns a small pool of kernel-mapped buffers, and hands
//! frames to the caller either in the native packed layout or converted
//! to planar 4:2:0. The [`FrameCapture`] trait covers the full lifecycle
//! so consumers can run against the real engine or a mock in tests.

pub mod convert;
pub mod device;
pub mod traits;
pub mod validation;

mod pool;
mod sys;

#[cfg(test)]
pub mod mock;

pub use device::CaptureDevice;
pub use traits::{
    CameraError, CaptureConfig, DeviceCapabilities, Format, FourCC, FrameCapture, FrameInfo,
    Result, BUFFER_COUNT,
};
