//! Core types, error taxonomy and the capture-engine trait.

use std::io;

use thiserror::Error;

/// Number of kernel capture buffers requested from the driver.
///
/// All slots are mapped together at stream start and unmapped together at
/// stream stop; the driver must grant exactly this many.
pub const BUFFER_COUNT: u32 = 4;

/// Pixel format tag (e.g., YUYV, MJPG).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed, 2 bytes per pixel).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");

    /// The little-endian u32 used by the V4L2 ABI.
    #[must_use]
    pub const fn code(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Rebuild a tag from the u32 the driver reports.
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        Self(code.to_le_bytes())
    }
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            if byte.is_ascii_graphic() {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, ".")?;
            }
        }
        Ok(())
    }
}

/// Requested capture parameters. Immutable once passed to `open`; the
/// driver's negotiated reply is what the engine uses afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Requested pixel format.
    pub fourcc: FourCC,
    /// Requested frame width in pixels.
    pub width: u32,
    /// Requested frame height in pixels.
    pub height: u32,
    /// Requested frame rate in frames per second.
    pub frame_rate: u32,
    /// Device index (`/dev/video<index>`).
    pub device_index: u32,
}

impl CaptureConfig {
    /// Packed-YUYV capture request.
    #[must_use]
    pub const fn yuyv(width: u32, height: u32, frame_rate: u32, device_index: u32) -> Self {
        Self {
            fourcc: FourCC::YUYV,
            width,
            height,
            frame_rate,
            device_index,
        }
    }
}

/// Format as negotiated with the driver. Width, height and stride come
/// from the driver's reply, not the caller's request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format the driver settled on.
    pub fourcc: FourCC,
    /// Bytes per packed row, at least `width * 2`.
    pub stride: u32,
    /// Per-slot byte size, at least `stride * height`.
    pub size: u32,
}

/// Device identity and capability bits from the driver.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming I/O.
    pub can_stream: bool,
}

/// What a read call produced. `bytes_used == 0` means no frame was
/// available this call; the caller simply reads again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Payload length written to the destination buffer.
    pub bytes_used: usize,
    /// Negotiated frame width.
    pub width: u32,
    /// Negotiated frame height.
    pub height: u32,
}

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// The device node does not exist.
    #[error("device {0} does not exist")]
    DeviceNotFound(String),
    /// The path exists but is not a character device.
    #[error("{0} is not a character device")]
    WrongDeviceType(String),
    /// The open syscall failed.
    #[error("failed to open {path}: {source}")]
    OpenFailed {
        /// Device node path.
        path: String,
        /// Underlying syscall error.
        source: io::Error,
    },
    /// Querying driver capabilities failed.
    #[error("capability query failed: {0}")]
    CapabilityQueryFailed(io::Error),
    /// The driver lacks video-capture or streaming support.
    #[error("{0} does not support video capture with streaming i/o")]
    CapabilityUnsupported(String),
    /// The driver rejected the requested pixel format/geometry.
    #[error("format negotiation failed: {0}")]
    FormatRejected(io::Error),
    /// Setting or re-querying the frame rate failed.
    #[error("frame rate negotiation failed: {0}")]
    RateRejected(io::Error),
    /// The driver settled on a different frame rate than requested.
    #[error(
        "requested {requested} fps but driver achieved {achieved_denominator}/{achieved_numerator}"
    )]
    RateMismatch {
        /// Frames per second the caller asked for.
        requested: u32,
        /// Numerator of the driver's time-per-frame interval.
        achieved_numerator: u32,
        /// Denominator of the driver's time-per-frame interval.
        achieved_denominator: u32,
    },
    /// `open` was called on an engine that already holds a device.
    #[error("a device is already open")]
    AlreadyOpen,
    /// The operation needs an open device.
    #[error("no device is open")]
    NotOpen,
    /// The given index does not match the open device.
    #[error("device index {requested} does not match open device {open}")]
    WrongDevice {
        /// Index passed to the call.
        requested: u32,
        /// Index the engine opened.
        open: u32,
    },
    /// The driver rejected the buffer allocation request.
    #[error("buffer request failed: {0}")]
    BufferRequestFailed(io::Error),
    /// The driver granted fewer buffers than requested.
    #[error("requested {requested} buffers but driver granted {granted}")]
    BufferShortfall {
        /// Buffers requested.
        requested: u32,
        /// Buffers the driver granted.
        granted: u32,
    },
    /// Mapping a kernel buffer into process memory failed.
    #[error("mapping buffer {index} failed: {source}")]
    BufferMapFailed {
        /// Slot index that failed to map.
        index: u32,
        /// Underlying mmap error.
        source: io::Error,
    },
    /// Handing a slot to the driver failed.
    #[error("queueing buffer {index} failed: {source}")]
    QueueFailed {
        /// Slot index that failed to queue.
        index: u32,
        /// Underlying ioctl error.
        source: io::Error,
    },
    /// The stream-on command failed.
    #[error("stream-on failed: {0}")]
    StreamOnFailed(io::Error),
    /// The stream-off command failed.
    #[error("stream-off failed: {0}")]
    StreamOffFailed(io::Error),
    /// The operation needs an active stream.
    #[error("streaming has not been started")]
    NotStreaming,
    /// Waiting for the descriptor to become readable failed.
    #[error("wait for frame failed: {0}")]
    WaitFailed(io::Error),
    /// The configured read timeout expired before a frame arrived.
    #[error("timed out waiting for a frame")]
    WaitTimeout,
    /// Dequeueing a filled buffer failed unrecoverably.
    #[error("dequeue failed: {0}")]
    DequeueFailed(io::Error),
    /// The driver returned a slot index outside the pool.
    #[error("driver returned slot {index} outside pool of {count}")]
    SlotOutOfRange {
        /// Index the driver reported.
        index: u32,
        /// Number of slots in the pool.
        count: u32,
    },
    /// The driver returned a slot the engine already holds.
    #[error("driver returned slot {0} that is already held")]
    SlotAlreadyHeld(u32),
    /// A slot was accessed or requeued while owned by the driver.
    #[error("slot {0} is not held by the engine")]
    SlotNotHeld(u32),
    /// The caller's destination buffer cannot hold the payload.
    #[error("destination buffer too small: need {needed} bytes, have {available}")]
    DestinationTooSmall {
        /// Bytes the payload requires.
        needed: usize,
        /// Bytes the caller provided.
        available: usize,
    },
    /// The source buffer is shorter than the frame geometry implies.
    #[error("source buffer too small: need {needed} bytes, have {available}")]
    SourceTooSmall {
        /// Bytes the geometry requires.
        needed: usize,
        /// Bytes available.
        available: usize,
    },
    /// The negotiated format cannot be converted to planar output.
    #[error("cannot convert {0} frames to planar output")]
    UnsupportedConversion(FourCC),
    /// The close syscall failed; the handle is reset regardless.
    #[error("closing the device failed: {0}")]
    CloseFailed(io::Error),
    /// A captured frame did not match the expected test pattern.
    #[error("frame validation failed: {0}")]
    ValidationFailed(String),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Abstraction over the capture lifecycle, shared by the V4L2 engine and
/// the mock used in tests.
///
/// Call order is open → start → read (repeatedly) → stop → close; every
/// implementation reports the same typed errors when a stage is skipped.
pub trait FrameCapture {
    /// Open the device at `device_index` and negotiate `config`.
    fn open(&mut self, device_index: u32, config: &CaptureConfig) -> Result<()>;

    /// Allocate and map the buffer pool, then start streaming.
    fn start(&mut self, device_index: u32) -> Result<()>;

    /// Read one frame in the native packed layout into `dest`.
    fn read_frame(&mut self, dest: &mut [u8]) -> Result<FrameInfo>;

    /// Read one frame converted to planar 4:2:0 into `dest`.
    fn read_frame_planar(&mut self, dest: &mut [u8]) -> Result<FrameInfo>;

    /// Stop streaming and unmap the buffer pool.
    fn stop(&mut self) -> Result<()>;

    /// Close the device. A no-op when nothing is open.
    fn close(&mut self) -> Result<()>;

    /// The negotiated format, once open.
    fn negotiated(&self) -> Option<&Format>;

    /// Worst-case destination size for either read call: the larger of
    /// the negotiated per-slot size and the planar 4:2:0 frame size.
    fn frame_buffer_size(&self) -> Option<usize>;
}
