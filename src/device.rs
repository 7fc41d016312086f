//! The V4L2 capture engine: negotiation, lifecycle and the read protocol.

use std::fs;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};
use v4l::v4l2;
use v4l::v4l_sys::{
    v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE, v4l2_capability, v4l2_captureparm,
    v4l2_field_V4L2_FIELD_INTERLACED, v4l2_fmtdesc, v4l2_format, v4l2_fract, v4l2_streamparm,
    V4L2_CAP_STREAMING, V4L2_CAP_VIDEO_CAPTURE,
};

use crate::convert;
use crate::pool::{BufferPool, ReadySlot};
use crate::sys;
use crate::traits::{
    CameraError, CaptureConfig, DeviceCapabilities, Format, FourCC, FrameCapture, FrameInfo,
    Result,
};

/// The open device session. The descriptor is valid exactly as long as
/// this value exists.
struct DeviceHandle {
    path: String,
    fd: c_int,
    index: u32,
    config: CaptureConfig,
    format: Format,
    capabilities: DeviceCapabilities,
}

/// Streaming capture engine for one `/dev/video<N>` device.
///
/// Drives the open → start → read → stop → close lifecycle against the
/// kernel driver and owns the mmap buffer pool in between. All calls are
/// synchronous; `&mut self` receivers make one thread of control per
/// engine a compile-time property.
pub struct CaptureDevice {
    handle: Option<DeviceHandle>,
    pool: Option<BufferPool>,
    read_timeout: Option<Duration>,
}

impl Default for CaptureDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDevice {
    /// Create an engine with nothing open and no read timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handle: None,
            pool: None,
            read_timeout: None,
        }
    }

    /// Bound the wait inside the read calls. `None` (the default) blocks
    /// until the driver produces data; with a timeout an expired wait
    /// returns [`CameraError::WaitTimeout`].
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Capability record gathered when the device was opened.
    #[must_use]
    pub fn capabilities(&self) -> Option<&DeviceCapabilities> {
        self.handle.as_ref().map(|handle| &handle.capabilities)
    }

    /// The capture parameters the caller originally requested.
    #[must_use]
    pub fn requested_config(&self) -> Option<&CaptureConfig> {
        self.handle.as_ref().map(|handle| &handle.config)
    }

    /// Number of kernel buffers currently mapped into process memory.
    #[must_use]
    pub fn mapped_slots(&self) -> usize {
        self.pool.as_ref().map_or(0, BufferPool::mapped_count)
    }

    /// Print an advisory report of the device's identity, supported
    /// formats, current geometry and frame rate.
    ///
    /// Requires the device at `device_index` to be open. Purely
    /// diagnostic: failures here never affect the capture stream.
    pub fn print_capability(&self, device_index: u32) -> Result<()> {
        let handle = self.handle.as_ref().ok_or(CameraError::NotOpen)?;
        if handle.index != device_index {
            return Err(CameraError::WrongDevice {
                requested: device_index,
                open: handle.index,
            });
        }
        let fd = handle.fd;

        let mut caps: v4l2_capability = unsafe { mem::zeroed() };
        unsafe {
            sys::xioctl(
                fd,
                v4l2::vidioc::VIDIOC_QUERYCAP,
                &mut caps as *mut v4l2_capability as *mut c_void,
            )
        }
        .map_err(CameraError::CapabilityQueryFailed)?;
        println!("driver: {}", sys::text_field(&caps.driver));
        println!("card: {}", sys::text_field(&caps.card));
        println!("bus: {}", sys::text_field(&caps.bus_info));
        println!("version: {:#x}", caps.version);

        println!("supported formats:");
        let mut index = 0u32;
        loop {
            let mut desc: v4l2_fmtdesc = unsafe { mem::zeroed() };
            desc.index = index;
            desc.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
            let queried = unsafe {
                sys::xioctl(
                    fd,
                    v4l2::vidioc::VIDIOC_ENUM_FMT,
                    &mut desc as *mut v4l2_fmtdesc as *mut c_void,
                )
            };
            if queried.is_err() {
                break;
            }
            println!(
                "  {}: {} ({})",
                index + 1,
                sys::text_field(&desc.description),
                FourCC::from_code(desc.pixelformat)
            );
            index += 1;
        }

        let mut fmt: v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe {
            sys::xioctl(
                fd,
                v4l2::vidioc::VIDIOC_G_FMT,
                &mut fmt as *mut v4l2_format as *mut c_void,
            )
        }
        .map_err(CameraError::CapabilityQueryFailed)?;
        let pix = unsafe { fmt.fmt.pix };
        println!(
            "current format: {}x{} {}",
            pix.width,
            pix.height,
            FourCC::from_code(pix.pixelformat)
        );

        let mut parm: v4l2_streamparm = unsafe { mem::zeroed() };
        parm.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe {
            sys::xioctl(
                fd,
                v4l2::vidioc::VIDIOC_G_PARM,
                &mut parm as *mut v4l2_streamparm as *mut c_void,
            )
        }
        .map_err(CameraError::CapabilityQueryFailed)?;
        let capture_parm = unsafe { parm.parm.capture };
        println!(
            "current frame rate: {}/{} fps (capability {:#x}, mode {:#x})",
            capture_parm.timeperframe.denominator,
            capture_parm.timeperframe.numerator,
            capture_parm.capability,
            capture_parm.capturemode,
        );
        Ok(())
    }

    /// QUERYCAP into the crate's capability record.
    fn query_capabilities(fd: c_int) -> Result<DeviceCapabilities> {
        let mut caps: v4l2_capability = unsafe { mem::zeroed() };
        unsafe {
            sys::xioctl(
                fd,
                v4l2::vidioc::VIDIOC_QUERYCAP,
                &mut caps as *mut v4l2_capability as *mut c_void,
            )
        }
        .map_err(CameraError::CapabilityQueryFailed)?;
        Ok(DeviceCapabilities {
            driver: sys::text_field(&caps.driver),
            card: sys::text_field(&caps.card),
            bus_info: sys::text_field(&caps.bus_info),
            can_capture: caps.capabilities & V4L2_CAP_VIDEO_CAPTURE != 0,
            can_stream: caps.capabilities & V4L2_CAP_STREAMING != 0,
        })
    }

    /// Submit the requested format; the driver's reply is authoritative.
    fn negotiate_format(fd: c_int, config: &CaptureConfig) -> Result<Format> {
        let mut fmt: v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        let mut pix = unsafe { fmt.fmt.pix };
        pix.width = config.width;
        pix.height = config.height;
        pix.pixelformat = config.fourcc.code();
        pix.field = v4l2_field_V4L2_FIELD_INTERLACED;
        fmt.fmt.pix = pix;

        unsafe {
            sys::xioctl(
                fd,
                v4l2::vidioc::VIDIOC_S_FMT,
                &mut fmt as *mut v4l2_format as *mut c_void,
            )
        }
        .map_err(CameraError::FormatRejected)?;
        let pix = unsafe { fmt.fmt.pix };

        // The driver may understate stride and image size; pad both up to
        // the packed minimum and size every slot uniformly from that.
        let stride = pix.bytesperline.max(pix.width * 2);
        let size = pix.sizeimage.max(stride * pix.height);
        Ok(Format {
            width: pix.width,
            height: pix.height,
            fourcc: FourCC::from_code(pix.pixelformat),
            stride,
            size,
        })
    }

    /// Set the frame rate, then re-query and require an exact rational
    /// match with the request. No closest-match tolerance.
    fn negotiate_rate(fd: c_int, rate: u32) -> Result<()> {
        let mut capture_parm: v4l2_captureparm = unsafe { mem::zeroed() };
        capture_parm.timeperframe = v4l2_fract {
            numerator: 1,
            denominator: rate,
        };
        let mut parm: v4l2_streamparm = unsafe { mem::zeroed() };
        parm.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        parm.parm.capture = capture_parm;
        unsafe {
            sys::xioctl(
                fd,
                v4l2::vidioc::VIDIOC_S_PARM,
                &mut parm as *mut v4l2_streamparm as *mut c_void,
            )
        }
        .map_err(CameraError::RateRejected)?;

        let mut parm: v4l2_streamparm = unsafe { mem::zeroed() };
        parm.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe {
            sys::xioctl(
                fd,
                v4l2::vidioc::VIDIOC_G_PARM,
                &mut parm as *mut v4l2_streamparm as *mut c_void,
            )
        }
        .map_err(CameraError::RateRejected)?;
        let achieved = unsafe { parm.parm.capture.timeperframe };
        if achieved.numerator == 0
            || achieved.denominator != rate.saturating_mul(achieved.numerator)
        {
            return Err(CameraError::RateMismatch {
                requested: rate,
                achieved_numerator: achieved.numerator,
                achieved_denominator: achieved.denominator,
            });
        }
        Ok(())
    }

    fn negotiate(
        fd: c_int,
        path: &str,
        config: &CaptureConfig,
    ) -> Result<(DeviceCapabilities, Format)> {
        let capabilities = Self::query_capabilities(fd)?;
        if !capabilities.can_capture || !capabilities.can_stream {
            return Err(CameraError::CapabilityUnsupported(path.to_owned()));
        }
        let format = Self::negotiate_format(fd, config)?;
        Self::negotiate_rate(fd, config.frame_rate)?;
        Ok((capabilities, format))
    }
}

/// Copy a held slot's payload into the caller's buffer. Returns the
/// bytes copied (the payload clamped to the mapped length).
fn copy_packed(pool: &BufferPool, ready: ReadySlot, dest: &mut [u8]) -> Result<usize> {
    if dest.len() < ready.bytes_used {
        return Err(CameraError::DestinationTooSmall {
            needed: ready.bytes_used,
            available: dest.len(),
        });
    }
    let src = pool.slot_data(ready.index, ready.bytes_used)?;
    dest[..src.len()].copy_from_slice(src);
    Ok(src.len())
}

/// Convert a held slot's packed payload into planar output. An empty
/// payload converts to nothing; a format the converter does not
/// understand is a distinct error either way the slot goes back to the
/// driver afterwards.
fn convert_planar(
    pool: &BufferPool,
    ready: ReadySlot,
    format: &Format,
    dest: &mut [u8],
) -> Result<usize> {
    if ready.bytes_used == 0 {
        return Ok(0);
    }
    if format.fourcc != FourCC::YUYV {
        return Err(CameraError::UnsupportedConversion(format.fourcc));
    }
    let src = pool.slot_data(ready.index, format.size as usize)?;
    convert::yuyv_to_i420(src, format.width, format.height, format.stride, dest)
}

impl FrameCapture for CaptureDevice {
    fn open(&mut self, device_index: u32, config: &CaptureConfig) -> Result<()> {
        if self.handle.is_some() {
            return Err(CameraError::AlreadyOpen);
        }
        let path = format!("/dev/video{device_index}");
        let meta = fs::metadata(&path).map_err(|_| CameraError::DeviceNotFound(path.clone()))?;
        if !meta.file_type().is_char_device() {
            return Err(CameraError::WrongDeviceType(path));
        }

        let fd = unsafe { v4l2::open(Path::new(&path), libc::O_RDWR) }.map_err(|source| {
            CameraError::OpenFailed {
                path: path.clone(),
                source,
            }
        })?;

        match Self::negotiate(fd, &path, config) {
            Ok((capabilities, format)) => {
                debug!(
                    "opened {path}: {}x{} {} stride {} slot size {}",
                    format.width, format.height, format.fourcc, format.stride, format.size
                );
                self.handle = Some(DeviceHandle {
                    path,
                    fd,
                    index: device_index,
                    config: config.clone(),
                    format,
                    capabilities,
                });
                Ok(())
            }
            Err(err) => {
                // The descriptor must not outlive a failed negotiation.
                if let Err(close_err) = unsafe { v4l2::close(fd) } {
                    warn!("closing {path} after failed open: {close_err}");
                }
                Err(err)
            }
        }
    }

    fn start(&mut self, device_index: u32) -> Result<()> {
        let handle = self.handle.as_ref().ok_or(CameraError::NotOpen)?;
        if handle.index != device_index {
            return Err(CameraError::WrongDevice {
                requested: device_index,
                open: handle.index,
            });
        }

        let pool = BufferPool::allocate(handle.fd)?;
        if let Err(err) = pool.stream_on() {
            drop(pool);
            return Err(err);
        }
        debug!(
            "streaming on {} with {} mapped slots",
            handle.path,
            pool.mapped_count()
        );
        self.pool = Some(pool);
        Ok(())
    }

    fn read_frame(&mut self, dest: &mut [u8]) -> Result<FrameInfo> {
        let handle = self.handle.as_ref().ok_or(CameraError::NotOpen)?;
        let pool = self.pool.as_mut().ok_or(CameraError::NotStreaming)?;
        let (width, height) = (handle.format.width, handle.format.height);

        match sys::wait_readable(handle.fd, self.read_timeout) {
            Ok(true) => {}
            Ok(false) => return Err(CameraError::WaitTimeout),
            Err(err) => return Err(CameraError::WaitFailed(err)),
        }

        let Some(ready) = pool.dequeue()? else {
            return Ok(FrameInfo {
                bytes_used: 0,
                width,
                height,
            });
        };

        // The slot goes back to the driver no matter how the copy went;
        // holding it would starve the pool.
        let copy_result = copy_packed(pool, ready, dest);
        let queue_result = pool.queue(ready.index);
        let copied = copy_result?;
        queue_result?;
        Ok(FrameInfo {
            bytes_used: copied,
            width,
            height,
        })
    }

    fn read_frame_planar(&mut self, dest: &mut [u8]) -> Result<FrameInfo> {
        let handle = self.handle.as_ref().ok_or(CameraError::NotOpen)?;
        let pool = self.pool.as_mut().ok_or(CameraError::NotStreaming)?;
        let format = handle.format.clone();

        match sys::wait_readable(handle.fd, self.read_timeout) {
            Ok(true) => {}
            Ok(false) => return Err(CameraError::WaitTimeout),
            Err(err) => return Err(CameraError::WaitFailed(err)),
        }

        let Some(ready) = pool.dequeue()? else {
            return Ok(FrameInfo {
                bytes_used: 0,
                width: format.width,
                height: format.height,
            });
        };

        let convert_result = convert_planar(pool, ready, &format, dest);
        let queue_result = pool.queue(ready.index);
        let written = convert_result?;
        queue_result?;
        Ok(FrameInfo {
            bytes_used: written,
            width: format.width,
            height: format.height,
        })
    }

    fn stop(&mut self) -> Result<()> {
        if self.handle.is_none() {
            return Err(CameraError::NotOpen);
        }
        let Some(mut pool) = self.pool.take() else {
            return Ok(());
        };

        let off_result = pool.stream_off();
        if off_result.is_err() {
            warn!("stream-off failed, releasing mappings anyway");
        }
        pool.release();
        off_result
    }

    fn close(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            // Nothing open: a no-op, not a failure.
            return Ok(());
        };

        let close_result = unsafe { v4l2::close(handle.fd) };

        // Guards a caller that skipped stop.
        if let Some(mut pool) = self.pool.take() {
            warn!(
                "{} closed with {} slots still mapped",
                handle.path,
                pool.mapped_count()
            );
            pool.release();
        }
        debug!("closed {}", handle.path);
        close_result.map_err(CameraError::CloseFailed)
    }

    fn negotiated(&self) -> Option<&Format> {
        self.handle.as_ref().map(|handle| &handle.format)
    }

    fn frame_buffer_size(&self) -> Option<usize> {
        self.handle.as_ref().map(|handle| {
            let format = &handle.format;
            (format.size as usize).max(convert::i420_frame_size(format.width, format.height))
        })
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(err) = self.close() {
                warn!("close during drop failed: {err}");
            }
        }
    }
}
