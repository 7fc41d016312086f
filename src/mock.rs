//! Mock capture engine for testing without hardware.
//!
//! Follows the same lifecycle contract as the real engine, including the
//! typed errors for skipped stages, so consumer loops can be exercised
//! against synthetic frames.

use crate::convert;
use crate::traits::{
    CameraError, CaptureConfig, Format, FourCC, FrameCapture, FrameInfo, Result, BUFFER_COUNT,
};

/// Test pattern generated into each packed frame.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// Luma equals the x coordinate mod 256, with constant U and V.
    Ramp(u8, u8),
    /// Solid color with the given Y, U, V values.
    Solid(u8, u8, u8),
    /// Horizontal luma gradient from dark to light, neutral chroma.
    Gradient,
}

struct MockHandle {
    index: u32,
    format: Format,
}

/// Mock engine producing synthetic packed frames.
pub struct MockCapture {
    present: bool,
    capable: bool,
    achievable_rates: Vec<u32>,
    stride_padding: u32,
    pattern: TestPattern,
    empty_reads: u32,
    handle: Option<MockHandle>,
    streaming: bool,
}

impl Default for MockCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCapture {
    /// A present, capable device that accepts any frame rate.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            present: true,
            capable: true,
            achievable_rates: Vec::new(),
            stride_padding: 0,
            pattern: TestPattern::Ramp(64, 192),
            empty_reads: 0,
            handle: None,
            streaming: false,
        }
    }

    /// Set the test pattern for frame generation.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Simulate a device node that does not exist.
    #[must_use]
    pub const fn without_device(mut self) -> Self {
        self.present = false;
        self
    }

    /// Simulate a device lacking capture/streaming capability bits.
    #[must_use]
    pub const fn without_streaming_support(mut self) -> Self {
        self.capable = false;
        self
    }

    /// Restrict the frame rates the simulated driver can achieve; a
    /// request outside the list negotiates to the first entry instead.
    #[must_use]
    pub fn with_achievable_rates(mut self, rates: Vec<u32>) -> Self {
        self.achievable_rates = rates;
        self
    }

    /// Pad each packed row beyond `width * 2` bytes, as drivers with
    /// alignment constraints do.
    #[must_use]
    pub const fn with_stride_padding(mut self, padding: u32) -> Self {
        self.stride_padding = padding;
        self
    }

    /// Make the first `count` reads return zero bytes, as a driver
    /// reporting transient I/O errors does.
    #[must_use]
    pub const fn with_empty_reads(mut self, count: u32) -> Self {
        self.empty_reads = count;
        self
    }

    /// Number of slots the simulated pool has mapped.
    #[must_use]
    pub fn mapped_slots(&self) -> usize {
        if self.streaming {
            BUFFER_COUNT as usize
        } else {
            0
        }
    }

    fn generate_packed(&self, format: &Format) -> Vec<u8> {
        let width = format.width as usize;
        let height = format.height as usize;
        let stride = format.stride as usize;
        let mut data = vec![0xEE_u8; stride * height];

        for row in 0..height {
            for x in 0..width {
                let offset = row * stride + x * 2;
                let (luma, chroma) = match self.pattern {
                    TestPattern::Ramp(u, v) => {
                        ((x % 256) as u8, if x % 2 == 0 { u } else { v })
                    }
                    TestPattern::Solid(y, u, v) => (y, if x % 2 == 0 { u } else { v }),
                    TestPattern::Gradient => (((x * 255) / width.max(1)) as u8, 128),
                };
                data[offset] = luma;
                data[offset + 1] = chroma;
            }
        }
        data
    }
}

impl FrameCapture for MockCapture {
    fn open(&mut self, device_index: u32, config: &CaptureConfig) -> Result<()> {
        if self.handle.is_some() {
            return Err(CameraError::AlreadyOpen);
        }
        let path = format!("/dev/video{device_index}");
        if !self.present {
            return Err(CameraError::DeviceNotFound(path));
        }
        if !self.capable {
            return Err(CameraError::CapabilityUnsupported(path));
        }
        if !self.achievable_rates.is_empty()
            && !self.achievable_rates.contains(&config.frame_rate)
        {
            let achieved = self.achievable_rates.first().copied().unwrap_or(30);
            return Err(CameraError::RateMismatch {
                requested: config.frame_rate,
                achieved_numerator: 1,
                achieved_denominator: achieved,
            });
        }

        let stride = config.width * 2 + self.stride_padding;
        self.handle = Some(MockHandle {
            index: device_index,
            format: Format {
                width: config.width,
                height: config.height,
                fourcc: config.fourcc,
                stride,
                size: stride * config.height,
            },
        });
        Ok(())
    }

    fn start(&mut self, device_index: u32) -> Result<()> {
        let handle = self.handle.as_ref().ok_or(CameraError::NotOpen)?;
        if handle.index != device_index {
            return Err(CameraError::WrongDevice {
                requested: device_index,
                open: handle.index,
            });
        }
        self.streaming = true;
        Ok(())
    }

    fn read_frame(&mut self, dest: &mut [u8]) -> Result<FrameInfo> {
        let handle = self.handle.as_ref().ok_or(CameraError::NotOpen)?;
        if !self.streaming {
            return Err(CameraError::NotStreaming);
        }
        let format = handle.format.clone();
        if self.empty_reads > 0 {
            self.empty_reads -= 1;
            return Ok(FrameInfo {
                bytes_used: 0,
                width: format.width,
                height: format.height,
            });
        }

        let packed = self.generate_packed(&format);
        if dest.len() < packed.len() {
            return Err(CameraError::DestinationTooSmall {
                needed: packed.len(),
                available: dest.len(),
            });
        }
        dest[..packed.len()].copy_from_slice(&packed);
        Ok(FrameInfo {
            bytes_used: packed.len(),
            width: format.width,
            height: format.height,
        })
    }

    fn read_frame_planar(&mut self, dest: &mut [u8]) -> Result<FrameInfo> {
        let handle = self.handle.as_ref().ok_or(CameraError::NotOpen)?;
        if !self.streaming {
            return Err(CameraError::NotStreaming);
        }
        let format = handle.format.clone();
        if self.empty_reads > 0 {
            self.empty_reads -= 1;
            return Ok(FrameInfo {
                bytes_used: 0,
                width: format.width,
                height: format.height,
            });
        }
        if format.fourcc != FourCC::YUYV {
            return Err(CameraError::UnsupportedConversion(format.fourcc));
        }

        let packed = self.generate_packed(&format);
        let written =
            convert::yuyv_to_i420(&packed, format.width, format.height, format.stride, dest)?;
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
        self.streaming = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.handle = None;
        self.streaming = false;
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::i420_frame_size;

    fn opened(width: u32, height: u32) -> MockCapture {
        let mut camera = MockCapture::new();
        let config = CaptureConfig::yuyv(width, height, 30, 0);
        camera.open(0, &config).expect("open failed");
        camera
    }

    #[test]
    fn lifecycle_happy_path_and_slot_accounting() {
        let mut camera = opened(1280, 720);
        assert_eq!(camera.mapped_slots(), 0);

        camera.start(0).expect("start failed");
        assert_eq!(camera.mapped_slots(), BUFFER_COUNT as usize);

        let mut buf = vec![0u8; camera.frame_buffer_size().expect("no buffer size")];
        let info = camera.read_frame_planar(&mut buf).expect("read failed");
        assert_eq!(info.bytes_used, i420_frame_size(1280, 720));
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);

        camera.stop().expect("stop failed");
        assert_eq!(camera.mapped_slots(), 0);
        camera.close().expect("close failed");

        // A fresh open over the same engine must work identically.
        let config = CaptureConfig::yuyv(1280, 720, 10, 0);
        camera.open(0, &config).expect("re-open failed");
        camera.start(0).expect("re-start failed");
        camera.stop().expect("stop failed");
        camera.close().expect("close failed");
    }

    #[test]
    fn raw_read_returns_the_packed_payload() {
        let mut camera = opened(64, 32);
        camera.start(0).expect("start failed");

        let mut buf = vec![0u8; camera.frame_buffer_size().expect("no buffer size")];
        let info = camera.read_frame(&mut buf).expect("read failed");
        assert_eq!(info.bytes_used, 64 * 2 * 32);
        // Packed layout: luma at even offsets, chroma at odd.
        assert_eq!(buf[0], 0);
        assert_eq!(buf[2], 1);
        assert_eq!(buf[1], 64);
        assert_eq!(buf[3], 192);
    }

    #[test]
    fn stages_cannot_be_skipped() {
        let mut camera = MockCapture::new();
        assert!(matches!(camera.start(0), Err(CameraError::NotOpen)));
        assert!(matches!(camera.stop(), Err(CameraError::NotOpen)));

        let config = CaptureConfig::yuyv(64, 32, 30, 0);
        camera.open(0, &config).expect("open failed");
        let mut buf = vec![0u8; 4096];
        assert!(matches!(
            camera.read_frame(&mut buf),
            Err(CameraError::NotStreaming)
        ));
        assert!(matches!(
            camera.read_frame_planar(&mut buf),
            Err(CameraError::NotStreaming)
        ));
    }

    #[test]
    fn open_is_exclusive_and_close_is_idempotent() {
        let mut camera = MockCapture::new();
        // Close before any open is a no-op success.
        camera.close().expect("close of closed engine failed");

        let config = CaptureConfig::yuyv(64, 32, 30, 0);
        camera.open(0, &config).expect("open failed");
        assert!(matches!(
            camera.open(0, &config),
            Err(CameraError::AlreadyOpen)
        ));
        camera.close().expect("close failed");
        camera.close().expect("second close failed");
    }

    #[test]
    fn start_rejects_a_mismatched_index() {
        let mut camera = opened(64, 32);
        let err = camera.start(3).expect_err("start should fail");
        assert!(matches!(
            err,
            CameraError::WrongDevice {
                requested: 3,
                open: 0
            }
        ));
    }

    #[test]
    fn missing_device_and_missing_capabilities_are_distinct() {
        let config = CaptureConfig::yuyv(64, 32, 30, 5);
        let mut camera = MockCapture::new().without_device();
        assert!(matches!(
            camera.open(5, &config),
            Err(CameraError::DeviceNotFound(_))
        ));
        // Nothing was opened, so close stays a no-op.
        camera.close().expect("close failed");

        let mut camera = MockCapture::new().without_streaming_support();
        assert!(matches!(
            camera.open(5, &config),
            Err(CameraError::CapabilityUnsupported(_))
        ));
    }

    #[test]
    fn unachievable_rate_is_a_mismatch_not_a_silent_accept() {
        let mut camera = MockCapture::new().with_achievable_rates(vec![30, 60]);
        let config = CaptureConfig::yuyv(64, 32, 10, 0);
        let err = camera.open(0, &config).expect_err("open should fail");
        assert!(matches!(
            err,
            CameraError::RateMismatch {
                requested: 10,
                achieved_numerator: 1,
                achieved_denominator: 30
            }
        ));
        assert!(camera.negotiated().is_none());
    }

    #[test]
    fn empty_reads_are_retried_by_looping() {
        let mut camera = MockCapture::new().with_empty_reads(2);
        let config = CaptureConfig::yuyv(64, 32, 30, 0);
        camera.open(0, &config).expect("open failed");
        camera.start(0).expect("start failed");

        let mut buf = vec![0u8; camera.frame_buffer_size().expect("no buffer size")];
        let mut attempts = 0;
        let info = loop {
            attempts += 1;
            let info = camera.read_frame_planar(&mut buf).expect("read failed");
            if info.bytes_used > 0 {
                break info;
            }
        };
        assert_eq!(attempts, 3);
        assert_eq!(info.bytes_used, i420_frame_size(64, 32));
    }

    #[test]
    fn non_yuyv_formats_cannot_be_converted() {
        let mut camera = MockCapture::new();
        let config = CaptureConfig {
            fourcc: FourCC::MJPG,
            width: 64,
            height: 32,
            frame_rate: 30,
            device_index: 0,
        };
        camera.open(0, &config).expect("open failed");
        camera.start(0).expect("start failed");

        let mut buf = vec![0u8; camera.frame_buffer_size().expect("no buffer size")];
        let err = camera
            .read_frame_planar(&mut buf)
            .expect_err("conversion should fail");
        assert!(matches!(
            err,
            CameraError::UnsupportedConversion(FourCC::MJPG)
        ));
    }

    #[test]
    fn short_destination_is_rejected() {
        let mut camera = opened(64, 32);
        camera.start(0).expect("start failed");
        let mut buf = vec![0u8; 16];
        assert!(matches!(
            camera.read_frame(&mut buf),
            Err(CameraError::DestinationTooSmall { .. })
        ));
    }

    #[test]
    fn buffer_size_covers_both_read_paths() {
        let camera = opened(64, 32);
        let format = camera.negotiated().expect("no format").clone();
        let size = camera.frame_buffer_size().expect("no buffer size");
        assert!(size >= format.size as usize);
        assert!(size >= i420_frame_size(format.width, format.height));
    }
}
