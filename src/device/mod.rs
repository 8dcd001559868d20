// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 采集设备 (Frame grabber boundary)
//!
//! The kernel driver is reached only through three requests: geometry
//! query, one-frame DMA transfer and buffer mapping. [`FpgaDevice`] speaks
//! that protocol; [`PatternDevice`] is a synthetic stand-in with the same
//! contract.

mod fpga;
mod pattern;

pub use fpga::{FpgaDevice, MappedRegion};
pub use pattern::PatternDevice;

use crate::error::{LprError, Result};
use crate::ring::SharedFrame;

const MAX_DIM: u32 = 4096;

/// Source pixel format reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PixelFormat {
    #[default]
    Bgr565,
    /// B, G, R, X where X is the auxiliary tag byte
    Bgrx8888,
}

impl PixelFormat {
    pub fn from_raw(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Bgr565),
            1 => Some(Self::Bgrx8888),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            Self::Bgr565 => 2,
            Self::Bgrx8888 => 4,
        }
    }

    pub fn has_aux(&self) -> bool {
        matches!(self, Self::Bgrx8888)
    }
}

/// Frame geometry as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor_id: u32,
    pub device_id: u32,
    pub width: u32,
    pub height: u32,
    /// bytes per pixel
    pub bpp: u32,
    /// bytes per line, 0 = width * bpp
    pub stride: u32,
    pub pixel_format: PixelFormat,
}

impl DeviceInfo {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            vendor_id: 0,
            device_id: 0,
            width,
            height,
            bpp: pixel_format.bytes_per_pixel(),
            stride: 0,
            pixel_format,
        }
    }

    pub fn stride(&self) -> usize {
        if self.stride == 0 {
            self.width as usize * self.bpp as usize
        } else {
            self.stride as usize
        }
    }

    /// Bytes moved by a transfer request of size 0
    pub fn default_transfer_size(&self) -> usize {
        self.stride() * self.height as usize
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Reject geometry no real grabber would report.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_DIM).contains(&self.width) || !(1..=MAX_DIM).contains(&self.height) {
            return Err(LprError::hardware(format!(
                "implausible frame size {}x{}",
                self.width, self.height
            )));
        }
        if self.bpp != self.pixel_format.bytes_per_pixel() {
            return Err(LprError::hardware(format!(
                "{} bytes/pixel does not match {:?}",
                self.bpp, self.pixel_format
            )));
        }
        if self.stride != 0 && (self.stride as usize) < self.width as usize * self.bpp as usize {
            return Err(LprError::hardware(format!(
                "stride {} shorter than a {}-pixel line",
                self.stride, self.width
            )));
        }
        Ok(())
    }
}

/// What the capture loop needs from a frame source.
pub trait CaptureDevice: Send {
    fn info(&self) -> &DeviceInfo;

    /// Capture one frame. `size` 0 asks for the default transfer size.
    /// With `dst` the frame is copied there; with `None` it lands in the
    /// mapped buffer. Returns the number of bytes transferred.
    fn read_frame(&mut self, size: usize, dst: Option<&mut [u8]>) -> Result<usize>;

    /// Read-only view of the mapped DMA buffer, if the device has one.
    fn mapped(&self) -> Option<SharedFrame> {
        None
    }
}

impl<T: CaptureDevice + ?Sized> CaptureDevice for Box<T> {
    fn info(&self) -> &DeviceInfo {
        (**self).info()
    }

    fn read_frame(&mut self, size: usize, dst: Option<&mut [u8]>) -> Result<usize> {
        (**self).read_frame(size, dst)
    }

    fn mapped(&self) -> Option<SharedFrame> {
        (**self).mapped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transfer_is_stride_times_height() {
        let info = DeviceInfo::new(1280, 720, PixelFormat::Bgr565);
        assert_eq!(info.default_transfer_size(), 1_843_200);
        let padded = DeviceInfo {
            stride: 2600,
            ..info
        };
        assert_eq!(padded.default_transfer_size(), 2600 * 720);
    }

    #[test]
    fn geometry_sanity() {
        assert!(DeviceInfo::new(1280, 720, PixelFormat::Bgrx8888).validate().is_ok());
        assert!(DeviceInfo::new(0, 720, PixelFormat::Bgr565).validate().is_err());
        assert!(DeviceInfo::new(8192, 720, PixelFormat::Bgr565).validate().is_err());
        let wrong_bpp = DeviceInfo {
            bpp: 3,
            ..DeviceInfo::new(64, 64, PixelFormat::Bgr565)
        };
        assert!(wrong_bpp.validate().is_err());
    }

    #[test]
    fn raw_pixel_format_codes() {
        assert_eq!(PixelFormat::from_raw(0), Some(PixelFormat::Bgr565));
        assert_eq!(PixelFormat::from_raw(1), Some(PixelFormat::Bgrx8888));
        assert_eq!(PixelFormat::from_raw(7), None);
    }
}
