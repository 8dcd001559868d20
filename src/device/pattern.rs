// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 内置测试图像源 (synthetic frame source)

use std::sync::Arc;

use super::{CaptureDevice, DeviceInfo, PixelFormat};
use crate::error::{LprError, Result};
use crate::pixel::{encode_565, PixelOrder};
use crate::ring::SharedFrame;
use crate::tracker::{AUX_CLASS_RED, AUX_CLASS_SHIFT, AUX_VALID};

const AUX_RED: u8 = AUX_VALID | (AUX_CLASS_RED << AUX_CLASS_SHIFT);

/// Moving colour bars in the device's native format. In BGRX mode the X
/// byte carries a valid-tagged block in the top-right corner, tagged red
/// while [`set_red`](Self::set_red) is on.
pub struct PatternDevice {
    info: DeviceInfo,
    frame_no: u64,
    red: bool,
    fail_after: Option<u64>,
    mapping: Option<Arc<Vec<u8>>>,
}

impl PatternDevice {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Result<Self> {
        let info = DeviceInfo::new(width, height, pixel_format);
        info.validate()?;
        Ok(Self {
            info,
            frame_no: 0,
            red: false,
            fail_after: None,
            mapping: None,
        })
    }

    pub fn set_red(&mut self, red: bool) {
        self.red = red;
    }

    /// Make every read after the first `frames` fail like a dead DMA link.
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// 模拟一块 DMA 映射内存: the first frame is rendered once into a shared
    /// buffer and `read_frame(_, None)` transfers into it from then on. The
    /// mapped bytes stay frozen at that first frame.
    pub fn with_mapping(mut self) -> Self {
        let mut buf = vec![0u8; self.info.default_transfer_size()];
        self.render(&mut buf);
        self.mapping = Some(Arc::new(buf));
        self
    }

    pub fn frames_read(&self) -> u64 {
        self.frame_no
    }

    fn bar_color(&self, x: u32) -> [u8; 3] {
        const BARS: [[u8; 3]; 6] = [
            [235, 235, 235],
            [235, 235, 16],
            [16, 235, 235],
            [16, 235, 16],
            [235, 16, 235],
            [16, 16, 235],
        ];
        let shift = (self.frame_no as u32 * 8) % self.info.width;
        let pos = (x + shift) % self.info.width;
        BARS[(pos as usize * BARS.len()) / self.info.width as usize]
    }

    fn render(&self, dst: &mut [u8]) {
        let w = self.info.width;
        let stride = self.info.stride();
        let block = (w / 8).max(1);
        for y in 0..self.info.height {
            let line = &mut dst[y as usize * stride..][..stride];
            for x in 0..w {
                let rgb = self.bar_color(x);
                match self.info.pixel_format {
                    PixelFormat::Bgr565 => {
                        let v = encode_565(rgb, PixelOrder::Bgr565).to_le_bytes();
                        line[x as usize * 2..x as usize * 2 + 2].copy_from_slice(&v);
                    }
                    PixelFormat::Bgrx8888 => {
                        let tag = if x >= w - block && y < block {
                            if self.red {
                                AUX_RED
                            } else {
                                AUX_VALID
                            }
                        } else {
                            0
                        };
                        let px = &mut line[x as usize * 4..x as usize * 4 + 4];
                        px.copy_from_slice(&[rgb[2], rgb[1], rgb[0], tag]);
                    }
                }
            }
        }
    }
}

impl CaptureDevice for PatternDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn read_frame(&mut self, size: usize, dst: Option<&mut [u8]>) -> Result<usize> {
        if self.fail_after.is_some_and(|n| self.frame_no >= n) {
            return Err(LprError::hardware("pattern source: simulated DMA failure"));
        }
        let full = self.info.default_transfer_size();
        let want = if size == 0 { full } else { size };
        if want > full {
            return Err(LprError::hardware(format!(
                "transfer of {want} bytes exceeds device buffer ({full})"
            )));
        }
        let Some(dst) = dst else {
            if self.mapping.is_none() {
                return Err(LprError::hardware("pattern source has no mapped buffer"));
            }
            self.frame_no += 1;
            return Ok(want);
        };
        if dst.len() < full {
            return Err(LprError::hardware(format!(
                "destination holds {} bytes, frame needs {full}",
                dst.len()
            )));
        }
        self.render(dst);
        self.frame_no += 1;
        Ok(want)
    }

    fn mapped(&self) -> Option<SharedFrame> {
        self.mapping.as_ref().map(|m| Arc::clone(m) as SharedFrame)
    }
}
