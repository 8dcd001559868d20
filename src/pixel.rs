// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 像素格式转换 (Pixel format conversion)
//!
//! Stateless helpers between the grabber's wire formats and the RGB888
//! buffers the detectors consume:
//! - RGB565 / BGR565, optionally byte-swapped per 16-bit word
//! - BGRX8888 where the X byte carries the auxiliary tag channel

use fast_image_resize as fr;

use crate::error::{LprError, Result};

/// 16-bit channel order of the capture stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PixelOrder {
    /// red in the low 5 bits
    #[default]
    Bgr565,
    /// red in the high 5 bits
    Rgb565,
}

impl PixelOrder {
    /// GStreamer raw video format name for this order
    pub fn caps_format(&self) -> &'static str {
        match self {
            PixelOrder::Bgr565 => "BGR16",
            PixelOrder::Rgb565 => "RGB16",
        }
    }
}

/// Layout of a display slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFormat {
    /// native-endian 16-bit pixels
    Rgb565(PixelOrder),
    /// B, G, R, X
    Bgrx,
}

impl SlotFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            SlotFormat::Rgb565(_) => 2,
            SlotFormat::Bgrx => 4,
        }
    }

    pub fn caps_format(&self) -> &'static str {
        match self {
            SlotFormat::Rgb565(order) => order.caps_format(),
            SlotFormat::Bgrx => "BGRx",
        }
    }
}

#[inline]
fn expand5(v: u16) -> u8 {
    ((v << 3) | (v >> 2)) as u8
}

#[inline]
fn expand6(v: u16) -> u8 {
    ((v << 2) | (v >> 4)) as u8
}

/// Decode one 16-bit pixel given as its two bytes in stream order.
#[inline]
pub fn decode_565(lo: u8, hi: u8, order: PixelOrder, swap16: bool) -> [u8; 3] {
    let (lo, hi) = if swap16 { (hi, lo) } else { (lo, hi) };
    let pix = lo as u16 | ((hi as u16) << 8);
    let g6 = (pix >> 5) & 0x3F;
    let (r5, b5) = match order {
        PixelOrder::Bgr565 => (pix & 0x1F, (pix >> 11) & 0x1F),
        PixelOrder::Rgb565 => ((pix >> 11) & 0x1F, pix & 0x1F),
    };
    [expand5(r5), expand6(g6), expand5(b5)]
}

/// Pack an RGB triple into a native-endian 16-bit display pixel.
#[inline]
pub fn encode_565(rgb: [u8; 3], order: PixelOrder) -> u16 {
    let r5 = (rgb[0] >> 3) as u16;
    let g6 = (rgb[1] >> 2) as u16;
    let b5 = (rgb[2] >> 3) as u16;
    match order {
        PixelOrder::Bgr565 => r5 | (g6 << 5) | (b5 << 11),
        PixelOrder::Rgb565 => (r5 << 11) | (g6 << 5) | b5,
    }
}

/// Full-frame 565 → RGB888. `rgb` must hold `raw.len() / 2 * 3` bytes.
pub fn raw565_to_rgb(raw: &[u8], order: PixelOrder, swap16: bool, rgb: &mut [u8]) {
    for (px, out) in raw.chunks_exact(2).zip(rgb.chunks_exact_mut(3)) {
        out.copy_from_slice(&decode_565(px[0], px[1], order, swap16));
    }
}

/// Copy a raw 565 frame into a display slot, undoing the stream byte swap.
pub fn copy_565_to_slot(src: &[u8], dst: &mut [u8], swap16: bool) {
    if !swap16 {
        dst.copy_from_slice(src);
        return;
    }
    for (s, d) in src.chunks_exact(2).zip(dst.chunks_exact_mut(2)) {
        d[0] = s[1];
        d[1] = s[0];
    }
}

/// BGRX8888 → RGB888, optionally extracting the X byte as the aux tag map.
pub fn bgrx_to_rgb_and_aux(raw: &[u8], rgb: &mut [u8], mut aux: Option<&mut [u8]>) {
    for (i, (px, out)) in raw.chunks_exact(4).zip(rgb.chunks_exact_mut(3)).enumerate() {
        out[0] = px[2];
        out[1] = px[1];
        out[2] = px[0];
        if let Some(tags) = aux.as_deref_mut() {
            tags[i] = px[3];
        }
    }
}

/// RGB → (hue in degrees [0, 360), saturation, value)
pub fn rgb_to_hsv(rgb: [u8; 3]) -> (f32, f32, f32) {
    let r = rgb[0] as f32 / 255.0;
    let g = rgb[1] as f32 / 255.0;
    let b = rgb[2] as f32 / 255.0;
    let mx = r.max(g).max(b);
    let mn = r.min(g).min(b);
    let d = mx - mn;
    let s = if mx == 0.0 { 0.0 } else { d / mx };
    let mut h = 0.0;
    if d > 1e-6 {
        h = if mx == r {
            60.0 * (((g - b) / d) % 6.0)
        } else if mx == g {
            60.0 * (((b - r) / d) + 2.0)
        } else {
            60.0 * (((r - g) / d) + 4.0)
        };
    }
    if h < 0.0 {
        h += 360.0;
    }
    (h, s, mx)
}

/// Copy an inclusive rectangle out of an RGB888 frame.
pub fn crop_rgb(rgb: &[u8], width: u32, x1: i32, y1: i32, x2: i32, y2: i32) -> (Vec<u8>, u32, u32) {
    let cw = (x2 - x1 + 1).max(0) as usize;
    let ch = (y2 - y1 + 1).max(0) as usize;
    let stride = width as usize * 3;
    let mut out = Vec::with_capacity(cw * ch * 3);
    for y in y1.max(0) as usize..y1.max(0) as usize + ch {
        let start = y * stride + x1.max(0) as usize * 3;
        out.extend_from_slice(&rgb[start..start + cw * 3]);
    }
    (out, cw as u32, ch as u32)
}

/// Nearest-neighbour RGB888 resizer (reuses its scratch between calls)
pub struct RgbResizer {
    resizer: fr::Resizer,
}

impl Default for RgbResizer {
    fn default() -> Self {
        Self::new()
    }
}

impl RgbResizer {
    pub fn new() -> Self {
        Self {
            resizer: fr::Resizer::new(),
        }
    }

    pub fn resize(&mut self, src: &[u8], sw: u32, sh: u32, dw: u32, dh: u32) -> Result<Vec<u8>> {
        if sw == dw && sh == dh {
            return Ok(src.to_vec());
        }
        let src_image = fr::images::ImageRef::new(sw, sh, src, fr::PixelType::U8x3)
            .map_err(|e| LprError::inference(format!("resize source {sw}x{sh}: {e}")))?;
        let mut dst_image = fr::images::Image::new(dw, dh, fr::PixelType::U8x3);
        self.resizer
            .resize(
                &src_image,
                &mut dst_image,
                &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Nearest),
            )
            .map_err(|e| LprError::inference(format!("resize to {dw}x{dh}: {e}")))?;
        Ok(dst_image.into_vec())
    }
}

/// One-shot nearest-neighbour resize
pub fn resize_rgb_nearest(src: &[u8], sw: u32, sh: u32, dw: u32, dh: u32) -> Result<Vec<u8>> {
    RgbResizer::new().resize(src, sw, sh, dw, dh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_resize_keeps_solid_color() {
        let src = [7u8, 8, 9].repeat(4 * 4);
        let out = resize_rgb_nearest(&src, 4, 4, 2, 2).unwrap();
        assert_eq!(out, [7u8, 8, 9].repeat(4));
    }

    #[test]
    fn decode_bgr565_primaries() {
        // red lives in the low 5 bits for BGR565
        assert_eq!(decode_565(0x1F, 0x00, PixelOrder::Bgr565, false), [255, 0, 0]);
        assert_eq!(decode_565(0xE0, 0x07, PixelOrder::Bgr565, false), [0, 255, 0]);
        assert_eq!(decode_565(0x00, 0xF8, PixelOrder::Bgr565, false), [0, 0, 255]);
    }

    #[test]
    fn decode_rgb565_with_swap() {
        // 0xF800 is pure red in RGB565; swapped stream sends 0xF8 first
        assert_eq!(decode_565(0xF8, 0x00, PixelOrder::Rgb565, true), [255, 0, 0]);
        assert_eq!(decode_565(0x00, 0xF8, PixelOrder::Rgb565, false), [255, 0, 0]);
        assert_eq!(decode_565(0xFF, 0xFF, PixelOrder::Rgb565, false), [255, 255, 255]);
    }

    #[test]
    fn encode_then_decode_keeps_high_bits() {
        let rgb = [200, 100, 50];
        for order in [PixelOrder::Bgr565, PixelOrder::Rgb565] {
            let v = encode_565(rgb, order);
            let back = decode_565(v as u8, (v >> 8) as u8, order, false);
            assert_eq!(back[0] >> 3, rgb[0] >> 3);
            assert_eq!(back[1] >> 2, rgb[1] >> 2);
            assert_eq!(back[2] >> 3, rgb[2] >> 3);
        }
    }

    #[test]
    fn slot_copy_swaps_bytes() {
        let src = [0x12, 0x34, 0x56, 0x78];
        let mut dst = [0u8; 4];
        copy_565_to_slot(&src, &mut dst, true);
        assert_eq!(dst, [0x34, 0x12, 0x78, 0x56]);
        copy_565_to_slot(&src, &mut dst, false);
        assert_eq!(dst, src);
    }

    #[test]
    fn bgrx_splits_aux_byte() {
        let raw = [10, 20, 30, 0x05, 1, 2, 3, 0x00];
        let mut rgb = [0u8; 6];
        let mut aux = [0u8; 2];
        bgrx_to_rgb_and_aux(&raw, &mut rgb, Some(&mut aux));
        assert_eq!(rgb, [30, 20, 10, 3, 2, 1]);
        assert_eq!(aux, [0x05, 0x00]);
    }

    #[test]
    fn hsv_of_known_colors() {
        let (h, s, v) = rgb_to_hsv([0, 0, 255]);
        assert!((h - 240.0).abs() < 1e-3 && (s - 1.0).abs() < 1e-6 && (v - 1.0).abs() < 1e-6);
        let (h, _, _) = rgb_to_hsv([0, 255, 0]);
        assert!((h - 120.0).abs() < 1e-3);
        let (h, _, _) = rgb_to_hsv([255, 0, 64]);
        assert!(h > 300.0 && h < 360.0);
        let (_, s, v) = rgb_to_hsv([0, 0, 0]);
        assert_eq!((s, v), (0.0, 0.0));
    }

    #[test]
    fn crop_extracts_inclusive_rect() {
        // 3x2 image, pixel value = x + 10*y in every channel
        let mut rgb = Vec::new();
        for y in 0..2u8 {
            for x in 0..3u8 {
                rgb.extend_from_slice(&[x + 10 * y; 3]);
            }
        }
        let (out, w, h) = crop_rgb(&rgb, 3, 1, 0, 2, 1);
        assert_eq!((w, h), (2, 2));
        assert_eq!(out, vec![1, 1, 1, 2, 2, 2, 11, 11, 11, 12, 12, 12]);
    }
}
