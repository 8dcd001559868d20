// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 结果叠加 (draws the latest results onto a display slot)

use crate::context::ResultsSnapshot;
use crate::detection::DetBox;
use crate::pixel::{encode_565, SlotFormat};

// RGB
const YELLOW: [u8; 3] = [255, 255, 0];
const GREEN: [u8; 3] = [0, 255, 0];
const CYAN: [u8; 3] = [0, 255, 255];
const MAGENTA: [u8; 3] = [255, 0, 255];
const RED: [u8; 3] = [255, 0, 0];
const WHITE: [u8; 3] = [255, 255, 255];
const GRAY: [u8; 3] = [64, 64, 64];

const BOX_THICKNESS: i32 = 2;
const GLYPH_ADVANCE: i32 = 6;
const INDICATOR: i32 = 16;

/// 5x7 glyph rows, bit 4 = leftmost column. Unknown characters are blank.
fn glyph5x7(ch: char) -> [u8; 7] {
    match ch.to_ascii_uppercase() {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'A' => [0x0E, 0x11, 0x11, 0x11, 0x1F, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        _ => [0; 7],
    }
}

/// Clipped drawing on one slot buffer
pub struct Canvas<'a> {
    buf: &'a mut [u8],
    width: i32,
    height: i32,
    stride: usize,
    format: SlotFormat,
}

impl<'a> Canvas<'a> {
    pub fn new(buf: &'a mut [u8], width: u32, height: u32, stride: usize, format: SlotFormat) -> Self {
        // 缓冲区不足时裁掉多余的行
        let rows = if stride == 0 { 0 } else { buf.len() / stride };
        Self {
            buf,
            width: width.min((stride / format.bytes_per_pixel()) as u32) as i32,
            height: height.min(rows as u32) as i32,
            stride,
            format,
        }
    }

    #[inline]
    pub fn put(&mut self, x: i32, y: i32, rgb: [u8; 3]) {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return;
        }
        let bpp = self.format.bytes_per_pixel();
        let idx = y as usize * self.stride + x as usize * bpp;
        match self.format {
            SlotFormat::Rgb565(order) => {
                let v = encode_565(rgb, order).to_ne_bytes();
                self.buf[idx..idx + 2].copy_from_slice(&v);
            }
            SlotFormat::Bgrx => {
                // X 字节保持不变
                self.buf[idx] = rgb[2];
                self.buf[idx + 1] = rgb[1];
                self.buf[idx + 2] = rgb[0];
            }
        }
    }

    pub fn hline(&mut self, x1: i32, x2: i32, y: i32, rgb: [u8; 3]) {
        if y < 0 || y >= self.height {
            return;
        }
        let (a, b) = (x1.min(x2).max(0), x1.max(x2).min(self.width - 1));
        for x in a..=b {
            self.put(x, y, rgb);
        }
    }

    pub fn vline(&mut self, x: i32, y1: i32, y2: i32, rgb: [u8; 3]) {
        if x < 0 || x >= self.width {
            return;
        }
        let (a, b) = (y1.min(y2).max(0), y1.max(y2).min(self.height - 1));
        for y in a..=b {
            self.put(x, y, rgb);
        }
    }

    pub fn rect(&mut self, b: &DetBox, rgb: [u8; 3]) {
        for t in 0..BOX_THICKNESS {
            self.hline(b.x1, b.x2, b.y1 + t, rgb);
            self.hline(b.x1, b.x2, b.y2 - t, rgb);
            self.vline(b.x1 + t, b.y1, b.y2, rgb);
            self.vline(b.x2 - t, b.y1, b.y2, rgb);
        }
    }

    pub fn fill(&mut self, x: i32, y: i32, w: i32, h: i32, rgb: [u8; 3]) {
        for yy in y..y + h {
            self.hline(x, x + w - 1, yy, rgb);
        }
    }

    pub fn text(&mut self, x: i32, y: i32, s: &str, rgb: [u8; 3]) {
        for (i, ch) in s.chars().enumerate() {
            let ox = x + i as i32 * GLYPH_ADVANCE;
            for (row, bits) in glyph5x7(ch).iter().enumerate() {
                for col in 0..5 {
                    if bits & (1 << (4 - col)) != 0 {
                        self.put(ox + col, y + row as i32, rgb);
                    }
                }
            }
        }
    }
}

/// Per-session overlay settings
#[derive(Debug, Clone)]
pub struct Overlay {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub format: SlotFormat,
    /// 行人事件开启时画停止线和红灯指示
    pub stop_line_y: Option<i32>,
}

impl Overlay {
    pub fn draw(&self, buf: &mut [u8], r: &ResultsSnapshot) {
        let mut c = Canvas::new(buf, self.width, self.height, self.stride, self.format);

        for v in &r.vehicles {
            c.rect(v, YELLOW);
        }
        for p in &r.persons {
            c.rect(p, GREEN);
        }
        for p in &r.plates {
            c.rect(&p.det, CYAN);
            let label = if p.text.is_empty() { p.color.name() } else { p.text.as_str() };
            // 框上方放不下就画在框内
            let ty = if p.det.y1 - 10 < 0 { p.det.y1 + 2 } else { p.det.y1 - 10 };
            c.text(p.det.x1, ty, label, CYAN);
        }
        if let Some(roi) = &r.aux_roi {
            c.rect(roi, MAGENTA);
        }
        if let Some(y) = self.stop_line_y {
            let color = if r.red_light { RED } else { WHITE };
            c.hline(0, self.width as i32 - 1, y, color);
            c.fill(4, 4, INDICATOR, INDICATOR, if r.red_light { RED } else { GRAY });
            if r.red_light {
                c.text(INDICATOR + 8, 8, "RED", RED);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{PlateColor, PlateDetection};
    use crate::pixel::PixelOrder;

    fn px565(buf: &[u8], w: usize, x: usize, y: usize) -> u16 {
        let i = (y * w + x) * 2;
        u16::from_ne_bytes([buf[i], buf[i + 1]])
    }

    #[test]
    fn rect_is_clipped_at_frame_edges() {
        let (w, h) = (32usize, 16usize);
        let mut buf = vec![0u8; w * h * 2];
        let mut c = Canvas::new(&mut buf, w as u32, h as u32, w * 2, SlotFormat::Rgb565(PixelOrder::Bgr565));
        c.rect(&DetBox::new(-5, -5, 40, 20, 1.0, 0), YELLOW);
        // nothing visible inside the box
        assert_eq!(px565(&buf, w, 10, 8), 0);
    }

    #[test]
    fn rect_edges_565() {
        let (w, h) = (32usize, 16usize);
        let mut buf = vec![0u8; w * h * 2];
        let mut c = Canvas::new(&mut buf, w as u32, h as u32, w * 2, SlotFormat::Rgb565(PixelOrder::Rgb565));
        c.rect(&DetBox::new(4, 4, 20, 12, 1.0, 0), YELLOW);
        assert_eq!(px565(&buf, w, 4, 4), 0xFFE0);
        assert_eq!(px565(&buf, w, 20, 12), 0xFFE0);
        assert_eq!(px565(&buf, w, 5, 5), 0xFFE0);
        assert_eq!(px565(&buf, w, 10, 8), 0);
    }

    #[test]
    fn bgrx_keeps_aux_byte() {
        let (w, h) = (8usize, 8usize);
        let mut buf = vec![7u8; w * h * 4];
        let mut c = Canvas::new(&mut buf, w as u32, h as u32, w * 4, SlotFormat::Bgrx);
        c.put(1, 1, [255, 0, 255]);
        let i = (w + 1) * 4;
        assert_eq!(&buf[i..i + 4], &[255, 0, 255, 7]);
    }

    #[test]
    fn unknown_glyphs_draw_nothing() {
        let (w, h) = (32usize, 8usize);
        let mut buf = vec![0u8; w * h * 4];
        let mut c = Canvas::new(&mut buf, w as u32, h as u32, w * 4, SlotFormat::Bgrx);
        c.text(0, 0, "京 ", WHITE);
        assert!(buf.iter().all(|&b| b == 0));
        let mut c = Canvas::new(&mut buf, w as u32, h as u32, w * 4, SlotFormat::Bgrx);
        c.text(0, 0, "-", WHITE);
        // dash is row 3
        let lit: Vec<usize> = (0..w).filter(|&x| buf[(3 * w + x) * 4] == 255).collect();
        assert_eq!(lit, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn short_buffer_is_not_overrun() {
        let mut buf = vec![0u8; 10 * 4 * 2];
        let overlay = Overlay {
            width: 10,
            height: 10,
            stride: 20,
            format: SlotFormat::Rgb565(PixelOrder::Bgr565),
            stop_line_y: Some(8),
        };
        let mut r = ResultsSnapshot::default();
        r.vehicles.push(DetBox::new(0, 0, 9, 9, 1.0, 2));
        overlay.draw(&mut buf, &r);
    }

    #[test]
    fn plate_label_falls_back_to_color() {
        let (w, h) = (64usize, 32usize);
        let mut buf = vec![0u8; w * h * 4];
        let overlay = Overlay {
            width: w as u32,
            height: h as u32,
            stride: w * 4,
            format: SlotFormat::Bgrx,
            stop_line_y: None,
        };
        let det = DetBox::new(2, 14, 40, 28, 0.9, 0);
        let mut r = ResultsSnapshot::default();
        r.plates.push(PlateDetection {
            det,
            crop: det,
            color: PlateColor::Blue,
            ..Default::default()
        });
        overlay.draw(&mut buf, &r);
        // "B" top row at y = 14 - 10 = 4 starts at x = 2: 0x1E lights columns 0..3
        let at = |x: usize, y: usize| buf[(y * w + x) * 4 + 1];
        assert_eq!(at(1, 4), 0);
        assert_eq!(at(2, 4), 255);
        assert_eq!(at(5, 4), 255);
        assert_eq!(at(6, 4), 0);
    }
}
