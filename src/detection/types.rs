// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 检测框: 帧坐标下的整数矩形 (含端点) + 置信度 + 类别
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DetBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub conf: f32,
    pub class_id: usize,
}

impl DetBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32, conf: f32, class_id: usize) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            conf,
            class_id,
        }
    }

    /// Clamp into a `w`×`h` frame; afterwards x2 >= x1 and y2 >= y1.
    pub fn clamp(&self, w: u32, h: u32) -> Self {
        let max_x = w.max(1) as i32 - 1;
        let max_y = h.max(1) as i32 - 1;
        let x1 = self.x1.clamp(0, max_x);
        let y1 = self.y1.clamp(0, max_y);
        let x2 = self.x2.clamp(x1, max_x);
        let y2 = self.y2.clamp(y1, max_y);
        Self {
            x1,
            y1,
            x2,
            y2,
            ..*self
        }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1 + 1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1 + 1
    }

    pub fn area(&self) -> i64 {
        self.width().max(0) as i64 * self.height().max(0) as i64
    }

    pub fn center(&self) -> (i32, i32) {
        ((self.x1 + self.x2) / 2, (self.y1 + self.y2) / 2)
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }

    /// Area of the inclusive intersection rectangle
    pub fn intersection(&self, other: &DetBox) -> i64 {
        let iw = (self.x2.min(other.x2) - self.x1.max(other.x1) + 1).max(0) as i64;
        let ih = (self.y2.min(other.y2) - self.y1.max(other.y1) + 1).max(0) as i64;
        iw * ih
    }

    pub fn iou(&self, other: &DetBox) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            return 0.0;
        }
        inter as f32 / union as f32
    }
}
