// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 三帧时域确认 (plate boxes must persist across t-2, t-1, t)

use super::DetBox;

#[derive(Debug, Clone)]
pub struct TemporalConfirmation {
    prev: Vec<DetBox>,
    prev2: Vec<DetBox>,
    iou_prev: f32,
    iou_prev2: f32,
}

impl Default for TemporalConfirmation {
    fn default() -> Self {
        Self::new(0.35, 0.30)
    }
}

impl TemporalConfirmation {
    pub fn new(iou_prev: f32, iou_prev2: f32) -> Self {
        Self {
            prev: Vec::new(),
            prev2: Vec::new(),
            iou_prev,
            iou_prev2,
        }
    }

    /// Keep the boxes of `filtered` that overlap a box in both earlier
    /// frames, then shift the window. History stores the filtered list,
    /// not the confirmed one, so a new plate is confirmed on its third frame.
    pub fn confirm(&mut self, filtered: &[DetBox]) -> Vec<DetBox> {
        let hits = |hist: &[DetBox], b: &DetBox, thr: f32| hist.iter().any(|h| h.iou(b) >= thr);
        let confirmed = filtered
            .iter()
            .filter(|b| hits(&self.prev, b, self.iou_prev) && hits(&self.prev2, b, self.iou_prev2))
            .copied()
            .collect();
        self.prev2 = std::mem::replace(&mut self.prev, filtered.to_vec());
        confirmed
    }

    pub fn reset(&mut self) {
        self.prev.clear();
        self.prev2.clear();
    }
}
