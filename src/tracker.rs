// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 行人跟踪 + 闯红灯事件
//! Nearest-centre tracks, stop-line crossing test and the debounced red signal

use tracing::info;

use crate::detection::DetBox;

// A 通道标记位
pub const AUX_VALID: u8 = 0b0001;
pub const AUX_EDGE: u8 = 0b0010;
pub const AUX_CLASS_SHIFT: u8 = 2;
pub const AUX_CLASS_RED: u8 = 1;

#[inline]
fn aux_class(tag: u8) -> u8 {
    (tag >> AUX_CLASS_SHIFT) & 0b11
}

/// Red share of the valid-tagged pixels plus the bounding rectangle of
/// all valid pixels. No valid pixel → (0.0, None).
pub fn aux_red_ratio(aux: &[u8], w: u32, h: u32) -> (f32, Option<DetBox>) {
    let w = w as usize;
    let mut valid = 0u64;
    let mut red = 0u64;
    let (mut x1, mut y1, mut x2, mut y2) = (usize::MAX, usize::MAX, 0usize, 0usize);

    for (y, row) in aux.chunks_exact(w.max(1)).take(h as usize).enumerate() {
        for (x, &tag) in row.iter().enumerate() {
            if tag & AUX_VALID == 0 {
                continue;
            }
            valid += 1;
            if aux_class(tag) == AUX_CLASS_RED {
                red += 1;
            }
            x1 = x1.min(x);
            y1 = y1.min(y);
            x2 = x2.max(x);
            y2 = y2.max(y);
        }
    }

    if valid == 0 {
        return (0.0, None);
    }
    let roi = DetBox::new(x1 as i32, y1 as i32, x2 as i32, y2 as i32, 1.0, 0);
    (red as f32 / valid as f32, Some(roi))
}

/// 连续 N 帧达到阈值才判定红灯
#[derive(Debug, Clone)]
pub struct RedLightDebouncer {
    threshold: f32,
    stable_frames: u32,
    streak: u32,
}

impl RedLightDebouncer {
    pub fn new(threshold: f32, stable_frames: u32) -> Self {
        Self {
            threshold,
            stable_frames: stable_frames.max(1),
            streak: 0,
        }
    }

    pub fn update(&mut self, ratio: f32) -> bool {
        if ratio >= self.threshold {
            self.streak = self.streak.saturating_add(1);
        } else {
            self.streak = 0;
        }
        self.is_red()
    }

    pub fn is_red(&self) -> bool {
        self.streak >= self.stable_frames
    }
}

#[derive(Debug, Clone)]
pub struct PedTrack {
    pub id: u32,
    pub bbox: DetBox,
    /// 剩余存活周期
    pub ttl: u32,
}

impl PedTrack {
    fn center_y(&self) -> i32 {
        self.bbox.center().1
    }
}

pub struct PedestrianTracker {
    tracks: Vec<PedTrack>,
    stop_line_y: i32,
    radius: f32,
    ttl: u32,
    next_id: u32,
    events: u64,
}

impl PedestrianTracker {
    pub fn new(stop_line_y: i32, radius: f32, ttl: u32) -> Self {
        Self {
            tracks: Vec::new(),
            stop_line_y,
            radius,
            ttl: ttl.max(1),
            next_id: 1,
            events: 0,
        }
    }

    pub fn tracks(&self) -> &[PedTrack] {
        &self.tracks
    }

    /// Crossings seen so far
    pub fn events(&self) -> u64 {
        self.events
    }

    /// One cycle. Returns the number of new crossing events.
    pub fn update(&mut self, persons: &[DetBox], red: bool) -> usize {
        let r2 = (self.radius * self.radius) as i64;
        let mut used = vec![false; persons.len()];
        let mut crossed = 0;

        for track in self.tracks.iter_mut() {
            track.ttl = track.ttl.saturating_sub(1);

            let (tx, ty) = track.bbox.center();
            let mut best: Option<(usize, i64)> = None;
            for (i, p) in persons.iter().enumerate() {
                if used[i] {
                    continue;
                }
                let (px, py) = p.center();
                let (dx, dy) = ((px - tx) as i64, (py - ty) as i64);
                let d2 = dx * dx + dy * dy;
                if d2 <= r2 && best.map_or(true, |(_, bd)| d2 < bd) {
                    best = Some((i, d2));
                }
            }

            if let Some((i, _)) = best {
                used[i] = true;
                let prev_cy = track.center_y();
                track.bbox = persons[i];
                track.ttl = self.ttl;
                let cy = track.center_y();
                if red && prev_cy < self.stop_line_y && cy >= self.stop_line_y {
                    crossed += 1;
                    info!("🚶 pedestrian #{} crossed stop line y={} on red", track.id, self.stop_line_y);
                }
            }
        }

        for (p, _) in persons.iter().zip(&used).filter(|(_, u)| !**u) {
            self.tracks.push(PedTrack {
                id: self.next_id,
                bbox: *p,
                ttl: self.ttl,
            });
            self.next_id = self.next_id.wrapping_add(1);
        }

        self.tracks.retain(|t| t.ttl > 0);
        self.events += crossed as u64;
        crossed
    }
}
