// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 车牌后处理: 几何过滤 / OCR 裁剪 / 颜色 / 类型 / 所属车辆

use regex::Regex;

use super::DetBox;
use crate::config::Tuning;
use crate::error::{LprError, Result};
use crate::pixel::rgb_to_hsv;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlateColor {
    Blue,
    Green,
    Yellow,
    White,
    Black,
    #[default]
    Unknown,
}

impl PlateColor {
    pub fn name(&self) -> &'static str {
        match self {
            PlateColor::Blue => "BLUE",
            PlateColor::Green => "GREEN",
            PlateColor::Yellow => "YELLOW",
            PlateColor::White => "WHITE",
            PlateColor::Black => "BLACK",
            PlateColor::Unknown => "UNK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlateType {
    SmallCar,
    LargeVehicle,
    NewEnergy,
    Police,
    Coach,
    Trailer,
    Embassy,
    HongKongMacau,
    Military,
    Foreign,
    #[default]
    Unknown,
}

impl PlateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlateType::SmallCar => "small_car",
            PlateType::LargeVehicle => "large_vehicle",
            PlateType::NewEnergy => "new_energy",
            PlateType::Police => "police",
            PlateType::Coach => "coach",
            PlateType::Trailer => "trailer",
            PlateType::Embassy => "embassy",
            PlateType::HongKongMacau => "hk_macau",
            PlateType::Military => "military",
            PlateType::Foreign => "foreign",
            PlateType::Unknown => "unknown",
        }
    }
}

/// One accepted plate of a results snapshot
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlateDetection {
    pub det: DetBox,
    /// OCR crop in frame coordinates
    pub crop: DetBox,
    pub color: PlateColor,
    pub plate_type: PlateType,
    pub text: String,
    pub ocr_conf: f32,
    /// index into the snapshot's vehicle list
    pub parent: Option<usize>,
}

impl PlateDetection {
    /// 检测置信度; OCR 读出文字时再乘上 OCR 置信度
    pub fn score(&self) -> f32 {
        if self.text.is_empty() {
            self.det.conf
        } else {
            self.det.conf * self.ocr_conf
        }
    }
}

/// Size, aspect, area and vertical-band rules for a candidate plate box.
pub fn is_plausible_plate(b: &DetBox, frame_h: u32, t: &Tuning) -> bool {
    let (w, h) = (b.width(), b.height());
    if w < t.plate_min_w || h < t.plate_min_h {
        return false;
    }
    let aspect = w as f32 / h as f32;
    if aspect < t.plate_aspect_min || aspect > t.plate_aspect_max {
        return false;
    }
    if b.area() < t.plate_min_area {
        return false;
    }
    let cy = b.center().1 as f32;
    let fh = frame_h as f32;
    cy >= fh * t.plate_band_top && cy <= fh * t.plate_band_bottom
}

/// Centre-anchored crop of at least `crop_w`×`crop_h`, grown to cover the
/// plate when it is bigger, shifted to stay inside the frame.
pub fn ocr_crop(b: &DetBox, frame_w: u32, frame_h: u32, crop_w: i32, crop_h: i32) -> DetBox {
    let fw = frame_w as i32;
    let fh = frame_h as i32;
    let cw = crop_w.max(b.width()).min(fw).max(1);
    let ch = crop_h.max(b.height()).min(fh).max(1);
    let (cx, cy) = b.center();
    let x1 = (cx - cw / 2).clamp(0, fw - cw);
    let y1 = (cy - ch / 2).clamp(0, fh - ch);
    DetBox::new(x1, y1, x1 + cw - 1, y1 + ch - 1, b.conf, b.class_id)
}

/// HSV bucket voting over the inner region of the plate box.
pub fn classify_color(rgb: &[u8], w: u32, h: u32, b: &DetBox, t: &Tuning) -> PlateColor {
    let div = t.color_margin_div.max(1);
    let mx = (b.x2 - b.x1) / div;
    let my = (b.y2 - b.y1) / div;
    let x1 = (b.x1 + mx).max(0);
    let y1 = (b.y1 + my).max(0);
    let x2 = (b.x2 - mx).min(w as i32 - 1);
    let y2 = (b.y2 - my).min(h as i32 - 1);

    const COLORS: [PlateColor; 5] = [
        PlateColor::Blue,
        PlateColor::Green,
        PlateColor::Yellow,
        PlateColor::White,
        PlateColor::Black,
    ];
    let mut votes = [0usize; 5];
    let mut total = 0usize;
    for y in y1..=y2 {
        for x in x1..=x2 {
            let i = (y as usize * w as usize + x as usize) * 3;
            let (hue, s, v) = rgb_to_hsv([rgb[i], rgb[i + 1], rgb[i + 2]]);
            let hue = hue / 2.0;
            total += 1;
            let bucket = if (t.blue_hue_min..=t.blue_hue_max).contains(&hue)
                && s > t.blue_s_min
                && v > t.blue_v_min
            {
                Some(0)
            } else if (t.green_hue_min..=t.green_hue_max).contains(&hue)
                && s > t.green_s_min
                && v > t.green_v_min
            {
                Some(1)
            } else if (t.yellow_hue_min..=t.yellow_hue_max).contains(&hue)
                && s > t.yellow_s_min
                && v > t.yellow_v_min
            {
                Some(2)
            } else if s < t.white_s_max && v > t.white_v_min {
                Some(3)
            } else if v < t.black_v_max {
                Some(4)
            } else {
                None
            };
            if let Some(k) = bucket {
                votes[k] += 1;
            }
        }
    }
    if total == 0 {
        return PlateColor::Unknown;
    }

    let mut order: Vec<usize> = (0..votes.len()).collect();
    order.sort_by(|&a, &b| votes[b].cmp(&votes[a]));
    let (best, second) = (votes[order[0]], votes[order[1]]);
    let lead = (t.color_lead_share * total as f32) as usize;
    if best as f32 / total as f32 >= t.color_min_share && best > second + lead {
        COLORS[order[0]]
    } else {
        PlateColor::Unknown
    }
}

/// Keyword rules on the recognised text first, then plate colour.
pub struct PlateTypeClassifier {
    new_energy: Regex,
}

impl PlateTypeClassifier {
    pub fn new() -> Result<Self> {
        // 省份 + 字母 + 6 位, D/F 在第 3 位或末位
        let new_energy = Regex::new(r"^\p{Han}[A-Z]([DF][A-HJ-NP-Z0-9]{5}|[A-HJ-NP-Z0-9]{5}[DF])$")
            .map_err(|e| LprError::config(format!("new-energy pattern: {e}")))?;
        Ok(Self { new_energy })
    }

    pub fn classify(&self, color: PlateColor, text: &str) -> PlateType {
        const KEYWORDS: [(char, PlateType); 7] = [
            ('警', PlateType::Police),
            ('学', PlateType::Coach),
            ('挂', PlateType::Trailer),
            ('使', PlateType::Embassy),
            ('领', PlateType::Embassy),
            ('港', PlateType::HongKongMacau),
            ('澳', PlateType::HongKongMacau),
        ];
        if let Some((_, t)) = KEYWORDS.iter().find(|(k, _)| text.contains(*k)) {
            return *t;
        }
        match color {
            PlateColor::Blue => PlateType::SmallCar,
            PlateColor::Yellow => PlateType::LargeVehicle,
            PlateColor::Green if self.new_energy.is_match(text) => PlateType::NewEnergy,
            PlateColor::White => PlateType::Military,
            PlateColor::Black => PlateType::Foreign,
            _ => PlateType::Unknown,
        }
    }
}

/// Vehicle that owns the plate: first one containing the plate centre,
/// else the one covering the largest share (> `min_ratio`) of the plate.
pub fn find_parent_vehicle(plate: &DetBox, vehicles: &[DetBox], min_ratio: f32) -> Option<usize> {
    let (cx, cy) = plate.center();
    let plate_area = plate.area();
    let mut best = None;
    let mut best_ratio = 0.0f32;
    for (i, v) in vehicles.iter().enumerate() {
        if v.contains(cx, cy) {
            return Some(i);
        }
        let ratio = if plate_area > 0 {
            plate.intersection(v) as f32 / plate_area as f32
        } else {
            0.0
        };
        if ratio > min_ratio && ratio > best_ratio {
            best_ratio = ratio;
            best = Some(i);
        }
    }
    best
}
