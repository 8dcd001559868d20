// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 命令行参数 + 感知阶段调参 (JSON)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::device::PixelFormat;
use crate::error::{LprError, Result};
use crate::pixel::PixelOrder;

pub const MIN_COPY_BUFFERS: i64 = 2;
pub const MAX_COPY_BUFFERS: i64 = 6;

/// Optional software pass before detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Enhance {
    #[default]
    None,
    Sharpen,
    Denoise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SinkKind {
    /// appsrc → queue → kmssink
    #[default]
    Gst,
    /// drop frames right after push
    Null,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "FPGA 采集 + 车牌识别 + KMS 显示", long_about = None)]
pub struct Args {
    /// FPGA 设备文件, 或 `pattern` 使用内置测试图
    #[arg(long, default_value = "/dev/fpga_dma0")]
    pub device: String,

    /// 车辆/行人检测模型 (ONNX)
    #[arg(long)]
    pub veh_model: Option<PathBuf>,

    /// 车牌检测模型 (ONNX)
    #[arg(long)]
    pub plate_model: PathBuf,

    /// 车牌字符识别模型 (ONNX, CTC 输出)
    #[arg(long)]
    pub ocr_model: Option<PathBuf>,

    /// 检测类别标签, 每行一个
    #[arg(long)]
    pub labels: Option<PathBuf>,

    /// OCR 字符表, 每行一个字符
    #[arg(long)]
    pub ocr_keys: Option<PathBuf>,

    /// CTC blank 类别索引 (默认 = 字符表长度)
    #[arg(long)]
    pub ocr_blank: Option<usize>,

    #[arg(long, default_value_t = 15)]
    pub fps: i64,

    /// 等待空闲帧槽的超时 (ms)
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: i64,

    /// 统计输出间隔 (s)
    #[arg(long, default_value_t = 1)]
    pub stats_interval: i64,

    /// 显示帧槽数量 (2..=6)
    #[arg(long, default_value_t = 2)]
    pub copy_buffers: i64,

    /// appsrc 最大排队帧数
    #[arg(long, default_value_t = 1)]
    pub queue_depth: i64,

    #[arg(long, value_enum, default_value_t = PixelOrder::Bgr565)]
    pub pixel_order: PixelOrder,

    /// 每个 16 位像素交换字节 (0|1)
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub swap16: bool,

    #[arg(long, default_value_t = 0.35)]
    pub min_car_conf: f32,

    #[arg(long, default_value_t = 0.35)]
    pub min_person_conf: f32,

    #[arg(long, default_value_t = 0.35)]
    pub min_plate_conf: f32,

    /// 只保留落在车辆框内的车牌 (0|1)
    #[arg(long, default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub plate_on_car_only: bool,

    /// 只跑车牌检测, 不跑车辆/行人模型 (0|1, 优先于 --plate-on-car-only)
    #[arg(long, default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub plate_only: bool,

    /// 源格式与显示格式一致时直接显示 DMA 映射内存 (0|1)
    #[arg(long, default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub zero_copy: bool,

    #[arg(long, value_enum, default_value_t = Enhance::None)]
    pub enhance: Enhance,

    /// 行人闯红灯事件检测 (0|1)
    #[arg(long, default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub ped_event: bool,

    /// 停止线 y 坐标 (像素)
    #[arg(long)]
    pub stop_line_y: Option<i32>,

    /// 红色像素占比阈值
    #[arg(long, default_value_t = 0.02)]
    pub red_ratio: f32,

    /// 连续多少帧达到阈值才判定为红灯
    #[arg(long, default_value_t = 3)]
    pub red_stable_frames: u32,

    /// 显示 A 通道 ROI (0|1)
    #[arg(long, default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub aux_roi: bool,

    /// 车牌识别结果 CSV
    #[arg(long)]
    pub pred_csv: Option<PathBuf>,

    /// 调参 JSON 文件
    #[arg(long)]
    pub tuning: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = SinkKind::Gst)]
    pub sink: SinkKind,

    /// kmssink connector-id
    #[arg(long)]
    pub connector_id: Option<i32>,

    /// 测试图尺寸 (--device pattern)
    #[arg(long, default_value = "1280x720")]
    pub pattern_size: String,

    #[arg(long, value_enum, default_value_t = PixelFormat::Bgr565)]
    pub pattern_format: PixelFormat,
}

fn check_conf(name: &str, v: f32) -> Result<()> {
    if v > 0.0 && v <= 1.0 {
        Ok(())
    } else {
        Err(LprError::config(format!("--{name} must be in (0, 1], got {v}")))
    }
}

impl Args {
    /// Range checks; runs before any device, model or sink is opened.
    pub fn validate(&self) -> Result<()> {
        if self.fps <= 0 {
            return Err(LprError::config(format!("--fps must be > 0, got {}", self.fps)));
        }
        if self.timeout_ms <= 0 {
            return Err(LprError::config(format!(
                "--timeout-ms must be > 0, got {}",
                self.timeout_ms
            )));
        }
        if self.stats_interval <= 0 {
            return Err(LprError::config(format!(
                "--stats-interval must be > 0, got {}",
                self.stats_interval
            )));
        }
        if !(MIN_COPY_BUFFERS..=MAX_COPY_BUFFERS).contains(&self.copy_buffers) {
            return Err(LprError::config(format!(
                "--copy-buffers must be in {MIN_COPY_BUFFERS}..={MAX_COPY_BUFFERS}, got {}",
                self.copy_buffers
            )));
        }
        if self.queue_depth <= 0 {
            return Err(LprError::config(format!(
                "--queue-depth must be > 0, got {}",
                self.queue_depth
            )));
        }
        check_conf("min-car-conf", self.min_car_conf)?;
        check_conf("min-person-conf", self.min_person_conf)?;
        check_conf("min-plate-conf", self.min_plate_conf)?;
        if !(0.0..=1.0).contains(&self.red_ratio) {
            return Err(LprError::config(format!(
                "--red-ratio must be in [0, 1], got {}",
                self.red_ratio
            )));
        }
        if self.red_stable_frames == 0 {
            return Err(LprError::config("--red-stable-frames must be >= 1"));
        }
        if self.ped_event && self.stop_line_y.is_none() {
            return Err(LprError::config("--ped-event needs --stop-line-y"));
        }
        if self.ped_event && self.plate_only {
            return Err(LprError::config(
                "--ped-event needs the vehicle/person model, which --plate-only disables",
            ));
        }
        if self.ocr_model.is_some() && self.ocr_keys.is_none() {
            return Err(LprError::config("--ocr-model needs --ocr-keys"));
        }
        if !self.plate_only && self.veh_model.is_none() {
            return Err(LprError::config("--veh-model is required unless --plate-only 1"));
        }
        if self.is_pattern() {
            self.pattern_dims()?;
        }
        Ok(())
    }

    pub fn is_pattern(&self) -> bool {
        self.device == "pattern"
    }

    /// `--pattern-size` as (width, height)
    pub fn pattern_dims(&self) -> Result<(u32, u32)> {
        let bad = || LprError::config(format!("--pattern-size must be WxH, got {}", self.pattern_size));
        let (w, h) = self.pattern_size.split_once(['x', 'X']).ok_or_else(bad)?;
        let w = w.trim().parse::<u32>().map_err(|_| bad())?;
        let h = h.trim().parse::<u32>().map_err(|_| bad())?;
        if w == 0 || h == 0 {
            return Err(bad());
        }
        Ok((w, h))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.fps.max(1) as u64)
    }

    pub fn slot_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(0) as u64)
    }

    pub fn stats_period(&self) -> Duration {
        Duration::from_secs(self.stats_interval.max(1) as u64)
    }
}

/// Numeric knobs of the perception stages, overridable from JSON.
/// Hue values are on the 0..180 half-degree scale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    // === 检测 ===
    pub nms_iou: f32,

    // === 时域确认 ===
    pub confirm_iou_prev: f32,
    pub confirm_iou_prev2: f32,

    // === 车牌几何约束 ===
    pub plate_min_w: i32,
    pub plate_min_h: i32,
    pub plate_aspect_min: f32,
    pub plate_aspect_max: f32,
    pub plate_min_area: i64,
    pub plate_band_top: f32,    // 车牌中心 y 不得高于 帧高 × top
    pub plate_band_bottom: f32, // 也不得低于 帧高 × bottom

    // === OCR 裁剪 ===
    pub ocr_crop_w: i32,
    pub ocr_crop_h: i32,

    // === 颜色分类 ===
    pub color_margin_div: i32, // 内缩 1/N
    pub blue_hue_min: f32,
    pub blue_hue_max: f32,
    pub blue_s_min: f32,
    pub blue_v_min: f32,
    pub green_hue_min: f32,
    pub green_hue_max: f32,
    pub green_s_min: f32,
    pub green_v_min: f32,
    pub yellow_hue_min: f32,
    pub yellow_hue_max: f32,
    pub yellow_s_min: f32,
    pub yellow_v_min: f32,
    pub white_s_max: f32,
    pub white_v_min: f32,
    pub black_v_max: f32,
    pub color_min_share: f32,  // 获胜颜色最少占比
    pub color_lead_share: f32, // 领先第二名的占比

    // === 行人跟踪 ===
    pub track_radius: f32,
    pub track_ttl: u32,

    // === 车牌归属 ===
    pub parent_overlap_ratio: f32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            nms_iou: 0.45,

            confirm_iou_prev: 0.35,
            confirm_iou_prev2: 0.30,

            plate_min_w: 24,
            plate_min_h: 8,
            plate_aspect_min: 2.4,
            plate_aspect_max: 5.8,
            plate_min_area: 400,
            plate_band_top: 0.15,
            plate_band_bottom: 0.98,

            ocr_crop_w: 168,
            ocr_crop_h: 48,

            color_margin_div: 6,
            blue_hue_min: 90.0,
            blue_hue_max: 130.0,
            blue_s_min: 0.23,
            blue_v_min: 0.16,
            green_hue_min: 35.0,
            green_hue_max: 90.0,
            green_s_min: 0.20,
            green_v_min: 0.16,
            yellow_hue_min: 15.0,
            yellow_hue_max: 35.0,
            yellow_s_min: 0.35,
            yellow_v_min: 0.35,
            white_s_max: 0.15,
            white_v_min: 0.70,
            black_v_max: 0.20,
            color_min_share: 0.20,
            color_lead_share: 0.05,

            track_radius: 80.0,
            track_ttl: 5,

            parent_overlap_ratio: 0.70,
        }
    }
}

impl Tuning {
    /// Missing file → defaults (with a warning); unparsable → error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => {
                let tuning: Self = serde_json::from_str(&json).map_err(|e| {
                    LprError::config(format!("tuning file {}: {e}", path.display()))
                })?;
                info!("✅ tuning loaded from {}", path.display());
                Ok(tuning)
            }
            Err(e) => {
                warn!("⚠️  tuning file {} unreadable ({e}), using defaults", path.display());
                Ok(Self::default())
            }
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| LprError::config(format!("serialize tuning: {e}")))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn print_summary(&self) {
        info!(
            "🎛️  nms_iou={:.2} confirm={:.2}/{:.2} plate {}x{}+ aspect {:.1}..{:.1} track r={} ttl={}",
            self.nms_iou,
            self.confirm_iou_prev,
            self.confirm_iou_prev2,
            self.plate_min_w,
            self.plate_min_h,
            self.plate_aspect_min,
            self.plate_aspect_max,
            self.track_radius,
            self.track_ttl
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["fpga-lpr", "--plate-model", "plate.onnx", "--veh-model", "veh.onnx"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_field_values() {
        let a = parse(&[]);
        assert_eq!(a.fps, 15);
        assert_eq!(a.timeout_ms, 5000);
        assert_eq!(a.stats_interval, 1);
        assert_eq!(a.copy_buffers, 2);
        assert_eq!(a.queue_depth, 1);
        assert!(a.swap16);
        assert!(!a.plate_only && !a.plate_on_car_only && !a.zero_copy);
        assert_eq!(a.pixel_order, PixelOrder::Bgr565);
        assert_eq!(a.sink, SinkKind::Gst);
        assert!((a.min_car_conf - 0.35).abs() < 1e-6);
        assert!(a.validate().is_ok());
        assert_eq!(a.frame_interval(), Duration::from_nanos(66_666_666));
    }

    #[test]
    fn zero_one_switches() {
        let a = parse(&["--swap16", "0", "--plate-only", "1", "--pixel-order", "rgb565"]);
        assert!(!a.swap16);
        assert!(a.plate_only);
        assert_eq!(a.pixel_order, PixelOrder::Rgb565);
    }

    #[test]
    fn out_of_range_values_rejected() {
        for extra in [
            &["--fps", "0"][..],
            &["--timeout-ms", "0"],
            &["--stats-interval", "0"],
            &["--copy-buffers", "1"],
            &["--copy-buffers", "7"],
            &["--queue-depth", "0"],
            &["--min-plate-conf", "1.5"],
            &["--min-car-conf", "0"],
            &["--red-ratio", "2"],
            &["--red-stable-frames", "0"],
            &["--ped-event", "1"],
            &["--ocr-model", "ocr.onnx"],
        ] {
            let err = parse(extra).validate().unwrap_err();
            assert!(matches!(err, LprError::ConfigValidation(_)), "{extra:?}");
        }
    }

    #[test]
    fn vehicle_model_needed_unless_plate_only() {
        let a = Args::try_parse_from(["fpga-lpr", "--plate-model", "p.onnx"]).unwrap();
        assert!(a.validate().is_err());
        let a = Args::try_parse_from(["fpga-lpr", "--plate-model", "p.onnx", "--plate-only", "1"])
            .unwrap();
        assert!(a.validate().is_ok());
    }

    #[test]
    fn ped_event_conflicts_with_plate_only() {
        let a = parse(&["--ped-event", "1", "--stop-line-y", "400", "--plate-only", "1"]);
        assert!(a.validate().is_err());
        let a = parse(&["--ped-event", "1", "--stop-line-y", "400"]);
        assert!(a.validate().is_ok());
    }

    #[test]
    fn pattern_size_parsing() {
        let a = parse(&["--device", "pattern", "--pattern-size", "640x480"]);
        assert_eq!(a.pattern_dims().unwrap(), (640, 480));
        let a = parse(&["--device", "pattern", "--pattern-size", "640"]);
        assert!(a.validate().is_err());
    }

    #[test]
    fn tuning_partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tuning.json");
        fs::write(&path, r#"{ "nms_iou": 0.5, "track_ttl": 9 }"#).unwrap();
        let t = Tuning::load(&path).unwrap();
        assert!((t.nms_iou - 0.5).abs() < 1e-6);
        assert_eq!(t.track_ttl, 9);
        assert_eq!(t.plate_min_w, 24);
    }

    #[test]
    fn tuning_missing_and_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Tuning::load(dir.path().join("nope.json")).unwrap();
        assert_eq!(missing, Tuning::default());
        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ nms_iou: ").unwrap();
        assert!(matches!(
            Tuning::load(&broken),
            Err(LprError::ConfigValidation(_))
        ));
    }

    #[test]
    fn tuning_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        let mut t = Tuning::default();
        t.track_radius = 55.0;
        t.save(&path).unwrap();
        assert_eq!(Tuning::load(&path).unwrap(), t);
    }
}
