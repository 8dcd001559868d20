// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod confirm; // 三帧时域确认
pub mod decode; // Rows / Grid 输出解码
pub mod plate; // 车牌规则 + 颜色/类型
pub mod types;

pub use confirm::TemporalConfirmation;
pub use decode::{decode, DecodeParams, OutputLayout};
pub use plate::{PlateColor, PlateDetection, PlateType, PlateTypeClassifier};
pub use types::DetBox;

use tracing::{info, warn};

use crate::error::Result;
use crate::pixel::RgbResizer;
use crate::runtime::InferenceRuntime;

/// One detection model: runtime + output layout resolved at load.
pub struct Detector {
    name: String,
    runtime: Box<dyn InferenceRuntime>,
    layout: OutputLayout,
    conf_threshold: f32,
    nms_iou: f32,
    resizer: RgbResizer,
}

impl Detector {
    pub fn new(name: &str, runtime: Box<dyn InferenceRuntime>, conf_threshold: f32, nms_iou: f32) -> Self {
        let (in_w, in_h) = runtime.input_size();
        let layout = OutputLayout::resolve(runtime.output_shapes(), in_w, in_h);
        match &layout {
            OutputLayout::Unsupported(why) => {
                warn!("⚠️  {name}: unsupported output layout, detector disabled ({why})")
            }
            l => info!(
                "🎯 {name}: {} classes, layout {}",
                l.num_classes(),
                match l {
                    OutputLayout::Rows { rows, cols, .. } => format!("rows {rows}x{cols}"),
                    OutputLayout::Grid { heads, .. } => format!("{} anchor heads", heads.len()),
                    OutputLayout::Unsupported(_) => String::new(),
                }
            ),
        }
        Self {
            name: name.to_string(),
            runtime,
            layout,
            conf_threshold,
            nms_iou,
            resizer: RgbResizer::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn is_enabled(&self) -> bool {
        self.layout.is_supported()
    }

    /// Frame-space boxes for one RGB888 frame.
    pub fn detect(&mut self, rgb: &[u8], w: u32, h: u32) -> Result<Vec<DetBox>> {
        if !self.is_enabled() {
            return Ok(Vec::new());
        }
        let (in_w, in_h) = self.runtime.input_size();
        let input = self.resizer.resize(rgb, w, h, in_w, in_h)?;
        let outputs = self.runtime.run(&input)?;
        let params = DecodeParams {
            conf_threshold: self.conf_threshold,
            nms_iou: self.nms_iou,
            in_w,
            in_h,
            frame_w: w,
            frame_h: h,
        };
        decode(&self.layout, &outputs, &params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LprError;
    use crate::runtime::Tensor;

    /// Always answers with the same row tensor.
    struct FixedRows {
        rows: Vec<[f32; 6]>,
        shapes: Vec<Vec<usize>>,
        fail: bool,
    }

    impl FixedRows {
        fn new(rows: Vec<[f32; 6]>) -> Self {
            let shapes = vec![vec![1, rows.len(), 6]];
            Self {
                rows,
                shapes,
                fail: false,
            }
        }
    }

    impl InferenceRuntime for FixedRows {
        fn input_size(&self) -> (u32, u32) {
            (64, 64)
        }

        fn output_shapes(&self) -> &[Vec<usize>] {
            &self.shapes
        }

        fn run(&mut self, rgb: &[u8]) -> Result<Vec<Tensor>> {
            assert_eq!(rgb.len(), 64 * 64 * 3);
            if self.fail {
                return Err(LprError::inference("npu timeout"));
            }
            let data = self.rows.iter().flatten().copied().collect();
            Ok(vec![Tensor::new(self.shapes[0].clone(), data)])
        }
    }

    #[test]
    fn detect_maps_model_space_to_frame() {
        let rt = FixedRows::new(vec![[32.0, 32.0, 16.0, 8.0, 0.9, 0.9]]);
        let mut det = Detector::new("plate", Box::new(rt), 0.35, 0.45);
        assert!(det.is_enabled());
        assert_eq!(det.name(), "plate");
        assert!(matches!(det.layout(), OutputLayout::Rows { rows: 1, cols: 6, .. }));
        assert_eq!(det.layout().num_classes(), 1);
        let frame = vec![0u8; 128 * 128 * 3];
        let boxes = det.detect(&frame, 128, 128).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!((boxes[0].x1, boxes[0].y1, boxes[0].x2, boxes[0].y2), (48, 56, 80, 72));
    }

    #[test]
    fn failed_run_surfaces_as_inference_error() {
        let mut rt = FixedRows::new(vec![[32.0, 32.0, 16.0, 8.0, 0.9, 0.9]]);
        rt.fail = true;
        let mut det = Detector::new("veh", Box::new(rt), 0.35, 0.45);
        let frame = vec![0u8; 64 * 64 * 3];
        let err = det.detect(&frame, 64, 64).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn unsupported_layout_yields_nothing() {
        let mut rt = FixedRows::new(vec![]);
        rt.shapes = vec![vec![1, 7]];
        let mut det = Detector::new("odd", Box::new(rt), 0.35, 0.45);
        assert!(!det.is_enabled());
        assert!(matches!(det.layout(), OutputLayout::Unsupported(_)));
        let frame = vec![0u8; 64 * 64 * 3];
        assert!(det.detect(&frame, 64, 64).unwrap().is_empty());
    }
}
