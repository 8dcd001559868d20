// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
#![allow(clippy::too_many_arguments)]

pub mod capture; // 采集主循环
pub mod config; // 命令行参数 + 调参
pub mod context; // 停止标志 / 计数器 / 结果快照
pub mod detection; // 检测解码 + 车牌后处理
pub mod device; // FPGA DMA 设备
pub mod error;
pub mod labels;
pub mod mailbox; // 采集 → 推理 单槽交接
pub mod ocr; // CTC 车牌字符识别
pub mod overlay; // 结果叠加到显示帧
pub mod pixel; // 像素格式转换
pub mod predlog; // 识别结果 CSV
pub mod ring; // 显示帧槽环
pub mod runtime; // ONNX Runtime 推理边界
pub mod sink; // 显示输出
pub mod tracker; // 行人跟踪 + 红灯去抖
pub mod worker; // 推理线程

pub use crate::capture::{CaptureLoop, CaptureSummary};
pub use crate::config::{Args, Tuning};
pub use crate::context::{AppContext, ResultsSnapshot};
pub use crate::detection::{DetBox, Detector, PlateDetection};
pub use crate::error::{LprError, Result};
pub use crate::ring::{FrameSlotRing, SlotLease, SlotTicket};
pub use crate::sink::{DisplaySink, SinkEvent};
pub use crate::worker::InferenceWorker;

/// Greedy class-wise NMS: highest confidence first, a lower box of the same
/// class is dropped once its IoU with a kept box exceeds `iou_threshold`.
pub fn non_max_suppression(xs: &mut Vec<DetBox>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.conf.total_cmp(&b1.conf));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].class_id != xs[index].class_id {
                continue;
            }
            let iou = xs[prev_index].iou(&xs[index]);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

/// Local wall-clock time with millisecond precision
pub fn gen_time_string() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.3f")
        .to_string()
}
