// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 采集 → 推理 → 显示, 用测试图源 + 假模型跑完整流程

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use fpga_lpr::capture::{slot_format, CaptureConfig, CaptureLoop};
use fpga_lpr::config::Enhance;
use fpga_lpr::device::{CaptureDevice, DeviceInfo, PatternDevice, PixelFormat};
use fpga_lpr::labels::ClassMap;
use fpga_lpr::mailbox::InferenceMailbox;
use fpga_lpr::overlay::Overlay;
use fpga_lpr::pixel::PixelOrder;
use fpga_lpr::predlog::{PredictionLog, HEADER};
use fpga_lpr::runtime::{InferenceRuntime, Tensor};
use fpga_lpr::sink::{DisplayFrame, DisplaySink, HoldingSink, NullSink, SinkEvent};
use fpga_lpr::worker::{InferenceWorker, Models, WorkerConfig};
use fpga_lpr::{AppContext, DetBox, Detector, FrameSlotRing, LprError, Result, ResultsSnapshot, Tuning};

/// Answers every frame with the same model-space rows
struct FixedRows {
    shape: Vec<Vec<usize>>,
    data: Vec<f32>,
}

impl FixedRows {
    fn new(rows: &[&[f32]]) -> Self {
        Self {
            shape: vec![vec![1, rows.len(), rows[0].len()]],
            data: rows.iter().flat_map(|r| r.iter().copied()).collect(),
        }
    }
}

impl InferenceRuntime for FixedRows {
    fn input_size(&self) -> (u32, u32) {
        (320, 320)
    }

    fn output_shapes(&self) -> &[Vec<usize>] {
        &self.shape
    }

    fn run(&mut self, _rgb: &[u8]) -> Result<Vec<Tensor>> {
        Ok(vec![Tensor::new(self.shape[0].clone(), self.data.clone())])
    }
}

const PLATE: &[f32] = &[160.0, 200.0, 120.0, 30.0, 0.9, 0.9];

fn worker_cfg(frame: DeviceInfo) -> WorkerConfig {
    WorkerConfig {
        frame,
        pixel_order: PixelOrder::Bgr565,
        swap16: true,
        enhance: Enhance::None,
        min_car_conf: 0.35,
        min_person_conf: 0.35,
        plate_only: true,
        plate_on_car_only: false,
        ped_event: false,
        stop_line_y: 0,
        red_ratio: 0.02,
        red_stable_frames: 3,
        aux_roi: false,
    }
}

fn capture_cfg(info: &DeviceInfo, frames: u64) -> CaptureConfig {
    CaptureConfig {
        interval: Duration::from_millis(5),
        slot_timeout: Duration::from_millis(100),
        stats_period: Duration::from_secs(60),
        swap16: true,
        overlay: Some(Overlay {
            width: info.width,
            height: info.height,
            stride: info.stride(),
            format: slot_format(info, PixelOrder::Bgr565),
            stop_line_y: None,
        }),
        frame_limit: Some(frames),
    }
}

/// Notes where every pushed frame lives and whether its bytes changed.
#[derive(Clone)]
struct RecordingSink {
    expected: Arc<Vec<u8>>,
    seen: Arc<Mutex<Vec<(usize, bool)>>>,
}

impl DisplaySink for RecordingSink {
    fn push(&mut self, frame: DisplayFrame) -> Result<()> {
        let bytes: &[u8] = &frame.lease;
        let entry = (bytes.as_ptr() as usize, bytes == self.expected.as_slice());
        self.seen.lock().unwrap().push(entry);
        Ok(())
    }

    fn poll_event(&mut self) -> Option<SinkEvent> {
        None
    }
}

/// Wait until the worker has caught up with the last published frame.
fn settle(ctx: &AppContext, mailbox: &InferenceMailbox) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while ctx.latest_results().seq < mailbox.sequence() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn pattern_frame_is_one_default_transfer() {
    let dev = PatternDevice::new(1280, 720, PixelFormat::Bgr565).unwrap();
    assert_eq!(dev.info().default_transfer_size(), 1_843_200);
    let ring = FrameSlotRing::new(2, dev.info().default_transfer_size());
    assert_eq!(ring.frame_size(), 1_843_200);
}

#[test]
fn held_display_slots_stall_capture() {
    let dev = PatternDevice::new(320, 240, PixelFormat::Bgr565).unwrap();
    let info = *dev.info();
    let ctx = AppContext::new();
    let ring = FrameSlotRing::new(3, info.default_transfer_size());
    let sink = HoldingSink::new();
    let mut cfg = capture_cfg(&info, 100);
    cfg.slot_timeout = Duration::from_millis(30);
    let mut capture = CaptureLoop::new(
        Arc::clone(&ctx),
        Box::new(dev),
        Arc::clone(&ring),
        Arc::new(InferenceMailbox::new()),
        Box::new(sink.clone()),
        cfg,
    );

    let err = capture.run().unwrap_err();
    assert!(matches!(err, LprError::SlotTimeout { .. }));
    assert!(err.is_fatal());
    // never more frames in flight than slots
    assert_eq!(sink.held(), 3);
    assert_eq!(ring.outstanding(), 3);
    let s = capture.summary();
    assert_eq!((s.captured, s.pushed, s.released, s.slot_timeouts), (4, 3, 0, 1));

    assert_eq!(sink.release_all(), 3);
    assert_eq!(ring.outstanding(), 0);
    assert_eq!(ring.released_count(), 3);
}

#[test]
fn plates_reach_snapshot_and_prediction_log() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("pred.csv");

    let dev = PatternDevice::new(320, 320, PixelFormat::Bgr565).unwrap();
    let info = *dev.info();
    let ctx = AppContext::new();
    let mailbox = Arc::new(InferenceMailbox::new());
    let ring = FrameSlotRing::new(2, info.default_transfer_size());

    let tuning = Tuning::default();
    let models = Models {
        vehicle: None,
        plate: Detector::new("plate", Box::new(FixedRows::new(&[PLATE])), 0.35, tuning.nms_iou),
        ocr: None,
    };
    let worker = InferenceWorker::new(
        Arc::clone(&ctx),
        Arc::clone(&mailbox),
        worker_cfg(info),
        tuning,
        ClassMap::default(),
        models,
        Some(PredictionLog::create(&csv).unwrap()),
    )
    .unwrap();
    let handle = thread::spawn(move || worker.run());

    let mut capture = CaptureLoop::new(
        Arc::clone(&ctx),
        Box::new(dev),
        Arc::clone(&ring),
        Arc::clone(&mailbox),
        Box::new(NullSink::new()),
        capture_cfg(&info, 40),
    );
    let summary = capture.run().unwrap();
    assert_eq!((summary.captured, summary.pushed, summary.released), (40, 40, 40));

    settle(&ctx, &mailbox);
    ctx.request_stop();
    mailbox.shutdown();
    let analysed = handle.join().unwrap();
    assert!(analysed >= 3, "worker analysed only {analysed} frames");

    let snap = ctx.latest_results();
    assert_eq!(snap.plates.len(), 1);
    assert_eq!(snap.plates[0].det, DetBox::new(100, 185, 220, 215, snap.plates[0].det.conf, 0));
    assert!(snap.vehicles.is_empty() && snap.persons.is_empty());

    let text = std::fs::read_to_string(&csv).unwrap();
    let mut lines = text.lines();
    let header = lines.next().unwrap();
    assert_eq!(header, HEADER);
    // columns the offline evaluator joins on
    let cols: HashSet<&str> = header.split(',').collect();
    for need in ["frame_id", "plate_text_pred", "plate_type_pred", "x1", "y1", "x2", "y2"] {
        assert!(cols.contains(need), "missing column {need}");
    }
    let rows: Vec<&str> = lines.collect();
    assert!(!rows.is_empty());
    assert!(rows.iter().all(|r| r.split(',').count() == 9));
    assert!(rows[0].contains(",100,185,220,215,"));
    // no OCR model: conf is the detector's own
    for r in &rows {
        let conf: f32 = r.split(',').nth(3).unwrap().parse().unwrap();
        assert!(conf > 0.0 && (conf - snap.plates[0].det.conf).abs() < 1e-3, "conf {conf} in {r}");
    }
}

#[test]
fn zero_copy_pushes_the_mapped_frame_untouched() {
    let dev = PatternDevice::new(320, 240, PixelFormat::Bgr565).unwrap().with_mapping();
    let info = *dev.info();
    let map = dev.mapped().unwrap();
    let expected = Arc::new((*map).as_ref().to_vec());
    let ring = FrameSlotRing::aliased(map);
    assert!(ring.is_aliased());

    let ctx = AppContext::new();
    // something the overlay would draw in copy mode
    ctx.publish_results(ResultsSnapshot {
        vehicles: vec![DetBox::new(10, 10, 200, 200, 0.9, 2)],
        ..Default::default()
    });
    let mailbox = Arc::new(InferenceMailbox::new());
    let sink = RecordingSink {
        expected: Arc::clone(&expected),
        seen: Arc::default(),
    };
    let mut capture = CaptureLoop::new(
        Arc::clone(&ctx),
        Box::new(dev),
        Arc::clone(&ring),
        Arc::clone(&mailbox),
        Box::new(sink.clone()),
        capture_cfg(&info, 12),
    );
    let s = capture.run().unwrap();
    assert_eq!((s.captured, s.pushed, s.released), (12, 12, 12));
    assert_eq!(mailbox.sequence(), 12);
    assert_eq!(ring.outstanding(), 0);

    let seen = sink.seen.lock().unwrap();
    assert_eq!(seen.len(), 12);
    let first = seen[0].0;
    assert!(seen.iter().all(|&(ptr, same)| ptr == first && same));

    let mut got = Vec::new();
    assert_eq!(mailbox.take(&mut got), Some(12));
    assert_eq!(got, *expected);
}

#[test]
fn aux_tags_drive_red_light_and_roi() {
    let mut dev = PatternDevice::new(320, 320, PixelFormat::Bgrx8888).unwrap();
    dev.set_red(true);
    let info = *dev.info();
    let ctx = AppContext::new();
    let mailbox = Arc::new(InferenceMailbox::new());

    let tuning = Tuning::default();
    // 一个行人, 一直站在停止线下方
    let person: &[f32] = &[100.0, 250.0, 30.0, 80.0, 0.9, 0.9];
    let models = Models {
        vehicle: Some(Detector::new("vehicle", Box::new(FixedRows::new(&[person])), 0.35, tuning.nms_iou)),
        plate: Detector::new("plate", Box::new(FixedRows::new(&[PLATE])), 0.35, tuning.nms_iou),
        ocr: None,
    };
    let mut cfg = worker_cfg(info);
    cfg.plate_only = false;
    cfg.ped_event = true;
    cfg.stop_line_y = 160;
    cfg.aux_roi = true;
    let worker = InferenceWorker::new(
        Arc::clone(&ctx),
        Arc::clone(&mailbox),
        cfg,
        tuning,
        ClassMap::default(),
        models,
        None,
    )
    .unwrap();
    let handle = thread::spawn(move || worker.run());

    let mut ccfg = capture_cfg(&info, 30);
    if let Some(o) = ccfg.overlay.as_mut() {
        o.stop_line_y = Some(160);
    }
    let mut capture = CaptureLoop::new(
        Arc::clone(&ctx),
        Box::new(dev),
        FrameSlotRing::new(2, info.default_transfer_size()),
        Arc::clone(&mailbox),
        Box::new(NullSink::new()),
        ccfg,
    );
    capture.run().unwrap();
    settle(&ctx, &mailbox);
    mailbox.shutdown();
    let analysed = handle.join().unwrap();
    assert!(analysed >= 3, "worker analysed only {analysed} frames");

    let snap = ctx.latest_results();
    assert!(snap.red_light);
    // the tagged block is the top-right 40x40 corner
    assert_eq!(snap.aux_roi.map(|r| (r.x1, r.y1, r.x2, r.y2)), Some((280, 0, 319, 39)));
    assert_eq!(snap.persons.len(), 1);
    // standing still past the line is not a crossing
    assert_eq!(snap.ped_events, 0);
}

#[test]
fn stop_request_from_another_thread() {
    let dev = PatternDevice::new(64, 32, PixelFormat::Bgr565).unwrap();
    let info = *dev.info();
    let ctx = AppContext::new();
    let mut cfg = capture_cfg(&info, u64::MAX);
    cfg.frame_limit = None;
    let mut capture = CaptureLoop::new(
        Arc::clone(&ctx),
        Box::new(dev),
        FrameSlotRing::new(2, info.default_transfer_size()),
        Arc::new(InferenceMailbox::new()),
        Box::new(NullSink::new()),
        cfg,
    );
    let stopper = {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            ctx.request_stop();
        })
    };
    let s = capture.run().unwrap();
    stopper.join().unwrap();
    assert!(s.captured > 0);
    assert_eq!(s.captured, s.pushed);
}
