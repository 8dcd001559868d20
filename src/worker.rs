// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 推理线程 (inference worker)
//!
//! Takes the newest raw frame from the mailbox, runs the detectors, plate
//! post-processing, OCR and the pedestrian tracker, then publishes one
//! [`ResultsSnapshot`]. A failing model call only empties that stage's
//! output for the cycle.

use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;
use tracing::{debug, info, warn};

use crate::config::{Args, Enhance, Tuning};
use crate::context::{AppContext, ResultsSnapshot};
use crate::detection::plate::{classify_color, find_parent_vehicle, is_plausible_plate, ocr_crop};
use crate::detection::{DetBox, Detector, PlateDetection, PlateTypeClassifier, TemporalConfirmation};
use crate::device::{DeviceInfo, PixelFormat};
use crate::error::Result;
use crate::labels::ClassMap;
use crate::mailbox::InferenceMailbox;
use crate::ocr::{OcrResult, Recognizer};
use crate::pixel::{bgrx_to_rgb_and_aux, raw565_to_rgb, PixelOrder};
use crate::predlog::PredictionLog;
use crate::tracker::{aux_red_ratio, PedestrianTracker, RedLightDebouncer};

/// Worker knobs taken from the command line
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub frame: DeviceInfo,
    pub pixel_order: PixelOrder,
    pub swap16: bool,
    pub enhance: Enhance,
    pub min_car_conf: f32,
    pub min_person_conf: f32,
    pub plate_only: bool,
    pub plate_on_car_only: bool,
    pub ped_event: bool,
    pub stop_line_y: i32,
    pub red_ratio: f32,
    pub red_stable_frames: u32,
    pub aux_roi: bool,
}

impl WorkerConfig {
    pub fn from_args(args: &Args, frame: DeviceInfo) -> Self {
        Self {
            frame,
            pixel_order: args.pixel_order,
            swap16: args.swap16,
            enhance: args.enhance,
            min_car_conf: args.min_car_conf,
            min_person_conf: args.min_person_conf,
            plate_only: args.plate_only,
            plate_on_car_only: args.plate_on_car_only,
            ped_event: args.ped_event,
            stop_line_y: args.stop_line_y.unwrap_or(0),
            red_ratio: args.red_ratio,
            red_stable_frames: args.red_stable_frames,
            aux_roi: args.aux_roi,
        }
    }
}

/// Models the worker drives. `vehicle` is `None` in plate-only mode.
pub struct Models {
    pub vehicle: Option<Detector>,
    pub plate: Detector,
    pub ocr: Option<Recognizer>,
}

pub struct InferenceWorker {
    ctx: Arc<AppContext>,
    mailbox: Arc<InferenceMailbox>,
    cfg: WorkerConfig,
    tuning: Tuning,
    classes: ClassMap,
    models: Models,
    plate_types: PlateTypeClassifier,
    confirm: TemporalConfirmation,
    tracker: Option<PedestrianTracker>,
    red: RedLightDebouncer,
    predlog: Option<PredictionLog>,

    // 复用的缓冲区
    rgb: Vec<u8>,
    aux: Vec<u8>,

    frames_processed: u64,
    infer_total_ms: f64,
}

impl InferenceWorker {
    pub fn new(
        ctx: Arc<AppContext>,
        mailbox: Arc<InferenceMailbox>,
        cfg: WorkerConfig,
        tuning: Tuning,
        classes: ClassMap,
        models: Models,
        predlog: Option<PredictionLog>,
    ) -> Result<Self> {
        let pixels = cfg.frame.pixel_count();
        let tracker = cfg
            .ped_event
            .then(|| PedestrianTracker::new(cfg.stop_line_y, tuning.track_radius, tuning.track_ttl));
        Ok(Self {
            confirm: TemporalConfirmation::new(tuning.confirm_iou_prev, tuning.confirm_iou_prev2),
            red: RedLightDebouncer::new(cfg.red_ratio, cfg.red_stable_frames),
            plate_types: PlateTypeClassifier::new()?,
            tracker,
            ctx,
            mailbox,
            classes,
            models,
            predlog,
            rgb: vec![0; pixels * 3],
            aux: if cfg.frame.pixel_format.has_aux() { vec![0; pixels] } else { Vec::new() },
            cfg,
            tuning,
            frames_processed: 0,
            infer_total_ms: 0.0,
        })
    }

    /// Thread body. Returns the number of analysed frames once the mailbox
    /// is shut down.
    pub fn run(mut self) -> u64 {
        info!("🧠 inference worker started");
        let mut raw = Vec::with_capacity(self.cfg.frame.default_transfer_size());
        while let Some(seq) = self.mailbox.take(&mut raw) {
            if self.ctx.should_stop() {
                break;
            }
            let t0 = Instant::now();
            let mut snapshot = self.process(seq, &raw);
            let ms = t0.elapsed().as_secs_f64() * 1000.0;

            self.frames_processed += 1;
            self.infer_total_ms += ms;
            snapshot.frames_processed = self.frames_processed;
            snapshot.infer_total_ms = self.infer_total_ms;
            snapshot.last_infer_ms = ms;
            self.ctx.publish_results(snapshot);
        }
        info!("🧠 inference worker stopped after {} frames", self.frames_processed);
        self.frames_processed
    }

    /// One full analysis cycle on a raw frame.
    pub fn process(&mut self, seq: u64, raw: &[u8]) -> ResultsSnapshot {
        let (w, h) = (self.cfg.frame.width, self.cfg.frame.height);
        self.convert(raw);
        self.enhance();

        let (vehicles, persons) = self.detect_road_users();
        let plates = self.detect_plates(seq, &vehicles);

        let has_aux = self.cfg.frame.pixel_format.has_aux();
        let (ratio, roi) = if has_aux && (self.cfg.ped_event || self.cfg.aux_roi) {
            aux_red_ratio(&self.aux, w, h)
        } else {
            (0.0, None)
        };

        let mut red_light = false;
        let mut ped_events = 0;
        if let Some(tracker) = self.tracker.as_mut() {
            red_light = self.red.update(ratio);
            tracker.update(&persons, red_light);
            ped_events = tracker.events();
        }

        ResultsSnapshot {
            seq,
            vehicles,
            persons,
            plates,
            aux_roi: if self.cfg.aux_roi { roi } else { None },
            red_light,
            ped_events,
            ..Default::default()
        }
    }

    /// Raw frame → RGB888 (+ aux tags), line by line so padded strides work.
    fn convert(&mut self, raw: &[u8]) {
        let f = &self.cfg.frame;
        let (w, stride) = (f.width as usize, f.stride());
        let line = w * f.bpp as usize;
        for (y, src) in raw.chunks(stride).take(f.height as usize).enumerate() {
            let src = &src[..line.min(src.len())];
            let rgb = &mut self.rgb[y * w * 3..(y + 1) * w * 3];
            match f.pixel_format {
                PixelFormat::Bgr565 => raw565_to_rgb(src, self.cfg.pixel_order, self.cfg.swap16, rgb),
                PixelFormat::Bgrx8888 => {
                    bgrx_to_rgb_and_aux(src, rgb, Some(&mut self.aux[y * w..(y + 1) * w]))
                }
            }
        }
    }

    fn enhance(&mut self) {
        if self.cfg.enhance == Enhance::None {
            return;
        }
        let (w, h) = (self.cfg.frame.width, self.cfg.frame.height);
        let Some(img) = RgbImage::from_raw(w, h, std::mem::take(&mut self.rgb)) else {
            // from_raw 只在尺寸不符时失败
            self.rgb = vec![0; w as usize * h as usize * 3];
            return;
        };
        let out = match self.cfg.enhance {
            Enhance::Sharpen => image::imageops::unsharpen(&img, 1.0, 4),
            Enhance::Denoise => imageproc::filter::median_filter(&img, 1, 1),
            Enhance::None => img,
        };
        self.rgb = out.into_raw();
    }

    fn detect_road_users(&mut self) -> (Vec<DetBox>, Vec<DetBox>) {
        let (w, h) = (self.cfg.frame.width, self.cfg.frame.height);
        let Some(det) = self.models.vehicle.as_mut().filter(|_| !self.cfg.plate_only) else {
            return (Vec::new(), Vec::new());
        };
        let boxes = det.detect(&self.rgb, w, h).unwrap_or_else(|e| {
            warn!("⚠️  {}: {e}", det.name());
            Vec::new()
        });
        let mut vehicles = Vec::new();
        let mut persons = Vec::new();
        for b in boxes {
            if self.classes.is_vehicle(b.class_id) && b.conf >= self.cfg.min_car_conf {
                vehicles.push(b);
            } else if self.classes.is_person(b.class_id) && b.conf >= self.cfg.min_person_conf {
                persons.push(b);
            }
        }
        (vehicles, persons)
    }

    fn detect_plates(&mut self, seq: u64, vehicles: &[DetBox]) -> Vec<PlateDetection> {
        let (w, h) = (self.cfg.frame.width, self.cfg.frame.height);
        let candidates = self.models.plate.detect(&self.rgb, w, h).unwrap_or_else(|e| {
            warn!("⚠️  {}: {e}", self.models.plate.name());
            Vec::new()
        });
        let filtered: Vec<DetBox> = candidates
            .into_iter()
            .filter(|b| is_plausible_plate(b, h, &self.tuning))
            .collect();
        let confirmed = self.confirm.confirm(&filtered);

        let mut plates = Vec::with_capacity(confirmed.len());
        for det in confirmed {
            let parent = if self.cfg.plate_only {
                None
            } else {
                find_parent_vehicle(&det, vehicles, self.tuning.parent_overlap_ratio)
            };
            if self.cfg.plate_on_car_only && !self.cfg.plate_only && parent.is_none() {
                continue;
            }

            let crop = ocr_crop(&det, w, h, self.tuning.ocr_crop_w, self.tuning.ocr_crop_h);
            let color = classify_color(&self.rgb, w, h, &det, &self.tuning);
            let OcrResult { text, confidence } = match self.models.ocr.as_mut() {
                Some(ocr) => ocr.recognize(&self.rgb, w, h, &crop).unwrap_or_else(|e| {
                    warn!("⚠️  ocr: {e}");
                    OcrResult::default()
                }),
                None => OcrResult::default(),
            };
            let plate_type = self.plate_types.classify(color, &text);
            debug!(
                "plate #{seq} {:?} {} {} {} conf={:.2}",
                (det.x1, det.y1, det.x2, det.y2),
                color.name(),
                plate_type.as_str(),
                text,
                confidence
            );

            let plate = PlateDetection {
                det,
                crop,
                color,
                plate_type,
                text,
                ocr_conf: confidence,
                parent,
            };
            if let Some(log) = self.predlog.as_mut() {
                if let Err(e) = log.append(seq, &plate) {
                    warn!("⚠️  prediction log {}: {e}", log.path().display());
                }
            }
            plates.push(plate);
        }
        plates
    }
}
