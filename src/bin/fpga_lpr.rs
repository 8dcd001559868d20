// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// FPGA 采集 → 车牌识别 → KMS 显示
///
/// 两线程: 采集主循环 (本线程) + 推理线程
/// 运行: cargo run --release --bin fpga-lpr -- --device pattern --plate-only 1 --plate-model models/plate.onnx
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fpga_lpr::capture::{can_alias, slot_format, CaptureConfig, CaptureLoop};
use fpga_lpr::config::SinkKind;
use fpga_lpr::device::{CaptureDevice, DeviceInfo, FpgaDevice, PatternDevice};
use fpga_lpr::labels::ClassMap;
use fpga_lpr::mailbox::InferenceMailbox;
use fpga_lpr::ocr::{load_keys, Recognizer};
use fpga_lpr::predlog::PredictionLog;
use fpga_lpr::runtime::OrtRuntime;
use fpga_lpr::sink::{DisplaySink, NullSink};
use fpga_lpr::worker::{InferenceWorker, Models, WorkerConfig};
use fpga_lpr::{AppContext, Args, Detector, FrameSlotRing, Tuning};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = args.validate() {
        eprintln!("❌ {e}");
        return ExitCode::from(2);
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn open_device(args: &Args) -> Result<Box<dyn CaptureDevice>> {
    if args.is_pattern() {
        let (w, h) = args.pattern_dims()?;
        info!("🧪 pattern source {}x{} {:?}", w, h, args.pattern_format);
        return Ok(Box::new(PatternDevice::new(w, h, args.pattern_format)?));
    }
    let dev = FpgaDevice::open(&args.device).with_context(|| format!("open {}", args.device))?;
    Ok(Box::new(dev))
}

fn build_ring(args: &Args, device: &dyn CaptureDevice) -> Arc<FrameSlotRing> {
    let info = device.info();
    let copy_ring = || FrameSlotRing::new(args.copy_buffers as usize, info.default_transfer_size());
    if !args.zero_copy {
        return copy_ring();
    }
    if !can_alias(info, args.swap16) {
        warn!("⚠️  zero-copy needs the display format as-is (swap16=0 for 565), using copy mode");
        return copy_ring();
    }
    match device.mapped() {
        Some(map) => {
            info!("🔗 zero-copy: displaying the DMA buffer directly, overlay off");
            FrameSlotRing::aliased(map)
        }
        None => {
            warn!("⚠️  device has no mapped buffer, using copy mode");
            copy_ring()
        }
    }
}

fn load_models(args: &Args, tuning: &Tuning, keys: Option<Vec<String>>) -> Result<Models> {
    let vehicle = if args.plate_only {
        None
    } else {
        let path = args.veh_model.as_ref().context("--veh-model")?;
        let rt = OrtRuntime::load(path, "vehicle").with_context(|| format!("load {}", path.display()))?;
        // 车辆和行人共用一个模型, 先按较低阈值解码, worker 内再按类别过滤
        let conf = args.min_car_conf.min(args.min_person_conf);
        Some(Detector::new("vehicle", Box::new(rt), conf, tuning.nms_iou))
    };

    let rt = OrtRuntime::load(&args.plate_model, "plate")
        .with_context(|| format!("load {}", args.plate_model.display()))?;
    let plate = Detector::new("plate", Box::new(rt), args.min_plate_conf, tuning.nms_iou);

    let ocr = match (&args.ocr_model, keys) {
        (Some(path), Some(keys)) => {
            let rt = OrtRuntime::load(path, "ocr").with_context(|| format!("load {}", path.display()))?;
            Some(Recognizer::new(Box::new(rt), keys, args.ocr_blank)?)
        }
        _ => None,
    };
    Ok(Models { vehicle, plate, ocr })
}

fn build_sink(args: &Args, info: &DeviceInfo) -> Result<Box<dyn DisplaySink>> {
    match args.sink {
        SinkKind::Null => {
            info!("🕳️  null sink: frames are released right after push");
            Ok(Box::new(NullSink::new()))
        }
        #[cfg(feature = "gst")]
        SinkKind::Gst => {
            let sink = fpga_lpr::sink::GstSink::new(
                info.width,
                info.height,
                args.fps as u32,
                slot_format(info, args.pixel_order),
                info.default_transfer_size(),
                args.queue_depth as usize,
                args.connector_id,
            )?;
            Ok(Box::new(sink))
        }
        #[cfg(not(feature = "gst"))]
        SinkKind::Gst => {
            warn!(
                "⚠️  built without the `gst` feature, {:?} frames go to the null sink",
                slot_format(info, args.pixel_order)
            );
            Ok(Box::new(NullSink::new()))
        }
    }
}

fn run(args: Args) -> Result<()> {
    let ctx = AppContext::new();
    {
        let ctx = Arc::clone(&ctx);
        if let Err(e) = ctrlc::set_handler(move || ctx.request_stop()) {
            warn!("⚠️  Ctrl-C handler not installed: {e}");
        }
    }

    // 标签 / 字符表 / 调参
    let classes = match &args.labels {
        Some(path) => ClassMap::load(path).with_context(|| format!("labels {}", path.display()))?,
        None => ClassMap::default(),
    };
    let keys = match &args.ocr_keys {
        Some(path) => Some(load_keys(path).with_context(|| format!("ocr keys {}", path.display()))?),
        None => None,
    };
    let tuning = match &args.tuning {
        Some(path) => Tuning::load(path)?,
        None => Tuning::default(),
    };
    tuning.print_summary();

    // 设备 → 帧槽环 / 邮箱
    let device = open_device(&args)?;
    let info = *device.info();
    info!(
        "📷 {}x{} {:?} stride {} ({} bytes/frame)",
        info.width,
        info.height,
        info.pixel_format,
        info.stride(),
        info.default_transfer_size()
    );
    let ring = build_ring(&args, &*device);
    let mailbox = Arc::new(InferenceMailbox::new());

    let models = load_models(&args, &tuning, keys)?;
    let sink = build_sink(&args, &info)?;
    let predlog = match &args.pred_csv {
        Some(path) => Some(PredictionLog::create(path).with_context(|| format!("pred csv {}", path.display()))?),
        None => None,
    };

    let worker = InferenceWorker::new(
        Arc::clone(&ctx),
        Arc::clone(&mailbox),
        WorkerConfig::from_args(&args, info),
        tuning,
        classes,
        models,
        predlog,
    )?;
    let handle = thread::Builder::new()
        .name("infer".into())
        .spawn(move || worker.run())
        .context("spawn inference thread")?;

    let cfg = CaptureConfig::from_args(&args, &info, ring.is_aliased());
    let mut capture = CaptureLoop::new(Arc::clone(&ctx), device, ring, Arc::clone(&mailbox), sink, cfg);
    let result = capture.run();

    // 逆序清理: 停止 → 推理线程 (模型) → sink → ring → device
    ctx.request_stop();
    mailbox.shutdown();
    match handle.join() {
        Ok(n) => info!("🧠 inference worker joined after {n} frame(s)"),
        Err(_) => error!("❌ inference worker panicked"),
    }
    drop(capture);

    result.map(|_| ()).context("capture loop")
}
