// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 采集主循环 (capture loop, producer side)
//!
//! Per cycle: drain sink events → DMA read → take a slot → copy/convert →
//! hand the raw frame to the mailbox → overlay → push → sleep out the rest
//! of the frame interval.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::Args;
use crate::context::{AppContext, Counters};
use crate::device::{CaptureDevice, DeviceInfo, PixelFormat};
use crate::error::{LprError, Result};
use crate::mailbox::InferenceMailbox;
use crate::overlay::Overlay;
use crate::pixel::{copy_565_to_slot, PixelOrder, SlotFormat};
use crate::ring::FrameSlotRing;
use crate::sink::{DisplayFrame, DisplaySink};

/// Display format of the slots for a given source
pub fn slot_format(info: &DeviceInfo, order: PixelOrder) -> SlotFormat {
    match info.pixel_format {
        PixelFormat::Bgr565 => SlotFormat::Rgb565(order),
        PixelFormat::Bgrx8888 => SlotFormat::Bgrx,
    }
}

/// The mapped DMA buffer can be shown as-is only when no conversion is
/// needed between source and display.
pub fn can_alias(info: &DeviceInfo, swap16: bool) -> bool {
    match info.pixel_format {
        PixelFormat::Bgrx8888 => true,
        PixelFormat::Bgr565 => !swap16,
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub interval: Duration,
    pub slot_timeout: Duration,
    pub stats_period: Duration,
    pub swap16: bool,
    /// `None` when the slots alias hardware memory
    pub overlay: Option<Overlay>,
    /// stop cleanly after this many captured frames
    pub frame_limit: Option<u64>,
}

impl CaptureConfig {
    pub fn from_args(args: &Args, info: &DeviceInfo, aliased: bool) -> Self {
        let overlay = (!aliased).then(|| Overlay {
            width: info.width,
            height: info.height,
            stride: info.stride(),
            format: slot_format(info, args.pixel_order),
            stop_line_y: if args.ped_event { args.stop_line_y } else { None },
        });
        Self {
            interval: args.frame_interval(),
            slot_timeout: args.slot_timeout(),
            stats_period: args.stats_period(),
            swap16: args.swap16,
            overlay,
            frame_limit: None,
        }
    }
}

/// Totals at loop exit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub captured: u64,
    pub pushed: u64,
    pub released: u64,
    pub inferred: u64,
    pub mailbox_drops: u64,
    pub slot_timeouts: u64,
}

/// Interval bookkeeping for the `[stats]` line
struct StatsWindow {
    since: Instant,
    captured: u64,
    released: u64,
    inferred: u64,
}

// 字段顺序即析构顺序: sink (EOS) → ring → device (munmap/close)
pub struct CaptureLoop {
    sink: Box<dyn DisplaySink>,
    ring: Arc<FrameSlotRing>,
    device: Box<dyn CaptureDevice>,
    mailbox: Arc<InferenceMailbox>,
    ctx: Arc<AppContext>,
    cfg: CaptureConfig,
    scratch: Vec<u8>,
    next_pts: Duration,
}

impl CaptureLoop {
    pub fn new(
        ctx: Arc<AppContext>,
        device: Box<dyn CaptureDevice>,
        ring: Arc<FrameSlotRing>,
        mailbox: Arc<InferenceMailbox>,
        sink: Box<dyn DisplaySink>,
        cfg: CaptureConfig,
    ) -> Self {
        let scratch = if ring.is_aliased() {
            Vec::new()
        } else {
            vec![0; device.info().default_transfer_size()]
        };
        Self {
            ctx,
            device,
            ring,
            mailbox,
            sink,
            cfg,
            scratch,
            next_pts: Duration::ZERO,
        }
    }

    pub fn summary(&self) -> CaptureSummary {
        let c = &self.ctx.counters;
        CaptureSummary {
            captured: Counters::get(&c.captured),
            pushed: Counters::get(&c.pushed),
            released: self.ring.released_count(),
            inferred: self.ctx.latest_results().frames_processed,
            mailbox_drops: self.mailbox.drops(),
            slot_timeouts: Counters::get(&c.slot_timeouts),
        }
    }

    /// Run until stop is requested, the frame limit is reached or a fatal
    /// error occurs. The exit line is logged either way.
    pub fn run(&mut self) -> Result<CaptureSummary> {
        let mut window = StatsWindow {
            since: Instant::now(),
            captured: 0,
            released: 0,
            inferred: 0,
        };
        info!(
            "▶️  capture loop: {:.1} fps, {} slot(s){}",
            1.0 / self.cfg.interval.as_secs_f64(),
            self.ring.capacity(),
            if self.ring.is_aliased() { ", zero-copy" } else { "" }
        );

        let result = loop {
            if self.ctx.should_stop() {
                break Ok(());
            }
            if let Some(event) = self.sink.poll_event() {
                let e = event.into_error();
                error!("❌ display sink: {e}");
                break Err(e);
            }
            if self
                .cfg
                .frame_limit
                .is_some_and(|n| Counters::get(&self.ctx.counters.captured) >= n)
            {
                break Ok(());
            }

            let t0 = Instant::now();
            if let Err(e) = self.cycle() {
                error!("❌ capture loop: {e}");
                break Err(e);
            }
            self.maybe_print_stats(&mut window);

            let spent = t0.elapsed();
            if spent < self.cfg.interval {
                thread::sleep(self.cfg.interval - spent);
            }
        };

        let s = self.summary();
        info!(
            "⏹️  exit: cap={} push={} rel={} infer={} drop={} slot_timeouts={}",
            s.captured, s.pushed, s.released, s.inferred, s.mailbox_drops, s.slot_timeouts
        );
        result.map(|_| s)
    }

    /// One frame: DMA read through push.
    fn cycle(&mut self) -> Result<()> {
        let counters = &self.ctx.counters;
        let aliased = self.ring.is_aliased();

        // DMA 直接写入映射内存 (零拷贝), 否则写入临时缓冲
        if aliased {
            self.device.read_frame(0, None)?;
        } else {
            self.device.read_frame(0, Some(&mut self.scratch))?;
        }
        Counters::bump(&counters.captured);

        let mut lease = match self.ring.acquire(self.cfg.slot_timeout) {
            Ok(lease) => lease,
            Err(e) => {
                if matches!(e, LprError::SlotTimeout { .. }) {
                    Counters::bump(&counters.slot_timeouts);
                }
                return Err(e);
            }
        };

        if aliased {
            self.mailbox.publish(&lease);
        } else {
            let Some(dst) = lease.data_mut() else {
                return Err(LprError::hardware("copy slot has no writable buffer"));
            };
            let n = self.scratch.len().min(dst.len());
            match self.device.info().pixel_format {
                PixelFormat::Bgr565 => copy_565_to_slot(&self.scratch[..n], &mut dst[..n], self.cfg.swap16),
                PixelFormat::Bgrx8888 => dst[..n].copy_from_slice(&self.scratch[..n]),
            }
            self.mailbox.publish(&self.scratch);
            if let Some(overlay) = &self.cfg.overlay {
                overlay.draw(dst, &self.ctx.latest_results());
            }
        }

        let ticket = lease.ticket();
        let frame = DisplayFrame {
            lease,
            pts: self.next_pts,
            duration: self.cfg.interval,
        };
        self.next_pts += self.cfg.interval;
        if let Err(e) = self.sink.push(frame) {
            // 推送失败的帧不计入 released
            self.ring.release(ticket, false);
            return Err(e);
        }
        Counters::bump(&counters.pushed);
        Ok(())
    }

    fn maybe_print_stats(&mut self, w: &mut StatsWindow) {
        let dt = w.since.elapsed();
        if dt < self.cfg.stats_period {
            return;
        }
        let s = self.summary();
        let r = self.ctx.latest_results();
        let secs = dt.as_secs_f64();
        let fps = |now: u64, then: u64| now.saturating_sub(then) as f64 / secs;
        info!(
            "[stats] cap={} push={} rel={} infer={} infer_ms={:.2} drop={} slot_timeouts={} cap_fps={:.2} disp_fps={:.2} infer_fps={:.2}",
            s.captured,
            s.pushed,
            s.released,
            s.inferred,
            r.last_infer_ms,
            s.mailbox_drops,
            s.slot_timeouts,
            fps(s.captured, w.captured),
            fps(s.released, w.released),
            fps(s.inferred, w.inferred)
        );
        if self.ring.outstanding() == self.ring.capacity() {
            warn!("⚠️  all {} display slots are held by the sink", self.ring.capacity());
        }
        *w = StatsWindow {
            since: Instant::now(),
            captured: s.captured,
            released: s.released,
            inferred: s.inferred,
        };
    }
}
