// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! appsrc → queue → kmssink

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{info, warn};

use super::{check_packed, push_owned, DisplayFrame, DisplaySink, SinkEvent};
use crate::error::{LprError, Result};
use crate::pixel::SlotFormat;

const EOS_WAIT_SECS: u64 = 2;

pub struct GstSink {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    bus: gst::Bus,
}

fn make(factory: &str, name: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .map_err(|e| LprError::sink(format!("create {factory}: {e}")))
}

impl GstSink {
    /// Build and start the pipeline. Caps are fixed for the session.
    pub fn new(
        width: u32,
        height: u32,
        fps: u32,
        format: SlotFormat,
        frame_size: usize,
        queue_depth: usize,
        connector_id: Option<i32>,
    ) -> Result<Self> {
        check_packed(width, height, format, frame_size)?;
        gst::init().map_err(|e| LprError::sink(format!("gst init: {e}")))?;

        let pipeline = gst::Pipeline::with_name("fpga-lpr");
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", format.caps_format())
            .field("width", width as i32)
            .field("height", height as i32)
            .field("framerate", gst::Fraction::new(fps as i32, 1))
            .build();

        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&caps)
            .is_live(true)
            .do_timestamp(true)
            .format(gst::Format::Time)
            .block(false)
            .max_bytes((frame_size * queue_depth.max(1)) as u64)
            .build();

        // 只保留最新一帧, 旧帧直接丢弃
        let queue = make("queue", "latency_queue")?;
        queue.set_property("max-size-buffers", 1u32);
        queue.set_property("max-size-bytes", 0u32);
        queue.set_property("max-size-time", 0u64);
        queue.set_property_from_str("leaky", "downstream");

        let kmssink = make("kmssink", "display")?;
        kmssink.set_property("sync", false);
        if let Some(id) = connector_id {
            kmssink.set_property("connector-id", id);
        }

        pipeline
            .add_many([appsrc.upcast_ref(), &queue, &kmssink])
            .map_err(|e| LprError::sink(format!("add elements: {e}")))?;
        gst::Element::link_many([appsrc.upcast_ref(), &queue, &kmssink])
            .map_err(|e| LprError::sink(format!("link: {e}")))?;

        let bus = pipeline
            .bus()
            .ok_or_else(|| LprError::sink("pipeline has no bus"))?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| LprError::sink(format!("set PLAYING: {e}")))?;

        info!(
            "📺 appsrc({} {}x{}@{}) → queue(leaky) → kmssink{}",
            format.caps_format(),
            width,
            height,
            fps,
            connector_id.map(|c| format!(" connector {c}")).unwrap_or_default()
        );
        Ok(Self {
            pipeline,
            appsrc,
            bus,
        })
    }
}

impl DisplaySink for GstSink {
    fn push(&mut self, frame: DisplayFrame) -> Result<()> {
        let DisplayFrame {
            lease,
            pts,
            duration,
        } = frame;
        let appsrc = &self.appsrc;
        // the buffer owns the lease: the slot returns when GStreamer frees it
        push_owned(
            lease,
            |lease| {
                let mut buffer = gst::Buffer::from_slice(lease);
                {
                    let b = buffer
                        .get_mut()
                        .ok_or_else(|| LprError::sink("fresh buffer is not writable"))?;
                    b.set_pts(gst::ClockTime::from_nseconds(pts.as_nanos() as u64));
                    b.set_duration(gst::ClockTime::from_nseconds(duration.as_nanos() as u64));
                }
                Ok(buffer)
            },
            |buffer| {
                appsrc
                    .push_buffer(buffer)
                    .map(|_| ())
                    .map_err(|e| LprError::sink(format!("push_buffer: {e:?}")))
            },
        )
    }

    fn poll_event(&mut self) -> Option<SinkEvent> {
        while let Some(msg) = self.bus.pop() {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    let src = err.src().map(|s| s.path_string().to_string()).unwrap_or_default();
                    return Some(SinkEvent::Error(format!("{src}: {}", err.error())));
                }
                gst::MessageView::Eos(_) => return Some(SinkEvent::EndOfStream),
                _ => {}
            }
        }
        None
    }
}

impl Drop for GstSink {
    fn drop(&mut self) {
        if let Err(e) = self.appsrc.end_of_stream() {
            warn!("⚠️  appsrc EOS: {e:?}");
        }
        let msg = self.bus.timed_pop_filtered(
            gst::ClockTime::from_seconds(EOS_WAIT_SECS),
            &[gst::MessageType::Eos, gst::MessageType::Error],
        );
        match msg.as_ref().map(|m| m.view()) {
            None => warn!("⚠️  no EOS from kmssink within {EOS_WAIT_SECS}s, tearing down anyway"),
            Some(gst::MessageView::Error(err)) => warn!("⚠️  pipeline error while draining: {}", err.error()),
            Some(_) => {}
        }
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("⚠️  pipeline → NULL: {e}");
        }
    }
}
