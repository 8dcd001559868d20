// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 显示输出 (display sink boundary)
//!
//! A sink owns pushed [`SlotLease`]s until it is done with the pixels; the
//! slot goes back to the ring when the lease is dropped.

#[cfg(feature = "gst")]
mod gst;

#[cfg(feature = "gst")]
pub use self::gst::GstSink;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{LprError, Result};
use crate::pixel::SlotFormat;
use crate::ring::SlotLease;

/// One frame handed to the display
#[derive(Debug)]
pub struct DisplayFrame {
    pub lease: SlotLease,
    pub pts: Duration,
    pub duration: Duration,
}

/// Asynchronous notifications from the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Error(String),
    EndOfStream,
}

impl SinkEvent {
    pub fn into_error(self) -> LprError {
        match self {
            SinkEvent::Error(msg) => LprError::Sink(msg),
            SinkEvent::EndOfStream => LprError::EndOfStream,
        }
    }
}

pub trait DisplaySink: Send {
    fn push(&mut self, frame: DisplayFrame) -> Result<()>;
    /// Next pending event, never blocks.
    fn poll_event(&mut self) -> Option<SinkEvent>;
}

impl<T: DisplaySink + ?Sized> DisplaySink for Box<T> {
    fn push(&mut self, frame: DisplayFrame) -> Result<()> {
        (**self).push(frame)
    }

    fn poll_event(&mut self) -> Option<SinkEvent> {
        (**self).poll_event()
    }
}

/// Caps carry no stride, so the sink only takes tightly packed rows.
pub fn check_packed(width: u32, height: u32, format: SlotFormat, frame_size: usize) -> Result<()> {
    let packed = width as usize * height as usize * format.bytes_per_pixel();
    if frame_size != packed {
        return Err(LprError::sink(format!(
            "{width}x{height} {} needs {packed} bytes/frame, got {frame_size} (padded stride?)",
            format.caps_format()
        )));
    }
    Ok(())
}

/// 把 lease 交给会先拿走所有权的下游。
///
/// `wrap` turns the lease into the consumer's buffer type, `push` hands it
/// over. The frame counts as delivered only if `push` succeeds; a clone of
/// the buffer stays alive until then, so the slot cannot come back before
/// the outcome is known.
pub fn push_owned<B, W, P>(mut lease: SlotLease, wrap: W, push: P) -> Result<()>
where
    B: Clone,
    W: FnOnce(SlotLease) -> Result<B>,
    P: FnOnce(B) -> Result<()>,
{
    let delivery = lease.defer_delivery();
    let buffer = wrap(lease)?;
    let keep = buffer.clone();
    let pushed = push(buffer);
    if pushed.is_ok() {
        delivery.confirm();
    }
    drop(keep);
    pushed
}

/// Releases every frame as soon as it is pushed.
#[derive(Debug, Default)]
pub struct NullSink {
    pushed: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushed(&self) -> u64 {
        self.pushed
    }
}

impl DisplaySink for NullSink {
    fn push(&mut self, frame: DisplayFrame) -> Result<()> {
        self.pushed += 1;
        drop(frame);
        Ok(())
    }

    fn poll_event(&mut self) -> Option<SinkEvent> {
        None
    }
}

#[derive(Default)]
struct Held {
    frames: VecDeque<DisplayFrame>,
    events: VecDeque<SinkEvent>,
    fail_pushes: bool,
}

/// Keeps frames until told to let them go. Clones share the same queue, so
/// one clone can drive releases while the capture loop owns the other.
#[derive(Clone, Default)]
pub struct HoldingSink {
    inner: Arc<Mutex<Held>>,
}

impl HoldingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Held> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn held(&self) -> usize {
        self.lock().frames.len()
    }

    /// PTS of the held frames, oldest first
    pub fn held_pts(&self) -> Vec<Duration> {
        self.lock().frames.iter().map(|f| f.pts).collect()
    }

    pub fn release_oldest(&self) -> bool {
        // drop outside the lock
        let frame = self.lock().frames.pop_front();
        frame.is_some()
    }

    pub fn release_all(&self) -> usize {
        let frames = std::mem::take(&mut self.lock().frames);
        frames.len()
    }

    pub fn inject(&self, event: SinkEvent) {
        self.lock().events.push_back(event);
    }

    /// Refuse every later push
    pub fn fail_pushes(&self, fail: bool) {
        self.lock().fail_pushes = fail;
    }
}

impl DisplaySink for HoldingSink {
    fn push(&mut self, mut frame: DisplayFrame) -> Result<()> {
        let mut held = self.lock();
        if held.fail_pushes {
            frame.lease.mark_undelivered();
            drop(held);
            return Err(LprError::sink("push refused"));
        }
        held.frames.push_back(frame);
        Ok(())
    }

    fn poll_event(&mut self) -> Option<SinkEvent> {
        self.lock().events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::FrameSlotRing;

    const WAIT: Duration = Duration::from_millis(30);

    fn frame(ring: &Arc<FrameSlotRing>, n: u64) -> DisplayFrame {
        DisplayFrame {
            lease: ring.acquire(WAIT).unwrap(),
            pts: Duration::from_millis(n * 66),
            duration: Duration::from_millis(66),
        }
    }

    #[test]
    fn null_sink_returns_slots_at_once() {
        let ring = FrameSlotRing::new(2, 8);
        let mut sink = NullSink::new();
        for n in 0..5 {
            sink.push(frame(&ring, n)).unwrap();
        }
        assert_eq!(sink.pushed(), 5);
        assert_eq!(ring.outstanding(), 0);
        assert_eq!(ring.released_count(), 5);
    }

    #[test]
    fn holding_sink_keeps_slots_until_released() {
        let ring = FrameSlotRing::new(2, 8);
        let mut sink = HoldingSink::new();
        let remote = sink.clone();
        sink.push(frame(&ring, 0)).unwrap();
        sink.push(frame(&ring, 1)).unwrap();
        assert_eq!(ring.outstanding(), 2);
        assert_eq!(remote.held_pts()[1], Duration::from_millis(66));
        assert!(remote.release_oldest());
        assert_eq!(ring.outstanding(), 1);
        assert_eq!(remote.release_all(), 1);
        assert_eq!(ring.outstanding(), 0);
        assert!(!remote.release_oldest());
    }

    #[test]
    fn refused_push_is_not_counted_as_delivered() {
        let ring = FrameSlotRing::new(2, 8);
        let mut sink = HoldingSink::new();
        sink.fail_pushes(true);
        assert!(sink.push(frame(&ring, 0)).is_err());
        assert_eq!(ring.outstanding(), 0);
        assert_eq!(ring.released_count(), 0);
    }

    #[test]
    fn owned_push_counts_only_accepted_frames() {
        let ring = FrameSlotRing::new(2, 8);
        let consumer: Arc<Mutex<Vec<Arc<SlotLease>>>> = Arc::default();

        // downstream refuses and frees the buffer inside the push call
        let r = push_owned(ring.acquire(WAIT).unwrap(), |l| Ok(Arc::new(l)), |b| {
            drop(b);
            Err(LprError::sink("flushing"))
        });
        assert!(r.is_err());
        assert_eq!(ring.outstanding(), 0);
        assert_eq!((ring.released_count(), ring.undelivered_count()), (0, 1));

        // a failing wrap gives the slot back as undelivered too
        let r = push_owned(
            ring.acquire(WAIT).unwrap(),
            |_l| Err::<Arc<SlotLease>, _>(LprError::sink("no memory")),
            |_b| Ok(()),
        );
        assert!(r.is_err());
        assert_eq!((ring.released_count(), ring.undelivered_count()), (0, 2));

        // accepted: the slot stays out until downstream drops it
        let held = Arc::clone(&consumer);
        push_owned(ring.acquire(WAIT).unwrap(), |l| Ok(Arc::new(l)), move |b| {
            held.lock().unwrap().push(b);
            Ok(())
        })
        .unwrap();
        assert_eq!(ring.outstanding(), 1);
        consumer.lock().unwrap().clear();
        assert_eq!(ring.outstanding(), 0);
        assert_eq!((ring.released_count(), ring.undelivered_count()), (1, 2));
    }

    #[test]
    fn padded_rows_are_rejected() {
        let fmt = SlotFormat::Rgb565(crate::pixel::PixelOrder::Bgr565);
        assert!(check_packed(1280, 720, fmt, 1_843_200).is_ok());
        // 1280 px rows padded to 2624 bytes
        let err = check_packed(1280, 720, fmt, 2624 * 720).unwrap_err();
        assert!(matches!(err, LprError::Sink(_)));
        assert!(check_packed(64, 32, SlotFormat::Bgrx, 64 * 32 * 4).is_ok());
    }

    #[test]
    fn injected_events_come_back_in_order() {
        let mut sink = HoldingSink::new();
        sink.inject(SinkEvent::Error("kms".into()));
        sink.inject(SinkEvent::EndOfStream);
        assert_eq!(sink.poll_event(), Some(SinkEvent::Error("kms".into())));
        assert!(matches!(
            sink.poll_event().map(SinkEvent::into_error),
            Some(LprError::EndOfStream)
        ));
        assert_eq!(sink.poll_event(), None);
    }
}
