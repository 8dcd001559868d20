// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 帧槽环 (Frame slot ring)
//!
//! A fixed arena of display-format frame buffers. Each acquire bumps the
//! slot generation and hands out a [`SlotLease`]; the lease gives the bytes
//! back when dropped. Releases carrying an old generation are ignored, so a
//! late callback from the display sink can never free a slot that has
//! already been reused for a newer frame.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{LprError, Result};

/// Longest single condvar wait while looking for a free slot
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Read-only memory shared with the hardware (zero-copy mode)
pub type SharedFrame = Arc<dyn AsRef<[u8]> + Send + Sync>;

/// Slot handle given to outside callers: index + generation snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTicket {
    pub index: usize,
    pub generation: u64,
}

enum SlotData {
    Owned(Vec<u8>),
    Mapped(SharedFrame),
}

impl SlotData {
    fn bytes(&self) -> &[u8] {
        match self {
            SlotData::Owned(v) => v,
            SlotData::Mapped(m) => (**m).as_ref(),
        }
    }
}

struct Slot {
    in_use: bool,
    generation: u64,
    data: SlotData,
}

struct RingState {
    slots: Vec<Slot>,
    outstanding: usize,
}

pub struct FrameSlotRing {
    state: Mutex<RingState>,
    cond: Condvar,
    frame_size: usize,
    released: AtomicU64,
    undelivered: AtomicU64,
    timeouts: AtomicU64,
}

impl FrameSlotRing {
    /// `count` independently allocated slots of `frame_size` bytes each.
    pub fn new(count: usize, frame_size: usize) -> Arc<Self> {
        let slots = (0..count)
            .map(|_| Slot {
                in_use: false,
                generation: 0,
                data: SlotData::Owned(vec![0; frame_size]),
            })
            .collect();
        Self::with_slots(slots, frame_size)
    }

    /// Single slot aliasing the hardware-mapped frame.
    pub fn aliased(map: SharedFrame) -> Arc<Self> {
        let frame_size = (*map).as_ref().len();
        let slots = vec![Slot {
            in_use: false,
            generation: 0,
            data: SlotData::Mapped(map),
        }];
        Self::with_slots(slots, frame_size)
    }

    fn with_slots(slots: Vec<Slot>, frame_size: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RingState {
                slots,
                outstanding: 0,
            }),
            cond: Condvar::new(),
            frame_size,
            released: AtomicU64::new(0),
            undelivered: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn is_aliased(&self) -> bool {
        self.lock()
            .slots
            .first()
            .is_some_and(|s| matches!(s.data, SlotData::Mapped(_)))
    }

    /// Take a free slot, waiting at most `timeout` for one to come back.
    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<SlotLease> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut st = self.lock();
        loop {
            if let Some(index) = st.slots.iter().position(|s| !s.in_use) {
                let frame_size = self.frame_size;
                let slot = &mut st.slots[index];
                slot.in_use = true;
                slot.generation += 1;
                let generation = slot.generation;
                let data = match &mut slot.data {
                    SlotData::Owned(v) => {
                        let mut buf = std::mem::take(v);
                        // a stale lease kept the old buffer
                        if buf.len() != frame_size {
                            buf = vec![0; frame_size];
                        }
                        SlotData::Owned(buf)
                    }
                    SlotData::Mapped(m) => SlotData::Mapped(Arc::clone(m)),
                };
                st.outstanding += 1;
                return Ok(SlotLease {
                    ring: Arc::clone(self),
                    ticket: SlotTicket { index, generation },
                    data: Some(data),
                    delivered: Arc::new(AtomicBool::new(true)),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(LprError::SlotTimeout {
                    waited_ms: now.duration_since(start).as_millis() as u64,
                });
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            st = self
                .cond
                .wait_timeout(st, slice)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Return a slot. Ignored (returns false) unless the ticket's generation
    /// is still current and the slot is in use.
    pub fn release(&self, ticket: SlotTicket, count_as_delivered: bool) -> bool {
        let mut st = self.lock();
        self.release_locked(&mut st, ticket, count_as_delivered)
    }

    fn release_locked(&self, st: &mut RingState, ticket: SlotTicket, delivered: bool) -> bool {
        let Some(slot) = st.slots.get_mut(ticket.index) else {
            return false;
        };
        if !slot.in_use || slot.generation != ticket.generation {
            debug!(
                "stale release of slot {} gen {} (current gen {})",
                ticket.index, ticket.generation, slot.generation
            );
            return false;
        }
        slot.in_use = false;
        st.outstanding -= 1;
        if delivered {
            self.released.fetch_add(1, Ordering::Relaxed);
        } else {
            self.undelivered.fetch_add(1, Ordering::Relaxed);
        }
        self.cond.notify_all();
        true
    }

    fn check_in(&self, ticket: SlotTicket, data: Option<SlotData>, delivered: bool) {
        let mut st = self.lock();
        if let (Some(slot), Some(SlotData::Owned(buf))) = (st.slots.get_mut(ticket.index), data) {
            if slot.generation == ticket.generation {
                if let SlotData::Owned(v) = &mut slot.data {
                    *v = buf;
                }
            }
        }
        self.release_locked(&mut st, ticket, delivered);
    }

    /// Slots currently handed out
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Slots that came back without reaching the display
    pub fn undelivered_count(&self) -> u64 {
        self.undelivered.load(Ordering::Relaxed)
    }

    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

/// A checked-out slot. Derefs to the frame bytes and gives the slot back to
/// its ring exactly once when dropped.
pub struct SlotLease {
    ring: Arc<FrameSlotRing>,
    ticket: SlotTicket,
    data: Option<SlotData>,
    delivered: Arc<AtomicBool>,
}

impl SlotLease {
    pub fn ticket(&self) -> SlotTicket {
        self.ticket
    }

    /// Writable pixels; `None` for a slot aliasing hardware memory.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        match self.data.as_mut() {
            Some(SlotData::Owned(v)) => Some(v.as_mut_slice()),
            _ => None,
        }
    }

    /// Do not count this frame as delivered when it comes back.
    pub fn mark_undelivered(&mut self) {
        self.delivered.store(false, Ordering::Release);
    }

    /// 交给一个先拿走所有权、后报告结果的消费者 (例如 GStreamer buffer)。
    /// The lease counts as undelivered from now on unless the returned
    /// handle is confirmed before the lease comes back.
    pub fn defer_delivery(&mut self) -> Delivery {
        self.delivered.store(false, Ordering::Release);
        Delivery(Arc::clone(&self.delivered))
    }
}

/// Confirms a deferred delivery, see [`SlotLease::defer_delivery`].
#[derive(Debug)]
pub struct Delivery(Arc<AtomicBool>);

impl Delivery {
    pub fn confirm(self) {
        self.0.store(true, Ordering::Release);
    }
}

impl Deref for SlotLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_ref().map(SlotData::bytes).unwrap_or(&[])
    }
}

impl AsRef<[u8]> for SlotLease {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl std::fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLease")
            .field("ticket", &self.ticket)
            .field("len", &self.len())
            .field("delivered", &self.delivered.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let delivered = self.delivered.load(Ordering::Acquire);
        self.ring.check_in(self.ticket, self.data.take(), delivered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(30);

    #[test]
    fn at_most_n_outstanding() {
        let ring = FrameSlotRing::new(3, 16);
        let leases: Vec<_> = (0..3).map(|_| ring.acquire(SHORT).unwrap()).collect();
        assert_eq!(ring.outstanding(), 3);
        let err = ring.acquire(SHORT).unwrap_err();
        assert!(matches!(err, LprError::SlotTimeout { .. }));
        assert_eq!(ring.timeout_count(), 1);
        drop(leases);
        assert_eq!(ring.outstanding(), 0);
        assert_eq!(ring.released_count(), 3);
    }

    #[test]
    fn generation_bumps_on_every_acquire() {
        let ring = FrameSlotRing::new(1, 4);
        let first = ring.acquire(SHORT).unwrap().ticket();
        let second = ring.acquire(SHORT).unwrap().ticket();
        assert_eq!(first.index, second.index);
        assert_eq!(second.generation, first.generation + 1);
    }

    #[test]
    fn stale_release_changes_nothing() {
        let ring = FrameSlotRing::new(2, 4);
        let old = ring.acquire(SHORT).unwrap();
        let old_ticket = old.ticket();
        assert!(ring.release(old_ticket, true));
        // slot reused for a newer frame
        let newer = ring.acquire(SHORT).unwrap();
        assert_eq!(newer.ticket().index, old_ticket.index);
        let before = (ring.outstanding(), ring.released_count());
        assert!(!ring.release(old_ticket, true));
        drop(old);
        assert_eq!((ring.outstanding(), ring.released_count()), before);
        drop(newer);
        assert_eq!(ring.outstanding(), 0);
    }

    #[test]
    fn double_release_is_ignored() {
        let ring = FrameSlotRing::new(1, 4);
        let lease = ring.acquire(SHORT).unwrap();
        let t = lease.ticket();
        drop(lease);
        assert!(!ring.release(t, true));
        assert_eq!(ring.released_count(), 1);
    }

    #[test]
    fn undelivered_is_not_counted() {
        let ring = FrameSlotRing::new(1, 4);
        let mut lease = ring.acquire(SHORT).unwrap();
        lease.mark_undelivered();
        drop(lease);
        assert_eq!(ring.released_count(), 0);
        assert_eq!(ring.undelivered_count(), 1);
        assert_eq!(ring.outstanding(), 0);
    }

    #[test]
    fn deferred_delivery_counts_only_when_confirmed() {
        let ring = FrameSlotRing::new(2, 4);

        // consumer took the lease and then refused it
        let mut refused = ring.acquire(SHORT).unwrap();
        let pending = refused.defer_delivery();
        let owned = Arc::new(refused);
        drop(owned);
        drop(pending);
        assert_eq!((ring.released_count(), ring.undelivered_count()), (0, 1));
        assert_eq!(ring.outstanding(), 0);

        // consumer accepted; it drops the frame later
        let mut accepted = ring.acquire(SHORT).unwrap();
        let pending = accepted.defer_delivery();
        let owned = Arc::new(accepted);
        pending.confirm();
        drop(owned);
        assert_eq!((ring.released_count(), ring.undelivered_count()), (1, 1));
        assert_eq!(ring.outstanding(), 0);
    }

    #[test]
    fn buffer_survives_round_trip() {
        let ring = FrameSlotRing::new(1, 8);
        let mut lease = ring.acquire(SHORT).unwrap();
        lease.data_mut().unwrap()[0] = 42;
        drop(lease);
        let lease = ring.acquire(SHORT).unwrap();
        assert_eq!(lease.len(), 8);
        assert_eq!(lease[0], 42);
    }

    #[test]
    fn waiter_wakes_on_release_from_other_thread() {
        let ring = FrameSlotRing::new(1, 4);
        let lease = ring.acquire(SHORT).unwrap();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(40));
            drop(lease);
        });
        let again = ring.acquire(Duration::from_secs(2));
        assert!(again.is_ok());
        h.join().unwrap();
    }

    #[test]
    fn aliased_slot_is_read_only() {
        let map: SharedFrame = Arc::new(vec![1u8, 2, 3, 4]);
        let ring = FrameSlotRing::aliased(map);
        assert!(ring.is_aliased());
        assert_eq!(ring.capacity(), 1);
        let mut lease = ring.acquire(SHORT).unwrap();
        assert_eq!(&lease[..], &[1, 2, 3, 4]);
        assert!(lease.data_mut().is_none());
        drop(lease);
        assert_eq!(ring.outstanding(), 0);
    }
}
