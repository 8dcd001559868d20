// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 推理信箱: 单槽 "最新帧优先" 交接 (Latest-wins single-slot handoff)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

struct Inner {
    frame: Vec<u8>,
    has_new: bool,
    seq: u64,
    stopped: bool,
}

/// Capture → inference handoff. Publishing never blocks on the consumer;
/// an unread frame is simply replaced and counted as a drop.
pub struct InferenceMailbox {
    inner: Mutex<Inner>,
    cond: Condvar,
    drops: AtomicU64,
}

impl Default for InferenceMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceMailbox {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                frame: Vec::new(),
                has_new: false,
                seq: 0,
                stopped: false,
            }),
            cond: Condvar::new(),
            drops: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Overwrite the pending frame and wake the worker. Returns the new
    /// sequence number.
    pub fn publish(&self, frame: &[u8]) -> u64 {
        let mut inner = self.lock();
        if inner.has_new {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
        inner.frame.clear();
        inner.frame.extend_from_slice(frame);
        inner.has_new = true;
        inner.seq += 1;
        let seq = inner.seq;
        drop(inner);
        self.cond.notify_one();
        seq
    }

    /// Block until a new frame is available and copy it into `out`.
    /// `None` once [`shutdown`](Self::shutdown) has been called.
    pub fn take(&self, out: &mut Vec<u8>) -> Option<u64> {
        let mut inner = self.lock();
        while !inner.has_new && !inner.stopped {
            inner = self.cond.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
        if inner.stopped {
            return None;
        }
        out.clear();
        out.extend_from_slice(&inner.frame);
        inner.has_new = false;
        Some(inner.seq)
    }

    /// Wake every waiter and make further `take` calls return `None`.
    pub fn shutdown(&self) {
        self.lock().stopped = true;
        self.cond.notify_all();
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn sequence(&self) -> u64 {
        self.lock().seq
    }
}
