// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 应用上下文: 停止标志, 计数器, 最新识别结果

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::detection::{DetBox, PlateDetection};

/// Everything one inference cycle produced. Published whole; never mutated
/// after it is stored.
#[derive(Debug, Clone, Default)]
pub struct ResultsSnapshot {
    /// mailbox sequence of the analysed frame
    pub seq: u64,
    pub vehicles: Vec<DetBox>,
    pub persons: Vec<DetBox>,
    pub plates: Vec<PlateDetection>,
    pub aux_roi: Option<DetBox>,
    pub red_light: bool,
    pub frames_processed: u64,
    pub infer_total_ms: f64,
    pub last_infer_ms: f64,
    pub ped_events: u64,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub captured: AtomicU64,
    pub pushed: AtomicU64,
    pub slot_timeouts: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Shared by `Arc` between the capture loop, the inference worker and the
/// signal handler.
#[derive(Debug, Default)]
pub struct AppContext {
    stop: AtomicBool,
    pub counters: Counters,
    results: Mutex<Arc<ResultsSnapshot>>,
}

impl AppContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Replace the published results.
    pub fn publish_results(&self, snapshot: ResultsSnapshot) {
        let snapshot = Arc::new(snapshot);
        *self.results.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    /// Latest completed inference cycle (cheap `Arc` clone).
    pub fn latest_results(&self) -> Arc<ResultsSnapshot> {
        Arc::clone(&self.results.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_flag_is_sticky() {
        let ctx = AppContext::new();
        assert!(!ctx.should_stop());
        ctx.request_stop();
        ctx.request_stop();
        assert!(ctx.should_stop());
    }

    #[test]
    fn snapshot_replaced_wholesale() {
        let ctx = AppContext::new();
        let before = ctx.latest_results();
        assert_eq!(before.seq, 0);
        ctx.publish_results(ResultsSnapshot {
            seq: 7,
            red_light: true,
            ..Default::default()
        });
        // readers holding the old snapshot keep seeing it unchanged
        assert_eq!(before.seq, 0);
        let after = ctx.latest_results();
        assert_eq!(after.seq, 7);
        assert!(after.red_light);
    }

    #[test]
    fn counters_bump() {
        let ctx = AppContext::new();
        assert_eq!(Counters::bump(&ctx.counters.captured), 1);
        assert_eq!(Counters::bump(&ctx.counters.captured), 2);
        assert_eq!(Counters::get(&ctx.counters.pushed), 0);
    }
}
