use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::classify::ComputeClass;

#[derive(Debug, Default)]
struct Running {
    total_us: AtomicU64,
    count: AtomicU64,
}

/// Running mean dispatch latency per class. Observability only.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    light: Running,
    heavy: Running,
}

impl LatencyTracker {
    fn slot(&self, class: ComputeClass) -> &Running {
        match class {
            ComputeClass::Light => &self.light,
            ComputeClass::Heavy => &self.heavy,
        }
    }

    pub fn record(&self, class: ComputeClass, elapsed: Duration) {
        let slot = self.slot(class);
        slot.total_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        slot.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, class: ComputeClass) -> u64 {
        self.slot(class).count.load(Ordering::Relaxed)
    }

    pub fn mean(&self, class: ComputeClass) -> Option<Duration> {
        let slot = self.slot(class);
        let count = slot.count.load(Ordering::Relaxed);
        if count == 0 {
            return None;
        }
        Some(Duration::from_micros(
            slot.total_us.load(Ordering::Relaxed) / count,
        ))
    }
}
