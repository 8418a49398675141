//! Per-engine timing and conservation samples.
//!
//! Observability only: nothing in the engine reads these back to make a
//! decision.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

use crate::constants::METRIC_WINDOW;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Local,
    Global,
    Particle,
    Observation,
}

/// Bounded ring of samples.
#[derive(Clone, Debug)]
pub struct SampleWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    total_count: u64,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            total_count: 0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.total_count += 1;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples ever pushed, including those rotated out.
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn max(&self) -> f64 {
        self.samples.iter().copied().fold(0.0, f64::max)
    }

    pub fn last(&self) -> Option<f64> {
        self.samples.back().copied()
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct TimingSummary {
    pub count: u64,
    pub mean_us: f64,
    pub max_us: f64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSummary {
    pub local: TimingSummary,
    pub global: TimingSummary,
    pub particle: TimingSummary,
    pub observation: TimingSummary,
    pub conservation_samples: u64,
    pub max_conservation_error: f64,
    pub conservation_errors_logged: u64,
    pub causality_violations: u64,
    pub node_failures: u64,
}

#[derive(Clone, Debug)]
pub struct PerformanceMetrics {
    local: SampleWindow,
    global: SampleWindow,
    particle: SampleWindow,
    observation: SampleWindow,
    conservation: SampleWindow,
    conservation_errors_logged: u64,
    causality_violations: u64,
    node_failures: u64,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new(METRIC_WINDOW)
    }
}

impl PerformanceMetrics {
    pub fn new(window: usize) -> Self {
        Self {
            local: SampleWindow::new(window),
            global: SampleWindow::new(window),
            particle: SampleWindow::new(window),
            observation: SampleWindow::new(window),
            conservation: SampleWindow::new(window),
            conservation_errors_logged: 0,
            causality_violations: 0,
            node_failures: 0,
        }
    }

    pub fn record_timing(&mut self, kind: EngineKind, elapsed: Duration) {
        let us = elapsed.as_secs_f64() * 1e6;
        self.window_mut(kind).push(us);
    }

    /// Relative conservation error of one step. `logged` marks samples over
    /// the tolerance.
    pub fn record_conservation(&mut self, relative_error: f64, logged: bool) {
        self.conservation.push(relative_error);
        if logged {
            self.conservation_errors_logged += 1;
        }
    }

    pub fn record_causality_violations(&mut self, n: usize) {
        self.causality_violations += n as u64;
    }

    pub fn record_node_failures(&mut self, n: usize) {
        self.node_failures += n as u64;
    }

    pub fn timings(&self, kind: EngineKind) -> &SampleWindow {
        match kind {
            EngineKind::Local => &self.local,
            EngineKind::Global => &self.global,
            EngineKind::Particle => &self.particle,
            EngineKind::Observation => &self.observation,
        }
    }

    pub fn conservation(&self) -> &SampleWindow {
        &self.conservation
    }

    pub fn summary(&self) -> MetricsSummary {
        let timing = |w: &SampleWindow| TimingSummary {
            count: w.total_count(),
            mean_us: w.mean(),
            max_us: w.max(),
        };
        MetricsSummary {
            local: timing(&self.local),
            global: timing(&self.global),
            particle: timing(&self.particle),
            observation: timing(&self.observation),
            conservation_samples: self.conservation.total_count(),
            max_conservation_error: self.conservation.max(),
            conservation_errors_logged: self.conservation_errors_logged,
            causality_violations: self.causality_violations,
            node_failures: self.node_failures,
        }
    }

    fn window_mut(&mut self, kind: EngineKind) -> &mut SampleWindow {
        match kind {
            EngineKind::Local => &mut self.local,
            EngineKind::Global => &mut self.global,
            EngineKind::Particle => &mut self.particle,
            EngineKind::Observation => &mut self.observation,
        }
    }
}
