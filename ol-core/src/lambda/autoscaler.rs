// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Instance-count recommender.
//!
//! Tracks outstanding work per function and recommends an instance count
//! of one sandbox per second of in-progress work, moving the
//! recommendation at most one step per interval. Requests are served by
//! the idle list regardless; the recommendation is reported in stats.

use std::time::{Duration, Instant};

use crate::metrics::RollingAvg;

/// Minimum spacing between recommendation changes.
pub const SCALE_INTERVAL: Duration = Duration::from_millis(100);
const EXEC_WINDOW: usize = 10;

#[derive(Debug, Clone)]
pub struct Autoscaler {
    outstanding: u64,
    exec_ms: RollingAvg,
    instances: u64,
    last_scale: Option<Instant>,
}

impl Default for Autoscaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Autoscaler {
    pub fn new() -> Self {
        Self {
            outstanding: 0,
            exec_ms: RollingAvg::new(EXEC_WINDOW),
            instances: 1,
            last_scale: None,
        }
    }

    pub fn started(&mut self, now: Instant) {
        self.outstanding += 1;
        self.step(now);
    }

    pub fn finished(&mut self, exec_ms: u64, now: Instant) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.exec_ms.add(exec_ms);
        self.step(now);
    }

    /// `outstanding * avg_ms / 1000`, capped by `outstanding`, at least 1.
    pub fn desired(&self) -> u64 {
        let work_ms = self.outstanding * self.exec_ms.avg();
        (work_ms / 1000).min(self.outstanding).max(1)
    }

    /// Current recommendation.
    pub fn instances(&self) -> u64 {
        self.instances
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding
    }

    pub fn exec_ms_avg(&self) -> u64 {
        self.exec_ms.avg()
    }

    fn step(&mut self, now: Instant) {
        let desired = self.desired();
        if desired == self.instances {
            return;
        }
        if let Some(last) = self.last_scale {
            if now.duration_since(last) < SCALE_INTERVAL {
                return;
            }
        }

        if self.instances < desired {
            self.instances += 1;
        } else {
            self.instances -= 1;
        }
        self.last_scale = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desired_bounds() {
        let mut scaler = Autoscaler::new();
        assert_eq!(scaler.desired(), 1);

        let now = Instant::now();
        for _ in 0..10 {
            scaler.started(now);
        }
        // no latency samples yet
        assert_eq!(scaler.desired(), 1);

        scaler.exec_ms.add(5000);
        // 10 outstanding * 5s = 50 instances, capped at 10
        assert_eq!(scaler.desired(), 10);
    }

    #[test]
    fn test_one_step_per_interval() {
        let mut scaler = Autoscaler::new();
        scaler.exec_ms.add(2000);
        let t0 = Instant::now();

        for _ in 0..4 {
            scaler.started(t0);
        }
        assert_eq!(scaler.desired(), 4);
        assert_eq!(scaler.instances(), 2);

        scaler.started(t0 + Duration::from_millis(50));
        assert_eq!(scaler.instances(), 2);

        scaler.started(t0 + SCALE_INTERVAL);
        assert_eq!(scaler.instances(), 3);
    }

    #[test]
    fn test_scales_down() {
        let mut scaler = Autoscaler::new();
        scaler.instances = 3;
        let t0 = Instant::now();

        scaler.finished(10, t0);
        assert_eq!(scaler.instances(), 2);
        scaler.finished(10, t0 + SCALE_INTERVAL);
        assert_eq!(scaler.instances(), 1);
        assert_eq!(scaler.outstanding(), 0);
    }
}
