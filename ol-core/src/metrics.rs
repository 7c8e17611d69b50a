// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! In-process counters, latency averages and timers.
//!
//! Snapshot keys follow `name.cnt` for counts and `name.ms-avg` for the
//! rolling latency average.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::{WorkerError, WorkerResult};

/// Samples kept per latency series.
const LATENCY_WINDOW: usize = 10;

/// Average over the last `n` samples.
#[derive(Debug, Clone)]
pub struct RollingAvg {
    capacity: usize,
    samples: VecDeque<u64>,
    sum: u64,
}

impl RollingAvg {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
            sum: 0,
        }
    }

    pub fn add(&mut self, sample: u64) {
        if self.samples.len() == self.capacity {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    /// Integer average; zero with no samples.
    pub fn avg(&self) -> u64 {
        if self.samples.is_empty() {
            0
        } else {
            self.sum / self.samples.len() as u64
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug)]
struct Latency {
    count: u64,
    avg: RollingAvg,
}

#[derive(Debug, Default)]
struct Series {
    counters: HashMap<String, u64>,
    latencies: HashMap<String, Latency>,
}

/// Registry of named counters and latency series.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    series: Mutex<Series>,
    trace_latency: bool,
}

impl MetricsRegistry {
    pub fn new(trace_latency: bool) -> Self {
        Self {
            series: Mutex::new(Series::default()),
            trace_latency,
        }
    }

    pub fn new_shared(trace_latency: bool) -> Arc<Self> {
        Arc::new(Self::new(trace_latency))
    }

    /// Bump a counter.
    pub fn inc(&self, name: &str) {
        *self
            .series
            .lock()
            .counters
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_ms(&self, name: &str, ms: u64) {
        if self.trace_latency {
            tracing::debug!(series = name, ms, "Latency");
        }

        let mut series = self.series.lock();
        let latency = series
            .latencies
            .entry(name.to_string())
            .or_insert_with(|| Latency {
                count: 0,
                avg: RollingAvg::new(LATENCY_WINDOW),
            });
        latency.count += 1;
        latency.avg.add(ms);
    }

    /// Start a timer; call [`Timer::t1`] to record it.
    pub fn t0(self: &Arc<Self>, name: &str) -> Timer {
        Timer {
            registry: Arc::clone(self),
            name: name.to_string(),
            start: Instant::now(),
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.series.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let series = self.series.lock();
        let mut snap = BTreeMap::new();

        for (name, count) in &series.counters {
            snap.insert(format!("{}.cnt", name), *count);
        }
        for (name, latency) in &series.latencies {
            snap.insert(format!("{}.cnt", name), latency.count);
            snap.insert(format!("{}.ms-avg", name), latency.avg.avg());
        }

        snap
    }

    /// Write the snapshot as pretty JSON (e.g. `worker_dir/stats.json`).
    pub fn dump(&self, path: impl AsRef<Path>) -> WorkerResult<()> {
        let json =
            serde_json::to_string_pretty(&self.snapshot()).map_err(|e| WorkerError::ConfigParse {
                message: format!("stats encode error: {}", e),
            })?;
        std::fs::write(path, json).map_err(|e| WorkerError::Io {
            context: "writing stats file",
            source: e,
        })
    }
}

/// Running latency measurement.
#[derive(Debug)]
pub struct Timer {
    registry: Arc<MetricsRegistry>,
    name: String,
    start: Instant,
}

impl Timer {
    /// Stop and record; returns elapsed ms.
    pub fn t1(self) -> u64 {
        let ms = self.start.elapsed().as_millis() as u64;
        self.registry.record_ms(&self.name, ms);
        ms
    }
}
