// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Prometheus exposition for `/metrics`.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec,
};

lazy_static! {
    pub static ref INVOCATIONS: IntCounterVec = register_int_counter_vec!(
        "ol_invocations_total",
        "Lambda invocations by function and HTTP status",
        &["function", "status"]
    )
    .unwrap();
    pub static ref INVOKE_DURATION: HistogramVec = register_histogram_vec!(
        "ol_invoke_duration_seconds",
        "End-to-end invocation latency as seen by the worker",
        &["function"],
        vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0, 30.0]
    )
    .unwrap();
    pub static ref ENGINE_STATS: IntGaugeVec = register_int_gauge_vec!(
        "ol_engine_stat",
        "Engine counters and latency averages from the stats snapshot",
        &["name"]
    )
    .unwrap();
}

/// Force registration so the series show up before the first request.
pub fn init() {
    lazy_static::initialize(&INVOCATIONS);
    lazy_static::initialize(&INVOKE_DURATION);
    lazy_static::initialize(&ENGINE_STATS);
}

pub fn observe_invocation(function: &str, status: u16, seconds: f64) {
    INVOCATIONS
        .with_label_values(&[function, &status.to_string()])
        .inc();
    INVOKE_DURATION
        .with_label_values(&[function])
        .observe(seconds);
}

/// Mirror the engine's stats snapshot into gauges, then encode everything.
pub fn render(stats: &BTreeMap<String, u64>) -> String {
    for (name, value) in stats {
        ENGINE_STATS
            .with_label_values(&[name.as_str()])
            .set(i64::try_from(*value).unwrap_or(i64::MAX));
    }

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("Encoding error"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_engine_stats() {
        init();
        observe_invocation("hello", 200, 0.004);

        let mut stats = BTreeMap::new();
        stats.insert("sandbox.reuse.cnt".to_string(), 3);
        let text = render(&stats);

        assert!(text.contains("ol_invocations_total"));
        assert!(text.contains(r#"function="hello""#));
        assert!(text.contains(r#"ol_engine_stat{name="sandbox.reuse.cnt"} 3"#));
    }
}
