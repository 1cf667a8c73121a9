use crate::inference::Mode;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider, UpDownCounter},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    frames_received: Counter<u64>,
    frames_dropped: Counter<u64>,
    results_sent: Counter<u64>,
    frame_failures: Counter<u64>,
    inference_duration: Histogram<u64>,
    active_sessions: UpDownCounter<i64>,
    // instruments stop exporting once every handle to the provider is gone
    _provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        // TODO: switch to an OTLP exporter, opentelemetry-prometheus is deprecated
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter("vision_stream");
        global::set_meter_provider(provider.clone());

        let frames_received = meter
            .u64_counter("frames_received_total")
            .with_description("Frame messages received from clients")
            .build();

        let frames_dropped = meter
            .u64_counter("frames_dropped_total")
            .with_description("Frames discarded because a frame was already in flight")
            .build();

        let results_sent = meter
            .u64_counter("results_sent_total")
            .with_description("Results written back to clients")
            .build();

        let frame_failures = meter
            .u64_counter("frame_failures_total")
            .with_description("Admitted frames that produced no result")
            .build();

        let boundaries = generate_boundaries((15, 30, 60, 500, 1000));

        let inference_duration = meter
            .u64_histogram("inference_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Decode and inference duration in milliseconds")
            .build();

        let active_sessions = meter
            .i64_up_down_counter("active_sessions")
            .with_description("Authenticated vision sessions")
            .build();

        Ok(Metrics {
            frames_received,
            frames_dropped,
            results_sent,
            frame_failures,
            inference_duration,
            active_sessions,
            _provider: provider,
            registry,
        })
    }

    pub fn record_frame_received(&self) {
        self.frames_received.add(1, &[]);
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.add(1, &[]);
    }

    pub fn record_result(&self, mode: Mode, inference_ms: u64) {
        let attributes = [KeyValue::new("mode", mode.as_str())];
        self.results_sent.add(1, &attributes);
        self.inference_duration.record(inference_ms, &attributes);
    }

    pub fn record_failure(&self, kind: &'static str) {
        self.frame_failures.add(1, &[KeyValue::new("kind", kind)]);
    }

    pub fn session_opened(&self) {
        self.active_sessions.add(1, &[]);
    }

    pub fn session_closed(&self) {
        self.active_sessions.add(-1, &[]);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
