//! OpenTelemetry metrics export.
//!
//! Only aggregate counters leave the host; individual lock events stay on
//! stdout. Export is off unless `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use crate::stats::OutcomeTotals;
use lockwatch_common::CaptureOutcome;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

static METRICS: OnceLock<LockWatchMetrics> = OnceLock::new();

/// Kept for graceful shutdown.
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Read by the `active_probes` gauge callback.
static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct LockWatchMetrics {
    pub mutex_events: Counter<u64>,
    pub mutex_events_dropped: Counter<u64>,
    pub mutex_events_filtered: Counter<u64>,
    pub mutex_events_aborted: Counter<u64>,
}

impl LockWatchMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            mutex_events: meter
                .u64_counter("mutex_events")
                .with_description("Mutex lock/unlock events delivered to userspace")
                .with_unit("events")
                .build(),
            mutex_events_dropped: meter
                .u64_counter("mutex_events_dropped")
                .with_description("Mutex events lost because the ring buffer was full")
                .with_unit("events")
                .build(),
            mutex_events_filtered: meter
                .u64_counter("mutex_events_filtered")
                .with_description("Mutex calls skipped by the mount namespace filter")
                .with_unit("events")
                .build(),
            mutex_events_aborted: meter
                .u64_counter("mutex_events_aborted")
                .with_description("Mutex calls whose task identity could not be read")
                .with_unit("events")
                .build(),
        }
    }
}

/// Adds a scheme when the endpoint is given as bare `host:port`.
fn normalize_endpoint(raw: Option<&str>) -> Option<String> {
    let endpoint = raw?.trim();
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint.to_string())
    }
}

/// Configures export to an OTLP collector via gRPC. A missing endpoint
/// leaves every `record_*` helper a no-op.
pub fn init_metrics(endpoint: Option<&str>) -> Result<()> {
    let endpoint = match normalize_endpoint(endpoint) {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "lockwatch"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("lockwatch");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of library images with mutex uprobes attached")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (probe_name, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("probe", probe_name.clone())]);
                }
            }
        })
        .build();

    let _ = METRICS.set(LockWatchMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static LockWatchMetrics> {
    METRICS.get()
}

pub fn record_mutex_event(operation: &'static str) {
    if let Some(m) = metrics() {
        m.mutex_events
            .add(1, &[KeyValue::new("operation", operation)]);
    }
}

/// Feeds the kernel-side outcome counters. `delta` is the change since the
/// previous report.
pub fn record_capture_outcomes(delta: &OutcomeTotals) {
    if let Some(m) = metrics() {
        m.mutex_events_dropped
            .add(delta.get(CaptureOutcome::NoSpace), &[]);
        m.mutex_events_filtered
            .add(delta.get(CaptureOutcome::FilteredOut), &[]);
        m.mutex_events_aborted
            .add(delta.get(CaptureOutcome::Aborted), &[]);
    }
}

/// Updates the map the `active_probes` gauge reports from.
pub fn record_active_probe(probe_name: &str, count: u64) {
    if let Ok(mut probes) = active_probes_map().write() {
        probes.insert(probe_name.to_string(), count);
        info!("Active probe registered: {} = {}", probe_name, count);
    }
}

/// Flushes pending metrics and shuts down the MeterProvider.
pub fn shutdown_metrics() {
    info!("Shutting down OpenTelemetry metrics...");
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}
