use std::env;
use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::store::ReapReport;

pub const LOG_FORMAT_ENV: &str = "GROUPQ_LOG_FORMAT";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

static LOG_FORMAT: OnceLock<LogFormat> = OnceLock::new();

pub fn log_format() -> LogFormat {
    *LOG_FORMAT.get_or_init(|| {
        let value = env::var(LOG_FORMAT_ENV).unwrap_or_else(|_| "json".to_string());
        parse_log_format(&value)
    })
}

fn parse_log_format(value: &str) -> LogFormat {
    match value.trim().to_lowercase().as_str() {
        "pretty" | "text" | "human" => LogFormat::Pretty,
        _ => LogFormat::Json,
    }
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_format() {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_current_span(true)
                .with_filter(filter);
            tracing_subscriber::registry().with(fmt_layer).init();
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter);
            tracing_subscriber::registry().with(fmt_layer).init();
        }
    }
}

#[cfg(not(feature = "otel"))]
pub fn record_enqueue(_created: bool) {}

#[cfg(not(feature = "otel"))]
pub fn record_reserved() {}

#[cfg(not(feature = "otel"))]
pub fn record_job_outcome(_outcome: &str, _duration_ms: f64) {}

#[cfg(not(feature = "otel"))]
pub fn record_poll_cycle(_kind: &str) {}

#[cfg(not(feature = "otel"))]
pub fn record_reap(_report: &ReapReport) {}

#[cfg(feature = "otel")]
pub fn record_enqueue(created: bool) {
    otel::record_enqueue(created);
}

#[cfg(feature = "otel")]
pub fn record_reserved() {
    otel::record_reserved();
}

#[cfg(feature = "otel")]
pub fn record_job_outcome(outcome: &str, duration_ms: f64) {
    otel::record_job_outcome(outcome, duration_ms);
}

#[cfg(feature = "otel")]
pub fn record_poll_cycle(kind: &str) {
    otel::record_poll_cycle(kind);
}

#[cfg(feature = "otel")]
pub fn record_reap(report: &ReapReport) {
    otel::record_reap(report);
}

/// Counters on the global meter. They stay inert until the embedding
/// application installs a meter provider.
#[cfg(feature = "otel")]
mod otel {
    use std::sync::OnceLock;

    use opentelemetry::metrics::{Counter, Histogram, Meter};
    use opentelemetry::{KeyValue, global};

    use crate::store::ReapReport;

    static QUEUE_METRICS: OnceLock<QueueMetrics> = OnceLock::new();

    struct QueueMetrics {
        enqueued_total: Counter<u64>,
        reserved_total: Counter<u64>,
        job_outcomes_total: Counter<u64>,
        job_duration_ms: Histogram<f64>,
        poll_cycles_total: Counter<u64>,
        leases_reaped_total: Counter<u64>,
    }

    impl QueueMetrics {
        fn new(meter: &Meter) -> Self {
            Self {
                enqueued_total: meter.u64_counter("groupq_enqueued_total").build(),
                reserved_total: meter.u64_counter("groupq_reserved_total").build(),
                job_outcomes_total: meter.u64_counter("groupq_job_outcomes_total").build(),
                job_duration_ms: meter.f64_histogram("groupq_job_duration_ms").build(),
                poll_cycles_total: meter.u64_counter("groupq_poll_cycles_total").build(),
                leases_reaped_total: meter.u64_counter("groupq_leases_reaped_total").build(),
            }
        }
    }

    fn metrics() -> &'static QueueMetrics {
        QUEUE_METRICS.get_or_init(|| QueueMetrics::new(&global::meter("groupq")))
    }

    pub fn record_enqueue(created: bool) {
        metrics()
            .enqueued_total
            .add(1, &[KeyValue::new("created", created)]);
    }

    pub fn record_reserved() {
        metrics().reserved_total.add(1, &[]);
    }

    pub fn record_job_outcome(outcome: &str, duration_ms: f64) {
        let attributes = [KeyValue::new("outcome", outcome.to_string())];
        let metrics = metrics();
        metrics.job_outcomes_total.add(1, &attributes);
        metrics.job_duration_ms.record(duration_ms, &attributes);
    }

    pub fn record_poll_cycle(kind: &str) {
        metrics()
            .poll_cycles_total
            .add(1, &[KeyValue::new("kind", kind.to_string())]);
    }

    pub fn record_reap(report: &ReapReport) {
        let metrics = metrics();
        if report.reclaimed > 0 {
            metrics
                .leases_reaped_total
                .add(report.reclaimed, &[KeyValue::new("result", "requeued")]);
        }
        if report.dead > 0 {
            metrics
                .leases_reaped_total
                .add(report.dead, &[KeyValue::new("result", "dead")]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_format_accepts_pretty_aliases() {
        assert_eq!(parse_log_format("pretty"), LogFormat::Pretty);
        assert_eq!(parse_log_format(" Text "), LogFormat::Pretty);
        assert_eq!(parse_log_format("human"), LogFormat::Pretty);
    }

    #[test]
    fn parse_log_format_defaults_to_json() {
        assert_eq!(parse_log_format("json"), LogFormat::Json);
        assert_eq!(parse_log_format(""), LogFormat::Json);
        assert_eq!(parse_log_format("yaml"), LogFormat::Json);
    }

    #[test]
    fn metric_hooks_are_callable_without_a_provider() {
        record_enqueue(true);
        record_reserved();
        record_job_outcome("success", 1.5);
        record_poll_cycle("no_jobs");
        record_reap(&ReapReport::default());
    }
}
