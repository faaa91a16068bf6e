use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    advice_invocations: CounterVec,
    advice_rows_in: CounterVec,
    advice_rows_dropped: CounterVec,
    advice_rows_out: CounterVec,
    advice_time_seconds: HistogramVec,
    installed_queries: GaugeVec,
    results_reported: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record one advice invocation and the fate of its candidate rows.
    pub fn record_advice(
        &self,
        query_id: &str,
        advice_id: &str,
        tracepoint: &str,
        rows_in: u64,
        rows_dropped: u64,
        rows_out: u64,
        secs: f64,
    ) {
        self.inner
            .advice_invocations
            .with_label_values(&[query_id, advice_id, tracepoint])
            .inc();
        let labels = [query_id, advice_id];
        self.inner
            .advice_rows_in
            .with_label_values(&labels)
            .inc_by(rows_in as f64);
        self.inner
            .advice_rows_dropped
            .with_label_values(&labels)
            .inc_by(rows_dropped as f64);
        self.inner
            .advice_rows_out
            .with_label_values(&labels)
            .inc_by(rows_out as f64);
        self.inner
            .advice_time_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn set_installed_queries(&self, installed: u64) {
        self.inner
            .installed_queries
            .with_label_values(&[])
            .set(installed as f64);
    }

    pub fn inc_results_reported(&self, query_id: &str) {
        self.inner
            .results_reported
            .with_label_values(&[query_id])
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let advice_invocations = counter_vec(
            &registry,
            "ptq_advice_invocations_total",
            "Advice invocations per tracepoint",
            &["query_id", "advice_id", "tracepoint"],
        );
        let advice_rows_in = counter_vec(
            &registry,
            "ptq_advice_rows_in_total",
            "Candidate rows formed from observed values and unpacked bags",
            &["query_id", "advice_id"],
        );
        let advice_rows_dropped = counter_vec(
            &registry,
            "ptq_advice_rows_dropped_total",
            "Candidate rows dropped by a failed let or where",
            &["query_id", "advice_id"],
        );
        let advice_rows_out = counter_vec(
            &registry,
            "ptq_advice_rows_out_total",
            "Rows emitted or packed",
            &["query_id", "advice_id"],
        );
        let advice_time_seconds = histogram_vec(
            &registry,
            "ptq_advice_time_seconds",
            "Time spent evaluating one advice invocation",
            &["query_id", "advice_id"],
        );

        let installed_queries = gauge_vec(
            &registry,
            "ptq_installed_queries",
            "Currently installed queries",
            &[],
        );
        let results_reported = counter_vec(
            &registry,
            "ptq_results_reported_total",
            "Result records drained from emit sinks",
            &["query_id"],
        );

        Self {
            registry,
            advice_invocations,
            advice_rows_in,
            advice_rows_dropped,
            advice_rows_out,
            advice_time_seconds,
            installed_queries,
            results_reported,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.record_advice("7", "7.1", "ClientRequest", 3, 1, 2, 0.001);
        let text = m.render_prometheus();
        assert!(text.contains("ptq_advice_invocations_total"));
        assert!(text.contains("ClientRequest"));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.record_advice("7", "7.0", "DataNodeRead", 27, 0, 27, 0.002);
        m.set_installed_queries(2);
        m.inc_results_reported("7");
        let text = m.render_prometheus();

        assert!(text.contains("ptq_advice_rows_in_total"));
        assert!(text.contains("ptq_advice_rows_dropped_total"));
        assert!(text.contains("ptq_advice_rows_out_total"));
        assert!(text.contains("ptq_advice_time_seconds"));
        assert!(text.contains("ptq_installed_queries"));
        assert!(text.contains("ptq_results_reported_total"));
    }
}
