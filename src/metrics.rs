//! Gauge materialization for probe results.
//!
//! Every probe invocation gets a brand-new registry holding exactly three
//! gauges (`up`, `success`, `duration_seconds`). Nothing is shared between
//! requests, so concurrent probes can never race on gauge state or leak
//! stale values into each other's responses. The long-lived registry in
//! [`ProcessMetrics`] only carries the exporter's own operational counters.

use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::{debug, error};

use crate::config::ProbeDefinition;
use crate::runner::RunResult;

/// Namespace segment prefixed to every probe gauge.
pub const NAMESPACE: &str = "probe_script";

/// Content type of the text exposition produced by [`render_registry`].
pub const EXPOSITION_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

type LabeledGauge = Family<Vec<(String, String)>, Gauge<f64, AtomicU64>>;

/// Build a fresh, request-scoped registry from a probe result.
///
/// Gauges are scoped `namespace_subsystem_name`. When the probe declares
/// constant labels they are applied to every gauge; otherwise the gauges
/// are plain scalars.
pub fn probe_registry(namespace: &str, probe: &ProbeDefinition, result: &RunResult) -> Registry {
    debug!(subsystem = %probe.subsystem, "initialize probe metrics");

    let mut registry = Registry::with_prefix(namespace);

    let scope = if probe.subsystem.is_empty() {
        &mut registry
    } else {
        registry.sub_registry_with_prefix(&probe.subsystem)
    };

    let success = if result.success() { 1.0 } else { 0.0 };
    let duration = result.duration.as_secs_f64();

    if probe.label_names.is_empty() {
        let up = Gauge::<f64, AtomicU64>::default();
        scope.register("up", "General availability of this probe", up.clone());
        up.set(1.0);

        let gauge_success = Gauge::<f64, AtomicU64>::default();
        scope.register(
            "success",
            "Show if the script was executed successfully",
            gauge_success.clone(),
        );
        gauge_success.set(success);

        let gauge_duration = Gauge::<f64, AtomicU64>::default();
        scope.register(
            "duration_seconds",
            "Shows the execution time of the script",
            gauge_duration.clone(),
        );
        gauge_duration.set(duration);
    } else {
        let labels: Vec<(String, String)> = probe
            .label_names
            .iter()
            .cloned()
            .zip(probe.label_values.iter().cloned())
            .collect();

        let up = LabeledGauge::default();
        scope.register("up", "General availability of this probe", up.clone());
        up.get_or_create(&labels).set(1.0);

        let gauge_success = LabeledGauge::default();
        scope.register(
            "success",
            "Show if the script was executed successfully",
            gauge_success.clone(),
        );
        gauge_success.get_or_create(&labels).set(success);

        let gauge_duration = LabeledGauge::default();
        scope.register(
            "duration_seconds",
            "Shows the execution time of the script",
            gauge_duration.clone(),
        );
        gauge_duration.get_or_create(&labels).set(duration);
    }

    registry
}

/// Encode a registry in the text exposition format.
pub fn render_registry(registry: &Registry) -> String {
    let mut body = String::new();
    if let Err(err) = encode(&mut body, registry) {
        error!(%err, "failed to encode metrics");
    }
    body
}

/// Labels for the exporter's own counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ModuleLabels {
    pub module: String,
}

/// The exporter's own operational metrics, served on `/metrics`.
pub struct ProcessMetrics {
    registry: Registry,
    probe_runs: Family<ModuleLabels, Counter>,
    probe_errors: Family<ModuleLabels, Counter>,
}

impl ProcessMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("probe_script_exporter");

        let probe_runs = Family::<ModuleLabels, Counter>::default();
        registry.register(
            "probe_runs",
            "Probe commands executed",
            probe_runs.clone(),
        );

        let probe_errors = Family::<ModuleLabels, Counter>::default();
        registry.register(
            "probe_errors",
            "Probe commands that finished with a non-zero exit code",
            probe_errors.clone(),
        );

        Self {
            registry,
            probe_runs,
            probe_errors,
        }
    }

    /// Count one probe run, and one error when the command failed.
    pub fn record_run(&self, module: &str, success: bool) {
        let labels = ModuleLabels {
            module: module.to_string(),
        };

        self.probe_runs.get_or_create(&labels).inc();
        if !success {
            self.probe_errors.get_or_create(&labels).inc();
        }
    }

    pub fn render(&self) -> String {
        render_registry(&self.registry)
    }
}

impl Default for ProcessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::EXIT_CODE_UNAVAILABLE;
    use std::collections::HashMap;
    use std::time::Duration;

    fn make_probe(labels: Vec<(&str, &str)>) -> ProbeDefinition {
        ProbeDefinition {
            command: "/bin/true".to_string(),
            subsystem: "ping".to_string(),
            label_names: labels.iter().map(|(k, _)| k.to_string()).collect(),
            label_values: labels.iter().map(|(_, v)| v.to_string()).collect(),
            arguments: HashMap::new(),
            argument_order: Vec::new(),
        }
    }

    fn make_result(exit_code: i32) -> RunResult {
        RunResult {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(1500),
        }
    }

    #[test]
    fn test_probe_registry_success() {
        let probe = make_probe(Vec::new());
        let registry = probe_registry(NAMESPACE, &probe, &make_result(0));
        let output = render_registry(&registry);

        assert!(output.contains("# TYPE probe_script_ping_up gauge"));
        assert!(output.contains("probe_script_ping_up 1.0"));
        assert!(output.contains("probe_script_ping_success 1.0"));
        assert!(output.contains("probe_script_ping_duration_seconds 1.5"));
    }

    #[test]
    fn test_probe_registry_failure_keeps_up() {
        let probe = make_probe(Vec::new());
        let registry = probe_registry(NAMESPACE, &probe, &make_result(2));
        let output = render_registry(&registry);

        // `up` reports "attempted", not "succeeded".
        assert!(output.contains("probe_script_ping_up 1.0"));
        assert!(output.contains("probe_script_ping_success 0.0"));
    }

    #[test]
    fn test_probe_registry_sentinel_is_failure() {
        let probe = make_probe(Vec::new());
        let registry = probe_registry(NAMESPACE, &probe, &make_result(EXIT_CODE_UNAVAILABLE));
        let output = render_registry(&registry);

        assert!(output.contains("probe_script_ping_success 0.0"));
    }

    #[test]
    fn test_probe_registry_with_constant_labels() {
        let probe = make_probe(vec![("target", "gateway"), ("site", "fra1")]);
        let registry = probe_registry(NAMESPACE, &probe, &make_result(0));
        let output = render_registry(&registry);

        assert!(output.contains("target=\"gateway\""));
        assert!(output.contains("site=\"fra1\""));
        assert!(output.contains("probe_script_ping_up{"));
    }

    #[test]
    fn test_probe_registry_empty_subsystem() {
        let mut probe = make_probe(Vec::new());
        probe.subsystem = String::new();

        let registry = probe_registry(NAMESPACE, &probe, &make_result(0));
        let output = render_registry(&registry);

        assert!(output.contains("probe_script_up 1.0"));
    }

    #[test]
    fn test_probe_registries_are_isolated() {
        let probe = make_probe(Vec::new());
        let ok = probe_registry(NAMESPACE, &probe, &make_result(0));
        let failed = probe_registry(NAMESPACE, &probe, &make_result(1));

        assert!(render_registry(&ok).contains("probe_script_ping_success 1.0"));
        assert!(render_registry(&failed).contains("probe_script_ping_success 0.0"));
        // The first registry is unaffected by the second run.
        assert!(render_registry(&ok).contains("probe_script_ping_success 1.0"));
    }

    #[test]
    fn test_process_metrics_counts_runs_and_errors() {
        let metrics = ProcessMetrics::new();
        metrics.record_run("ping_gateway", true);
        metrics.record_run("ping_gateway", false);

        let output = metrics.render();
        assert!(
            output.contains("probe_script_exporter_probe_runs_total{module=\"ping_gateway\"} 2")
        );
        assert!(
            output.contains("probe_script_exporter_probe_errors_total{module=\"ping_gateway\"} 1")
        );
    }
}
