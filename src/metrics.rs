use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub operation: String,
    pub outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PolicyLabels {
    pub policy: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CycleLabels {
    pub state: &'static str,
}

pub struct PluginManagerMetrics {
    pub admission_requests_total: Family<RequestLabels, Counter>,
    pub admission_request_duration_seconds: Histogram,
    pub policies_applied_total: Family<PolicyLabels, Counter>,
    pub certificate_cycles_total: Family<CycleLabels, Counter>,
    pub certificate_cycle_errors_total: Counter,
    pub certificate_rotations_total: Counter,
}

const DURATION_BUCKETS: [f64; 14] = [
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

impl PluginManagerMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let admission_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "plugin_manager_admission_requests",
            "Total number of admission requests handled, by outcome",
            admission_requests_total.clone(),
        );

        let admission_request_duration_seconds = Histogram::new(DURATION_BUCKETS.iter().copied());
        registry.register(
            "plugin_manager_admission_request_duration_seconds",
            "Duration of admission request processing in seconds",
            admission_request_duration_seconds.clone(),
        );

        let policies_applied_total = Family::<PolicyLabels, Counter>::default();
        registry.register(
            "plugin_manager_policies_applied",
            "Total number of plugin policies applied to a resource",
            policies_applied_total.clone(),
        );

        let certificate_cycles_total = Family::<CycleLabels, Counter>::default();
        registry.register(
            "plugin_manager_certificate_cycles",
            "Certificate lifecycle cycles, by resulting state",
            certificate_cycles_total.clone(),
        );

        let certificate_cycle_errors_total = Counter::default();
        registry.register(
            "plugin_manager_certificate_cycle_errors",
            "Certificate lifecycle cycles that failed with an error",
            certificate_cycle_errors_total.clone(),
        );

        let certificate_rotations_total = Counter::default();
        registry.register(
            "plugin_manager_certificate_rotations",
            "Number of times the certificate bundle was regenerated",
            certificate_rotations_total.clone(),
        );

        Self {
            admission_requests_total,
            admission_request_duration_seconds,
            policies_applied_total,
            certificate_cycles_total,
            certificate_cycle_errors_total,
            certificate_rotations_total,
        }
    }
}
