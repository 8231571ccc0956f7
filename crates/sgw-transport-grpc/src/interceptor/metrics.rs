//! Prometheus RPC metrics.

use super::{CallContext, CallInterceptor, CallKind, CallOutcome};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tonic::Status;

type Labels = Vec<(String, String)>;

fn duration_histogram() -> Histogram {
    // 0.5ms .. ~16s
    Histogram::new(exponential_buckets(0.0005, 2.0, 16))
}

/// RPC metric families and the registry they are exported from.
pub struct GatewayMetrics {
    registry: Registry,
    calls: Family<Labels, Counter>,
    durations: Family<Labels, Histogram, fn() -> Histogram>,
    in_flight: Family<Labels, Gauge>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let calls = Family::<Labels, Counter>::default();
        registry.register("sgw_rpc_calls", "Completed RPCs", calls.clone());

        let durations =
            Family::<Labels, Histogram, fn() -> Histogram>::new_with_constructor(duration_histogram);
        registry.register(
            "sgw_rpc_call_duration_seconds",
            "RPC latency in seconds",
            durations.clone(),
        );

        let in_flight = Family::<Labels, Gauge>::default();
        registry.register("sgw_rpc_calls_in_flight", "RPCs currently executing", in_flight.clone());

        Self {
            registry,
            calls,
            durations,
            in_flight,
        }
    }

    /// Prometheus text exposition of every family.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    /// Completed-call count for one method and code.
    pub fn calls_total(&self, plane: &str, method: &str, kind: CallKind, code: tonic::Code) -> u64 {
        self.calls
            .get_or_create(&outcome_labels(plane, method, kind, code))
            .get()
    }

    pub fn in_flight(&self, plane: &str, method: &str, kind: CallKind) -> i64 {
        self.in_flight
            .get_or_create(&call_labels(plane, method, kind))
            .get()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn call_labels(plane: &str, method: &str, kind: CallKind) -> Labels {
    vec![
        ("plane".to_string(), plane.to_string()),
        ("method".to_string(), method.to_string()),
        ("kind".to_string(), kind.as_str().to_string()),
    ]
}

fn outcome_labels(plane: &str, method: &str, kind: CallKind, code: tonic::Code) -> Labels {
    let mut labels = call_labels(plane, method, kind);
    labels.push(("code".to_string(), format!("{:?}", code)));
    labels
}

/// Records call counts, latency and in-flight calls into [`GatewayMetrics`].
pub struct MetricsInterceptor {
    metrics: Arc<GatewayMetrics>,
    kind: CallKind,
}

impl MetricsInterceptor {
    pub fn new(metrics: Arc<GatewayMetrics>, kind: CallKind) -> Self {
        Self { metrics, kind }
    }
}

impl CallInterceptor for MetricsInterceptor {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn on_request(&self, ctx: &mut CallContext) -> Result<(), Status> {
        self.metrics
            .in_flight
            .get_or_create(&call_labels(ctx.plane.as_str(), &ctx.method, self.kind))
            .inc();
        Ok(())
    }

    fn on_response(&self, ctx: &CallContext, outcome: &CallOutcome) {
        let plane = ctx.plane.as_str();
        self.metrics
            .in_flight
            .get_or_create(&call_labels(plane, &ctx.method, self.kind))
            .dec();
        self.metrics
            .durations
            .get_or_create(&call_labels(plane, &ctx.method, self.kind))
            .observe(ctx.started.elapsed().as_secs_f64());
        self.metrics
            .calls
            .get_or_create(&outcome_labels(plane, &ctx.method, self.kind, outcome.code))
            .inc();
    }
}
