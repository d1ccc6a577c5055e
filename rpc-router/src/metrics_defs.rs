use shared::metrics_defs::{MetricDef, MetricType};

pub const ROUTE_REQUESTS: MetricDef = MetricDef {
    name: "route.requests",
    metric_type: MetricType::Counter,
    description: "JSON-RPC calls routed. Tagged with project, outcome.",
};

pub const ROUTE_SELECTED: MetricDef = MetricDef {
    name: "route.selected",
    metric_type: MetricType::Counter,
    description: "Upstream selections made by the pipeline. Tagged with upstream, method.",
};

pub const ROUTE_EMERGENCY_SELECTION: MetricDef = MetricDef {
    name: "route.emergency_selection",
    metric_type: MetricType::Counter,
    description: "Picks made after the pipeline selected nothing. Tagged with upstream.",
};

pub const ROUTE_STAGE_ERRORS: MetricDef = MetricDef {
    name: "route.stage_errors",
    metric_type: MetricType::Counter,
    description: "Pipeline stages that failed and were skipped. Tagged with stage.",
};

pub const UPSTREAM_REQUEST_DURATION: MetricDef = MetricDef {
    name: "upstream.request.duration",
    metric_type: MetricType::Histogram,
    description: "Outbound JSON-RPC call duration in seconds. Tagged with upstream, status.",
};

pub const UPSTREAM_CIRCUIT_OPENED: MetricDef = MetricDef {
    name: "upstream.circuit.opened",
    metric_type: MetricType::Counter,
    description: "Upstreams marked unhealthy. Tagged with upstream.",
};

pub const UPSTREAM_CIRCUIT_CLOSED: MetricDef = MetricDef {
    name: "upstream.circuit.closed",
    metric_type: MetricType::Counter,
    description: "Upstreams marked healthy again. Tagged with upstream.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const SYNC_STATUS_REFRESH: MetricDef = MetricDef {
    name: "sync_status.refresh",
    metric_type: MetricType::Counter,
    description: "Sync status refresh attempts. Tagged with project, result.",
};

// TODO: all metrics must be added here for now, this can be done dynamically with a macro
// in the future.
pub const ALL_METRICS: &[MetricDef] = &[
    ROUTE_REQUESTS,
    ROUTE_SELECTED,
    ROUTE_EMERGENCY_SELECTION,
    ROUTE_STAGE_ERRORS,
    UPSTREAM_REQUEST_DURATION,
    UPSTREAM_CIRCUIT_OPENED,
    UPSTREAM_CIRCUIT_CLOSED,
    REQUESTS_INFLIGHT,
    SYNC_STATUS_REFRESH,
];
