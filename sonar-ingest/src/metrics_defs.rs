//! Metrics definitions for the sonar ingestion service.

use shared::metrics_defs::{MetricDef, MetricType};

pub const SCANS_STORED: MetricDef = MetricDef {
    name: "sonar.scans.stored",
    metric_type: MetricType::Counter,
    description: "Number of scan payloads upserted into the scan store",
};

pub const FRAGMENT_DROPPED: MetricDef = MetricDef {
    name: "sonar.scans.fragment_dropped",
    metric_type: MetricType::Counter,
    description: "Scan fragments left out of a stored row because they did not decode. Tagged with fragment.",
};

pub const ROWS_SKIPPED: MetricDef = MetricDef {
    name: "sonar.read.rows_skipped",
    metric_type: MetricType::Counter,
    description: "Stored rows skipped during aggregation or projection because a fragment did not decode",
};

pub const TICKETS_CREATED: MetricDef = MetricDef {
    name: "sonar.tickets.created",
    metric_type: MetricType::Counter,
    description: "Tickets created by reconciliation. Tagged with category.",
};

pub const TICKET_FAILURES: MetricDef = MetricDef {
    name: "sonar.tickets.failures",
    metric_type: MetricType::Counter,
    description: "Failed ticket service calls during reconciliation. Tagged with operation.",
};

pub const RECONCILE_DURATION: MetricDef = MetricDef {
    name: "sonar.reconcile.duration",
    metric_type: MetricType::Histogram,
    description: "Time to reconcile one application and category in seconds",
};

pub const TELEMETRY_DELIVERED: MetricDef = MetricDef {
    name: "sonar.telemetry.delivered",
    metric_type: MetricType::Counter,
    description: "Scan metric samples accepted by the collector",
};

pub const TELEMETRY_DROPPED: MetricDef = MetricDef {
    name: "sonar.telemetry.dropped",
    metric_type: MetricType::Counter,
    description: "Scan metric samples abandoned after exhausting delivery attempts",
};

pub const TASKS_REJECTED: MetricDef = MetricDef {
    name: "sonar.tasks.rejected",
    metric_type: MetricType::Counter,
    description: "Background jobs rejected because the task queue was full or closed",
};

pub const TASKS_INFLIGHT: MetricDef = MetricDef {
    name: "sonar.tasks.inflight",
    metric_type: MetricType::Gauge,
    description: "Background jobs queued or running",
};

pub const ALL_METRICS: &[MetricDef] = &[
    SCANS_STORED,
    FRAGMENT_DROPPED,
    ROWS_SKIPPED,
    TICKETS_CREATED,
    TICKET_FAILURES,
    RECONCILE_DURATION,
    TELEMETRY_DELIVERED,
    TELEMETRY_DROPPED,
    TASKS_REJECTED,
    TASKS_INFLIGHT,
];
