//! Prometheus metric families for both controllers.
//!
//! Metric names are stable; dashboards depend on them. Per-VNI label values
//! are deliberately absent — VNIs show up in log lines and aggregates only,
//! never as label cardinality.

use std::collections::HashMap;
use std::sync::LazyLock;

use anyhow::Result;
use prometheus::{
    CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
};

pub const METRICS_NAMESPACE: &str = "kos";

/// Registry backing the `/metrics` endpoint of each binary.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub const OP_CREATE: &str = "create";
pub const OP_DELETE: &str = "delete";
pub const OP_LIST: &str = "list";

pub fn fmt_err_bool(err: bool) -> &'static str {
    if err {
        "err"
    } else {
        "ok"
    }
}

const LATENCY_BUCKETS: &[f64] = &[
    -1.0, 0.0, 0.125, 0.25, 0.5, 1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0, 16.0, 24.0, 32.0, 64.0,
];
const ROUND_TRIP_BUCKETS: &[f64] = &[
    -0.125, 0.0, 0.125, 0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0,
];
const IFC_LATENCY_BUCKETS: &[f64] = &[
    -0.125, 0.0, 0.125, 0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0,
];

fn ipam_opts(name: &str, help: &str) -> HistogramOpts {
    HistogramOpts::new(name, help)
        .namespace(METRICS_NAMESPACE)
        .subsystem("ipam")
}

fn agent_opts(name: &str, help: &str, node: &str) -> HistogramOpts {
    HistogramOpts::new(name, help)
        .namespace(METRICS_NAMESPACE)
        .subsystem("agent")
        .const_labels(HashMap::from([("node".to_owned(), node.to_owned())]))
}

/// Metric families of the IPAM controller.
#[derive(Clone)]
pub struct IpamMetrics {
    /// Per address-pick attempt: 0 without contention, 1 when no address
    /// was available.
    pub address_contention: Histogram,
    pub last_client_write_to_lock: HistogramVec,
    /// Round trip to create/delete an IPLock.
    pub lock_op: HistogramVec,
    pub last_client_write_to_address: HistogramVec,
    /// Round trip to update attachment status.
    pub attachment_update: HistogramVec,
    /// Kind of anticipation use: 0 none, 1 with a usable lock as clue,
    /// 2 on the anticipated address alone.
    pub anticipation_used: Histogram,
    /// Whether the point lookup by the status IP found a usable lock.
    pub status_used: Histogram,
    pub address_delay_due_to_downtime: HistogramVec,
    pub worker_count: IntCounter,
}

impl IpamMetrics {
    pub fn new(registry: &Registry, workers: usize) -> Result<Self> {
        let address_contention = Histogram::with_opts(
            ipam_opts(
                "address_contention",
                "For each attempt to pick an address: 0 if no contention, 1 if no address available",
            )
            .buckets(vec![0.0]),
        )?;
        let last_client_write_to_lock = HistogramVec::new(
            ipam_opts(
                "last_client_write_to_lock_latency_seconds",
                "Seconds from the last relevant object creation to creation of the NetworkAttachment's IPLock",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["last_client_wr", "contention"],
        )?;
        let lock_op = HistogramVec::new(
            ipam_opts(
                "ip_lock_latency_seconds",
                "Round trip latency to create/delete IPLock object, in seconds",
            )
            .buckets(ROUND_TRIP_BUCKETS.to_vec()),
            &["op", "err"],
        )?;
        let last_client_write_to_address = HistogramVec::new(
            ipam_opts(
                "last_client_write_to_address_latency_seconds",
                "Seconds from the last relevant object creation to update of the NetworkAttachment's status",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["last_client_wr", "contention"],
        )?;
        let attachment_update = HistogramVec::new(
            ipam_opts(
                "attachment_update_latency_seconds",
                "Round trip latency to set attachment address, in seconds",
            )
            .buckets(ROUND_TRIP_BUCKETS.to_vec()),
            &["statusErr", "err"],
        )?;
        let anticipation_used = Histogram::with_opts(
            ipam_opts("anticipation_used", "Kind of anticipation use").buckets(vec![0.0, 1.0, 2.0]),
        )?;
        let status_used = Histogram::with_opts(
            ipam_opts("status_used", "Was the IP address in Status used?").buckets(vec![0.0, 1.0]),
        )?;
        let address_delay_due_to_downtime = HistogramVec::new(
            ipam_opts(
                "address_delay_due_to_downtime_seconds",
                "Seconds an IP address assignment is delayed by because a relevant controller is down",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["last_client_wr", "last_controller_start"],
        )?;
        let worker_count = IntCounter::with_opts(
            Opts::new("worker_count", "Number of queue worker tasks")
                .namespace(METRICS_NAMESPACE)
                .subsystem("ipam"),
        )?;

        registry.register(Box::new(address_contention.clone()))?;
        registry.register(Box::new(last_client_write_to_lock.clone()))?;
        registry.register(Box::new(lock_op.clone()))?;
        registry.register(Box::new(last_client_write_to_address.clone()))?;
        registry.register(Box::new(attachment_update.clone()))?;
        registry.register(Box::new(anticipation_used.clone()))?;
        registry.register(Box::new(status_used.clone()))?;
        registry.register(Box::new(address_delay_due_to_downtime.clone()))?;
        registry.register(Box::new(worker_count.clone()))?;
        worker_count.inc_by(workers as u64);

        // Pre-touch the happy-path series so dashboards see them from the
        // start.
        let ok = fmt_err_bool(false);
        lock_op.with_label_values(&[OP_CREATE, ok]);
        lock_op.with_label_values(&[OP_DELETE, ok]);
        attachment_update.with_label_values(&[ok, "ok"]);

        Ok(Self {
            address_contention,
            last_client_write_to_lock,
            lock_op,
            last_client_write_to_address,
            attachment_update,
            anticipation_used,
            status_used,
            address_delay_due_to_downtime,
            worker_count,
        })
    }
}

/// Metric families of the connection agent. All carry a per-node const
/// label.
#[derive(Clone)]
pub struct AgentMetrics {
    pub last_client_write_to_local_ifc: HistogramVec,
    pub local_ifc_delay_due_to_downtime: HistogramVec,
    pub last_client_write_to_remote_ifc: HistogramVec,
    pub remote_ifc_delay_due_to_remote_ca_downtime: HistogramVec,
    pub local_impl_to_remote_ifc: HistogramVec,
    pub fabric_latency: HistogramVec,
    pub last_client_write_to_status: HistogramVec,
    pub attachment_status: HistogramVec,
    pub local_attachments: Gauge,
    pub remote_attachments: Gauge,
    pub attachment_exec_duration: HistogramVec,
    /// Sum over all relevant virtual networks of the delays of their
    /// recorded relevance times.
    pub vn_relevance_aggregate_delay: Gauge,
    pub fabric_count: CounterVec,
    pub worker_count: IntCounter,
}

impl AgentMetrics {
    pub fn new(registry: &Registry, node: &str, fabric: &str, workers: usize) -> Result<Self> {
        let last_client_write_to_local_ifc = HistogramVec::new(
            agent_opts(
                "last_client_write_to_local_ifc_latency_seconds",
                "Seconds from the last relevant object creation to creation of the attachment's local network interface",
                node,
            )
            .buckets(IFC_LATENCY_BUCKETS.to_vec()),
            &["last_client_wr"],
        )?;
        let local_ifc_delay_due_to_downtime = HistogramVec::new(
            agent_opts(
                "local_ifc_delay_due_to_downtime_seconds",
                "Seconds an attachment's local interface creation is delayed by because the connection agent is down",
                node,
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["last_client_wr"],
        )?;
        let last_client_write_to_remote_ifc = HistogramVec::new(
            agent_opts(
                "last_client_write_to_remote_ifc_latency_seconds",
                "Seconds from the last relevant object creation to creation of the attachment's remote network interface",
                node,
            )
            .buckets(IFC_LATENCY_BUCKETS.to_vec()),
            &["last_client_wr"],
        )?;
        let remote_ifc_delay_due_to_remote_ca_downtime = HistogramVec::new(
            agent_opts(
                "remote_ifc_delay_due_to_remote_ca_downtime_seconds",
                "Seconds an attachment's remote interface creation is delayed by because the remote connection agent is down",
                node,
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["last_client_wr"],
        )?;
        let local_impl_to_remote_ifc = HistogramVec::new(
            agent_opts(
                "attachment_impl_to_remote_ifc_latency_seconds",
                "Seconds from attachment local implementation to finished creating remote interface",
                node,
            )
            .buckets(IFC_LATENCY_BUCKETS.to_vec()),
            &["last_client_wr"],
        )?;
        let fabric_latency = HistogramVec::new(
            agent_opts(
                "fabric_latency_seconds",
                "Network fabric operation time in seconds",
                node,
            )
            .buckets(vec![-0.125, 0.0, 0.125, 0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0]),
            &["op", "err"],
        )?;
        let last_client_write_to_status = HistogramVec::new(
            agent_opts(
                "last_client_write_to_status_update_latency_seconds",
                "Seconds from the last relevant object creation to attachment's status update",
                node,
            )
            .buckets(IFC_LATENCY_BUCKETS.to_vec()),
            &["last_client_wr"],
        )?;
        let attachment_status = HistogramVec::new(
            agent_opts(
                "attachment_status_latency_seconds",
                "Round trip latency to update attachment status, in seconds",
                node,
            )
            .buckets(IFC_LATENCY_BUCKETS.to_vec()),
            &["statusErr", "err"],
        )?;
        let gauge_opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(METRICS_NAMESPACE)
                .subsystem("agent")
                .const_labels(HashMap::from([("node".to_owned(), node.to_owned())]))
        };
        let local_attachments = Gauge::with_opts(gauge_opts(
            "local_attachments",
            "Number of local attachments in network fabric",
        ))?;
        let remote_attachments = Gauge::with_opts(gauge_opts(
            "remote_attachments",
            "Number of remote attachments in network fabric",
        ))?;
        let attachment_exec_duration = HistogramVec::new(
            agent_opts(
                "attachment_exec_duration_secs",
                "Seconds to run attachment commands, by what and exit status",
                node,
            )
            .buckets(IFC_LATENCY_BUCKETS.to_vec()),
            &["what", "exitStatus"],
        )?;
        let vn_relevance_aggregate_delay = Gauge::with_opts(gauge_opts(
            "vn_relevance_aggregate_delay_seconds",
            "Sum over all relevant virtual networks of the delays of their recorded relevance times",
        ))?;
        let fabric_count = CounterVec::new(
            gauge_opts("fabric_count", "Indicator of chosen fabric implementation"),
            &["fabric"],
        )?;
        let worker_count = IntCounter::with_opts(gauge_opts(
            "worker_count",
            "Number of queue worker tasks",
        ))?;

        registry.register(Box::new(last_client_write_to_local_ifc.clone()))?;
        registry.register(Box::new(local_ifc_delay_due_to_downtime.clone()))?;
        registry.register(Box::new(last_client_write_to_remote_ifc.clone()))?;
        registry.register(Box::new(remote_ifc_delay_due_to_remote_ca_downtime.clone()))?;
        registry.register(Box::new(local_impl_to_remote_ifc.clone()))?;
        registry.register(Box::new(fabric_latency.clone()))?;
        registry.register(Box::new(last_client_write_to_status.clone()))?;
        registry.register(Box::new(attachment_status.clone()))?;
        registry.register(Box::new(local_attachments.clone()))?;
        registry.register(Box::new(remote_attachments.clone()))?;
        registry.register(Box::new(attachment_exec_duration.clone()))?;
        registry.register(Box::new(vn_relevance_aggregate_delay.clone()))?;
        registry.register(Box::new(fabric_count.clone()))?;
        registry.register(Box::new(worker_count.clone()))?;

        fabric_count.with_label_values(&[fabric]).inc();
        worker_count.inc_by(workers as u64);

        Ok(Self {
            last_client_write_to_local_ifc,
            local_ifc_delay_due_to_downtime,
            last_client_write_to_remote_ifc,
            remote_ifc_delay_due_to_remote_ca_downtime,
            local_impl_to_remote_ifc,
            fabric_latency,
            last_client_write_to_status,
            attachment_status,
            local_attachments,
            remote_attachments,
            attachment_exec_duration,
            vn_relevance_aggregate_delay,
            fabric_count,
            worker_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_into_fresh_registries() {
        let r = Registry::new();
        IpamMetrics::new(&r, 2).unwrap();
        let r = Registry::new();
        let m = AgentMetrics::new(&r, "n1", "logger", 2).unwrap();
        m.local_attachments.inc();
        assert_eq!(m.local_attachments.get(), 1.0);
    }
}
