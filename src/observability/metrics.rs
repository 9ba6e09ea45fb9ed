use prometheus::{IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Counters for one replication endpoint (a host session or a client).
///
/// Each endpoint owns its registry so several sessions can live in one
/// process without clobbering each other's series.
pub struct ReplicationMetrics {
	registry: Registry,

	// Host outbound
	pub snapshots_published: IntCounter,
	pub patches_published: IntCounter,
	pub resends_incremental: IntCounter,
	pub resends_snapshot: IntCounter,
	pub deliveries_abandoned: IntCounter,
	pub acks_received: IntCounter,

	// Host inbound
	pub messages_received: IntCounter,
	pub messages_dropped: IntCounter,
	pub rate_limited: IntCounter,

	// Client store
	pub revisions_applied: IntCounter,
	pub patches_queued: IntCounter,
	pub patches_rejected: IntCounter,
	pub stalls: IntCounter,
	pub resync_requests: IntCounter,
	pub pending_depth: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
	let c = IntCounter::with_opts(Opts::new(name, help).namespace("bifrost"))?;
	registry.register(Box::new(c.clone()))?;
	Ok(c)
}

impl ReplicationMetrics {
	pub fn new() -> prometheus::Result<Self> {
		let registry = Registry::new();

		let pending_depth = IntGauge::with_opts(
			Opts::new(
				"client_pending_depth",
				"Patches currently buffered waiting for a missing revision",
			)
			.namespace("bifrost"),
		)?;
		registry.register(Box::new(pending_depth.clone()))?;

		Ok(Self {
			snapshots_published: counter(
				&registry,
				"snapshots_published_total",
				"Full object snapshots published by the host",
			)?,
			patches_published: counter(
				&registry,
				"patches_published_total",
				"Incremental patches published by the host",
			)?,
			resends_incremental: counter(
				&registry,
				"resends_incremental_total",
				"Unacknowledged deliveries resent from the patch log",
			)?,
			resends_snapshot: counter(
				&registry,
				"resends_snapshot_total",
				"Unacknowledged deliveries resent as a full snapshot",
			)?,
			deliveries_abandoned: counter(
				&registry,
				"deliveries_abandoned_total",
				"Deliveries given up after the retry budget ran out",
			)?,
			acks_received: counter(&registry, "acks_received_total", "Acknowledgments received")?,
			messages_received: counter(
				&registry,
				"messages_received_total",
				"Inbound messages parsed by the host router",
			)?,
			messages_dropped: counter(
				&registry,
				"messages_dropped_total",
				"Inbound messages dropped as malformed or invalid",
			)?,
			rate_limited: counter(
				&registry,
				"rate_limited_total",
				"Inbound requests dropped by a rate limiter",
			)?,
			revisions_applied: counter(
				&registry,
				"revisions_applied_total",
				"Revisions applied by a client store",
			)?,
			patches_queued: counter(
				&registry,
				"patches_queued_total",
				"Patches buffered because they arrived ahead of their predecessor",
			)?,
			patches_rejected: counter(
				&registry,
				"patches_rejected_total",
				"Patches refused by a client store",
			)?,
			stalls: counter(
				&registry,
				"stalls_total",
				"Pending queues dropped after stalling or overflowing",
			)?,
			resync_requests: counter(
				&registry,
				"resync_requests_total",
				"Fresh snapshot requests sent by a client",
			)?,
			pending_depth,
			registry,
		})
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				log::error!("Failed to encode metrics: {}", e);
				String::new()
			}
		}
	}
}

/// Build a metrics registry for one endpoint.
pub fn init_metrics() -> anyhow::Result<Arc<ReplicationMetrics>> {
	Ok(Arc::new(ReplicationMetrics::new()?))
}
