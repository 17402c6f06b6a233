//! Prometheus gauges describing the upstream fleet, served over HTTP for
//! scraping. Label sets are removed when an upstream leaves so that no gauge
//! keeps pointing at a dead upstream.

use std::{net::IpAddr, sync::Arc};

use lazy_static::lazy_static;
use prometheus::{IntGaugeVec, Opts, Registry};
use utilities::{task::spawn_scoped, ScopedJoinHandle};
use warp::Filter;

use crate::{
	chain::Chain,
	settings,
	upstream::{availability::UpstreamAvailability, Upstream, UpstreamId},
};

lazy_static! {
	static ref REGISTRY: Registry = Registry::new();
	pub static ref UPSTREAM_LAG: IntGaugeVec = IntGaugeVec::new(
		Opts::new("upstreams_lag", "Blocks behind the best member height, per upstream"),
		&["chain", "upstream"]
	)
	.expect("metric successfully created");
	pub static ref UPSTREAM_STATUS: IntGaugeVec = IntGaugeVec::new(
		Opts::new(
			"upstreams_availability_status",
			"Availability of an upstream (0=OK 1=LAGGING 2=SYNCING 3=IMMATURE 4=UNAVAILABLE)"
		),
		&["chain", "upstream"]
	)
	.expect("metric successfully created");
	pub static ref UPSTREAMS_AT_STATUS: IntGaugeVec = IntGaugeVec::new(
		Opts::new("upstreams_availability", "Count of upstreams at a given availability"),
		&["chain", "status"]
	)
	.expect("metric successfully created");
	pub static ref UPSTREAMS_CONNECTED: IntGaugeVec = IntGaugeVec::new(
		Opts::new("upstreams_connected", "Number of upstreams adopted by the multistream"),
		&["chain"]
	)
	.expect("metric successfully created");
}

pub fn register_metrics() {
	static REGISTER: std::sync::Once = std::sync::Once::new();
	REGISTER.call_once(|| {
		REGISTRY
			.register(Box::new(UPSTREAM_LAG.clone()))
			.expect("metric successfully registered");
		REGISTRY
			.register(Box::new(UPSTREAM_STATUS.clone()))
			.expect("metric successfully registered");
		REGISTRY
			.register(Box::new(UPSTREAMS_AT_STATUS.clone()))
			.expect("metric successfully registered");
		REGISTRY
			.register(Box::new(UPSTREAMS_CONNECTED.clone()))
			.expect("metric successfully registered");
	});
}

pub fn set_upstream_status(chain: Chain, id: &UpstreamId, status: UpstreamAvailability) {
	UPSTREAM_STATUS
		.with_label_values(&[chain.code(), id.as_str()])
		.set(status.metric_value());
}

pub fn set_upstream_lag(chain: Chain, id: &UpstreamId, lag: u64) {
	UPSTREAM_LAG
		.with_label_values(&[chain.code(), id.as_str()])
		.set(lag.min(i64::MAX as u64) as i64);
}

pub fn set_connected(chain: Chain, count: usize) {
	UPSTREAMS_CONNECTED.with_label_values(&[chain.code()]).set(count as i64);
}

pub fn set_status_counts(chain: Chain, upstreams: &[Arc<dyn Upstream>]) {
	for status in UpstreamAvailability::ALL {
		let count =
			upstreams.iter().filter(|upstream| upstream.status() == status).count();
		UPSTREAMS_AT_STATUS
			.with_label_values(&[chain.code(), &status.to_string()])
			.set(count as i64);
	}
}

/// Called on removal so a dead upstream does not linger behind stale gauges.
pub fn remove_upstream(chain: Chain, id: &UpstreamId) {
	let labels = [chain.code(), id.as_str()];
	let _ = UPSTREAM_LAG.remove_label_values(&labels);
	let _ = UPSTREAM_STATUS.remove_label_values(&labels);
}

/// Serves the registry in the prometheus text format.
pub fn spawn_exporter(
	prometheus_settings: &settings::Prometheus,
) -> anyhow::Result<ScopedJoinHandle<()>> {
	const PATH: &str = "metrics";

	tracing::info!(
		"Serving metrics at http://{}:{}/{PATH}",
		prometheus_settings.hostname,
		prometheus_settings.port,
	);

	let future = warp::serve(
		warp::any().and(warp::path(PATH)).and(warp::path::end()).map(metrics_handler),
	)
	.bind((prometheus_settings.hostname.parse::<IpAddr>()?, prometheus_settings.port));

	Ok(spawn_scoped(future))
}

fn metrics_handler() -> String {
	use prometheus::Encoder;
	let encoder = prometheus::TextEncoder::new();

	let mut buffer = Vec::new();
	if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
		tracing::error!("Could not encode metrics: {e}");
	}
	String::from_utf8(buffer).unwrap_or_default()
}
