use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use chainmux_engine::{
	health, metrics,
	multistream::Multistream,
	settings::{CommandLineOptions, Settings},
	upstream::{
		event::{ChangeKind, UpstreamChangeEvent},
		native::NativeRpcUpstream,
		Upstream,
	},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.json()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();

	let opts = CommandLineOptions::parse();
	let settings = Settings::new(&opts).context("Failed to load settings")?;

	metrics::register_metrics();
	let _health_server = settings
		.health_check
		.as_ref()
		.map(health::spawn_health_check)
		.transpose()?;
	let _metrics_server = settings
		.prometheus
		.as_ref()
		.map(metrics::spawn_exporter)
		.transpose()?;

	let mut multistreams = Vec::new();
	for chain_settings in &settings.chains {
		let chain = chain_settings.chain()?;
		let multistream = Multistream::new(chain);

		for upstream_settings in chain_settings.upstreams.clone() {
			let upstream = NativeRpcUpstream::new(upstream_settings.into_native_config(chain)?)?;
			upstream.start();
			multistream
				.process_event(UpstreamChangeEvent::new(
					chain,
					upstream as Arc<dyn Upstream>,
					ChangeKind::Added,
				))
				.await;
		}
		multistreams.push(multistream);
	}

	if multistreams.is_empty() {
		anyhow::bail!("No chains configured. Nothing to serve.");
	}

	tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
	tracing::info!("Shutting down");
	for multistream in &multistreams {
		multistream.stop();
	}
	Ok(())
}
