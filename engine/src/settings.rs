use std::time::Duration;

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use utilities::SecretUrl;

use crate::{
	chain::Chain,
	constants::{CONFIG_ROOT, DEFAULT_CONFIG_ROOT, DEFAULT_LAG_THRESHOLD, HEAD_POLL_INTERVAL},
	upstream::{
		native::NativeUpstreamConfig, Capability, Labels, UpstreamId, UpstreamOptions,
		UpstreamRole,
	},
};

#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheck {
	pub hostname: String,
	pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Prometheus {
	pub hostname: String,
	pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamSettings {
	pub id: String,
	pub endpoint: SecretUrl,
	#[serde(default)]
	pub role: UpstreamRole,
	#[serde(default)]
	pub labels: Labels,
	#[serde(default)]
	pub methods: Vec<String>,
	#[serde(default)]
	pub capabilities: Vec<String>,
	#[serde(default)]
	pub node_id: u8,
	pub timeout_millis: Option<u64>,
	pub retries: Option<u32>,
	pub priority: Option<i32>,
	pub poll_interval_millis: Option<u64>,
	pub lag_threshold: Option<u64>,
}

impl UpstreamSettings {
	pub fn into_native_config(self, chain: Chain) -> anyhow::Result<NativeUpstreamConfig> {
		let defaults = UpstreamOptions::default();
		let mut capabilities = std::collections::BTreeSet::new();
		// Every configured endpoint serves calls; extra capabilities come
		// from the settings file.
		capabilities.insert(Capability::Rpc);
		for capability in &self.capabilities {
			capabilities.insert(capability.parse()?);
		}

		Ok(NativeUpstreamConfig {
			id: UpstreamId::from(self.id),
			chain,
			role: self.role,
			labels: self.labels,
			capabilities,
			methods: self.methods.into_iter().collect(),
			endpoint: self.endpoint,
			options: UpstreamOptions {
				timeout: self
					.timeout_millis
					.map(Duration::from_millis)
					.unwrap_or(defaults.timeout),
				retries: self.retries.unwrap_or(defaults.retries),
				priority: self.priority.unwrap_or(defaults.priority),
			},
			node_id: self.node_id,
			poll_interval: self
				.poll_interval_millis
				.map(Duration::from_millis)
				.unwrap_or(HEAD_POLL_INTERVAL),
			lag_threshold: self.lag_threshold.unwrap_or(DEFAULT_LAG_THRESHOLD),
		})
	}
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainSettings {
	pub chain: String,
	pub upstreams: Vec<UpstreamSettings>,
}

impl ChainSettings {
	pub fn chain(&self) -> anyhow::Result<Chain> {
		self.chain.parse()
	}
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
	#[serde(default)]
	pub chains: Vec<ChainSettings>,
	pub health_check: Option<HealthCheck>,
	pub prometheus: Option<Prometheus>,
}

#[derive(Parser, Debug, Clone)]
pub struct CommandLineOptions {
	#[clap(
		short = 'c',
		long = "config-root",
		env = CONFIG_ROOT,
		default_value = DEFAULT_CONFIG_ROOT,
		help = "Directory containing chainmux.toml"
	)]
	pub config_root: String,
}

impl Default for CommandLineOptions {
	fn default() -> Self {
		Self { config_root: DEFAULT_CONFIG_ROOT.to_string() }
	}
}

impl Settings {
	/// Settings are merged from the TOML file under the config root and
	/// `CHAINMUX__`-prefixed environment variables, the latter winning.
	pub fn new(opts: &CommandLineOptions) -> Result<Self, ConfigError> {
		let file = format!("{}/chainmux.toml", opts.config_root);
		Config::builder()
			.add_source(File::with_name(&file).required(false))
			.add_source(Environment::with_prefix("CHAINMUX").separator("__"))
			.build()?
			.try_deserialize()
	}

	#[cfg(test)]
	pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
		Config::builder()
			.add_source(File::from_str(toml, config::FileFormat::Toml))
			.build()?
			.try_deserialize()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const EXAMPLE: &str = r#"
		[health_check]
		hostname = "127.0.0.1"
		port = 5555

		[prometheus]
		hostname = "127.0.0.1"
		port = 5566

		[[chains]]
		chain = "ETH"

		[[chains.upstreams]]
		id = "local"
		endpoint = "http://localhost:8545"
		methods = ["eth_call", "eth_blockNumber"]

		[[chains.upstreams]]
		id = "infura"
		endpoint = "https://mainnet.infura.io/v3/d52c362116b640b98a166d08d3170a42"
		role = "fallback"
		lag_threshold = 10
		[chains.upstreams.labels]
		provider = "infura"
	"#;

	#[test]
	fn parses_a_full_settings_file() {
		let settings = Settings::from_toml(EXAMPLE).unwrap();

		assert_eq!(settings.health_check.unwrap().port, 5555);
		assert_eq!(settings.prometheus.unwrap().port, 5566);

		let chain = &settings.chains[0];
		assert_eq!(chain.chain().unwrap(), Chain::Ethereum);
		assert_eq!(chain.upstreams.len(), 2);
		assert_eq!(chain.upstreams[0].role, UpstreamRole::Primary);
		assert_eq!(chain.upstreams[1].role, UpstreamRole::Fallback);
		assert_eq!(chain.upstreams[1].labels.get("provider"), Some("infura"));
	}

	#[test]
	fn upstream_settings_map_onto_a_native_config() {
		let settings = Settings::from_toml(EXAMPLE).unwrap();
		let config = settings.chains[0].upstreams[1]
			.clone()
			.into_native_config(Chain::Ethereum)
			.unwrap();

		assert_eq!(config.id.as_str(), "infura");
		assert_eq!(config.role, UpstreamRole::Fallback);
		assert_eq!(config.lag_threshold, 10);
		assert!(config.capabilities.contains(&Capability::Rpc));
		// The api key must not leak through Display.
		assert!(!format!("{}", config.endpoint).contains("d52c362116b640b98a166d08d3170a42"));
	}

	#[test]
	fn unknown_capability_is_rejected() {
		let upstream = UpstreamSettings {
			id: "u".to_string(),
			endpoint: "http://localhost:8545".into(),
			role: UpstreamRole::Primary,
			labels: Labels::default(),
			methods: Vec::new(),
			capabilities: vec!["teleport".to_string()],
			node_id: 0,
			timeout_millis: None,
			retries: None,
			priority: None,
			poll_interval_millis: None,
			lag_threshold: None,
		};
		assert!(upstream.into_native_config(Chain::Ethereum).is_err());
	}
}
