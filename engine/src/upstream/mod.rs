pub mod availability;
pub mod call_methods;
pub mod event;
pub mod grpc;
pub mod native;
pub mod rpc;

use std::{collections::BTreeSet, fmt, str::FromStr, sync::Arc};

use futures::stream::BoxStream;

use crate::{
	cache::CacheSink,
	chain::Chain,
	errors::MultistreamError,
	head::Head,
	selector::Matcher,
};
use availability::UpstreamAvailability;
use call_methods::CallMethods;
use event::UpstreamChangeEvent;
use rpc::IngressReader;

/// Stable identity of an upstream within its chain. Also used as the metrics
/// label and as the membership key inside a multistream.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UpstreamId(Arc<str>);

impl UpstreamId {
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<&str> for UpstreamId {
	fn from(id: &str) -> Self {
		UpstreamId(Arc::from(id))
	}
}

impl From<String> for UpstreamId {
	fn from(id: String) -> Self {
		UpstreamId(Arc::from(id.as_str()))
	}
}

impl fmt::Display for UpstreamId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl fmt::Debug for UpstreamId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "UpstreamId({})", self.0)
	}
}

/// Primary upstreams serve traffic first; fallbacks only when primaries
/// cannot. The ordering sorts primaries first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamRole {
	#[default]
	Primary,
	Fallback,
}

/// Feature flags an upstream advertises.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Capability {
	Rpc,
	Balance,
	WsHead,
}

impl fmt::Display for Capability {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Capability::Rpc => "rpc",
			Capability::Balance => "balance",
			Capability::WsHead => "ws_head",
		})
	}
}

impl FromStr for Capability {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"rpc" => Ok(Capability::Rpc),
			"balance" => Ok(Capability::Balance),
			"ws_head" => Ok(Capability::WsHead),
			unknown => Err(anyhow::anyhow!("unknown capability: {unknown}")),
		}
	}
}

/// Free-form `key=value` pairs attached to an upstream by configuration,
/// matched by label selectors and grouped into quorum label sets.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, serde::Deserialize)]
#[serde(transparent)]
pub struct Labels(std::collections::BTreeMap<String, String>);

impl Labels {
	pub fn get(&self, name: &str) -> Option<&str> {
		self.0.get(name).map(String::as_str)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}
}

impl FromIterator<(String, String)> for Labels {
	fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
		Labels(iter.into_iter().collect())
	}
}

/// Per-upstream tuning knobs from configuration.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct UpstreamOptions {
	pub timeout: std::time::Duration,
	pub retries: u32,
	pub priority: i32,
}

impl Default for UpstreamOptions {
	fn default() -> Self {
		Self { timeout: std::time::Duration::from_secs(5), retries: 3, priority: 0 }
	}
}

/// The oldest block for which a given kind of data is retrievable from an
/// upstream.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum LowerBoundType {
	State,
	Trace,
	Block,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LowerBoundData {
	pub bound_type: LowerBoundType,
	pub height: u64,
}

/// Safe/finalized heights reported by the consensus layer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum FinalizationType {
	Safe,
	Finalized,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FinalizationData {
	pub finalization_type: FinalizationType,
	pub height: u64,
}

/// Capability contract of a single backend endpoint. Implementations:
/// [native::NativeRpcUpstream] (polls a JSON-RPC node),
/// [grpc::GrpcUpstream] (follows a remote peer's head stream), and
/// [crate::multistream::Multistream] itself (recursive composition, with the
/// per-node operations unsupported).
pub trait Upstream: Send + Sync {
	fn id(&self) -> UpstreamId;

	fn chain(&self) -> Chain;

	fn role(&self) -> UpstreamRole;

	fn labels(&self) -> Labels;

	fn capabilities(&self) -> BTreeSet<Capability>;

	/// Fails with [MultistreamError::Unsupported] on aggregated upstreams.
	fn options(&self) -> Result<UpstreamOptions, MultistreamError>;

	/// Fails with [MultistreamError::Unsupported] on aggregated upstreams.
	fn node_id(&self) -> Result<u8, MultistreamError>;

	fn client_version(&self) -> Option<String>;

	fn status(&self) -> UpstreamAvailability;

	fn is_available(&self) -> bool {
		self.status().is_usable()
	}

	/// Replays the current status, then emits changes.
	fn observe_status(&self) -> BoxStream<'static, UpstreamAvailability>;

	/// Change events this upstream emits about itself. Aggregated upstreams
	/// return an empty stream to break the recursive composition.
	fn observe_events(&self) -> BoxStream<'static, UpstreamChangeEvent>;

	fn head(&self) -> Arc<dyn Head>;

	fn current_height(&self) -> Option<u64> {
		self.head().current().map(|block| block.height)
	}

	/// Direct JSON-RPC dispatch to this upstream.
	fn ingress_reader(&self) -> Result<Arc<dyn IngressReader>, MultistreamError>;

	fn call_methods(&self) -> Arc<CallMethods>;

	fn lag(&self) -> Option<u64>;

	/// Drivers must accept external lag assignment (the lag observer pushes
	/// values derived from the whole member set).
	fn set_lag(&self, lag: u64);

	fn lower_bounds(&self) -> Vec<LowerBoundData> {
		Vec::new()
	}

	fn finalizations(&self) -> Vec<FinalizationData> {
		Vec::new()
	}

	/// Cache-aware upstreams receive the shared cache handle when adopted by
	/// a multistream.
	fn is_cache_aware(&self) -> bool {
		false
	}

	fn set_cache(&self, _cache: Arc<dyn CacheSink>) {}

	fn start(&self);

	/// Terminal. A stopped upstream is never restarted.
	fn stop(&self);

	fn is_running(&self) -> bool;
}

impl dyn Upstream {
	/// Availability gated by a matcher: the upstream must be usable and
	/// advertise the labels/capabilities the matcher queries.
	pub fn is_available_matching(&self, matcher: &Matcher) -> bool {
		self.is_available() && matcher.matches(self)
	}
}
