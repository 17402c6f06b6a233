//! Scriptable upstream doubles shared by the module tests and the
//! integration tests.

use std::{
	collections::BTreeSet,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
};

use futures::stream::BoxStream;
use num_bigint::BigUint;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::{
	cache::CacheSink,
	chain::Chain,
	constants::BROADCAST_BUFFER,
	errors::MultistreamError,
	head::{BlockHash, BlockRef, Head, StandardHead},
	upstream::{
		availability::UpstreamAvailability,
		call_methods::CallMethods,
		event::{ChangeKind, UpstreamChangeEvent},
		rpc::{IngressReader, JsonRpcRequest, JsonRpcResponse},
		Capability, FinalizationData, Labels, LowerBoundData, Upstream, UpstreamId,
		UpstreamOptions, UpstreamRole,
	},
};

/// A deterministic block: the hash encodes height and weight so test
/// failures print something readable.
pub fn block_ref(height: u64, weight: u64) -> BlockRef {
	let mut hash = [0u8; 32];
	hash[..8].copy_from_slice(&height.to_be_bytes());
	hash[24..].copy_from_slice(&weight.to_be_bytes());
	BlockRef::new(BlockHash(hash), height, BigUint::from(weight))
}

pub struct TestUpstreamBuilder {
	id: UpstreamId,
	chain: Chain,
	role: UpstreamRole,
	labels: Vec<(String, String)>,
	capabilities: BTreeSet<Capability>,
	methods: BTreeSet<String>,
	lower_bounds: Vec<LowerBoundData>,
	finalizations: Vec<FinalizationData>,
	lag: Option<u64>,
	cache_aware: bool,
}

impl TestUpstreamBuilder {
	pub fn chain(mut self, chain: Chain) -> Self {
		self.chain = chain;
		self
	}

	pub fn role(mut self, role: UpstreamRole) -> Self {
		self.role = role;
		self
	}

	pub fn label(mut self, name: &str, value: &str) -> Self {
		self.labels.push((name.to_string(), value.to_string()));
		self
	}

	pub fn capability(mut self, capability: Capability) -> Self {
		self.capabilities.insert(capability);
		self
	}

	pub fn method(mut self, method: &str) -> Self {
		self.methods.insert(method.to_string());
		self
	}

	pub fn lower_bound(mut self, bound: LowerBoundData) -> Self {
		self.lower_bounds.push(bound);
		self
	}

	pub fn finalization(mut self, data: FinalizationData) -> Self {
		self.finalizations.push(data);
		self
	}

	pub fn lag(mut self, lag: u64) -> Self {
		self.lag = Some(lag);
		self
	}

	pub fn cache_aware(mut self) -> Self {
		self.cache_aware = true;
		self
	}

	pub fn build(self) -> Arc<TestUpstream> {
		let (status, _) = watch::channel(UpstreamAvailability::Ok);
		let (mut events_tx, events_rx) = async_broadcast::broadcast(BROADCAST_BUFFER);
		events_tx.set_overflow(true);
		Arc::new(TestUpstream {
			id: self.id,
			chain: self.chain,
			role: self.role,
			labels: self.labels.into_iter().collect(),
			capabilities: self.capabilities,
			methods: self.methods,
			lower_bounds: self.lower_bounds,
			finalizations: self.finalizations,
			head: Arc::new(StandardHead::new()),
			status,
			lag: Mutex::new(self.lag),
			running: AtomicBool::new(true),
			events_tx,
			_events_keepalive: events_rx.deactivate(),
			cache: Mutex::new(None),
			cache_aware: self.cache_aware,
		})
	}
}

pub struct TestUpstream {
	id: UpstreamId,
	chain: Chain,
	role: UpstreamRole,
	labels: Labels,
	capabilities: BTreeSet<Capability>,
	methods: BTreeSet<String>,
	lower_bounds: Vec<LowerBoundData>,
	finalizations: Vec<FinalizationData>,
	head: Arc<StandardHead>,
	status: watch::Sender<UpstreamAvailability>,
	lag: Mutex<Option<u64>>,
	running: AtomicBool,
	events_tx: async_broadcast::Sender<UpstreamChangeEvent>,
	_events_keepalive: async_broadcast::InactiveReceiver<UpstreamChangeEvent>,
	cache: Mutex<Option<Arc<dyn CacheSink>>>,
	cache_aware: bool,
}

impl TestUpstream {
	pub fn builder(id: &str) -> TestUpstreamBuilder {
		TestUpstreamBuilder {
			id: UpstreamId::from(id),
			chain: Chain::Ethereum,
			role: UpstreamRole::Primary,
			labels: Vec::new(),
			capabilities: [Capability::Rpc].into_iter().collect(),
			methods: BTreeSet::new(),
			lower_bounds: Vec::new(),
			finalizations: Vec::new(),
			lag: None,
			cache_aware: false,
		}
	}

	/// Feed a block observation into this upstream's head.
	pub fn push_block(&self, block: BlockRef) {
		self.head.on_next(block);
	}

	pub fn set_status(&self, status: UpstreamAvailability) {
		self.status.send_replace(status);
	}

	/// Emit a change event about this upstream on its own event stream, the
	/// way a connection driver would.
	pub fn emit_event(self: &Arc<Self>, kind: ChangeKind) {
		let event =
			UpstreamChangeEvent::new(self.chain, self.clone() as Arc<dyn Upstream>, kind);
		match self.events_tx.try_broadcast(event) {
			Ok(_) | Err(async_broadcast::TrySendError::Inactive(_)) => {},
			Err(e) => panic!("test upstream event channel broken: {e}"),
		}
	}

	pub fn installed_cache(&self) -> Option<Arc<dyn CacheSink>> {
		self.cache.lock().unwrap().clone()
	}
}

impl Upstream for TestUpstream {
	fn id(&self) -> UpstreamId {
		self.id.clone()
	}

	fn chain(&self) -> Chain {
		self.chain
	}

	fn role(&self) -> UpstreamRole {
		self.role
	}

	fn labels(&self) -> Labels {
		self.labels.clone()
	}

	fn capabilities(&self) -> BTreeSet<Capability> {
		self.capabilities.clone()
	}

	fn options(&self) -> Result<UpstreamOptions, MultistreamError> {
		Ok(UpstreamOptions::default())
	}

	fn node_id(&self) -> Result<u8, MultistreamError> {
		Ok(1)
	}

	fn client_version(&self) -> Option<String> {
		Some("test/0.0.0".to_string())
	}

	fn status(&self) -> UpstreamAvailability {
		*self.status.borrow()
	}

	fn observe_status(&self) -> BoxStream<'static, UpstreamAvailability> {
		// Replays the current status, then changes.
		Box::pin(WatchStream::new(self.status.subscribe()))
	}

	fn observe_events(&self) -> BoxStream<'static, UpstreamChangeEvent> {
		Box::pin(self.events_tx.new_receiver())
	}

	fn head(&self) -> Arc<dyn Head> {
		self.head.clone()
	}

	fn ingress_reader(&self) -> Result<Arc<dyn IngressReader>, MultistreamError> {
		Ok(Arc::new(EchoReader { id: self.id.clone() }))
	}

	fn call_methods(&self) -> Arc<CallMethods> {
		Arc::new(CallMethods::ready(self.methods.clone()))
	}

	fn lag(&self) -> Option<u64> {
		*self.lag.lock().unwrap()
	}

	fn set_lag(&self, lag: u64) {
		*self.lag.lock().unwrap() = Some(lag);
	}

	fn lower_bounds(&self) -> Vec<LowerBoundData> {
		self.lower_bounds.clone()
	}

	fn finalizations(&self) -> Vec<FinalizationData> {
		self.finalizations.clone()
	}

	fn is_cache_aware(&self) -> bool {
		self.cache_aware
	}

	fn set_cache(&self, cache: Arc<dyn CacheSink>) {
		*self.cache.lock().unwrap() = Some(cache);
	}

	fn start(&self) {
		self.running.store(true, Ordering::SeqCst);
	}

	fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
	}

	fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}
}

/// Answers every call with its own upstream id, so routing tests can see
/// which member served a request.
struct EchoReader {
	id: UpstreamId,
}

#[async_trait::async_trait]
impl IngressReader for EchoReader {
	async fn read(&self, request: JsonRpcRequest) -> anyhow::Result<JsonRpcResponse> {
		Ok(JsonRpcResponse::result(serde_json::json!({
			"served_by": self.id.as_str(),
			"method": request.method,
		})))
	}
}
