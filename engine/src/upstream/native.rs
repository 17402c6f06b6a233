//! Upstream driver for a plain JSON-RPC node endpoint: polls the node's
//! head on an interval, derives availability from poll outcomes, and serves
//! calls through an HTTP ingress reader.

use std::{
	collections::BTreeSet,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, Weak,
	},
	time::Duration,
};

use futures::stream::BoxStream;
use num_bigint::BigUint;
use num_traits::Num;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use utilities::{make_periodic_tick, task::spawn_scoped, ScopedJoinHandle, SecretUrl};

use crate::{
	chain::Chain,
	constants::{DEFAULT_LAG_THRESHOLD, HEAD_POLL_INTERVAL},
	errors::MultistreamError,
	head::{BlockHash, BlockRef, Head, StandardHead},
	upstream::{
		availability::UpstreamAvailability,
		call_methods::CallMethods,
		event::UpstreamChangeEvent,
		rpc::{HttpIngressReader, IngressReader, JsonRpcRequest},
		Capability, Labels, Upstream, UpstreamId, UpstreamOptions, UpstreamRole,
	},
};

pub struct NativeUpstreamConfig {
	pub id: UpstreamId,
	pub chain: Chain,
	pub role: UpstreamRole,
	pub labels: Labels,
	pub capabilities: BTreeSet<Capability>,
	pub methods: BTreeSet<String>,
	pub endpoint: SecretUrl,
	pub options: UpstreamOptions,
	pub node_id: u8,
	pub poll_interval: Duration,
	pub lag_threshold: u64,
}

impl NativeUpstreamConfig {
	pub fn new(id: &str, chain: Chain, endpoint: SecretUrl) -> Self {
		Self {
			id: UpstreamId::from(id),
			chain,
			role: UpstreamRole::Primary,
			labels: Labels::default(),
			capabilities: [Capability::Rpc].into_iter().collect(),
			methods: BTreeSet::new(),
			endpoint,
			options: UpstreamOptions::default(),
			node_id: 0,
			poll_interval: HEAD_POLL_INTERVAL,
			lag_threshold: DEFAULT_LAG_THRESHOLD,
		}
	}
}

pub struct NativeRpcUpstream {
	config: NativeUpstreamConfig,
	weak_self: Weak<NativeRpcUpstream>,
	reader: Arc<dyn IngressReader>,
	head: Arc<StandardHead>,
	status: watch::Sender<UpstreamAvailability>,
	client_version: Mutex<Option<String>>,
	lag: Mutex<Option<u64>>,
	running: AtomicBool,
	poller: Mutex<Option<ScopedJoinHandle<()>>>,
	events_tx: async_broadcast::Sender<UpstreamChangeEvent>,
	_events_keepalive: async_broadcast::InactiveReceiver<UpstreamChangeEvent>,
}

impl NativeRpcUpstream {
	pub fn new(config: NativeUpstreamConfig) -> anyhow::Result<Arc<Self>> {
		let reader = Arc::new(HttpIngressReader::new(&config.endpoint, config.options.timeout)?);
		Ok(Self::with_reader(config, reader))
	}

	/// The reader is injectable so tests can drive the poll path without a
	/// node.
	pub fn with_reader(config: NativeUpstreamConfig, reader: Arc<dyn IngressReader>) -> Arc<Self> {
		let (status, _) = watch::channel(UpstreamAvailability::Unavailable);
		let (mut events_tx, events_rx) =
			async_broadcast::broadcast(crate::constants::BROADCAST_BUFFER);
		events_tx.set_overflow(true);

		Arc::new_cyclic(|weak| Self {
			config,
			weak_self: weak.clone(),
			reader,
			head: Arc::new(StandardHead::new()),
			status,
			client_version: Mutex::new(None),
			lag: Mutex::new(None),
			running: AtomicBool::new(false),
			poller: Mutex::new(None),
			events_tx,
			_events_keepalive: events_rx.deactivate(),
		})
	}

	fn set_availability(&self, status: UpstreamAvailability) {
		self.status.send_if_modified(|current| {
			if *current == status {
				false
			} else {
				tracing::info!("Upstream {} is now {status}", self.config.id);
				*current = status;
				true
			}
		});
	}

	async fn poll_once(&self) -> anyhow::Result<()> {
		if self.probe_syncing().await? {
			self.set_availability(UpstreamAvailability::Syncing);
			return Ok(())
		}

		let block = self.fetch_head().await?;
		self.head.on_next(block);
		self.refresh_availability_from_lag();

		if self.client_version.lock().expect("version lock is never poisoned").is_none() {
			let version = self.probe_client_version().await?;
			*self.client_version.lock().expect("version lock is never poisoned") = Some(version);
		}
		Ok(())
	}

	async fn probe_client_version(&self) -> anyhow::Result<String> {
		let raw = self
			.reader
			.read(JsonRpcRequest::no_params("web3_clientVersion"))
			.await?
			.into_result()?;
		Ok(serde_json::from_str(raw.get())?)
	}

	async fn probe_syncing(&self) -> anyhow::Result<bool> {
		let raw = self
			.reader
			.read(JsonRpcRequest::no_params("eth_syncing"))
			.await?
			.into_result()?;
		// `false` when synced, a progress object otherwise.
		Ok(serde_json::from_str::<serde_json::Value>(raw.get())? != serde_json::json!(false))
	}

	async fn fetch_head(&self) -> anyhow::Result<BlockRef> {
		let raw = self
			.reader
			.read(JsonRpcRequest::new(
				"eth_getBlockByNumber",
				&serde_json::json!(["latest", false]),
			))
			.await?
			.into_result()?;
		parse_head_block(raw.get())
	}

	/// Lag is pushed in from the outside (the lag observer); availability
	/// follows it.
	fn refresh_availability_from_lag(&self) {
		let lagging = self
			.lag
			.lock()
			.expect("lag lock is never poisoned")
			.is_some_and(|lag| lag > self.config.lag_threshold);
		self.set_availability(if lagging {
			UpstreamAvailability::Lagging
		} else {
			UpstreamAvailability::Ok
		});
	}

	async fn run_poller(weak: Weak<NativeRpcUpstream>, poll_interval: Duration) {
		let mut poll = make_periodic_tick(poll_interval, true);
		loop {
			poll.tick().await;
			let Some(upstream) = weak.upgrade() else { break };
			if let Err(e) = upstream.poll_once().await {
				tracing::warn!(
					"Head poll failed for {} at {}: {e:#}",
					upstream.config.id,
					upstream.config.endpoint,
				);
				upstream.set_availability(UpstreamAvailability::Unavailable);
			}
		}
	}
}

fn parse_head_block(raw: &str) -> anyhow::Result<BlockRef> {
	#[derive(serde::Deserialize)]
	#[serde(rename_all = "camelCase")]
	struct RpcBlock {
		hash: String,
		number: String,
		total_difficulty: Option<String>,
	}

	let block: RpcBlock = serde_json::from_str(raw)?;
	let hash = BlockHash::from_hex(&block.hash)?;
	let height = u64::from_str_radix(block.number.trim_start_matches("0x"), 16)?;
	// Chains without difficulty accumulate by height instead, which keeps
	// the strictly-heavier promotion rule meaningful.
	let weight = match &block.total_difficulty {
		Some(difficulty) => BigUint::from_str_radix(difficulty.trim_start_matches("0x"), 16)
			.map_err(|e| anyhow::anyhow!("invalid totalDifficulty: {e}"))?,
		None => BigUint::from(height),
	};
	Ok(BlockRef::new(hash, height, weight))
}

impl Upstream for NativeRpcUpstream {
	fn id(&self) -> UpstreamId {
		self.config.id.clone()
	}

	fn chain(&self) -> Chain {
		self.config.chain
	}

	fn role(&self) -> UpstreamRole {
		self.config.role
	}

	fn labels(&self) -> Labels {
		self.config.labels.clone()
	}

	fn capabilities(&self) -> BTreeSet<Capability> {
		self.config.capabilities.clone()
	}

	fn options(&self) -> Result<UpstreamOptions, MultistreamError> {
		Ok(self.config.options.clone())
	}

	fn node_id(&self) -> Result<u8, MultistreamError> {
		Ok(self.config.node_id)
	}

	fn client_version(&self) -> Option<String> {
		self.client_version.lock().expect("version lock is never poisoned").clone()
	}

	fn status(&self) -> UpstreamAvailability {
		*self.status.borrow()
	}

	fn observe_status(&self) -> BoxStream<'static, UpstreamAvailability> {
		Box::pin(WatchStream::new(self.status.subscribe()))
	}

	fn observe_events(&self) -> BoxStream<'static, UpstreamChangeEvent> {
		Box::pin(self.events_tx.new_receiver())
	}

	fn head(&self) -> Arc<dyn Head> {
		self.head.clone()
	}

	fn ingress_reader(&self) -> Result<Arc<dyn IngressReader>, MultistreamError> {
		Ok(self.reader.clone())
	}

	fn call_methods(&self) -> Arc<CallMethods> {
		Arc::new(CallMethods::ready(self.config.methods.clone()))
	}

	fn lag(&self) -> Option<u64> {
		*self.lag.lock().expect("lag lock is never poisoned")
	}

	fn set_lag(&self, lag: u64) {
		*self.lag.lock().expect("lag lock is never poisoned") = Some(lag);
		if self.status().is_usable() {
			self.refresh_availability_from_lag();
		}
	}

	fn start(&self) {
		if self.running.swap(true, Ordering::SeqCst) {
			return
		}
		let mut poller = self.poller.lock().expect("poller lock is never poisoned");
		if poller.is_none() {
			*poller = Some(spawn_scoped(Self::run_poller(
				self.weak_self.clone(),
				self.config.poll_interval,
			)));
		}
	}

	fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
		*self.poller.lock().expect("poller lock is never poisoned") = None;
		self.set_availability(UpstreamAvailability::Unavailable);
	}

	fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_a_mainnet_style_head_block() {
		let block = parse_head_block(
			r#"{
				"hash": "0x50d26ed1ee21a090fdf9371bc2b8f0d25b68f7fbc4c44b5b6f9bee1d9ad79ad7",
				"number": "0x9ec86",
				"totalDifficulty": "0x35bbde5595de6456",
				"extraData": "0x"
			}"#,
		)
		.unwrap();

		assert_eq!(block.height, 0x9ec86);
		assert_eq!(block.weight, 0x35bbde5595de6456u64.into());
		assert_eq!(
			block.hash.to_string(),
			"50d26ed1ee21a090fdf9371bc2b8f0d25b68f7fbc4c44b5b6f9bee1d9ad79ad7"
		);
	}

	#[test]
	fn missing_total_difficulty_falls_back_to_height() {
		let block = parse_head_block(
			r#"{
				"hash": "0x50d26ed1ee21a090fdf9371bc2b8f0d25b68f7fbc4c44b5b6f9bee1d9ad79ad7",
				"number": "0x10"
			}"#,
		)
		.unwrap();
		assert_eq!(block.weight, 16u64.into());
	}

	#[test]
	fn garbage_head_blocks_are_rejected() {
		assert!(parse_head_block(r#"{"hash": "0xzz", "number": "0x10"}"#).is_err());
		assert!(parse_head_block("null").is_err());
	}

	mockall::mock! {
		Reader {}
		#[async_trait::async_trait]
		impl IngressReader for Reader {
			async fn read(
				&self,
				request: crate::upstream::rpc::JsonRpcRequest,
			) -> anyhow::Result<crate::upstream::rpc::JsonRpcResponse>;
		}
	}

	fn test_upstream(reader: MockReader) -> Arc<NativeRpcUpstream> {
		NativeRpcUpstream::with_reader(
			NativeUpstreamConfig::new(
				"local",
				Chain::Ethereum,
				SecretUrl::from("http://localhost:8545"),
			),
			Arc::new(reader),
		)
	}

	#[tokio::test]
	async fn a_successful_poll_promotes_the_head_and_reports_ok() {
		use crate::upstream::rpc::JsonRpcResponse;
		use mockall::Sequence;

		let mut reader = MockReader::new();
		let mut seq = Sequence::new();
		reader
			.expect_read()
			.times(1)
			.withf(|request| request.method == "eth_syncing")
			.in_sequence(&mut seq)
			.returning(|_| Ok(JsonRpcResponse::result(serde_json::json!(false))));
		reader
			.expect_read()
			.times(1)
			.withf(|request| request.method == "eth_getBlockByNumber")
			.in_sequence(&mut seq)
			.returning(|_| {
				Ok(JsonRpcResponse::result(serde_json::json!({
					"hash": "0x50d26ed1ee21a090fdf9371bc2b8f0d25b68f7fbc4c44b5b6f9bee1d9ad79ad7",
					"number": "0x9ec86",
					"totalDifficulty": "0x35bbde5595de6456",
				})))
			});
		reader
			.expect_read()
			.times(1)
			.withf(|request| request.method == "web3_clientVersion")
			.in_sequence(&mut seq)
			.returning(|_| Ok(JsonRpcResponse::result(serde_json::json!("geth/v1.13.0"))));

		let upstream = test_upstream(reader);
		upstream.poll_once().await.unwrap();

		assert_eq!(upstream.status(), UpstreamAvailability::Ok);
		assert_eq!(upstream.current_height(), Some(0x9ec86));
		assert_eq!(upstream.client_version().as_deref(), Some("geth/v1.13.0"));
	}

	#[tokio::test]
	async fn a_syncing_node_is_reported_syncing_without_a_head_fetch() {
		use crate::upstream::rpc::JsonRpcResponse;

		let mut reader = MockReader::new();
		reader
			.expect_read()
			.times(1)
			.withf(|request| request.method == "eth_syncing")
			.returning(|_| {
				Ok(JsonRpcResponse::result(serde_json::json!({
					"startingBlock": "0x0",
					"currentBlock": "0x10",
					"highestBlock": "0x9ec86",
				})))
			});

		let upstream = test_upstream(reader);
		upstream.poll_once().await.unwrap();
		assert_eq!(upstream.status(), UpstreamAvailability::Syncing);
		assert!(upstream.head().current().is_none());
	}

	#[tokio::test]
	async fn a_failing_poll_surfaces_the_error() {
		let mut reader = MockReader::new();
		reader
			.expect_read()
			.returning(|_| Err(anyhow::anyhow!("connection refused")));

		let upstream = test_upstream(reader);
		assert!(upstream.poll_once().await.is_err());
	}

	#[test]
	fn lag_above_the_threshold_marks_the_upstream_lagging() {
		let upstream = NativeRpcUpstream::with_reader(
			NativeUpstreamConfig::new(
				"local",
				Chain::Ethereum,
				SecretUrl::from("http://localhost:8545"),
			),
			Arc::new(MockReader::new()),
		);

		// The poller has not run; force a usable state first.
		upstream.set_availability(UpstreamAvailability::Ok);

		upstream.set_lag(2);
		assert_eq!(upstream.status(), UpstreamAvailability::Ok);

		upstream.set_lag(DEFAULT_LAG_THRESHOLD + 1);
		assert_eq!(upstream.status(), UpstreamAvailability::Lagging);

		upstream.set_lag(0);
		assert_eq!(upstream.status(), UpstreamAvailability::Ok);
	}
}
