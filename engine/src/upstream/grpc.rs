//! Upstream variant backed by a remote peer aggregator: the peer's head
//! subscription drives the local head, and native calls proxy through the
//! peer. The network client itself is an external collaborator behind
//! [PeerConnection].

use std::{
	collections::BTreeSet,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, Weak,
	},
	time::Duration,
};

use futures::{stream::BoxStream, StreamExt};
use num_bigint::BigUint;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use utilities::{make_periodic_tick, task::spawn_scoped, ScopedJoinHandle};

use crate::{
	chain::Chain,
	constants::RPC_RETRY_CONNECTION_INTERVAL,
	errors::MultistreamError,
	head::{BlockHash, BlockRef, Head, StandardHead},
	upstream::{
		availability::UpstreamAvailability,
		call_methods::CallMethods,
		event::UpstreamChangeEvent,
		rpc::{IngressReader, JsonRpcRequest, JsonRpcResponse},
		Capability, Labels, Upstream, UpstreamId, UpstreamOptions, UpstreamRole,
	},
};

/// Head event as it crosses the wire between aggregators.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ChainHead {
	pub chain_id: u16,
	/// Lowercase hex, no `0x` prefix.
	pub block_id: String,
	pub height: u64,
	/// Big-endian bytes of the block weight.
	pub weight: Vec<u8>,
}

impl ChainHead {
	pub fn from_block(chain: Chain, block: &BlockRef) -> Self {
		Self {
			chain_id: chain.id(),
			block_id: block.hash.to_string(),
			height: block.height,
			weight: block.weight.to_bytes_be(),
		}
	}

	pub fn to_block(&self) -> anyhow::Result<BlockRef> {
		Ok(BlockRef::new(
			BlockHash::from_hex(&self.block_id)?,
			self.height,
			BigUint::from_bytes_be(&self.weight),
		))
	}
}

/// Contract of the remote-peer client (the gRPC egress side).
#[async_trait::async_trait]
pub trait PeerConnection: Send + Sync {
	/// A finite stream means the connection dropped; the caller resubscribes.
	async fn subscribe_head(&self) -> anyhow::Result<BoxStream<'static, ChainHead>>;

	async fn native_call(&self, request: JsonRpcRequest) -> anyhow::Result<JsonRpcResponse>;
}

pub struct GrpcUpstreamConfig {
	pub id: UpstreamId,
	pub chain: Chain,
	pub role: UpstreamRole,
	pub labels: Labels,
	pub capabilities: BTreeSet<Capability>,
	pub methods: BTreeSet<String>,
	pub options: UpstreamOptions,
	pub node_id: u8,
	pub resubscribe_interval: Duration,
}

impl GrpcUpstreamConfig {
	pub fn new(id: &str, chain: Chain) -> Self {
		Self {
			id: UpstreamId::from(id),
			chain,
			role: UpstreamRole::Primary,
			labels: Labels::default(),
			capabilities: [Capability::Rpc, Capability::WsHead].into_iter().collect(),
			methods: BTreeSet::new(),
			options: UpstreamOptions::default(),
			node_id: 0,
			resubscribe_interval: RPC_RETRY_CONNECTION_INTERVAL,
		}
	}
}

pub struct GrpcUpstream {
	config: GrpcUpstreamConfig,
	weak_self: Weak<GrpcUpstream>,
	peer: Arc<dyn PeerConnection>,
	head: Arc<StandardHead>,
	status: watch::Sender<UpstreamAvailability>,
	lag: Mutex<Option<u64>>,
	running: AtomicBool,
	follower: Mutex<Option<ScopedJoinHandle<()>>>,
	events_tx: async_broadcast::Sender<UpstreamChangeEvent>,
	_events_keepalive: async_broadcast::InactiveReceiver<UpstreamChangeEvent>,
}

impl GrpcUpstream {
	pub fn new(config: GrpcUpstreamConfig, peer: Arc<dyn PeerConnection>) -> Arc<Self> {
		let (status, _) = watch::channel(UpstreamAvailability::Unavailable);
		let (mut events_tx, events_rx) =
			async_broadcast::broadcast(crate::constants::BROADCAST_BUFFER);
		events_tx.set_overflow(true);

		Arc::new_cyclic(|weak| Self {
			config,
			weak_self: weak.clone(),
			peer,
			head: Arc::new(StandardHead::new()),
			status,
			lag: Mutex::new(None),
			running: AtomicBool::new(false),
			follower: Mutex::new(None),
			events_tx,
			_events_keepalive: events_rx.deactivate(),
		})
	}

	fn set_availability(&self, status: UpstreamAvailability) {
		self.status.send_if_modified(|current| {
			if *current == status {
				false
			} else {
				tracing::info!("Peer upstream {} is now {status}", self.config.id);
				*current = status;
				true
			}
		});
	}

	/// Follows the peer's head stream, resubscribing with a delay whenever
	/// the stream ends or fails.
	async fn run_follower(weak: Weak<GrpcUpstream>, resubscribe_interval: Duration) {
		let mut retry = make_periodic_tick(resubscribe_interval, true);
		loop {
			retry.tick().await;
			let Some(upstream) = weak.upgrade() else { break };

			let mut heads = match upstream.peer.subscribe_head().await {
				Ok(heads) => heads,
				Err(e) => {
					tracing::warn!(
						"Head subscription to peer {} failed: {e:#}. Retrying in {:?}...",
						upstream.config.id,
						retry.period(),
					);
					upstream.set_availability(UpstreamAvailability::Unavailable);
					continue
				},
			};
			drop(upstream);

			// The upstream handle is re-acquired per item so a parked stream
			// does not keep a stopped upstream alive.
			loop {
				let Some(head) = heads.next().await else { break };
				let Some(upstream) = weak.upgrade() else { return };
				match head.to_block() {
					Ok(block) => {
						upstream.head.on_next(block);
						upstream.set_availability(UpstreamAvailability::Ok);
					},
					Err(e) => {
						// A malformed head does not tear the stream down.
						tracing::warn!(
							"Discarding malformed head from peer {}: {e:#}",
							upstream.config.id,
						);
					},
				}
			}

			if let Some(upstream) = weak.upgrade() {
				tracing::warn!(
					"Head stream from peer {} ended. Resubscribing in {:?}...",
					upstream.config.id,
					retry.period(),
				);
				upstream.set_availability(UpstreamAvailability::Unavailable);
			}
		}
	}
}

struct PeerReader {
	peer: Arc<dyn PeerConnection>,
}

#[async_trait::async_trait]
impl IngressReader for PeerReader {
	async fn read(&self, request: JsonRpcRequest) -> anyhow::Result<JsonRpcResponse> {
		self.peer.native_call(request).await
	}
}

impl Upstream for GrpcUpstream {
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
		None
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
		Ok(Arc::new(PeerReader { peer: self.peer.clone() }))
	}

	fn call_methods(&self) -> Arc<CallMethods> {
		Arc::new(CallMethods::ready(self.config.methods.clone()))
	}

	fn lag(&self) -> Option<u64> {
		*self.lag.lock().expect("lag lock is never poisoned")
	}

	fn set_lag(&self, lag: u64) {
		*self.lag.lock().expect("lag lock is never poisoned") = Some(lag);
	}

	fn start(&self) {
		if self.running.swap(true, Ordering::SeqCst) {
			return
		}
		let mut follower = self.follower.lock().expect("follower lock is never poisoned");
		if follower.is_none() {
			*follower = Some(spawn_scoped(Self::run_follower(
				self.weak_self.clone(),
				self.config.resubscribe_interval,
			)));
		}
	}

	fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
		*self.follower.lock().expect("follower lock is never poisoned") = None;
		self.set_availability(UpstreamAvailability::Unavailable);
	}

	fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}
}
