//! The per-chain aggregator. A [Multistream] owns a dynamic set of
//! upstreams, reduces their availability and heads into one authoritative
//! view, routes calls through the selector pipeline, and fans change events
//! out to subscribers.
//!
//! All membership and state mutation is serialized: external
//! [UpstreamChangeEvent]s are pushed onto a single ingress channel and
//! consumed by one task, in arrival order. Readers take lock-free snapshots.

pub mod availability;
pub mod state;

use std::{
	collections::{BTreeSet, HashMap},
	sync::{
		atomic::{AtomicBool, AtomicU32, Ordering},
		Arc, Mutex, RwLock, Weak,
	},
};

use futures::{stream, FutureExt, StreamExt};
use itertools::Itertools;
use tokio::sync::mpsc;
use utilities::{make_periodic_tick, task::spawn_scoped, ScopedJoinHandle, Signal, Signaller};

use crate::{
	cache::CacheSink,
	chain::Chain,
	constants::{
		BROADCAST_BUFFER, EVENT_INGRESS_BUFFER, ROTATION_SEED_LIMIT, STATUS_CHANGE_SAMPLE_INTERVAL,
		STATUS_HEIGHT_TIMEOUT, STATUS_PRINT_INTERVAL,
	},
	egress::EgressSubscription,
	errors::MultistreamError,
	head::{
		aggregate::{AggregateHead, SubsetHead},
		lag_observer::HeadLagObserver,
		Head, StandardHead,
	},
	metrics,
	selector::{filtered_apis::FilteredApis, Matcher, UpstreamFilter},
	upstream::{
		availability::UpstreamAvailability,
		call_methods::CallMethods,
		event::{ChangeKind, UpstreamChangeEvent},
		rpc::IngressReader,
		Capability, FinalizationData, Labels, LowerBoundData, Upstream, UpstreamId,
		UpstreamOptions, UpstreamRole,
	},
};
use availability::FilterBestAvailability;
use state::{MultistreamState, MultistreamStateEvent, QuorumForLabels};

enum Ingress {
	Change(UpstreamChangeEvent),
	MemberStatus(UpstreamId, UpstreamAvailability),
}

/// Consumer-task-owned resources attached to the membership.
struct Members {
	list: Vec<Arc<dyn Upstream>>,
	// Per-member forwarding tasks (head, status, self-events). Dropped (and
	// thereby aborted) when the member is removed.
	forwarders: HashMap<UpstreamId, Vec<ScopedJoinHandle<()>>>,
	// Upstreams seen via Observed, waiting for their own Added event.
	observed: HashMap<UpstreamId, ScopedJoinHandle<()>>,
	// Lag observation only runs with two or more members; the id set records
	// which membership the observer covers.
	lag_observer: Option<(BTreeSet<UpstreamId>, HeadLagObserver)>,
	availability: FilterBestAvailability,
}

pub struct Multistream {
	chain: Chain,
	id: UpstreamId,
	weak_self: Weak<Multistream>,
	cache: Option<Arc<dyn CacheSink>>,
	head: Arc<AggregateHead>,
	state: RwLock<MultistreamState>,
	members: Mutex<Members>,
	// Copy-on-write membership snapshot for the reader path.
	snapshot: RwLock<Arc<Vec<Arc<dyn Upstream>>>>,
	rotation: AtomicU32,
	ingress_tx: mpsc::Sender<Ingress>,
	running: AtomicBool,
	stopped: AtomicBool,
	shutdown_signaller: Mutex<Option<Signaller<()>>>,
	shutdown: Signal<()>,
	status_tx: async_broadcast::Sender<UpstreamAvailability>,
	_status_keepalive: async_broadcast::InactiveReceiver<UpstreamAvailability>,
	added_tx: async_broadcast::Sender<Arc<dyn Upstream>>,
	_added_keepalive: async_broadcast::InactiveReceiver<Arc<dyn Upstream>>,
	removed_tx: async_broadcast::Sender<Arc<dyn Upstream>>,
	_removed_keepalive: async_broadcast::InactiveReceiver<Arc<dyn Upstream>>,
	updated_tx: async_broadcast::Sender<Arc<dyn Upstream>>,
	_updated_keepalive: async_broadcast::InactiveReceiver<Arc<dyn Upstream>>,
	observed_tx: async_broadcast::Sender<Arc<dyn Upstream>>,
	_observed_keepalive: async_broadcast::InactiveReceiver<Arc<dyn Upstream>>,
	tasks: Mutex<Vec<ScopedJoinHandle<()>>>,
}

fn multicast<T>(
) -> (async_broadcast::Sender<T>, async_broadcast::InactiveReceiver<T>) {
	let (mut tx, rx) = async_broadcast::broadcast(BROADCAST_BUFFER);
	tx.set_overflow(true);
	(tx, rx.deactivate())
}

fn emit<T: Clone>(tx: &async_broadcast::Sender<T>, value: T) {
	match tx.try_broadcast(value) {
		Ok(_) | Err(async_broadcast::TrySendError::Inactive(_)) => {},
		Err(e) => {
			tracing::error!("Dropping multistream event: {e}");
		},
	}
}

impl Multistream {
	pub fn new(chain: Chain) -> Arc<Self> {
		Self::with_cache(chain, None)
	}

	pub fn with_cache(chain: Chain, cache: Option<Arc<dyn CacheSink>>) -> Arc<Self> {
		let (ingress_tx, ingress_rx) = mpsc::channel(EVENT_INGRESS_BUFFER);
		let (status_tx, status_keepalive) = multicast();
		let (added_tx, added_keepalive) = multicast();
		let (removed_tx, removed_keepalive) = multicast();
		let (updated_tx, updated_keepalive) = multicast();
		let (observed_tx, observed_keepalive) = multicast();
		let (shutdown_signaller, shutdown) = Signal::new();

		let multistream = Arc::new_cyclic(|weak: &Weak<Multistream>| {
			let consumer =
				spawn_scoped(Self::run_ingress(weak.clone(), ingress_rx, shutdown.clone()));
			Self {
				chain,
				id: UpstreamId::from(format!("!all:{}", chain.code())),
				weak_self: weak.clone(),
				cache,
				head: Arc::new(AggregateHead::new()),
				state: RwLock::new(MultistreamState::new()),
				members: Mutex::new(Members {
					list: Vec::new(),
					forwarders: HashMap::new(),
					observed: HashMap::new(),
					lag_observer: None,
					availability: FilterBestAvailability::new(),
				}),
				snapshot: RwLock::new(Arc::new(Vec::new())),
				rotation: AtomicU32::new(0),
				ingress_tx,
				running: AtomicBool::new(false),
				stopped: AtomicBool::new(false),
				shutdown_signaller: Mutex::new(Some(shutdown_signaller)),
				shutdown,
				status_tx,
				_status_keepalive: status_keepalive,
				added_tx,
				_added_keepalive: added_keepalive,
				removed_tx,
				_removed_keepalive: removed_keepalive,
				updated_tx,
				_updated_keepalive: updated_keepalive,
				observed_tx,
				_observed_keepalive: observed_keepalive,
				tasks: Mutex::new(vec![consumer]),
			}
		});

		if let Some(cache) = &multistream.cache {
			cache.set_head(multistream.head.clone());
			multistream.head.set_cache(cache.clone());
		}
		multistream
	}

	/// Push an external membership event onto the serialized ingress. Events
	/// are processed in arrival order; membership events are never dropped
	/// while the multistream is alive.
	pub async fn process_event(&self, event: UpstreamChangeEvent) {
		if self.stopped.load(Ordering::SeqCst) {
			tracing::trace!("Ignoring {:?} after stop", event);
			return
		}
		if self.ingress_tx.send(Ingress::Change(event)).await.is_err() {
			tracing::error!("Multistream {} ingress is gone", self.id);
		}
	}

	async fn run_ingress(
		weak: Weak<Multistream>,
		mut ingress_rx: mpsc::Receiver<Ingress>,
		shutdown: Signal<()>,
	) {
		loop {
			tokio::select! {
				biased;
				_ = shutdown.clone().wait() => break,
				maybe_msg = ingress_rx.recv() => {
					let Some(msg) = maybe_msg else { break };
					let Some(multistream) = weak.upgrade() else { break };
					multistream.dispatch(msg);
				},
			}
		}
	}

	fn dispatch(self: &Arc<Self>, msg: Ingress) {
		match msg {
			Ingress::Change(event) => self.dispatch_change(event),
			Ingress::MemberStatus(id, status) => self.on_member_status(id, status),
		}
	}

	fn dispatch_change(self: &Arc<Self>, event: UpstreamChangeEvent) {
		if event.chain != self.chain {
			// This multistream serves exactly one chain.
			return
		}
		match event.kind {
			ChangeKind::Added => {
				if !self.is_running() {
					self.start();
				}
				if event.upstream.is_cache_aware() {
					if let Some(cache) = &self.cache {
						event.upstream.set_cache(cache.clone());
					}
				}
				if self.add_upstream(event.upstream.clone()) {
					emit(&self.added_tx, event.upstream);
				}
			},
			ChangeKind::Updated => {
				self.refresh_state();
				emit(&self.updated_tx, event.upstream);
			},
			ChangeKind::Removed => {
				self.remove_upstream(&event.upstream.id(), true);
			},
			ChangeKind::FatalSettingsErrorRemoved => {
				// The driver already stopped it.
				self.remove_upstream(&event.upstream.id(), false);
			},
			ChangeKind::Observed => self.on_observed(event.upstream),
			ChangeKind::Revalidated => {
				tracing::trace!("Upstream {} revalidated", event.upstream.id());
			},
		}
	}

	/// Adopts an upstream. Returns true iff the id was new; a duplicate add
	/// is a no-op.
	pub fn add_upstream(&self, upstream: Arc<dyn Upstream>) -> bool {
		let mut members = self.members.lock().expect("members lock is never poisoned");
		if members.list.iter().any(|member| member.id() == upstream.id()) {
			return false
		}
		tracing::info!("Adding upstream {} to {}", upstream.id(), self.id);

		members.list.push(upstream.clone());
		members.observed.remove(&upstream.id());

		let mut forwarders = Vec::new();
		{
			// Member head emissions feed the aggregate tip.
			let aggregate = self.head.clone();
			let mut flux = upstream.head().flux();
			forwarders.push(spawn_scoped(async move {
				while let Some(block) = flux.next().await {
					aggregate.on_next(block);
				}
			}));
		}
		{
			let ingress_tx = self.ingress_tx.clone();
			let id = upstream.id();
			let mut statuses = upstream.observe_status();
			forwarders.push(spawn_scoped(async move {
				while let Some(status) = statuses.next().await {
					if ingress_tx.send(Ingress::MemberStatus(id.clone(), status)).await.is_err() {
						break
					}
				}
			}));
		}
		{
			// The upstream's own change events re-enter the ingress; the
			// forwarder ends once its Removed arrives and it is not running.
			let ingress_tx = self.ingress_tx.clone();
			let observed = upstream.clone();
			let mut events = upstream.observe_events();
			forwarders.push(spawn_scoped(async move {
				while let Some(event) = events.next().await {
					let terminal =
						event.kind == ChangeKind::Removed && !observed.is_running();
					if ingress_tx.send(Ingress::Change(event)).await.is_err() {
						break
					}
					if terminal {
						break
					}
				}
			}));
		}
		members.forwarders.insert(upstream.id(), forwarders);

		metrics::set_upstream_status(self.chain, &upstream.id(), upstream.status());
		self.refresh_membership(&mut members);
		true
	}

	/// Removes an upstream by id, optionally stopping it. Returns false (and
	/// emits nothing) when the id is unknown.
	pub fn remove_upstream(&self, id: &UpstreamId, stop_upstream: bool) -> bool {
		let mut members = self.members.lock().expect("members lock is never poisoned");
		let Some(position) = members.list.iter().position(|member| &member.id() == id) else {
			return false
		};
		tracing::info!("Removing upstream {id} from {}", self.id);

		let upstream = members.list.remove(position);
		members.forwarders.remove(id);
		if let Some(aggregate) = members.availability.evict(id) {
			self.emit_status(aggregate, &members.list);
		}
		metrics::remove_upstream(self.chain, id);

		if stop_upstream {
			upstream.stop();
		}
		emit(&self.removed_tx, upstream);
		self.refresh_membership(&mut members);
		true
	}

	/// Re-runs the state reducer against the current membership. Also the
	/// entry point for "methods changed upstream-side" notifications, which
	/// carry no payload worth trusting over a fresh reduction.
	pub fn refresh_state(&self) {
		let mut members = self.members.lock().expect("members lock is never poisoned");
		self.refresh_membership(&mut members);
	}

	fn refresh_membership(&self, members: &mut Members) {
		let snapshot: Arc<Vec<Arc<dyn Upstream>>> = Arc::new(members.list.clone());
		*self.snapshot.write().expect("snapshot lock is never poisoned") = snapshot.clone();

		self.state
			.write()
			.expect("state lock is never poisoned")
			.update_state(&snapshot, EgressSubscription::from_upstreams(&snapshot));

		self.apply_lag_policy(members);
		metrics::set_connected(self.chain, snapshot.len());
		metrics::set_status_counts(self.chain, &snapshot);
	}

	fn apply_lag_policy(&self, members: &mut Members) {
		match members.list.len() {
			0 => {
				members.lag_observer = None;
			},
			1 => {
				// A lone upstream is the tip by definition.
				members.lag_observer = None;
				members.list[0].set_lag(0);
			},
			_ => {
				if !self.is_running() {
					return
				}
				let ids: BTreeSet<UpstreamId> =
					members.list.iter().map(|member| member.id()).collect();
				let covers_current = members
					.lag_observer
					.as_ref()
					.is_some_and(|(covered, _)| covered == &ids);
				if !covers_current {
					members.lag_observer =
						Some((ids, HeadLagObserver::spawn(members.list.clone())));
				}
			},
		}
	}

	fn on_member_status(&self, id: UpstreamId, status: UpstreamAvailability) {
		let mut members = self.members.lock().expect("members lock is never poisoned");
		if !members.list.iter().any(|member| member.id() == id) {
			// Stale event raced with removal.
			return
		}
		metrics::set_upstream_status(self.chain, &id, status);
		if let Some(aggregate) = members.availability.update(id, status) {
			self.emit_status(aggregate, &members.list);
		}
	}

	fn emit_status(&self, status: UpstreamAvailability, members: &[Arc<dyn Upstream>]) {
		emit(&self.status_tx, status);
		metrics::set_status_counts(self.chain, members);
	}

	fn on_observed(self: &Arc<Self>, upstream: Arc<dyn Upstream>) {
		let mut members = self.members.lock().expect("members lock is never poisoned");
		if members.list.iter().any(|member| member.id() == upstream.id()) {
			// Already a member; a repeated Observed is a no-op.
			return
		}
		if members.observed.contains_key(&upstream.id()) {
			return
		}
		emit(&self.observed_tx, upstream.clone());

		// Follow the upstream's own events until it announces itself Added,
		// then route that into the ingress to complete observed -> added.
		let ingress_tx = self.ingress_tx.clone();
		let mut events = upstream.observe_events();
		let id = upstream.id();
		members.observed.insert(
			id,
			spawn_scoped(async move {
				while let Some(event) = events.next().await {
					if event.kind == ChangeKind::Added {
						let _ = ingress_tx.send(Ingress::Change(event)).await;
						break
					}
				}
			}),
		);
	}

	/// Current membership snapshot. Consistent, lock-free for readers.
	pub fn upstreams(&self) -> Arc<Vec<Arc<dyn Upstream>>> {
		self.snapshot.read().expect("snapshot lock is never poisoned").clone()
	}

	/// An ordered api-source for one request. Two calls under identical
	/// membership and filter yield the same set; the order rotates with an
	/// internal counter so load spreads across callers.
	pub fn get_api_source(&self, filter: UpstreamFilter) -> FilteredApis {
		let seed = self
			.rotation
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |seed| {
				Some((seed + 1) % ROTATION_SEED_LIMIT)
			})
			.expect("fetch_update closure always returns Some");
		FilteredApis::new(self.chain, &self.upstreams(), &filter, seed)
	}

	/// A head over the subset of members accepted by the matcher.
	pub fn head_matching(&self, matcher: &Matcher) -> Arc<dyn Head> {
		let inner = Arc::new(StandardHead::new());
		let mut forwarders = Vec::new();
		for upstream in self.upstreams().iter() {
			if !matcher.matches(upstream.as_ref()) {
				continue
			}
			let member_head = upstream.head();
			if let Some(current) = member_head.current() {
				inner.on_next(current);
			}
			let subset = inner.clone();
			let mut flux = member_head.flux();
			forwarders.push(spawn_scoped(async move {
				while let Some(block) = flux.next().await {
					subset.on_next(block);
				}
			}));
		}
		Arc::new(SubsetHead::new(inner, forwarders))
	}

	/// Native subscription pass-through. The aggregate serves everything
	/// from its own streams, so there is nothing to proxy by default.
	pub fn try_proxy_subscribe(
		&self,
		_matcher: &Matcher,
		_topic: &str,
	) -> Option<futures::stream::BoxStream<'static, serde_json::Value>> {
		None
	}

	pub fn quorum_labels(&self) -> QuorumForLabels {
		self.state.read().expect("state lock is never poisoned").quorum_labels()
	}

	pub fn state_events(&self) -> futures::stream::BoxStream<'static, MultistreamStateEvent> {
		self.state.read().expect("state lock is never poisoned").events()
	}

	pub fn observe_added(&self) -> futures::stream::BoxStream<'static, Arc<dyn Upstream>> {
		Box::pin(self.added_tx.new_receiver())
	}

	pub fn observe_removed(&self) -> futures::stream::BoxStream<'static, Arc<dyn Upstream>> {
		Box::pin(self.removed_tx.new_receiver())
	}

	pub fn observe_updated(&self) -> futures::stream::BoxStream<'static, Arc<dyn Upstream>> {
		Box::pin(self.updated_tx.new_receiver())
	}

	pub fn observe_observed(&self) -> futures::stream::BoxStream<'static, Arc<dyn Upstream>> {
		Box::pin(self.observed_tx.new_receiver())
	}

	#[cfg(test)]
	fn lag_observer_active(&self) -> bool {
		self.members.lock().unwrap().lag_observer.is_some()
	}

	/// One status line: aggregate height, per-member statuses and lags.
	async fn print_status(&self) {
		let snapshot = self.upstreams();
		let height = match self.head.wait_for_current(STATUS_HEIGHT_TIMEOUT).await {
			Ok(block) => block.height.to_string(),
			Err(e) => {
				tracing::debug!("Head height unknown for {}: {e}", self.id);
				"?".to_string()
			},
		};
		let statuses = snapshot
			.iter()
			.map(|upstream| format!("{}={}", upstream.id(), upstream.status()))
			.join(", ");
		let lags = snapshot
			.iter()
			.map(|upstream| {
				let lag = upstream
					.lag()
					.map(|lag| lag.to_string())
					.unwrap_or_else(|| "?".to_string());
				format!("{}={lag}", upstream.id())
			})
			.join(", ");
		tracing::info!(
			chain = %self.chain,
			"State of {}: height={height}, status={}, upstreams=[{statuses}], lag=[{lags}]",
			self.id,
			self.status(),
		);

		for upstream in snapshot.iter() {
			if let Some(lag) = upstream.lag() {
				metrics::set_upstream_lag(self.chain, &upstream.id(), lag);
			}
		}
	}

	async fn run_status_printer(weak: Weak<Multistream>, shutdown: Signal<()>) {
		let mut ticker = make_periodic_tick(STATUS_PRINT_INTERVAL, false);
		let mut sample = make_periodic_tick(STATUS_CHANGE_SAMPLE_INTERVAL, true);
		let mut status_changes = match weak.upgrade() {
			Some(multistream) => multistream.status_tx.new_receiver(),
			None => return,
		};
		loop {
			tokio::select! {
				biased;
				_ = shutdown.clone().wait() => break,
				_ = ticker.tick() => {
					let Some(multistream) = weak.upgrade() else { break };
					multistream.print_status().await;
				},
				maybe_status = status_changes.next() => {
					let Some(_) = maybe_status else { break };
					// Print on change, at most once per sample interval.
					if sample.tick().now_or_never().is_some() {
						let Some(multistream) = weak.upgrade() else { break };
						multistream.print_status().await;
					}
				},
			}
		}
	}
}

impl Upstream for Multistream {
	fn id(&self) -> UpstreamId {
		self.id.clone()
	}

	fn chain(&self) -> Chain {
		self.chain
	}

	fn role(&self) -> UpstreamRole {
		UpstreamRole::Primary
	}

	fn labels(&self) -> Labels {
		Labels::default()
	}

	fn capabilities(&self) -> BTreeSet<Capability> {
		self.state.read().expect("state lock is never poisoned").capabilities()
	}

	fn options(&self) -> Result<UpstreamOptions, MultistreamError> {
		Err(MultistreamError::Unsupported("options are per-upstream"))
	}

	fn node_id(&self) -> Result<u8, MultistreamError> {
		Err(MultistreamError::Unsupported("nodeId is per-upstream"))
	}

	fn client_version(&self) -> Option<String> {
		None
	}

	fn status(&self) -> UpstreamAvailability {
		self.upstreams()
			.iter()
			.map(|upstream| upstream.status())
			.min()
			.unwrap_or(UpstreamAvailability::Unavailable)
	}

	fn observe_status(&self) -> futures::stream::BoxStream<'static, UpstreamAvailability> {
		let current = self.status();
		Box::pin(stream::once(async move { current }).chain(self.status_tx.new_receiver()))
	}

	/// Empty: the aggregate does not emit change events about itself, which
	/// also breaks the recursion when multistreams nest.
	fn observe_events(&self) -> futures::stream::BoxStream<'static, UpstreamChangeEvent> {
		Box::pin(stream::empty())
	}

	fn head(&self) -> Arc<dyn Head> {
		self.head.clone()
	}

	fn ingress_reader(&self) -> Result<Arc<dyn IngressReader>, MultistreamError> {
		Err(MultistreamError::Unsupported("use getApiSource to pick a member reader"))
	}

	fn call_methods(&self) -> Arc<CallMethods> {
		self.state.read().expect("state lock is never poisoned").call_methods()
	}

	fn lag(&self) -> Option<u64> {
		None
	}

	fn set_lag(&self, _lag: u64) {}

	fn lower_bounds(&self) -> Vec<LowerBoundData> {
		self.state
			.read()
			.expect("state lock is never poisoned")
			.lower_bounds()
			.into_iter()
			.map(|(bound_type, height)| LowerBoundData { bound_type, height })
			.collect()
	}

	fn finalizations(&self) -> Vec<FinalizationData> {
		self.state
			.read()
			.expect("state lock is never poisoned")
			.finalizations()
			.into_iter()
			.map(|(finalization_type, height)| FinalizationData { finalization_type, height })
			.collect()
	}

	/// Idempotent. Also triggered implicitly by the first Added event.
	fn start(&self) {
		if self.stopped.load(Ordering::SeqCst) {
			tracing::warn!("Multistream {} cannot be restarted after stop", self.id);
			return
		}
		if self.running.swap(true, Ordering::SeqCst) {
			return
		}
		tracing::info!("Starting multistream {}", self.id);

		let printer =
			spawn_scoped(Self::run_status_printer(self.weak_self.clone(), self.shutdown.clone()));
		self.tasks.lock().expect("tasks lock is never poisoned").push(printer);

		let mut members = self.members.lock().expect("members lock is never poisoned");
		self.apply_lag_policy(&mut members);
	}

	/// Terminal: disposes every subscription, stops lag observation, emits a
	/// final Unavailable on the status stream and closes it.
	fn stop(&self) {
		if self.stopped.swap(true, Ordering::SeqCst) {
			return
		}
		self.running.store(false, Ordering::SeqCst);
		tracing::info!("Stopping multistream {}", self.id);

		if let Some(signaller) =
			self.shutdown_signaller.lock().expect("signaller lock is never poisoned").take()
		{
			signaller.signal(());
		}

		{
			let mut members = self.members.lock().expect("members lock is never poisoned");
			members.forwarders.clear();
			members.observed.clear();
			members.lag_observer = None;
		}

		emit(&self.status_tx, UpstreamAvailability::Unavailable);
		self.status_tx.close();

		self.tasks.lock().expect("tasks lock is never poisoned").clear();
	}

	fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
	}
}
