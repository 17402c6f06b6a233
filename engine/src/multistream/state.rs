use std::{
	collections::{BTreeMap, BTreeSet},
	sync::Arc,
};

use futures::stream::BoxStream;

use crate::{
	constants::BROADCAST_BUFFER,
	egress::EgressSubscription,
	upstream::{
		availability::UpstreamAvailability,
		call_methods::CallMethods,
		Capability, FinalizationType, Labels, LowerBoundType, Upstream, UpstreamRole,
	},
};

/// Label sets present among the members, with how many members carry each.
/// Downstream quorum enforcement selects over these groups.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct QuorumForLabels(pub Vec<QuorumItem>);

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct QuorumItem {
	pub labels: Labels,
	pub count: usize,
}

/// Which derived aspects changed in one reduction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StateAspect {
	Status,
	Methods,
	Capabilities,
	QuorumLabels,
	LowerBounds,
	Finalizations,
	Egress,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MultistreamStateEvent {
	pub changed: Vec<StateAspect>,
}

/// Snapshot of everything a multistream derives from its member set. Only
/// the orchestrator writes (serialized on its event task); readers take the
/// getters concurrently.
pub struct MultistreamState {
	status: UpstreamAvailability,
	call_methods: Arc<CallMethods>,
	capabilities: BTreeSet<Capability>,
	quorum_labels: QuorumForLabels,
	lower_bounds: BTreeMap<LowerBoundType, u64>,
	finalizations: BTreeMap<FinalizationType, u64>,
	egress: EgressSubscription,
	events_tx: async_broadcast::Sender<MultistreamStateEvent>,
	_events_keepalive: async_broadcast::InactiveReceiver<MultistreamStateEvent>,
}

impl Default for MultistreamState {
	fn default() -> Self {
		Self::new()
	}
}

impl MultistreamState {
	pub fn new() -> Self {
		let (mut events_tx, events_rx) = async_broadcast::broadcast(BROADCAST_BUFFER);
		events_tx.set_overflow(true);
		Self {
			status: UpstreamAvailability::Unavailable,
			call_methods: Arc::new(CallMethods::pending()),
			capabilities: BTreeSet::new(),
			quorum_labels: QuorumForLabels::default(),
			lower_bounds: BTreeMap::new(),
			finalizations: BTreeMap::new(),
			egress: EgressSubscription::default(),
			events_tx,
			_events_keepalive: events_rx.deactivate(),
		}
	}

	/// Re-derives every aspect from the current member list and broadcasts a
	/// diff naming the aspects that changed.
	pub fn update_state(&mut self, upstreams: &[Arc<dyn Upstream>], egress: EgressSubscription) {
		let mut changed = Vec::new();

		let status = reduce_status(upstreams);
		if status != self.status {
			self.status = status;
			changed.push(StateAspect::Status);
		}

		let call_methods = Arc::new(reduce_methods(upstreams));
		if call_methods != self.call_methods {
			self.call_methods = call_methods;
			changed.push(StateAspect::Methods);
		}

		let capabilities: BTreeSet<Capability> =
			upstreams.iter().flat_map(|upstream| upstream.capabilities()).collect();
		if capabilities != self.capabilities {
			self.capabilities = capabilities;
			changed.push(StateAspect::Capabilities);
		}

		let quorum_labels = reduce_quorum_labels(upstreams);
		if quorum_labels != self.quorum_labels {
			self.quorum_labels = quorum_labels;
			changed.push(StateAspect::QuorumLabels);
		}

		let lower_bounds = reduce_lower_bounds(upstreams);
		if lower_bounds != self.lower_bounds {
			self.lower_bounds = lower_bounds;
			changed.push(StateAspect::LowerBounds);
		}

		let finalizations = reduce_finalizations(upstreams);
		if finalizations != self.finalizations {
			self.finalizations = finalizations;
			changed.push(StateAspect::Finalizations);
		}

		if egress != self.egress {
			self.egress = egress;
			changed.push(StateAspect::Egress);
		}

		if !changed.is_empty() {
			match self.events_tx.try_broadcast(MultistreamStateEvent { changed }) {
				Ok(_) | Err(async_broadcast::TrySendError::Inactive(_)) => {},
				Err(e) => {
					tracing::error!("Dropping multistream state event: {e}");
				},
			}
		}
	}

	pub fn status(&self) -> UpstreamAvailability {
		self.status
	}

	/// Pending (rejecting every method) until the first reduction.
	pub fn call_methods(&self) -> Arc<CallMethods> {
		self.call_methods.clone()
	}

	pub fn capabilities(&self) -> BTreeSet<Capability> {
		self.capabilities.clone()
	}

	pub fn quorum_labels(&self) -> QuorumForLabels {
		self.quorum_labels.clone()
	}

	pub fn lower_bounds(&self) -> BTreeMap<LowerBoundType, u64> {
		self.lower_bounds.clone()
	}

	pub fn finalizations(&self) -> BTreeMap<FinalizationType, u64> {
		self.finalizations.clone()
	}

	pub fn egress(&self) -> EgressSubscription {
		self.egress.clone()
	}

	pub fn events(&self) -> BoxStream<'static, MultistreamStateEvent> {
		Box::pin(self.events_tx.new_receiver())
	}
}

fn reduce_status(upstreams: &[Arc<dyn Upstream>]) -> UpstreamAvailability {
	upstreams
		.iter()
		.map(|upstream| upstream.status())
		.min()
		.unwrap_or(UpstreamAvailability::Unavailable)
}

/// A method is callable iff some primary allows it, or every primary is
/// unusable and a fallback allows it.
fn reduce_methods(upstreams: &[Arc<dyn Upstream>]) -> CallMethods {
	if upstreams.is_empty() {
		return CallMethods::pending()
	}

	let any_primary_usable = upstreams
		.iter()
		.any(|upstream| upstream.role() == UpstreamRole::Primary && upstream.is_available());

	let mut methods = BTreeSet::new();
	for upstream in upstreams {
		let counted = match upstream.role() {
			UpstreamRole::Primary => true,
			UpstreamRole::Fallback => !any_primary_usable,
		};
		if counted {
			if let Ok(allowed) = upstream.call_methods().methods() {
				methods.extend(allowed.iter().cloned());
			}
		}
	}
	CallMethods::ready(methods)
}

fn reduce_quorum_labels(upstreams: &[Arc<dyn Upstream>]) -> QuorumForLabels {
	let mut groups: BTreeMap<Labels, usize> = BTreeMap::new();
	for upstream in upstreams {
		let labels = upstream.labels();
		if !labels.is_empty() {
			*groups.entry(labels).or_default() += 1;
		}
	}
	QuorumForLabels(groups.into_iter().map(|(labels, count)| QuorumItem { labels, count }).collect())
}

/// The aggregate can serve anything at least one member can, so the reported
/// bound per type is the lowest bound any member offers.
fn reduce_lower_bounds(upstreams: &[Arc<dyn Upstream>]) -> BTreeMap<LowerBoundType, u64> {
	let mut bounds: BTreeMap<LowerBoundType, u64> = BTreeMap::new();
	for upstream in upstreams {
		for bound in upstream.lower_bounds() {
			bounds
				.entry(bound.bound_type)
				.and_modify(|height| *height = (*height).min(bound.height))
				.or_insert(bound.height);
		}
	}
	bounds
}

fn reduce_finalizations(upstreams: &[Arc<dyn Upstream>]) -> BTreeMap<FinalizationType, u64> {
	let mut finalizations: BTreeMap<FinalizationType, u64> = BTreeMap::new();
	for upstream in upstreams {
		for data in upstream.finalizations() {
			finalizations
				.entry(data.finalization_type)
				.and_modify(|height| *height = (*height).min(data.height))
				.or_insert(data.height);
		}
	}
	finalizations
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		testing::TestUpstream,
		upstream::{LowerBoundData, UpstreamRole},
	};
	use futures::StreamExt;

	fn reduce(state: &mut MultistreamState, upstreams: &[Arc<dyn Upstream>]) {
		state.update_state(upstreams, EgressSubscription::from_upstreams(upstreams));
	}

	#[test]
	fn empty_member_set_is_unavailable_and_pending() {
		let mut state = MultistreamState::new();
		reduce(&mut state, &[]);
		assert_eq!(state.status(), UpstreamAvailability::Unavailable);
		assert!(state.call_methods().methods().is_err());
		assert!(state.capabilities().is_empty());
	}

	#[test]
	fn status_reduces_to_the_worst_member() {
		let ok = TestUpstream::builder("ok").build();
		let lagging = TestUpstream::builder("lagging").build();
		lagging.set_status(UpstreamAvailability::Lagging);

		let mut state = MultistreamState::new();
		reduce(&mut state, &[ok.clone() as Arc<dyn Upstream>, lagging]);
		assert_eq!(state.status(), UpstreamAvailability::Lagging);

		reduce(&mut state, &[ok as Arc<dyn Upstream>]);
		assert_eq!(state.status(), UpstreamAvailability::Ok);
	}

	#[test]
	fn fallback_methods_count_only_when_primaries_are_down() {
		let primary = TestUpstream::builder("primary").method("eth_call").build();
		let fallback = TestUpstream::builder("fallback")
			.role(UpstreamRole::Fallback)
			.method("eth_getLogs")
			.build();

		let members: Vec<Arc<dyn Upstream>> = vec![primary.clone(), fallback];

		let mut state = MultistreamState::new();
		reduce(&mut state, &members);
		let methods = state.call_methods();
		assert!(methods.is_allowed("eth_call"));
		assert!(!methods.is_allowed("eth_getLogs"));

		primary.set_status(UpstreamAvailability::Unavailable);
		reduce(&mut state, &members);
		let methods = state.call_methods();
		assert!(methods.is_allowed("eth_getLogs"));
	}

	#[test]
	fn lower_bounds_take_the_minimum_per_type() {
		let deep = TestUpstream::builder("deep")
			.lower_bound(LowerBoundData { bound_type: LowerBoundType::State, height: 1_000 })
			.build();
		let shallow = TestUpstream::builder("shallow")
			.lower_bound(LowerBoundData { bound_type: LowerBoundType::State, height: 5_000 })
			.lower_bound(LowerBoundData { bound_type: LowerBoundType::Trace, height: 9_000 })
			.build();

		let mut state = MultistreamState::new();
		reduce(&mut state, &[deep as Arc<dyn Upstream>, shallow]);
		assert_eq!(state.lower_bounds()[&LowerBoundType::State], 1_000);
		assert_eq!(state.lower_bounds()[&LowerBoundType::Trace], 9_000);
	}

	#[test]
	fn quorum_labels_group_members_with_identical_label_sets() {
		let a = TestUpstream::builder("a").label("provider", "infura").build();
		let b = TestUpstream::builder("b").label("provider", "infura").build();
		let c = TestUpstream::builder("c").label("provider", "alchemy").build();

		let mut state = MultistreamState::new();
		reduce(&mut state, &[a as Arc<dyn Upstream>, b, c]);

		let quorum = state.quorum_labels();
		assert_eq!(quorum.0.len(), 2);
		let infura = quorum
			.0
			.iter()
			.find(|item| item.labels.get("provider") == Some("infura"))
			.unwrap();
		assert_eq!(infura.count, 2);
	}

	#[tokio::test]
	async fn reductions_emit_diffs_only_on_change() {
		let upstream = TestUpstream::builder("u").method("eth_call").build();
		let members: Vec<Arc<dyn Upstream>> = vec![upstream];

		let mut state = MultistreamState::new();
		let mut events = state.events();

		reduce(&mut state, &members);
		let event = events.next().await.unwrap();
		assert!(event.changed.contains(&StateAspect::Status));
		assert!(event.changed.contains(&StateAspect::Methods));

		// Same members, same values: no event.
		reduce(&mut state, &members);
		assert!(futures::poll!(events.next()).is_pending());
	}
}
