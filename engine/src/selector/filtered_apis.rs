use std::{collections::VecDeque, sync::Arc};

use itertools::Itertools;

use crate::{
	chain::Chain,
	errors::MultistreamError,
	selector::{FilterSort, UpstreamFilter},
	upstream::{rpc::IngressReader, Upstream, UpstreamId, UpstreamRole},
};

/// An ordered, finite, single-pass sequence of api handles for one request.
///
/// Construction order:
/// 1. filter the snapshot by the matcher,
/// 2. partition primaries before fallbacks,
/// 3. rotate each partition by `seed % len` so load spreads across callers,
/// 4. stable-sort each rotated partition by the filter's sort strategy.
///
/// Callers walk the sequence until one api succeeds. An empty sequence is a
/// different failure from every api failing; check [FilteredApis::is_empty]
/// before walking.
pub struct FilteredApis {
	chain: Chain,
	ordered: VecDeque<Arc<dyn Upstream>>,
}

impl FilteredApis {
	pub fn new(
		chain: Chain,
		upstreams: &[Arc<dyn Upstream>],
		filter: &UpstreamFilter,
		seed: u32,
	) -> Self {
		let (primary, fallback): (Vec<_>, Vec<_>) = upstreams
			.iter()
			.filter(|upstream| filter.matcher.matches(upstream.as_ref()))
			.cloned()
			.partition(|upstream| upstream.role() == UpstreamRole::Primary);

		let ordered = arrange(primary, filter.sort, seed)
			.into_iter()
			.chain(arrange(fallback, filter.sort, seed))
			.collect();

		Self { chain, ordered }
	}

	pub fn chain(&self) -> Chain {
		self.chain
	}

	pub fn is_empty(&self) -> bool {
		self.ordered.is_empty()
	}

	pub fn len(&self) -> usize {
		self.ordered.len()
	}

	/// The ids in dispatch order, without consuming the sequence.
	pub fn upstream_ids(&self) -> Vec<UpstreamId> {
		self.ordered.iter().map(|upstream| upstream.id()).collect()
	}

	/// Walks forward to the next upstream that can hand out an ingress
	/// reader. Exhaustion means every candidate was filtered out or failing.
	pub fn try_next_reader(&mut self) -> Result<Arc<dyn IngressReader>, MultistreamError> {
		while let Some(upstream) = self.ordered.pop_front() {
			match upstream.ingress_reader() {
				Ok(reader) => return Ok(reader),
				Err(e) => {
					tracing::debug!("Skipping upstream {} without a reader: {e}", upstream.id());
				},
			}
		}
		Err(MultistreamError::UpstreamUnavailable)
	}
}

impl Iterator for FilteredApis {
	type Item = Arc<dyn Upstream>;

	fn next(&mut self) -> Option<Self::Item> {
		self.ordered.pop_front()
	}
}

fn arrange(
	mut partition: Vec<Arc<dyn Upstream>>,
	sort: FilterSort,
	seed: u32,
) -> Vec<Arc<dyn Upstream>> {
	if partition.is_empty() {
		return partition
	}
	let len = partition.len();
	partition.rotate_left(seed as usize % len);

	match sort {
		FilterSort::AvailabilityAndLag => partition
			.into_iter()
			// Stable: upstreams with equal keys keep their rotated order.
			.sorted_by_key(|upstream| {
				(!upstream.is_available(), upstream.lag().unwrap_or(u64::MAX))
			})
			.collect(),
		FilterSort::HighestHeight => partition
			.into_iter()
			.sorted_by_key(|upstream| std::cmp::Reverse(upstream.current_height().unwrap_or(0)))
			.collect(),
	}
}
