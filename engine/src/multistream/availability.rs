use std::collections::HashMap;

use crate::upstream::{availability::UpstreamAvailability, UpstreamId};

/// Reducer behind the aggregate status stream: tracks the latest status per
/// member and emits the min (worst) across them, deduplicating consecutive
/// equal values.
///
/// Entries are evicted when the member is removed, so the map is bounded by
/// the current membership rather than growing with upstream churn.
#[derive(Default)]
pub struct FilterBestAvailability {
	statuses: HashMap<UpstreamId, UpstreamAvailability>,
	last_emitted: Option<UpstreamAvailability>,
}

impl FilterBestAvailability {
	pub fn new() -> Self {
		Self::default()
	}

	/// Current aggregate without recording an emission.
	pub fn current(&self) -> UpstreamAvailability {
		self.statuses.values().copied().min().unwrap_or(UpstreamAvailability::Unavailable)
	}

	/// Records a member status. Returns the new aggregate iff it differs
	/// from the last emitted one.
	pub fn update(
		&mut self,
		id: UpstreamId,
		status: UpstreamAvailability,
	) -> Option<UpstreamAvailability> {
		self.statuses.insert(id, status);
		self.emit_if_changed()
	}

	/// Drops a removed member's entry. Returns the new aggregate iff the
	/// removal changed it.
	pub fn evict(&mut self, id: &UpstreamId) -> Option<UpstreamAvailability> {
		self.statuses.remove(id);
		self.emit_if_changed()
	}

	fn emit_if_changed(&mut self) -> Option<UpstreamAvailability> {
		let aggregate = self.current();
		if self.last_emitted == Some(aggregate) {
			None
		} else {
			self.last_emitted = Some(aggregate);
			Some(aggregate)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn id(s: &str) -> UpstreamId {
		UpstreamId::from(s)
	}

	#[test]
	fn aggregate_is_the_worst_member_status() {
		let mut reducer = FilterBestAvailability::new();
		assert_eq!(reducer.update(id("a"), UpstreamAvailability::Ok), Some(UpstreamAvailability::Ok));
		assert_eq!(
			reducer.update(id("b"), UpstreamAvailability::Lagging),
			Some(UpstreamAvailability::Lagging)
		);
		// A third healthy member does not mask the laggard.
		assert_eq!(reducer.update(id("c"), UpstreamAvailability::Ok), None);
	}

	#[test]
	fn consecutive_duplicates_are_not_emitted() {
		let mut reducer = FilterBestAvailability::new();
		assert!(reducer.update(id("a"), UpstreamAvailability::Ok).is_some());
		assert_eq!(reducer.update(id("a"), UpstreamAvailability::Ok), None);
	}

	#[test]
	fn eviction_recovers_the_aggregate() {
		let mut reducer = FilterBestAvailability::new();
		reducer.update(id("ok"), UpstreamAvailability::Ok);
		reducer.update(id("lagging"), UpstreamAvailability::Lagging);

		assert_eq!(reducer.evict(&id("lagging")), Some(UpstreamAvailability::Ok));
	}

	#[test]
	fn evicting_the_last_member_goes_unavailable() {
		let mut reducer = FilterBestAvailability::new();
		reducer.update(id("a"), UpstreamAvailability::Ok);
		assert_eq!(reducer.evict(&id("a")), Some(UpstreamAvailability::Unavailable));
	}

	#[test]
	fn unknown_eviction_changes_nothing() {
		let mut reducer = FilterBestAvailability::new();
		reducer.update(id("a"), UpstreamAvailability::Ok);
		assert_eq!(reducer.evict(&id("ghost")), None);
	}
}
