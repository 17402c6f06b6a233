use std::{collections::BTreeSet, sync::Arc};

use crate::upstream::{Capability, Upstream};

/// The subscription topics a multistream can serve downstream. Aggregated
/// heads always make `newHeads` available; the rest depends on what the
/// members support.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct EgressSubscription {
	topics: BTreeSet<String>,
}

pub const NEW_HEADS_TOPIC: &str = "newHeads";

impl EgressSubscription {
	pub fn from_upstreams(upstreams: &[Arc<dyn Upstream>]) -> Self {
		let mut topics = BTreeSet::new();
		if !upstreams.is_empty() {
			topics.insert(NEW_HEADS_TOPIC.to_string());
		}
		if upstreams
			.iter()
			.any(|upstream| upstream.capabilities().contains(&Capability::WsHead))
		{
			topics.insert("newHeadsDirect".to_string());
		}
		Self { topics }
	}

	pub fn supports(&self, topic: &str) -> bool {
		self.topics.contains(topic)
	}

	pub fn topics(&self) -> impl Iterator<Item = &str> {
		self.topics.iter().map(String::as_str)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::TestUpstream;

	#[test]
	fn no_members_means_nothing_to_serve() {
		let egress = EgressSubscription::from_upstreams(&[]);
		assert!(!egress.supports(NEW_HEADS_TOPIC));
	}

	#[test]
	fn members_enable_new_heads() {
		let upstreams: Vec<Arc<dyn Upstream>> = vec![TestUpstream::builder("u1").build()];
		let egress = EgressSubscription::from_upstreams(&upstreams);
		assert!(egress.supports(NEW_HEADS_TOPIC));
		assert!(!egress.supports("newHeadsDirect"));
	}

	#[test]
	fn ws_head_capability_enables_direct_heads() {
		let upstreams: Vec<Arc<dyn Upstream>> =
			vec![TestUpstream::builder("u1").capability(Capability::WsHead).build()];
		let egress = EgressSubscription::from_upstreams(&upstreams);
		assert_eq!(egress.topics().collect::<Vec<_>>(), ["newHeads", "newHeadsDirect"]);
	}
}
