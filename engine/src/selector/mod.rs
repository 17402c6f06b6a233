pub mod filtered_apis;

use crate::upstream::{Capability, Labels, Upstream};

/// Matches upstreams advertising a label with one of the given values.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LabelSelector {
	pub name: String,
	pub values: Vec<String>,
}

impl LabelSelector {
	pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
		Self { name: name.into(), values }
	}

	pub fn matches(&self, labels: &Labels) -> bool {
		labels.get(&self.name).is_some_and(|value| self.values.iter().any(|v| v == value))
	}
}

/// Predicate over upstreams used to pick api sources for a request.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub enum Matcher {
	#[default]
	Anything,
	Label(LabelSelector),
	Capability(Capability),
	And(Vec<Matcher>),
	Or(Vec<Matcher>),
}

impl Matcher {
	pub fn matches(&self, upstream: &dyn Upstream) -> bool {
		match self {
			Matcher::Anything => true,
			Matcher::Label(selector) => selector.matches(&upstream.labels()),
			Matcher::Capability(capability) => upstream.capabilities().contains(capability),
			Matcher::And(matchers) => matchers.iter().all(|m| m.matches(upstream)),
			Matcher::Or(matchers) => matchers.iter().any(|m| m.matches(upstream)),
		}
	}
}

/// Ordering applied within each role partition after rotation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FilterSort {
	/// Available upstreams before unavailable ones, lower lag first.
	#[default]
	AvailabilityAndLag,
	/// Upstreams with the highest observed head first.
	HighestHeight,
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct UpstreamFilter {
	pub matcher: Matcher,
	pub sort: FilterSort,
}

impl UpstreamFilter {
	pub fn matching(matcher: Matcher) -> Self {
		Self { matcher, sort: FilterSort::default() }
	}
}
