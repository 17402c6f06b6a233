use std::{fmt, sync::Arc};

use crate::{chain::Chain, upstream::Upstream};

/// How an upstream's relationship to its multistream changed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ChangeKind {
	/// The upstream joined (or should join) the multistream.
	Added,
	/// The upstream left; the multistream stops it.
	Removed,
	/// The driver re-validated the upstream; no state change required.
	Revalidated,
	/// Some derived property (methods, labels, bounds) changed.
	Updated,
	/// The upstream was discovered but is not yet a member.
	Observed,
	/// The driver already stopped the upstream due to broken settings; the
	/// multistream removes it without calling stop again.
	FatalSettingsErrorRemoved,
}

#[derive(Clone)]
pub struct UpstreamChangeEvent {
	pub chain: Chain,
	pub upstream: Arc<dyn Upstream>,
	pub kind: ChangeKind,
}

impl UpstreamChangeEvent {
	pub fn new(chain: Chain, upstream: Arc<dyn Upstream>, kind: ChangeKind) -> Self {
		Self { chain, upstream, kind }
	}
}

impl fmt::Debug for UpstreamChangeEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("UpstreamChangeEvent")
			.field("chain", &self.chain)
			.field("upstream", &self.upstream.id())
			.field("kind", &self.kind)
			.finish()
	}
}
