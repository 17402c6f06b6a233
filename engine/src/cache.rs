use std::sync::Arc;

use crate::head::{BlockRef, Head};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheTag {
	Latest,
}

/// Seam to the external cache subsystem. The aggregation core only ever
/// pushes: the latest promoted block, and the head to follow.
pub trait CacheSink: Send + Sync {
	fn cache(&self, tag: CacheTag, block: &BlockRef);

	fn set_head(&self, head: Arc<dyn Head>);
}

/// Used when no cache is configured.
#[derive(Default)]
pub struct NoopCache;

impl CacheSink for NoopCache {
	fn cache(&self, _tag: CacheTag, _block: &BlockRef) {}

	fn set_head(&self, _head: Arc<dyn Head>) {}
}
