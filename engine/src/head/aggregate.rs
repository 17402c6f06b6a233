use std::{sync::Arc, time::Duration};

use futures::stream::BoxStream;
use utilities::ScopedJoinHandle;

use crate::{
	cache::{CacheSink, CacheTag},
	errors::MultistreamError,
	head::{BlockRef, Head, StandardHead},
};

/// The canonical chain tip as seen by a multistream: follows the heaviest
/// block across all member heads. Member emissions are forwarded in by the
/// orchestrator; promotion applies the same strictly-greater-weight rule as
/// a single-upstream head, so the aggregate weight never decreases and
/// equals the maximum weight observed so far.
pub struct AggregateHead {
	inner: StandardHead,
	cache: std::sync::RwLock<Option<Arc<dyn CacheSink>>>,
}

impl Default for AggregateHead {
	fn default() -> Self {
		Self::new()
	}
}

impl AggregateHead {
	pub fn new() -> Self {
		Self { inner: StandardHead::new(), cache: std::sync::RwLock::new(None) }
	}

	/// Rebinds the cache: every future promotion is mirrored to it with
	/// [CacheTag::Latest].
	pub fn set_cache(&self, cache: Arc<dyn CacheSink>) {
		*self.cache.write().expect("cache lock is never poisoned") = Some(cache);
	}
}

#[async_trait::async_trait]
impl Head for AggregateHead {
	fn current(&self) -> Option<BlockRef> {
		self.inner.current()
	}

	async fn wait_for_current(&self, timeout: Duration) -> Result<BlockRef, MultistreamError> {
		self.inner.wait_for_current(timeout).await
	}

	fn flux(&self) -> BoxStream<'static, BlockRef> {
		self.inner.flux()
	}

	fn on_next(&self, block: BlockRef) {
		if self.inner.promote(block.clone()) {
			if let Some(cache) = self.cache.read().expect("cache lock is never poisoned").as_ref() {
				cache.cache(CacheTag::Latest, &block);
			}
		}
	}
}

/// A head over the subset of upstreams accepted by a matcher. Forwarding
/// tasks live as long as the head itself.
pub struct SubsetHead {
	inner: Arc<StandardHead>,
	_forwarders: Vec<ScopedJoinHandle<()>>,
}

impl SubsetHead {
	pub fn new(inner: Arc<StandardHead>, forwarders: Vec<ScopedJoinHandle<()>>) -> Self {
		Self { inner, _forwarders: forwarders }
	}
}

#[async_trait::async_trait]
impl Head for SubsetHead {
	fn current(&self) -> Option<BlockRef> {
		self.inner.current()
	}

	async fn wait_for_current(&self, timeout: Duration) -> Result<BlockRef, MultistreamError> {
		self.inner.wait_for_current(timeout).await
	}

	fn flux(&self) -> BoxStream<'static, BlockRef> {
		self.inner.flux()
	}

	fn on_next(&self, block: BlockRef) {
		self.inner.on_next(block);
	}
}
