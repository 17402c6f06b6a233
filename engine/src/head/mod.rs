pub mod aggregate;
pub mod lag_observer;

use std::{fmt, time::Duration};

use futures::stream::BoxStream;
use num_bigint::BigUint;
use tokio::sync::watch;

use crate::{constants::BROADCAST_BUFFER, errors::MultistreamError};

/// 32-byte block hash, displayed as lowercase hex without a `0x` prefix to
/// match the wire contract of head subscriptions.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
	pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
		Ok(BlockHash(bytes.try_into().map_err(|_| {
			anyhow::anyhow!("block hash must be exactly 32 bytes, got {}", bytes.len())
		})?))
	}

	pub fn from_hex(s: &str) -> anyhow::Result<Self> {
		Self::from_slice(&hex::decode(s.trim_start_matches("0x"))?)
	}
}

impl fmt::Display for BlockHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&hex::encode(self.0))
	}
}

impl fmt::Debug for BlockHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "BlockHash({self})")
	}
}

/// A block as observed on some upstream. `weight` is the chain's cumulative
/// work measure (total difficulty on proof-of-work chains); head promotion
/// is decided on weight alone, never on height.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlockRef {
	pub hash: BlockHash,
	pub height: u64,
	pub weight: BigUint,
}

impl BlockRef {
	pub fn new(hash: BlockHash, height: u64, weight: BigUint) -> Self {
		Self { hash, height, weight }
	}
}

/// A lazy sequence of the heaviest blocks seen so far, with a "current best"
/// snapshot accessor.
#[async_trait::async_trait]
pub trait Head: Send + Sync {
	/// Lock-free snapshot of the current best block, if any was promoted.
	fn current(&self) -> Option<BlockRef>;

	fn current_height(&self) -> Result<u64, MultistreamError> {
		self.current().map(|block| block.height).ok_or(MultistreamError::NotInitialized)
	}

	/// Blocks until a best block exists, up to the caller-supplied timeout.
	async fn wait_for_current(&self, timeout: Duration) -> Result<BlockRef, MultistreamError>;

	/// Stream of promoted blocks. Subscribers only see promotions that
	/// happen after they subscribe; use [Head::current] for the snapshot.
	fn flux(&self) -> BoxStream<'static, BlockRef>;

	/// Feed an observation. The head advances iff the incoming weight
	/// strictly exceeds the current one; ties and lighter blocks are
	/// ignored (first seen wins).
	fn on_next(&self, block: BlockRef);
}

/// Head implementation backed by a watch snapshot plus a broadcast flux.
pub struct StandardHead {
	current: watch::Sender<Option<BlockRef>>,
	flux_tx: async_broadcast::Sender<BlockRef>,
	// Keeps the flux channel open while nobody is subscribed.
	_flux_keepalive: async_broadcast::InactiveReceiver<BlockRef>,
}

impl Default for StandardHead {
	fn default() -> Self {
		Self::new()
	}
}

impl StandardHead {
	pub fn new() -> Self {
		let (current, _) = watch::channel(None);
		let (mut flux_tx, flux_rx) = async_broadcast::broadcast(BROADCAST_BUFFER);
		// Slow subscribers lag rather than block promotion.
		flux_tx.set_overflow(true);
		Self { current, flux_tx, _flux_keepalive: flux_rx.deactivate() }
	}

	/// Applies the strictly-greater-weight rule. Returns whether the block
	/// became the new current best.
	pub fn promote(&self, block: BlockRef) -> bool {
		let promoted = self.current.send_if_modified(|current| match current {
			Some(best) if block.weight <= best.weight => false,
			_ => {
				*current = Some(block.clone());
				true
			},
		});

		if promoted {
			match self.flux_tx.try_broadcast(block) {
				Ok(_) => {},
				// No active subscribers right now; nothing to deliver.
				Err(async_broadcast::TrySendError::Inactive(_)) => {},
				Err(e) => {
					tracing::error!("Dropping head block emission: {e}");
				},
			}
		}
		promoted
	}
}

#[async_trait::async_trait]
impl Head for StandardHead {
	fn current(&self) -> Option<BlockRef> {
		self.current.borrow().clone()
	}

	async fn wait_for_current(&self, timeout: Duration) -> Result<BlockRef, MultistreamError> {
		let mut rx = self.current.subscribe();
		tokio::time::timeout(timeout, async move {
			loop {
				if let Some(block) = rx.borrow_and_update().clone() {
					break block
				}
				if rx.changed().await.is_err() {
					// The head was dropped; only the timeout can end this.
					futures::future::pending::<()>().await;
				}
			}
		})
		.await
		.map_err(|_| MultistreamError::HeadTimeout(timeout))
	}

	fn flux(&self) -> BoxStream<'static, BlockRef> {
		Box::pin(self.flux_tx.new_receiver())
	}

	fn on_next(&self, block: BlockRef) {
		self.promote(block);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::block_ref;
	use futures::StreamExt;

	#[tokio::test]
	async fn promotes_only_strictly_heavier_blocks() {
		let head = StandardHead::new();
		assert!(head.promote(block_ref(650246, 0x35bbde5595de6456)));
		assert_eq!(head.current_height().unwrap(), 650246);

		// Heavier successor advances the head.
		assert!(head.promote(block_ref(650247, 0x35bbde5595de6457)));
		assert_eq!(head.current_height().unwrap(), 650247);

		// A lighter block is ignored even though its height is larger.
		assert!(!head.promote(block_ref(650248, 0x35bbde5595de6455)));
		assert_eq!(head.current_height().unwrap(), 650247);

		// Ties are ignored: first seen wins.
		assert!(!head.promote(block_ref(650248, 0x35bbde5595de6457)));
		assert_eq!(head.current_height().unwrap(), 650247);
	}

	#[tokio::test]
	async fn current_height_before_any_block_is_not_initialized() {
		let head = StandardHead::new();
		assert!(matches!(head.current_height(), Err(MultistreamError::NotInitialized)));
	}

	#[tokio::test]
	async fn wait_for_current_times_out_when_no_block_arrives() {
		let head = StandardHead::new();
		assert!(matches!(
			head.wait_for_current(Duration::from_millis(50)).await,
			Err(MultistreamError::HeadTimeout(_))
		));
	}

	#[tokio::test]
	async fn wait_for_current_resolves_once_a_block_is_promoted() {
		let head = std::sync::Arc::new(StandardHead::new());

		let waiter = {
			let head = head.clone();
			tokio::spawn(async move { head.wait_for_current(Duration::from_secs(5)).await })
		};
		tokio::task::yield_now().await;

		head.on_next(block_ref(650246, 0x35bbde5595de6456));
		assert_eq!(waiter.await.unwrap().unwrap().height, 650246);
	}

	#[tokio::test]
	async fn flux_only_sees_promotions_after_subscription() {
		let head = StandardHead::new();
		head.on_next(block_ref(1, 100));

		let mut flux = head.flux();
		head.on_next(block_ref(2, 200));
		head.on_next(block_ref(3, 150)); // lighter, not promoted
		head.on_next(block_ref(4, 300));

		assert_eq!(flux.next().await.unwrap().height, 2);
		assert_eq!(flux.next().await.unwrap().height, 4);
	}
}
