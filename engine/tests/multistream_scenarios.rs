//! End-to-end behaviour of a multistream fed through the public event
//! ingress, using scriptable in-memory upstreams.

use std::{sync::Arc, time::Duration};

use hex_literal::hex;
use num_bigint::BigUint;

use chainmux_engine::{
	chain::Chain,
	head::{BlockHash, BlockRef, Head},
	multistream::Multistream,
	selector::UpstreamFilter,
	testing::{block_ref, TestUpstream},
	upstream::{
		availability::UpstreamAvailability,
		event::{ChangeKind, UpstreamChangeEvent},
		rpc::JsonRpcRequest,
		Upstream,
	},
};

async fn settle() {
	tokio::time::sleep(Duration::from_millis(50)).await;
}

fn added(upstream: &Arc<TestUpstream>) -> UpstreamChangeEvent {
	UpstreamChangeEvent::new(
		Chain::Ethereum,
		upstream.clone() as Arc<dyn Upstream>,
		ChangeKind::Added,
	)
}

#[tokio::test]
async fn single_upstream_head_subscription() {
	let multistream = Multistream::new(Chain::Ethereum);
	let upstream = TestUpstream::builder("node-1").build();
	multistream.process_event(added(&upstream)).await;
	settle().await;

	let block = BlockRef::new(
		BlockHash(hex!("50d26ed1ee21a090fdf9371bc2b8f0d25b68f7fbc4c44b5b6f9bee1d9ad79ad7")),
		650246,
		BigUint::from(0x35bbde5595de6456u64),
	);
	upstream.push_block(block.clone());

	let tip = multistream
		.head()
		.wait_for_current(Duration::from_secs(1))
		.await
		.unwrap();
	assert_eq!(tip, block);
	assert_eq!(multistream.status(), UpstreamAvailability::Ok);
}

#[tokio::test]
async fn aggregate_head_follows_the_strictly_heavier_tip() {
	let multistream = Multistream::new(Chain::Ethereum);
	let upstream = TestUpstream::builder("node-1").build();
	multistream.process_event(added(&upstream)).await;
	settle().await;

	upstream.push_block(block_ref(650246, 0x35bbde5595de6456));
	upstream.push_block(block_ref(650247, 0x35bbde5595de6457));
	settle().await;

	assert_eq!(multistream.head().current_height().unwrap(), 650247);
}

#[tokio::test]
async fn aggregate_head_ignores_a_less_difficult_successor() {
	let multistream = Multistream::new(Chain::Ethereum);
	let upstream = TestUpstream::builder("node-1").build();
	multistream.process_event(added(&upstream)).await;
	settle().await;

	upstream.push_block(block_ref(650246, 0x35bbde5595de6456));
	upstream.push_block(block_ref(650247, 0x35bbde5595de6455));
	settle().await;

	assert_eq!(multistream.head().current_height().unwrap(), 650246);
	assert_eq!(multistream.status(), UpstreamAvailability::Ok);
}

#[tokio::test]
async fn heaviest_tip_wins_across_multiple_upstreams() {
	let multistream = Multistream::new(Chain::Ethereum);
	let fast = TestUpstream::builder("fast").build();
	let slow = TestUpstream::builder("slow").build();
	multistream.process_event(added(&fast)).await;
	multistream.process_event(added(&slow)).await;
	settle().await;

	slow.push_block(block_ref(650246, 0x35bbde5595de6456));
	fast.push_block(block_ref(650247, 0x35bbde5595de6457));
	// A behind-the-tip emission from the slow member changes nothing.
	slow.push_block(block_ref(650247, 0x35bbde5595de6456));
	settle().await;

	assert_eq!(multistream.head().current_height().unwrap(), 650247);
}

#[tokio::test]
async fn lag_observation_updates_member_lags() {
	let multistream = Multistream::new(Chain::Ethereum);
	let fast = TestUpstream::builder("fast").build();
	let slow = TestUpstream::builder("slow").build();
	multistream.process_event(added(&fast)).await;
	multistream.process_event(added(&slow)).await;
	settle().await;

	fast.push_block(block_ref(650247, 0x35bbde5595de6457));
	slow.push_block(block_ref(650240, 0x35bbde5595de6450));
	settle().await;

	assert_eq!(fast.lag(), Some(0));
	assert_eq!(slow.lag(), Some(7));
}

#[tokio::test]
async fn calls_route_through_the_selected_member() {
	let multistream = Multistream::new(Chain::Ethereum);
	for id in ["u1", "u2"] {
		multistream
			.process_event(added(&TestUpstream::builder(id).method("eth_blockNumber").build()))
			.await;
	}
	settle().await;

	assert!(multistream.call_methods().is_allowed("eth_blockNumber"));

	let mut apis = multistream.get_api_source(UpstreamFilter::default());
	assert!(!apis.is_empty());
	let reader = apis.try_next_reader().unwrap();
	let response = reader
		.read(JsonRpcRequest::no_params("eth_blockNumber"))
		.await
		.unwrap();
	let raw = response.into_result().unwrap();
	assert!(raw.get().contains("eth_blockNumber"));
}

#[tokio::test]
async fn cache_aware_upstreams_receive_the_cache_handle_on_adoption() {
	use chainmux_engine::cache::{CacheSink, CacheTag};

	#[derive(Default)]
	struct RecordingCache {
		blocks: std::sync::Mutex<Vec<u64>>,
	}
	impl CacheSink for RecordingCache {
		fn cache(&self, _tag: CacheTag, block: &BlockRef) {
			self.blocks.lock().unwrap().push(block.height);
		}

		fn set_head(&self, _head: Arc<dyn Head>) {}
	}

	let cache = Arc::new(RecordingCache::default());
	let multistream = Multistream::with_cache(Chain::Ethereum, Some(cache.clone()));
	let upstream = TestUpstream::builder("u1").cache_aware().build();
	multistream.process_event(added(&upstream)).await;
	settle().await;

	// The adopted upstream was handed the shared cache.
	assert!(upstream.installed_cache().is_some());

	// Promotions of the aggregate tip are mirrored into the cache.
	upstream.push_block(block_ref(650246, 0x35bbde5595de6456));
	settle().await;
	assert_eq!(*cache.blocks.lock().unwrap(), vec![650246]);
}
