use std::sync::Arc;

use futures::StreamExt;
use utilities::{task::spawn_scoped, ScopedJoinHandle};

use crate::upstream::Upstream;

/// Derives each upstream's lag from the member heads: on every head advance,
/// `lag = max(heights) − height`, floored at zero. An upstream whose height
/// is not yet known keeps its previous lag rather than being reset.
///
/// Only created when a multistream has two or more members; a single
/// upstream is by definition at lag zero.
pub struct HeadLagObserver {
	_task: ScopedJoinHandle<()>,
}

impl HeadLagObserver {
	pub fn spawn(upstreams: Vec<Arc<dyn Upstream>>) -> Self {
		let task = spawn_scoped(run(upstreams));
		Self { _task: task }
	}

	/// Disposes the head subscriptions. Dropping the observer has the same
	/// effect.
	pub fn stop(self) {
		drop(self);
	}
}

async fn run(upstreams: Vec<Arc<dyn Upstream>>) {
	let mut heights: Vec<Option<u64>> =
		upstreams.iter().map(|upstream| upstream.current_height()).collect();

	let mut merged = futures::stream::select_all(upstreams.iter().enumerate().map(
		|(index, upstream)| upstream.head().flux().map(move |block| (index, block)).boxed(),
	));

	// Push an initial round in case some members already have heads.
	push_lags(&upstreams, &heights);

	while let Some((index, block)) = merged.next().await {
		heights[index] = Some(block.height);
		push_lags(&upstreams, &heights);
	}
}

fn push_lags(upstreams: &[Arc<dyn Upstream>], heights: &[Option<u64>]) {
	let Some(max_height) = heights.iter().flatten().copied().max() else {
		return
	};

	for (upstream, height) in upstreams.iter().zip(heights) {
		if let Some(height) = height {
			upstream.set_lag(max_height.saturating_sub(*height));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{block_ref, TestUpstream};
	use std::time::Duration;

	async fn settle() {
		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	#[tokio::test]
	async fn computes_lag_relative_to_the_best_height() {
		let fast = TestUpstream::builder("fast").build();
		let slow = TestUpstream::builder("slow").build();

		let _observer =
			HeadLagObserver::spawn(vec![fast.clone() as Arc<dyn Upstream>, slow.clone()]);
		settle().await;

		fast.push_block(block_ref(100, 1_000));
		slow.push_block(block_ref(94, 940));
		settle().await;

		assert_eq!(fast.lag(), Some(0));
		assert_eq!(slow.lag(), Some(6));
	}

	#[tokio::test]
	async fn unknown_height_keeps_previous_lag() {
		let fast = TestUpstream::builder("fast").build();
		let silent = TestUpstream::builder("silent").build();

		let _observer =
			HeadLagObserver::spawn(vec![fast.clone() as Arc<dyn Upstream>, silent.clone()]);
		settle().await;

		fast.push_block(block_ref(100, 1_000));
		settle().await;

		// The silent upstream never reported a height: no spurious reset.
		assert_eq!(silent.lag(), None);
		assert_eq!(fast.lag(), Some(0));
	}

	#[tokio::test]
	async fn lag_shrinks_when_the_laggard_catches_up() {
		let a = TestUpstream::builder("a").build();
		let b = TestUpstream::builder("b").build();

		let _observer = HeadLagObserver::spawn(vec![a.clone() as Arc<dyn Upstream>, b.clone()]);
		settle().await;

		a.push_block(block_ref(100, 1_000));
		b.push_block(block_ref(98, 980));
		settle().await;
		assert_eq!(b.lag(), Some(2));

		b.push_block(block_ref(100, 1_001));
		settle().await;
		assert_eq!(b.lag(), Some(0));
	}
}
