pub mod redact_endpoint_secret;
pub mod signal;
pub mod task;

pub use redact_endpoint_secret::SecretUrl;
pub use signal::{Signal, Signaller};
pub use task::ScopedJoinHandle;

use core::{
	pin::Pin,
	task::{Context, Poll},
};
use futures::Stream;

/// Creates an interval that ticks every `period` without bunching up missed
/// ticks. If `yield_immediately` is false the first tick happens one full
/// period from now.
pub fn make_periodic_tick(period: std::time::Duration, yield_immediately: bool) -> tokio::time::Interval {
	let mut interval = tokio::time::interval_at(
		tokio::time::Instant::now() + if yield_immediately { std::time::Duration::ZERO } else { period },
		period,
	);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	interval
}

/// For streams used inside select loops: when the stream is exhausted, park
/// forever instead of returning `None`, so an empty source never terminates
/// the loop.
pub trait UnendingStream: Stream {
	fn next_or_pending(&mut self) -> NextOrPending<'_, Self>
	where
		Self: Unpin,
	{
		NextOrPending { stream: self }
	}
}
impl<T: Stream> UnendingStream for T {}

pub struct NextOrPending<'a, S: ?Sized> {
	stream: &'a mut S,
}
impl<S: Stream + Unpin + ?Sized> std::future::Future for NextOrPending<'_, S> {
	type Output = S::Item;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.stream).poll_next(cx) {
			Poll::Ready(Some(item)) => Poll::Ready(item),
			// Exhausted streams stay pending so select loops keep running.
			Poll::Ready(None) => Poll::Pending,
			Poll::Pending => Poll::Pending,
		}
	}
}
