use core::{
	future::Future,
	pin::Pin,
	task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};

/// A join handle that aborts its task when dropped, so a task cannot outlive
/// the component that spawned it.
#[derive(Debug)]
pub struct ScopedJoinHandle<T> {
	handle: JoinHandle<T>,
}

impl<T> ScopedJoinHandle<T> {
	pub fn new(handle: JoinHandle<T>) -> Self {
		Self { handle }
	}

	pub fn abort(&self) {
		self.handle.abort();
	}

	pub fn is_finished(&self) -> bool {
		self.handle.is_finished()
	}
}

pub fn spawn_scoped<F>(future: F) -> ScopedJoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	ScopedJoinHandle::new(tokio::spawn(future))
}

impl<T> Drop for ScopedJoinHandle<T> {
	fn drop(&mut self) {
		self.handle.abort();
	}
}

impl<T> Future for ScopedJoinHandle<T> {
	type Output = Result<T, JoinError>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.handle).poll(cx)
	}
}
