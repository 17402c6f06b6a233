/// One-shot latch used to signal a value (typically shutdown) to any number
/// of holders of the matching [Signal].
pub struct Signaller<T> {
	sender: async_broadcast::Sender<T>,
}
impl<T: Clone + Send + 'static> Signaller<T> {
	pub fn signal(self, t: T) {
		match self.sender.try_broadcast(t) {
			Ok(None) | Err(async_broadcast::TrySendError::Closed(_)) => {},
			_ => panic!("Signal can only be signalled once"),
		}
	}
}

#[derive(Clone)]
pub enum Signal<T> {
	Pending(async_broadcast::Receiver<T>),
	Signalled(T),
}
impl<T: Clone + Send + 'static> Signal<T> {
	pub fn new() -> (Signaller<T>, Self) {
		let (sender, receiver) = async_broadcast::broadcast(1);

		(Signaller { sender }, Self::Pending(receiver))
	}

	pub fn signalled(t: T) -> Self {
		Self::Signalled(t)
	}

	pub fn get(&mut self) -> Option<&T> {
		match self {
			Signal::Pending(receiver) => match receiver.try_recv() {
				Ok(t) => {
					*self = Self::Signalled(t);
					match self {
						Signal::Pending(_) => unreachable!(),
						Signal::Signalled(t) => Some(t),
					}
				},
				Err(_err) => None,
			},
			Signal::Signalled(t) => Some(t),
		}
	}

	pub async fn wait(self) -> T {
		match self {
			Signal::Pending(mut receiver) => match receiver.recv().await {
				Ok(t) => t,
				Err(_err) => futures::future::pending().await,
			},
			Signal::Signalled(t) => t,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn signal_starts_pending_then_resolves() {
		let (signaller, mut signal) = Signal::<()>::new();
		assert!(signal.get().is_none());
		signaller.signal(());
		assert!(signal.get().is_some());
		signal.wait().await;
	}

	#[tokio::test]
	async fn wait_resolves_for_clones_created_before_signal() {
		let (signaller, signal) = Signal::<u32>::new();
		let cloned = signal.clone();
		signaller.signal(7);
		assert_eq!(cloned.wait().await, 7);
		assert_eq!(signal.wait().await, 7);
	}

	#[tokio::test]
	async fn pre_signalled_signal_is_immediately_available() {
		let mut signal = Signal::signalled(3u8);
		assert_eq!(signal.get(), Some(&3));
	}
}
