use std::collections::BTreeSet;

use crate::errors::MultistreamError;

/// The set of JSON-RPC methods an upstream (or the aggregate) will accept.
///
/// Kept as an explicit pending-vs-ready sum so that "queried before the
/// first upstream was adopted" is a stable error instead of a panic inside a
/// lazily-built factory.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum CallMethods {
	Pending,
	Ready { methods: BTreeSet<String> },
}

impl CallMethods {
	pub fn pending() -> Self {
		CallMethods::Pending
	}

	pub fn ready(methods: BTreeSet<String>) -> Self {
		CallMethods::Ready { methods }
	}

	pub fn from_iter<I: IntoIterator<Item = String>>(methods: I) -> Self {
		CallMethods::Ready { methods: methods.into_iter().collect() }
	}

	/// A pending set allows nothing.
	pub fn is_allowed(&self, method: &str) -> bool {
		match self {
			CallMethods::Pending => false,
			CallMethods::Ready { methods } => methods.contains(method),
		}
	}

	pub fn methods(&self) -> Result<&BTreeSet<String>, MultistreamError> {
		match self {
			CallMethods::Pending => Err(MultistreamError::NotInitialized),
			CallMethods::Ready { methods } => Ok(methods),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pending_set_errors_and_allows_nothing() {
		let methods = CallMethods::pending();
		assert!(matches!(methods.methods(), Err(MultistreamError::NotInitialized)));
		assert!(!methods.is_allowed("eth_blockNumber"));
	}

	#[test]
	fn ready_set_answers_membership() {
		let methods = CallMethods::from_iter(["eth_blockNumber".to_string(), "eth_call".to_string()]);
		assert!(methods.is_allowed("eth_call"));
		assert!(!methods.is_allowed("eth_sendRawTransaction"));
		assert_eq!(methods.methods().unwrap().len(), 2);
	}
}
