use std::time::Duration;

/// Stable error taxonomy exposed at the aggregation API boundary. Transient
/// plumbing failures stay as `anyhow::Error` internally.
#[derive(Debug, thiserror::Error)]
pub enum MultistreamError {
	/// State was queried before the first upstream was adopted.
	#[error("multistream is not initialized yet")]
	NotInitialized,

	/// Every candidate upstream was filtered out or is failing.
	#[error("no upstream available for the request")]
	UpstreamUnavailable,

	/// The current-block accessor exceeded its caller-supplied duration.
	#[error("no head block received within {0:?}")]
	HeadTimeout(Duration),

	/// Operations that are meaningless on an aggregated upstream.
	#[error("not supported on an aggregated upstream: {0}")]
	Unsupported(&'static str),
}

impl MultistreamError {
	pub fn is_recoverable(&self) -> bool {
		matches!(self, MultistreamError::HeadTimeout(_) | MultistreamError::UpstreamUnavailable)
	}
}
