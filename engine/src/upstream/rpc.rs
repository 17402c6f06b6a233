use jsonrpsee::{
	core::{client::ClientT, traits::ToRpcParams},
	http_client::{HttpClient, HttpClientBuilder},
};
use serde_json::value::RawValue;
use utilities::SecretUrl;

/// A native JSON-RPC call as routed through the aggregator. Params are kept
/// raw so a request passes through without re-serialisation.
#[derive(Clone, Debug)]
pub struct JsonRpcRequest {
	pub method: String,
	pub params: Option<Box<RawValue>>,
}

impl JsonRpcRequest {
	pub fn new(method: impl Into<String>, params: &serde_json::Value) -> Self {
		Self {
			method: method.into(),
			params: Some(
				RawValue::from_string(params.to_string())
					.expect("serde_json::Value always serialises to valid JSON"),
			),
		}
	}

	pub fn no_params(method: impl Into<String>) -> Self {
		Self { method: method.into(), params: None }
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsonRpcError {
	pub code: i32,
	pub message: String,
}

#[derive(Clone, Debug)]
pub enum JsonRpcResponse {
	Result(Box<RawValue>),
	Error(JsonRpcError),
}

impl JsonRpcResponse {
	pub fn result(value: serde_json::Value) -> Self {
		JsonRpcResponse::Result(
			RawValue::from_string(value.to_string())
				.expect("serde_json::Value always serialises to valid JSON"),
		)
	}

	pub fn error(code: i32, message: impl Into<String>) -> Self {
		JsonRpcResponse::Error(JsonRpcError { code, message: message.into() })
	}

	/// The raw result, or an error for JSON-RPC level failures.
	pub fn into_result(self) -> anyhow::Result<Box<RawValue>> {
		match self {
			JsonRpcResponse::Result(raw) => Ok(raw),
			JsonRpcResponse::Error(e) => {
				Err(anyhow::anyhow!("JSON-RPC error {}: {}", e.code, e.message))
			},
		}
	}
}

/// Direct JSON-RPC dispatch to one upstream. A transport failure is an
/// `Err`; a JSON-RPC level error from the node is a successful read of
/// [JsonRpcResponse::Error].
#[async_trait::async_trait]
pub trait IngressReader: Send + Sync {
	async fn read(&self, request: JsonRpcRequest) -> anyhow::Result<JsonRpcResponse>;
}

struct RawParams(Option<Box<RawValue>>);

impl ToRpcParams for RawParams {
	fn to_rpc_params(self) -> Result<Option<Box<RawValue>>, serde_json::Error> {
		Ok(self.0)
	}
}

/// [IngressReader] over a jsonrpsee HTTP client.
pub struct HttpIngressReader {
	client: HttpClient,
}

impl HttpIngressReader {
	pub fn new(endpoint: &SecretUrl, timeout: std::time::Duration) -> anyhow::Result<Self> {
		Ok(Self {
			client: HttpClientBuilder::default()
				.request_timeout(timeout)
				.build(endpoint.as_ref())?,
		})
	}
}

#[async_trait::async_trait]
impl IngressReader for HttpIngressReader {
	async fn read(&self, request: JsonRpcRequest) -> anyhow::Result<JsonRpcResponse> {
		match self
			.client
			.request::<Box<RawValue>, _>(&request.method, RawParams(request.params))
			.await
		{
			Ok(raw) => Ok(JsonRpcResponse::Result(raw)),
			Err(jsonrpsee::core::ClientError::Call(e)) => Ok(JsonRpcResponse::Error(
				JsonRpcError { code: e.code(), message: e.message().to_string() },
			)),
			Err(e) => Err(anyhow::Error::new(e).context("JSON-RPC transport failure")),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_params_pass_through_unchanged() {
		let request = JsonRpcRequest::new("eth_getBlockByNumber", &serde_json::json!(["latest", false]));
		assert_eq!(request.params.unwrap().get(), r#"["latest",false]"#);
	}

	#[test]
	fn response_error_surfaces_code_and_message() {
		let response = JsonRpcResponse::error(-32601, "method not found");
		let err = response.into_result().unwrap_err();
		assert!(err.to_string().contains("-32601"));
		assert!(err.to_string().contains("method not found"));
	}

	#[test]
	fn response_result_keeps_raw_json() {
		let response = JsonRpcResponse::result(serde_json::json!({"number": "0x9ec86"}));
		assert_eq!(response.into_result().unwrap().get(), r#"{"number":"0x9ec86"}"#);
	}
}
