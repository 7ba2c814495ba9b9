use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};
use tracing::trace;

#[derive(Serialize)]
struct Request<'a> {
	jsonrpc: &'static str,
	id: u64,
	method: &'a str,
	params: [(); 0],
}

#[derive(Deserialize)]
struct Response<T> {
	result: Option<T>,
	error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
	pub code: i64,
	pub message: String,
}

/// JSON-RPC 2.0 client over HTTP, one POST per call.
#[derive(Clone)]
pub struct Client {
	http: reqwest::Client,
	endpoint: String,
	next_id: Arc<AtomicU64>,
}

impl Client {
	pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
		Ok(Self {
			http: super::http_client(timeout)?,
			endpoint: endpoint.to_string(),
			next_id: Arc::new(AtomicU64::new(1)),
		})
	}

	pub async fn call<T: DeserializeOwned>(&self, method: &str) -> Result<T> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		trace!(method, id, endpoint = self.endpoint, "Sending RPC request");

		let response = self
			.http
			.post(&self.endpoint)
			.json(&Request {
				jsonrpc: "2.0",
				id,
				method,
				params: [],
			})
			.send()
			.await
			.wrap_err_with(|| format!("RPC request {method} to {} failed", self.endpoint))?
			.error_for_status()
			.wrap_err_with(|| format!("RPC request {method} rejected"))?
			.json::<Response<T>>()
			.await
			.wrap_err_with(|| format!("Malformed RPC response for {method}"))?;

		if let Some(RpcError { code, message }) = response.error {
			return Err(eyre!("RPC call {method} failed with code {code}: {message}"));
		}
		response
			.result
			.ok_or_else(|| eyre!("RPC call {method} returned no result"))
	}
}
