use crate::types::duration_seconds_format;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::WrapErr, Result};
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

pub const LOCAL_CRAWLER_ENDPOINT: &str = "http://127.0.0.1:8080";

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct CrawlerConfig {
	/// Base URL of the peer crawler API (default: http://127.0.0.1:8080).
	pub crawler_endpoint: String,
	/// Optional API key sent with every crawler request (default: None).
	pub crawler_api_key: Option<String>,
	/// Crawler request timeout in seconds (default: 30).
	#[serde(with = "duration_seconds_format")]
	pub crawler_request_timeout: Duration,
}

impl Default for CrawlerConfig {
	fn default() -> Self {
		Self {
			crawler_endpoint: LOCAL_CRAWLER_ENDPOINT.to_string(),
			crawler_api_key: None,
			crawler_request_timeout: Duration::from_secs(30),
		}
	}
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geo {
	pub country: Option<String>,
	pub city: Option<String>,
	/// ISP or autonomous system name.
	#[serde(alias = "asName", alias = "org")]
	pub isp: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct NetworkAddress {
	pub ip: String,
	pub port: u16,
	#[serde(default)]
	pub geo: Option<Geo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
	pub id: String,
	pub client: String,
	pub last_seen: DateTime<Utc>,
	#[serde(default)]
	pub block_height: Option<u64>,
	#[serde(default)]
	pub synced: Option<bool>,
	#[serde(default)]
	pub addresses: Vec<NetworkAddress>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPage {
	pub peers: Vec<Peer>,
	#[serde(default)]
	pub next_token: Option<String>,
}

/// Paginated listing of network peers.
#[async_trait]
#[automock]
pub trait PeerCrawler: Send + Sync {
	async fn list_peers(&self, page_size: usize, continuation: Option<String>) -> Result<PeerPage>;
}

#[derive(Clone)]
pub struct Client {
	http: reqwest::Client,
	endpoint: String,
	api_key: Option<String>,
}

impl Client {
	pub fn new(config: &CrawlerConfig) -> Result<Self> {
		Ok(Self {
			http: super::http_client(config.crawler_request_timeout)?,
			endpoint: config.crawler_endpoint.trim_end_matches('/').to_string(),
			api_key: config.crawler_api_key.clone(),
		})
	}
}

#[async_trait]
impl PeerCrawler for Client {
	async fn list_peers(&self, page_size: usize, continuation: Option<String>) -> Result<PeerPage> {
		let url = format!("{}/peers", self.endpoint);
		trace!(url, page_size, ?continuation, "Listing crawler peers");

		let mut request = self
			.http
			.get(&url)
			.query(&[("limit", page_size.to_string())]);
		if let Some(cursor) = &continuation {
			request = request.query(&[("cursor", cursor)]);
		}
		if let Some(api_key) = &self.api_key {
			request = request.header(API_KEY_HEADER, api_key);
		}

		request
			.send()
			.await
			.wrap_err_with(|| format!("Peer crawler request to {url} failed"))?
			.error_for_status()
			.wrap_err("Peer crawler rejected the request")?
			.json::<PeerPage>()
			.await
			.wrap_err("Malformed peer crawler response")
	}
}
