use super::rpc;
use crate::types::{duration_seconds_format, Address};
use async_trait::async_trait;
use color_eyre::Result;
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const LOCAL_CHAIN_ENDPOINT: &str = "http://127.0.0.1:8545";

const CURRENT_EPOCH_METHOD: &str = "chain_currentEpoch";
const VALIDATOR_SET_METHOD: &str = "chain_validatorSet";

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct ChainConfig {
	/// JSON-RPC endpoint of the chain node (default: http://127.0.0.1:8545).
	pub chain_endpoint: String,
	/// Chain request timeout in seconds (default: 10).
	#[serde(with = "duration_seconds_format")]
	pub chain_request_timeout: Duration,
}

impl Default for ChainConfig {
	fn default() -> Self {
		Self {
			chain_endpoint: LOCAL_CHAIN_ENDPOINT.to_string(),
			chain_request_timeout: Duration::from_secs(10),
		}
	}
}

/// Reads epoch progress and the validator committee from the chain.
#[async_trait]
#[automock]
pub trait ChainReader: Send + Sync {
	async fn current_epoch(&self) -> Result<u64>;
	async fn current_validator_set(&self) -> Result<Vec<Address>>;
}

#[derive(Clone)]
pub struct Client {
	rpc: rpc::Client,
}

impl Client {
	pub fn new(config: &ChainConfig) -> Result<Self> {
		Ok(Self {
			rpc: rpc::Client::new(&config.chain_endpoint, config.chain_request_timeout)?,
		})
	}
}

#[async_trait]
impl ChainReader for Client {
	async fn current_epoch(&self) -> Result<u64> {
		self.rpc.call(CURRENT_EPOCH_METHOD).await
	}

	async fn current_validator_set(&self) -> Result<Vec<Address>> {
		self.rpc.call(VALIDATOR_SET_METHOD).await
	}
}
