use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::{fs, time::Duration};
use tracing::Level;
use validator_sync_core::{
	network::{attestation::AttestationConfig, chain::ChainConfig, crawler::CrawlerConfig},
	sync::SyncConfig,
	telemetry::otlp::OtelConfig,
	types::tracing_level_format,
};

#[derive(Parser)]
#[command(version)]
pub struct CliOpts {
	/// Path to the toml configuration file
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<String>,
	/// Sets verbosity level.
	#[arg(long)]
	pub verbosity: Option<Level>,
	/// Sets logs format to JSON.
	#[arg(long)]
	pub logs_json: bool,
	/// Cleans DB state.
	#[arg(long)]
	pub clean: bool,
	/// RocksDB store location
	#[arg(long)]
	pub db_path: Option<String>,
	/// JSON-RPC endpoint of the chain node
	#[arg(long)]
	pub chain_endpoint: Option<String>,
	/// JSON-RPC endpoint of the attestation telemetry node
	#[arg(long)]
	pub attestation_endpoint: Option<String>,
	/// Base URL of the peer crawler API
	#[arg(long)]
	pub crawler_endpoint: Option<String>,
	/// Epoch poll interval in seconds
	#[arg(long)]
	pub poll_interval: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Log level.
	#[serde(with = "tracing_level_format")]
	pub log_level: Level,
	/// Log format: JSON for `true`, plain text for `false`.
	pub log_format_json: bool,
	/// Database file system path.
	pub db_path: String,
	#[serde(flatten)]
	pub sync: SyncConfig,
	#[serde(flatten)]
	pub chain: ChainConfig,
	#[serde(flatten)]
	pub attestation: AttestationConfig,
	#[serde(flatten)]
	pub crawler: CrawlerConfig,
	#[serde(flatten)]
	pub otel: OtelConfig,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			log_level: Level::INFO,
			log_format_json: false,
			db_path: "./validator_sync_db".to_string(),
			sync: Default::default(),
			chain: Default::default(),
			attestation: Default::default(),
			crawler: Default::default(),
			otel: Default::default(),
		}
	}
}

pub fn load(opts: &CliOpts) -> Result<Config> {
	let mut config = match &opts.config {
		Some(path) => {
			fs::metadata(path).map_err(|_| eyre!("Provided config file {path} doesn't exist."))?;
			confy::load_path(path)?
		},
		None => Config::default(),
	};

	config.log_level = opts.verbosity.unwrap_or(config.log_level);
	config.log_format_json = opts.logs_json || config.log_format_json;

	if let Some(db_path) = &opts.db_path {
		config.db_path = db_path.clone();
	}
	if let Some(endpoint) = &opts.chain_endpoint {
		config.chain.chain_endpoint = endpoint.clone();
	}
	if let Some(endpoint) = &opts.attestation_endpoint {
		config.attestation.attestation_endpoint = endpoint.clone();
	}
	if let Some(endpoint) = &opts.crawler_endpoint {
		config.crawler.crawler_endpoint = endpoint.clone();
	}
	if let Some(poll_interval) = opts.poll_interval {
		config.sync.poll_interval = Duration::from_secs(poll_interval);
	}

	validate(&config)?;
	Ok(config)
}

fn validate(config: &Config) -> Result<()> {
	if config.sync.poll_interval.is_zero() {
		return Err(eyre!("Poll interval must be greater than zero"));
	}
	if config.sync.registry_batch.size == 0 || config.sync.history_batch.size == 0 {
		return Err(eyre!("Batch sizes must be greater than zero"));
	}
	if config.sync.scan_page_size == 0 || config.sync.crawler_page_size == 0 {
		return Err(eyre!("Page sizes must be greater than zero"));
	}
	Ok(())
}
