use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use config::Config;
use std::{fs, path::Path, sync::Arc};
use tracing::{info, span, warn, Level};
use validator_sync_core::{
	network::{attestation, chain, crawler},
	shutdown::Controller,
	sync::{EpochMonitor, Orchestrator},
	telemetry::{otlp, NoopMetrics, SyncMetrics},
	utils::{default_subscriber, install_panic_hooks, json_subscriber, spawn_in_span},
};

#[cfg(not(feature = "rocksdb"))]
use validator_sync_core::data::MemoryStore as Store;
#[cfg(feature = "rocksdb")]
use validator_sync_core::data::RocksStore as Store;

mod config;

fn clean_db_state(path: &str) -> Result<()> {
	if !Path::new(path).exists() {
		return Ok(());
	};
	info!("Cleaning up local state directory");
	Ok(fs::remove_dir_all(path)?)
}

#[cfg(feature = "rocksdb")]
fn open_store(config: &Config) -> Result<Store> {
	Store::open(&config.db_path)
}

#[cfg(not(feature = "rocksdb"))]
fn open_store(_: &Config) -> Result<Store> {
	warn!("Built without RocksDB, records are kept in memory only");
	Ok(Store::default())
}

#[tokio::main]
pub async fn main() -> Result<()> {
	let shutdown = Controller::new();
	let opts = config::CliOpts::parse();
	let config = config::load(&opts)?;

	if config.log_format_json {
		tracing::subscriber::set_global_default(json_subscriber(config.log_level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(config.log_level))?;
	}

	install_panic_hooks(shutdown.clone())?;

	let span = span!(Level::INFO, "run");
	let _enter = config.log_format_json.then(|| span.enter());

	spawn_in_span(shutdown.on_user_signal("User signaled shutdown".to_string()));

	if opts.clean {
		clean_db_state(&config.db_path)?;
	};

	let store = open_store(&config)?;

	let reason = spawn_in_span(run(config, store, shutdown.clone())).await??;
	info!("Shutdown completed: {reason}");
	Ok(())
}

async fn run(config: Config, store: Store, shutdown: Controller<String>) -> Result<String> {
	let version = clap::crate_version!();
	info!("Running validator sync monitor v{version}");
	info!("Using configuration: {config:?}");

	let otel = if config.otel.ot_enabled {
		let attributes = vec![
			("role", "validator-sync".to_string()),
			("version", version.to_string()),
		];
		Some(
			otlp::initialize(attributes, &config.otel)
				.wrap_err("Unable to initialize OpenTelemetry service")?,
		)
	} else {
		None
	};
	let metrics: Arc<dyn SyncMetrics> = match &otel {
		Some(otel) => Arc::new(otel.clone()),
		None => Arc::new(NoopMetrics),
	};

	let chain = chain::Client::new(&config.chain).wrap_err("Unable to create chain client")?;
	let attestations = attestation::Client::new(&config.attestation)
		.wrap_err("Unable to create attestation telemetry client")?;
	let crawler =
		crawler::Client::new(&config.crawler).wrap_err("Unable to create peer crawler client")?;

	let orchestrator = Orchestrator::new(
		Arc::new(store),
		attestations,
		crawler,
		metrics.clone(),
		config.sync.clone(),
	);
	let monitor = EpochMonitor::new(chain, orchestrator, metrics, config.sync.poll_interval);

	let reason = match shutdown.with_cancel(monitor.run()).await {
		Ok(()) => "Epoch monitor stopped".to_string(),
		Err(reason) => reason,
	};

	if let Some(otel) = otel {
		if let Err(error) = otel.shutdown() {
			warn!("Unable to flush metrics: {error:#}");
		}
	}
	Ok(reason)
}
