use super::SyncMetrics;
use crate::sync::Stage;
use color_eyre::Result;
use opentelemetry::{
	global,
	metrics::{Counter, Gauge, Histogram, MeterProvider},
	KeyValue,
};
use opentelemetry_otlp::{MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::{
	metrics::{PeriodicReader, SdkMeterProvider},
	runtime,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

const METER_NAME: &str = "validator_sync";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OtelConfig {
	/// Export metrics to the OpenTelemetry collector (default: false).
	pub ot_enabled: bool,
	/// OpenTelemetry Collector endpoint (default: `http://127.0.0.1:4317`)
	pub ot_collector_endpoint: String,
	/// Export period in seconds (default: 60).
	pub ot_export_period: u64,
	/// Export timeout in seconds (default: 10).
	pub ot_export_timeout: u64,
}

impl Default for OtelConfig {
	fn default() -> Self {
		Self {
			ot_enabled: false,
			ot_collector_endpoint: "http://127.0.0.1:4317".to_string(),
			ot_export_period: 60,
			ot_export_timeout: 10,
		}
	}
}

#[derive(Clone)]
pub struct Metrics {
	stage_duration: Histogram<f64>,
	stage_processed: Counter<u64>,
	stage_failed: Counter<u64>,
	synced_epoch: Gauge<u64>,
	overruns: Counter<u64>,
	failed_syncs: Counter<u64>,
	attributes: Vec<KeyValue>,
	meter_provider: SdkMeterProvider,
}

impl Metrics {
	fn attributes_with_stage(&self, stage: Stage) -> Vec<KeyValue> {
		let mut attributes = self.attributes.clone();
		attributes.push(KeyValue::new("stage", stage.to_string()));
		attributes
	}

	/// Flushes pending exports and stops the periodic reader.
	pub fn shutdown(&self) -> Result<()> {
		self.meter_provider.shutdown()?;
		Ok(())
	}
}

pub fn initialize(attributes: Vec<(&str, String)>, config: &OtelConfig) -> Result<Metrics> {
	info!(
		"Initializing sync metrics with endpoint: {}",
		config.ot_collector_endpoint
	);

	let exporter = MetricExporter::builder()
		.with_tonic()
		.with_endpoint(&config.ot_collector_endpoint)
		.with_protocol(Protocol::Grpc)
		.with_timeout(Duration::from_secs(config.ot_export_timeout))
		.build()?;

	let reader = PeriodicReader::builder(exporter, runtime::Tokio)
		.with_interval(Duration::from_secs(config.ot_export_period))
		.build();

	let meter_provider = SdkMeterProvider::builder().with_reader(reader).build();
	global::set_meter_provider(meter_provider.clone());

	let meter = meter_provider.meter(METER_NAME);

	let stage_duration = meter
		.f64_histogram("validator_sync.stage.duration_ms")
		.with_description("Duration of a sync stage in milliseconds")
		.with_unit("ms")
		.build();

	let stage_processed = meter
		.u64_counter("validator_sync.stage.processed")
		.with_description("Items processed by a sync stage")
		.build();

	let stage_failed = meter
		.u64_counter("validator_sync.stage.failed")
		.with_description("Items a sync stage failed to process")
		.build();

	let synced_epoch = meter
		.u64_gauge("validator_sync.epoch")
		.with_description("Last successfully synced epoch")
		.build();

	let overruns = meter
		.u64_counter("validator_sync.overruns")
		.with_description("Syncs that took longer than the poll interval")
		.build();

	let failed_syncs = meter
		.u64_counter("validator_sync.failures")
		.with_description("Syncs aborted by a fatal stage error")
		.build();

	let attributes = attributes
		.into_iter()
		.map(|(k, v)| KeyValue::new(k.to_string(), v))
		.collect();

	Ok(Metrics {
		stage_duration,
		stage_processed,
		stage_failed,
		synced_epoch,
		overruns,
		failed_syncs,
		attributes,
		meter_provider,
	})
}

impl SyncMetrics for Metrics {
	fn record_stage(&self, stage: Stage, elapsed: Duration, processed: u64, failed: u64) {
		let attributes = self.attributes_with_stage(stage);
		self.stage_duration
			.record(elapsed.as_secs_f64() * 1000.0, &attributes);
		self.stage_processed.add(processed, &attributes);
		self.stage_failed.add(failed, &attributes);
	}

	fn record_synced_epoch(&self, epoch: u64) {
		self.synced_epoch.record(epoch, &self.attributes);
	}

	fn count_overrun(&self) {
		self.overruns.add(1, &self.attributes);
	}

	fn count_failed_sync(&self) {
		self.failed_syncs.add(1, &self.attributes);
	}
}
