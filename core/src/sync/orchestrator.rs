use super::{
	attestations::{self, AttestationOutcome},
	peers::{self, PeerOutcome},
	registry::{self, RegistryOutcome},
	statistics::{self, StatisticsInput},
	BestEffort, Criticality, Stage, SyncCheckpoint, SyncConfig,
};
use crate::{
	data::{scan_all, RecordStore},
	network::{attestation::AttestationSource, crawler::PeerCrawler},
	telemetry::SyncMetrics,
	types::{Address, NetworkStatsSnapshot},
};
use chrono::Utc;
use color_eyre::{eyre::WrapErr, Result};
use futures::Future;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug)]
pub struct SyncReport {
	pub epoch: u64,
	pub registry: RegistryOutcome,
	pub attestations: AttestationOutcome,
	pub peers: PeerOutcome,
	pub statistics: BestEffort<NetworkStatsSnapshot>,
	pub elapsed: Duration,
}

/// Item counts reported to metrics for a finished stage.
trait StageCounts {
	fn processed(&self) -> u64;
	fn failed(&self) -> u64;
}

impl StageCounts for RegistryOutcome {
	fn processed(&self) -> u64 {
		(self.ensured + self.active_flags_updated) as u64
	}

	fn failed(&self) -> u64 {
		self.failed as u64
	}
}

impl StageCounts for AttestationOutcome {
	fn processed(&self) -> u64 {
		(self.updated + self.history_inserted) as u64
	}

	fn failed(&self) -> u64 {
		(self.ensure_failed + self.history_failed) as u64
	}
}

impl StageCounts for PeerOutcome {
	fn processed(&self) -> u64 {
		self.updated as u64
	}

	fn failed(&self) -> u64 {
		0
	}
}

impl StageCounts for BestEffort<NetworkStatsSnapshot> {
	fn processed(&self) -> u64 {
		self.completed().map_or(0, |_| 1)
	}

	fn failed(&self) -> u64 {
		self.completed().map_or(1, |_| 0)
	}
}

/// Runs the reconciliation stages of one sync pass, in order.
pub struct Orchestrator<S: ?Sized, A, P> {
	store: Arc<S>,
	attestations: A,
	crawler: P,
	metrics: Arc<dyn SyncMetrics>,
	config: SyncConfig,
}

impl<S, A, P> Orchestrator<S, A, P>
where
	S: RecordStore + ?Sized,
	A: AttestationSource,
	P: PeerCrawler,
{
	pub fn new(
		store: Arc<S>,
		attestations: A,
		crawler: P,
		metrics: Arc<dyn SyncMetrics>,
		config: SyncConfig,
	) -> Self {
		Self {
			store,
			attestations,
			crawler,
			metrics,
			config,
		}
	}

	pub fn store(&self) -> &S {
		&self.store
	}

	pub fn config(&self) -> &SyncConfig {
		&self.config
	}

	async fn timed<T, F>(&self, stage: Stage, future: F) -> Result<T>
	where
		T: StageCounts,
		F: Future<Output = Result<T>>,
	{
		let started = Instant::now();
		let result = future.instrument(info_span!("stage", %stage)).await;
		let elapsed = started.elapsed();

		match &result {
			Ok(outcome) => {
				info!(%stage, ?elapsed, "Stage completed");
				self.metrics
					.record_stage(stage, elapsed, outcome.processed(), outcome.failed());
			},
			Err(error) => {
				match stage.criticality() {
					Criticality::Fatal => error!(%stage, ?elapsed, "Stage failed, aborting pass: {error:#}"),
					Criticality::BestEffort => warn!(%stage, ?elapsed, "Stage failed: {error:#}"),
				}
				self.metrics.record_stage(stage, elapsed, 0, 1);
			},
		}
		result.wrap_err_with(|| format!("Stage {stage} failed"))
	}

	/// Runs all stages for the epoch. The first fatal stage error aborts the pass.
	pub async fn run(
		&self,
		epoch: u64,
		on_chain: Vec<Address>,
		checkpoint: &mut SyncCheckpoint,
	) -> Result<SyncReport> {
		let started = Instant::now();
		let result = self.run_stages(epoch, on_chain, checkpoint, started).await;
		if result.is_err() {
			self.metrics.count_failed_sync();
		}
		result
	}

	async fn run_stages(
		&self,
		epoch: u64,
		on_chain: Vec<Address>,
		checkpoint: &mut SyncCheckpoint,
		started: Instant,
	) -> Result<SyncReport> {
		let store = self.store.as_ref();
		let config = &self.config;

		let RecordsWith(registry, records) = self
			.timed(Stage::Registry, async {
				let mut outcome = registry::reconcile(store, &on_chain, checkpoint, config).await;
				let records = scan_all(store, config.scan_page_size)
					.await
					.wrap_err("Unable to scan validator records")?;
				outcome.active_flags_updated =
					registry::refresh_active_flags(store, &on_chain, &records)
						.await
						.wrap_err("Unable to update active set flags")?;
				Ok(RecordsWith(outcome, records))
			})
			.await?;

		let addresses = records
			.into_iter()
			.map(|record| record.address)
			.collect::<Vec<_>>();

		let attestations = self
			.timed(
				Stage::Attestations,
				attestations::reconcile(
					store,
					&self.attestations,
					&addresses,
					checkpoint,
					config,
					Utc::now(),
				),
			)
			.await?;

		let PeersWith(peers, listing) = self
			.timed(Stage::Peers, async {
				let (outcome, listing) =
					peers::reconcile(store, &self.crawler, checkpoint, config).await?;
				Ok(PeersWith(outcome, listing))
			})
			.await?;

		let stats_started = Instant::now();
		let input = StatisticsInput {
			epoch,
			on_chain: on_chain.len(),
			current_slot: checkpoint.last_attestation_slot(),
			peers: &listing,
			now: Utc::now(),
		};
		let statistics = statistics::aggregate(store, input, config)
			.instrument(info_span!("stage", stage = %Stage::Statistics))
			.await;
		self.metrics.record_stage(
			Stage::Statistics,
			stats_started.elapsed(),
			statistics.processed(),
			statistics.failed(),
		);

		let report = SyncReport {
			epoch,
			registry,
			attestations,
			peers,
			statistics,
			elapsed: started.elapsed(),
		};
		info!(
			epoch,
			ensured = report.registry.ensured,
			registry_failed = report.registry.failed,
			telemetry_skipped = report.attestations.skipped,
			performance_updated = report.attestations.updated,
			history_inserted = report.attestations.history_inserted,
			peers_updated = report.peers.updated,
			statistics_stored = !report.statistics.is_failed(),
			elapsed = ?report.elapsed,
			"Sync pass completed"
		);
		Ok(report)
	}
}

/// Registry outcome paired with the fresh record scan.
struct RecordsWith(RegistryOutcome, Vec<crate::types::ValidatorRecord>);

impl StageCounts for RecordsWith {
	fn processed(&self) -> u64 {
		self.0.processed()
	}

	fn failed(&self) -> u64 {
		self.0.failed()
	}
}

/// Peer outcome paired with the crawler listing.
struct PeersWith(PeerOutcome, Vec<crate::network::crawler::Peer>);

impl StageCounts for PeersWith {
	fn processed(&self) -> u64 {
		self.0.processed()
	}

	fn failed(&self) -> u64 {
		self.0.failed()
	}
}
