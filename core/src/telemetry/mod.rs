use crate::sync::Stage;
use std::time::Duration;

pub mod otlp;

/// Sink for sync engine metrics.
///
/// The engine only records through this trait, so exporting is optional.
pub trait SyncMetrics: Send + Sync {
	/// Records duration and processed/failed item counts of one stage run.
	fn record_stage(&self, stage: Stage, elapsed: Duration, processed: u64, failed: u64);
	fn record_synced_epoch(&self, epoch: u64);
	/// Counts a sync that took longer than the poll interval.
	fn count_overrun(&self);
	/// Counts a sync aborted by a fatal stage error.
	fn count_failed_sync(&self);
}

/// Metrics sink used when no collector is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl SyncMetrics for NoopMetrics {
	fn record_stage(&self, _: Stage, _: Duration, _: u64, _: u64) {}
	fn record_synced_epoch(&self, _: u64) {}
	fn count_overrun(&self) {}
	fn count_failed_sync(&self) {}
}

#[cfg(test)]
pub mod tests {
	use super::*;
	use std::sync::Mutex;

	/// Keeps every recorded value for assertions.
	#[derive(Default)]
	pub struct RecordingMetrics {
		pub stages: Mutex<Vec<(Stage, u64, u64)>>,
		pub epochs: Mutex<Vec<u64>>,
		pub overruns: Mutex<u64>,
		pub failed_syncs: Mutex<u64>,
	}

	impl SyncMetrics for RecordingMetrics {
		fn record_stage(&self, stage: Stage, _: Duration, processed: u64, failed: u64) {
			self.stages.lock().unwrap().push((stage, processed, failed));
		}

		fn record_synced_epoch(&self, epoch: u64) {
			self.epochs.lock().unwrap().push(epoch);
		}

		fn count_overrun(&self) {
			*self.overruns.lock().unwrap() += 1;
		}

		fn count_failed_sync(&self) {
			*self.failed_syncs.lock().unwrap() += 1;
		}
	}
}
