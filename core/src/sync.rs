//! Epoch-triggered differential sync of validator records.
//!
//! # Flow
//!
//! * [`epoch_monitor::EpochMonitor`] polls the chain and starts a sync once per new epoch
//! * [`orchestrator::Orchestrator`] runs the stages in order:
//!   registry, attestations, peers, statistics
//! * [`checkpoint::SyncCheckpoint`] carries what previous passes already processed,
//!   so each pass only writes what changed
//!
//! Registry, attestations and peers are fatal stages: their error aborts the pass.
//! Statistics are best-effort and never abort a pass.

use crate::types::{duration_millis_format, duration_seconds_format};
use color_eyre::Report;
use futures::Future;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::Display;
use tokio_retry::strategy::{jitter, ExponentialBackoff, FibonacciBackoff};

pub mod attestations;
pub mod checkpoint;
pub mod epoch_monitor;
pub mod orchestrator;
pub mod peers;
pub mod registry;
pub mod statistics;

pub use checkpoint::SyncCheckpoint;
pub use epoch_monitor::{EpochMonitor, Tick};
pub use orchestrator::{Orchestrator, SyncReport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
	Registry,
	Attestations,
	Peers,
	Statistics,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Criticality {
	/// Failure aborts the sync pass.
	Fatal,
	/// Failure is logged and the pass completes.
	BestEffort,
}

impl Stage {
	pub const fn criticality(&self) -> Criticality {
		match self {
			Stage::Registry | Stage::Attestations | Stage::Peers => Criticality::Fatal,
			Stage::Statistics => Criticality::BestEffort,
		}
	}
}

/// Outcome of a best-effort stage.
#[derive(Debug)]
pub enum BestEffort<T> {
	Completed(T),
	Failed(Report),
}

impl<T> BestEffort<T> {
	pub fn completed(&self) -> Option<&T> {
		match self {
			BestEffort::Completed(value) => Some(value),
			BestEffort::Failed(_) => None,
		}
	}

	pub fn is_failed(&self) -> bool {
		matches!(self, BestEffort::Failed(_))
	}
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct BatchConfig {
	/// Number of store calls issued concurrently.
	pub size: usize,
	/// Pause between consecutive batches in milliseconds.
	#[serde(with = "duration_millis_format")]
	pub delay: Duration,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum RetryConfig {
	#[serde(rename = "exponential")]
	Exponential(ExponentialConfig),

	#[serde(rename = "fibonacci")]
	Fibonacci(FibonacciConfig),
}

impl IntoIterator for RetryConfig {
	type Item = Duration;
	type IntoIter = std::vec::IntoIter<Self::Item>;

	fn into_iter(self) -> Self::IntoIter {
		match self {
			RetryConfig::Exponential(config) => ExponentialBackoff::from_millis(config.base)
				.factor(1000)
				.max_delay(config.max_delay)
				.map(jitter)
				.take(config.retries)
				.collect::<Vec<Duration>>()
				.into_iter(),
			RetryConfig::Fibonacci(config) => FibonacciBackoff::from_millis(config.base)
				.factor(1000)
				.max_delay(config.max_delay)
				.map(jitter)
				.take(config.retries)
				.collect::<Vec<Duration>>()
				.into_iter(),
		}
	}
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ExponentialConfig {
	pub base: u64,
	#[serde(with = "duration_millis_format")]
	pub max_delay: Duration,
	pub retries: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FibonacciConfig {
	pub base: u64,
	#[serde(with = "duration_millis_format")]
	pub max_delay: Duration,
	pub retries: usize,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct SyncConfig {
	/// Epoch poll interval in seconds (default: 60).
	#[serde(with = "duration_seconds_format")]
	pub poll_interval: Duration,
	/// Page size of store scans (default: 100).
	pub scan_page_size: usize,
	/// Batching of record existence checks (default: 10 per batch, 1000ms apart).
	pub registry_batch: BatchConfig,
	/// Batching of history inserts (default: 5 validators per batch, 500ms apart).
	pub history_batch: BatchConfig,
	/// Backoff applied to batches throttled by the store.
	/// (default:
	/// exponential:
	///     base: 2,
	///     max_delay: 30000,
	///     retries: 5,
	/// )
	pub throttle_retry: RetryConfig,
	/// Page size of the peer crawler listing (default: 100).
	pub crawler_page_size: usize,
	/// Maximum number of crawler pages read per pass (default: 50).
	pub crawler_max_pages: usize,
	/// Window in seconds in which a validator counts as recently active (default: 86400).
	#[serde(with = "duration_seconds_format")]
	pub activity_window: Duration,
	/// Number of top entries kept in statistics distributions (default: 3).
	pub top_entries: usize,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_secs(60),
			scan_page_size: 100,
			registry_batch: BatchConfig {
				size: 10,
				delay: Duration::from_millis(1000),
			},
			history_batch: BatchConfig {
				size: 5,
				delay: Duration::from_millis(500),
			},
			throttle_retry: RetryConfig::Exponential(ExponentialConfig {
				base: 2,
				max_delay: Duration::from_millis(30000),
				retries: 5,
			}),
			crawler_page_size: 100,
			crawler_max_pages: 50,
			activity_window: Duration::from_secs(86400),
			top_entries: 3,
		}
	}
}

/// Runs `task` over consecutive chunks of `items`, one chunk at a time,
/// sleeping `batch.delay` between chunks. Results are returned in chunk order.
pub(crate) async fn for_each_batch<'a, T, R, F, Fut>(
	items: &'a [T],
	batch: &BatchConfig,
	mut task: F,
) -> Vec<R>
where
	F: FnMut(&'a [T]) -> Fut,
	Fut: Future<Output = R>,
{
	let mut results = vec![];
	for (index, chunk) in items.chunks(batch.size.max(1)).enumerate() {
		if index > 0 && !batch.delay.is_zero() {
			tokio::time::sleep(batch.delay).await;
		}
		results.push(task(chunk).await);
	}
	results
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::time::Instant;

	#[test]
	fn test_retry_delays_are_capped() {
		let retry = RetryConfig::Exponential(ExponentialConfig {
			base: 2,
			max_delay: Duration::from_millis(5000),
			retries: 6,
		});

		let delays = retry.into_iter().collect::<Vec<_>>();
		assert_eq!(delays.len(), 6);
		assert!(delays.iter().all(|delay| *delay <= Duration::from_millis(5000)));
	}

	#[test]
	fn test_stage_criticality() {
		assert_eq!(Stage::Registry.criticality(), Criticality::Fatal);
		assert_eq!(Stage::Peers.criticality(), Criticality::Fatal);
		assert_eq!(Stage::Statistics.criticality(), Criticality::BestEffort);
		assert_eq!(Stage::Attestations.to_string(), "attestations");
	}

	#[tokio::test(start_paused = true)]
	async fn test_for_each_batch_waits_between_chunks() {
		let batch = BatchConfig {
			size: 2,
			delay: Duration::from_millis(1000),
		};
		let items = [1, 2, 3, 4, 5];
		let started = Instant::now();

		let sums = for_each_batch(&items, &batch, |chunk| async move {
			chunk.iter().sum::<i32>()
		})
		.await;

		assert_eq!(sums, vec![3, 7, 5]);
		assert_eq!(started.elapsed(), Duration::from_millis(2000));
	}

	#[test]
	fn test_sync_config_defaults_fill_missing_fields() {
		let config: SyncConfig = serde_json::from_str(r#"{ "poll_interval": 30 }"#).unwrap();
		assert_eq!(config.poll_interval, Duration::from_secs(30));
		assert_eq!(config.registry_batch.size, 10);
		assert_eq!(config.top_entries, 3);
	}
}
