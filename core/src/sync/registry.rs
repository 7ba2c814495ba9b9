use super::{for_each_batch, RetryConfig, SyncCheckpoint, SyncConfig};
use crate::{
	data::{RecordStore, StoreError},
	types::{Address, ValidatorFields, ValidatorRecord, ValidatorUpdate},
};
use futures::future::join_all;
use std::collections::HashSet;
use tokio_retry::Retry;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryOutcome {
	/// Records confirmed to exist during this pass.
	pub ensured: usize,
	/// Addresses whose existence check failed, retried next pass.
	pub failed: usize,
	/// On-chain addresses skipped as already known.
	pub already_known: usize,
	/// Records whose active set flag changed.
	pub active_flags_updated: usize,
}

/// Addresses split by the result of their existence check.
#[derive(Debug, Default)]
pub(crate) struct EnsureResult {
	pub ensured: Vec<Address>,
	pub failed: Vec<Address>,
}

/// Ensures every on-chain validator has a record, skipping addresses already known.
///
/// Existence checks run in batches with a pause in between. A throttled batch is
/// retried as a whole with backoff; other failures are counted per address and
/// never abort the pass. Only confirmed addresses join the known set.
pub async fn reconcile<S: RecordStore + ?Sized>(
	store: &S,
	on_chain: &[Address],
	checkpoint: &mut SyncCheckpoint,
	config: &SyncConfig,
) -> RegistryOutcome {
	let pending = checkpoint.unknown(on_chain);
	let distinct = on_chain.iter().collect::<HashSet<_>>().len();
	let already_known = distinct - pending.len();

	if pending.is_empty() {
		debug!(already_known, "All on-chain validators are known");
		return RegistryOutcome {
			already_known,
			..Default::default()
		};
	}

	info!(
		pending = pending.len(),
		already_known, "Ensuring records for new validators"
	);

	let EnsureResult { ensured, failed } = ensure_records(store, &pending, config).await;
	let outcome = RegistryOutcome {
		ensured: ensured.len(),
		failed: failed.len(),
		already_known,
		..Default::default()
	};
	checkpoint.mark_known(ensured);

	if outcome.failed > 0 {
		warn!(
			ensured = outcome.ensured,
			failed = outcome.failed,
			"Some validator records could not be ensured, retrying next pass"
		);
	}
	outcome
}

/// Runs existence checks in paced batches, backing off on throttled batches.
pub(crate) async fn ensure_records<S: RecordStore + ?Sized>(
	store: &S,
	addresses: &[Address],
	config: &SyncConfig,
) -> EnsureResult {
	let results = for_each_batch(addresses, &config.registry_batch, |batch| {
		ensure_batch(store, batch, &config.throttle_retry)
	})
	.await;

	results
		.into_iter()
		.fold(EnsureResult::default(), |mut acc, batch| {
			acc.ensured.extend(batch.ensured);
			acc.failed.extend(batch.failed);
			acc
		})
}

async fn ensure_batch<S: RecordStore + ?Sized>(
	store: &S,
	batch: &[Address],
	retry: &RetryConfig,
) -> EnsureResult {
	let attempt = move || async move {
		let results = join_all(batch.iter().map(|address| store.ensure_exists(address))).await;

		let throttled = results
			.iter()
			.filter_map(|result| result.as_ref().err())
			.find(|error| error.is_throttled());
		if let Some(error) = throttled {
			warn!(%error, batch_size = batch.len(), "Store throttled batch, backing off");
			return Err(error.to_string());
		}
		Ok(results)
	};

	match Retry::start(retry.clone(), attempt).await {
		Ok(results) => {
			let mut outcome = EnsureResult::default();
			for (address, result) in batch.iter().zip(results) {
				match result {
					Ok(()) => outcome.ensured.push(address.clone()),
					Err(error) => {
						warn!(%address, %error, "Unable to ensure validator record");
						outcome.failed.push(address.clone());
					},
				}
			}
			outcome
		},
		Err(error) => {
			error!(
				batch_size = batch.len(),
				%error, "Batch still throttled after retries, giving up"
			);
			EnsureResult {
				ensured: vec![],
				failed: batch.to_vec(),
			}
		},
	}
}

/// Writes the active set flag of records whose membership changed.
pub async fn refresh_active_flags<S: RecordStore + ?Sized>(
	store: &S,
	on_chain: &[Address],
	records: &[ValidatorRecord],
) -> Result<usize, StoreError> {
	let active = on_chain.iter().collect::<HashSet<_>>();
	let updates = records
		.iter()
		.filter_map(|record| {
			let in_active_set = active.contains(&record.address);
			(record.in_active_set != in_active_set).then(|| {
				ValidatorUpdate::new(
					record.address.clone(),
					ValidatorFields::ActiveSet(in_active_set),
				)
			})
		})
		.collect::<Vec<_>>();

	if updates.is_empty() {
		return Ok(0);
	}
	debug!(changed = updates.len(), "Updating active set flags");
	store.batch_update(updates).await
}
