use super::{
	for_each_batch,
	registry::{self, EnsureResult},
	SyncCheckpoint, SyncConfig,
};
use crate::{
	data::RecordStore,
	network::attestation::{AttestationSource, ValidatorStats},
	types::{
		Address, PerformanceFields, SlotMark, ValidatorFields, ValidatorHistoryEntry,
		ValidatorUpdate,
	},
};
use chrono::{DateTime, Utc};
use color_eyre::{eyre::WrapErr, Result};
use futures::future::join_all;
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttestationOutcome {
	/// Telemetry had not advanced since the previous pass, nothing was written.
	pub skipped: bool,
	pub reported_slot: Option<u64>,
	pub updated: usize,
	/// Defensive existence checks that failed.
	pub ensure_failed: usize,
	pub history_inserted: usize,
	/// Validators whose history insert failed.
	pub history_failed: usize,
}

/// Merges attestation telemetry into the records of `addresses`.
///
/// Returns early without any store call when the telemetry source reports the
/// same last processed slot as the previous pass. The slot marker follows the
/// source, also when it moves backwards. Performance fields of every
/// address are written in one batch. History is appended per validator, keeping
/// only entries newer than the validator's highest stored slot.
pub async fn reconcile<S, A>(
	store: &S,
	source: &A,
	addresses: &[Address],
	checkpoint: &mut SyncCheckpoint,
	config: &SyncConfig,
	now: DateTime<Utc>,
) -> Result<AttestationOutcome>
where
	S: RecordStore + ?Sized,
	A: AttestationSource + ?Sized,
{
	let stats = source
		.fetch_stats()
		.await
		.wrap_err("Unable to fetch attestation telemetry")?;

	let reported_slot = stats.last_processed_slot;
	if let (Some(reported), Some(previous)) = (reported_slot, checkpoint.last_attestation_slot()) {
		if reported == previous {
			info!(slot = reported, "Attestation telemetry has not advanced, skipping");
			return Ok(AttestationOutcome {
				skipped: true,
				reported_slot,
				..Default::default()
			});
		}
		if reported < previous {
			warn!(
				reported,
				previous, "Attestation telemetry moved backwards, following it"
			);
		}
	}

	let per_address = stats
		.per_address
		.into_iter()
		.map(|(address, stats)| (Address::new(&address), stats))
		.collect::<HashMap<_, _>>();

	let mut outcome = AttestationOutcome {
		reported_slot,
		..Default::default()
	};

	// records created outside of the registry stage
	let unverified = checkpoint.unknown(addresses);
	if !unverified.is_empty() {
		let EnsureResult { failed, .. } =
			registry::ensure_records(store, &unverified, config).await;
		outcome.ensure_failed = failed.len();
	}

	let cutoff = now
		- chrono::Duration::from_std(config.activity_window)
			.wrap_err("Activity window out of range")?;

	let mut updates = Vec::with_capacity(addresses.len());
	let mut histories = vec![];
	for address in addresses {
		let stats = per_address.get(address);
		updates.push(ValidatorUpdate::new(
			address.clone(),
			ValidatorFields::Performance(derive_performance(stats, cutoff)),
		));
		if let Some(stats) = stats.filter(|stats| !stats.history.is_empty()) {
			histories.push((address.clone(), stats.history.clone()));
		}
	}

	outcome.updated = store
		.batch_update(updates)
		.await
		.wrap_err("Unable to write validator performance")?;

	let (inserted, failed) = merge_history(store, histories, config).await?;
	outcome.history_inserted = inserted;
	outcome.history_failed = failed;

	if let Some(slot) = reported_slot {
		checkpoint.set_attestation_slot(slot);
	}

	info!(
		updated = outcome.updated,
		history_inserted = outcome.history_inserted,
		history_failed = outcome.history_failed,
		"Merged attestation telemetry"
	);
	Ok(outcome)
}

/// Missing telemetry yields zeroed counters and no activity.
pub fn derive_performance(stats: Option<&ValidatorStats>, cutoff: DateTime<Utc>) -> PerformanceFields {
	let Some(stats) = stats else {
		return PerformanceFields::default();
	};

	let recently_active = stats
		.last_attestation
		.as_ref()
		.is_some_and(|event| event.timestamp > cutoff);

	PerformanceFields {
		recently_active,
		last_attestation: stats
			.last_attestation
			.as_ref()
			.map(|event| SlotMark::new(event.slot, event.timestamp)),
		last_proposal: stats
			.last_proposal
			.as_ref()
			.map(|event| SlotMark::new(event.slot, event.timestamp)),
		missed_attestations: stats.missed_attestations,
		missed_proposals: stats.missed_proposals,
		total_slots: stats.total_slots,
	}
}

/// Entries strictly newer than `high_water`, ordered by slot.
pub fn new_history_entries(
	history: Vec<ValidatorHistoryEntry>,
	high_water: Option<u64>,
) -> Vec<ValidatorHistoryEntry> {
	let mut entries = history
		.into_iter()
		.filter(|entry| high_water.map_or(true, |slot| entry.slot > slot))
		.collect::<Vec<_>>();
	entries.sort_by_key(|entry| entry.slot);
	entries.dedup_by_key(|entry| entry.slot);
	entries
}

async fn merge_history<S: RecordStore + ?Sized>(
	store: &S,
	histories: Vec<(Address, Vec<ValidatorHistoryEntry>)>,
	config: &SyncConfig,
) -> Result<(usize, usize)> {
	if histories.is_empty() {
		return Ok((0, 0));
	}

	let targets = histories
		.iter()
		.map(|(address, _)| address.clone())
		.collect::<Vec<_>>();
	let high_water = store
		.latest_history_slots(&targets)
		.await
		.wrap_err("Unable to read latest history slots")?;

	let pending = histories
		.into_iter()
		.filter_map(|(address, history)| {
			let entries = new_history_entries(history, high_water.get(&address).copied());
			(!entries.is_empty()).then_some((address, entries))
		})
		.collect::<Vec<_>>();

	if pending.is_empty() {
		debug!("No new history entries");
		return Ok((0, 0));
	}

	let results = for_each_batch(&pending, &config.history_batch, |batch| {
		insert_batch(store, batch)
	})
	.await;

	let (mut inserted, mut failed) = (0, 0);
	for result in results.into_iter().flatten() {
		match result {
			Ok(count) => inserted += count,
			Err(()) => failed += 1,
		}
	}
	Ok((inserted, failed))
}

async fn insert_batch<S: RecordStore + ?Sized>(
	store: &S,
	batch: &[(Address, Vec<ValidatorHistoryEntry>)],
) -> Vec<Result<usize, ()>> {
	join_all(batch.iter().map(|(address, entries)| async move {
		store
			.insert_history(address, entries.clone())
			.await
			.map_err(|error| warn!(%address, %error, "Unable to insert validator history"))
	}))
	.await
}
