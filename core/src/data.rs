use crate::types::{
	Address, NetworkStatsSnapshot, ValidatorHistoryEntry, ValidatorRecord, ValidatorUpdate,
};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

mod keys;

mod mem_db;
pub use mem_db::*;

#[cfg(feature = "rocksdb")]
mod rocks_db;
#[cfg(feature = "rocksdb")]
pub use rocks_db::RocksStore;

#[derive(Debug, Error)]
pub enum StoreError {
	/// The store rejected the request because of its write-rate limits.
	#[error("Store request throttled: {0}")]
	Throttled(String),
	#[error("Store encoding failed: {0}")]
	Encoding(#[from] serde_json::Error),
	#[error("Store continuation token did not advance: {0}")]
	StalledScan(String),
	#[error("Store backend failure: {0}")]
	Backend(String),
}

impl StoreError {
	/// Returns `true` for the throttling signature, which is the only retryable error.
	pub fn is_throttled(&self) -> bool {
		matches!(self, StoreError::Throttled(_))
	}
}

/// One page of a paginated store scan.
#[derive(Clone, Debug, Default)]
pub struct ScanPage {
	pub items: Vec<ValidatorRecord>,
	pub next_token: Option<String>,
}

/// Narrow read/write contract of the record store.
///
/// Every write is an idempotent upsert keyed by the entity's natural key:
/// the validator address, the (address, slot) pair or the epoch number.
#[async_trait]
pub trait RecordStore: Send + Sync {
	/// Creates an empty record for the address unless one exists already.
	async fn ensure_exists(&self, address: &Address) -> Result<(), StoreError>;

	/// Applies field updates to existing records, returning the number of records updated.
	/// Updates for unknown addresses are skipped.
	async fn batch_update(&self, updates: Vec<ValidatorUpdate>) -> Result<usize, StoreError>;

	/// Returns up to `page_size` records ordered by address, starting after `continuation`.
	async fn paginated_scan(
		&self,
		continuation: Option<String>,
		page_size: usize,
	) -> Result<ScanPage, StoreError>;

	/// Highest stored history slot of a validator.
	async fn latest_history_slot(&self, address: &Address) -> Result<Option<u64>, StoreError>;

	/// Highest stored history slot for each of the given validators, in one read.
	/// Validators without history are absent from the result.
	async fn latest_history_slots(
		&self,
		addresses: &[Address],
	) -> Result<HashMap<Address, u64>, StoreError>;

	/// Appends history entries. Entries whose (address, slot) is already stored are
	/// left untouched. Returns the number of entries written.
	async fn insert_history(
		&self,
		address: &Address,
		entries: Vec<ValidatorHistoryEntry>,
	) -> Result<usize, StoreError>;

	/// Stores the snapshot, replacing any snapshot of the same epoch.
	async fn upsert_snapshot(&self, snapshot: NetworkStatsSnapshot) -> Result<(), StoreError>;
}

/// Collects all records by following continuation tokens until the store reports the last page.
pub async fn scan_all<S: RecordStore + ?Sized>(
	store: &S,
	page_size: usize,
) -> Result<Vec<ValidatorRecord>, StoreError> {
	let mut records = vec![];
	let mut continuation: Option<String> = None;

	loop {
		let ScanPage { items, next_token } =
			store.paginated_scan(continuation.clone(), page_size).await?;
		records.extend(items);

		match next_token {
			None => break,
			Some(token) if continuation.as_ref() == Some(&token) => {
				return Err(StoreError::StalledScan(token));
			},
			Some(token) => continuation = Some(token),
		}
	}

	Ok(records)
}
