use super::{keys::*, RecordStore, ScanPage, StoreError};
use crate::types::{
	Address, NetworkStatsSnapshot, ValidatorHistoryEntry, ValidatorRecord, ValidatorUpdate,
};
use async_trait::async_trait;
use chrono::Utc;
use color_eyre::eyre::Result;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch};
use std::{collections::HashMap, sync::Arc};

impl From<rocksdb::Error> for StoreError {
	fn from(error: rocksdb::Error) -> Self {
		StoreError::Backend(error.to_string())
	}
}

/// RocksDB backed record store with one column family per collection.
#[derive(Clone)]
pub struct RocksStore {
	db: Arc<rocksdb::DB>,
}

impl RocksStore {
	pub fn open(path: &str) -> Result<RocksStore> {
		let cf_opts = vec![
			ColumnFamilyDescriptor::new(VALIDATORS_CF, Options::default()),
			ColumnFamilyDescriptor::new(HISTORY_CF, Options::default()),
			ColumnFamilyDescriptor::new(SNAPSHOTS_CF, Options::default()),
		];

		let mut db_opts = Options::default();
		db_opts.create_if_missing(true);
		db_opts.create_missing_column_families(true);

		let db = rocksdb::DB::open_cf_descriptors(&db_opts, path, cf_opts)?;
		Ok(RocksStore { db: Arc::new(db) })
	}

	fn cf(&self, name: &'static str) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
		self.db
			.cf_handle(name)
			.ok_or_else(|| StoreError::Backend(format!("Missing column family {name}")))
	}

	fn get_record(&self, address: &Address) -> Result<Option<ValidatorRecord>, StoreError> {
		let cf = self.cf(VALIDATORS_CF)?;
		self.db
			.get_cf(&cf, address.as_str())?
			.map(|value| serde_json::from_slice(&value).map_err(StoreError::from))
			.transpose()
	}

	/// Inserts or replaces a whole record.
	pub fn put_record(&self, record: &ValidatorRecord) -> Result<(), StoreError> {
		let cf = self.cf(VALIDATORS_CF)?;
		self.db
			.put_cf(&cf, record.address.as_str(), serde_json::to_vec(record)?)?;
		Ok(())
	}
}

#[async_trait]
impl RecordStore for RocksStore {
	async fn ensure_exists(&self, address: &Address) -> Result<(), StoreError> {
		if self.get_record(address)?.is_some() {
			return Ok(());
		}
		self.put_record(&ValidatorRecord::new(address.clone()))
	}

	async fn batch_update(&self, updates: Vec<ValidatorUpdate>) -> Result<usize, StoreError> {
		let now = Utc::now();
		let cf = self.cf(VALIDATORS_CF)?;
		let mut batch = WriteBatch::default();
		let mut updated = 0;

		for ValidatorUpdate { address, fields } in updates {
			// unknown addresses are not created here
			let Some(mut record) = self.get_record(&address)? else {
				continue;
			};
			record.apply(fields, now);
			batch.put_cf(&cf, address.as_str(), serde_json::to_vec(&record)?);
			updated += 1;
		}

		self.db.write(batch)?;
		Ok(updated)
	}

	async fn paginated_scan(
		&self,
		continuation: Option<String>,
		page_size: usize,
	) -> Result<ScanPage, StoreError> {
		let cf = self.cf(VALIDATORS_CF)?;
		let mode = match &continuation {
			Some(token) => IteratorMode::From(token.as_bytes(), Direction::Forward),
			None => IteratorMode::Start,
		};

		let mut items = vec![];
		let mut has_more = false;
		for entry in self.db.iterator_cf(&cf, mode) {
			let (key, value) = entry?;
			// continuation token is exclusive
			if continuation.as_deref().map(str::as_bytes) == Some(&key[..]) {
				continue;
			}
			if items.len() == page_size.max(1) {
				has_more = true;
				break;
			}
			items.push(serde_json::from_slice::<ValidatorRecord>(&value)?);
		}

		let next_token = has_more
			.then(|| items.last().map(|record| record.address.to_string()))
			.flatten();
		Ok(ScanPage { items, next_token })
	}

	async fn latest_history_slot(&self, address: &Address) -> Result<Option<u64>, StoreError> {
		let cf = self.cf(HISTORY_CF)?;
		let prefix = history_prefix(address.as_str());
		let upper_bound = history_upper_bound(address.as_str());

		let mut iterator = self.db.iterator_cf(
			&cf,
			IteratorMode::From(upper_bound.as_bytes(), Direction::Reverse),
		);
		match iterator.next() {
			Some(entry) => {
				let (key, _) = entry?;
				Ok(history_slot(&key, &prefix))
			},
			None => Ok(None),
		}
	}

	async fn latest_history_slots(
		&self,
		addresses: &[Address],
	) -> Result<HashMap<Address, u64>, StoreError> {
		let mut slots = HashMap::new();
		for address in addresses {
			if let Some(slot) = self.latest_history_slot(address).await? {
				slots.insert(address.clone(), slot);
			}
		}
		Ok(slots)
	}

	async fn insert_history(
		&self,
		address: &Address,
		entries: Vec<ValidatorHistoryEntry>,
	) -> Result<usize, StoreError> {
		let cf = self.cf(HISTORY_CF)?;
		let mut batch = WriteBatch::default();
		let mut inserted = 0;

		for entry in entries {
			let key = history_key(address.as_str(), entry.slot);
			if self.db.get_cf(&cf, &key)?.is_some() {
				continue;
			}
			batch.put_cf(&cf, &key, serde_json::to_vec(&entry.status)?);
			inserted += 1;
		}

		self.db.write(batch)?;
		Ok(inserted)
	}

	async fn upsert_snapshot(&self, snapshot: NetworkStatsSnapshot) -> Result<(), StoreError> {
		let cf = self.cf(SNAPSHOTS_CF)?;
		self.db.put_cf(
			&cf,
			snapshot_key(snapshot.epoch),
			serde_json::to_vec(&snapshot)?,
		)?;
		Ok(())
	}
}
