use super::{RecordStore, ScanPage, StoreError};
use crate::types::{
	Address, HistoryStatus, NetworkStatsSnapshot, ValidatorHistoryEntry, ValidatorRecord,
	ValidatorUpdate,
};
use async_trait::async_trait;
use chrono::Utc;
use std::{
	collections::{BTreeMap, HashMap},
	ops::Bound,
	sync::{Arc, RwLock},
};

#[derive(Default)]
struct Collections {
	validators: BTreeMap<Address, ValidatorRecord>,
	history: HashMap<Address, BTreeMap<u64, HistoryStatus>>,
	snapshots: BTreeMap<u64, NetworkStatsSnapshot>,
}

/// In-memory record store, ordered by address.
#[derive(Clone, Default)]
pub struct MemoryStore {
	collections: Arc<RwLock<Collections>>,
}

impl MemoryStore {
	/// Inserts or replaces a whole record. Used by administrative flows
	/// assigning operators and peer identities.
	pub fn put_record(&self, record: ValidatorRecord) {
		let mut collections = self.collections.write().expect("Lock acquired");
		collections
			.validators
			.insert(record.address.clone(), record);
	}

	pub fn record(&self, address: &Address) -> Option<ValidatorRecord> {
		let collections = self.collections.read().expect("Lock acquired");
		collections.validators.get(address).cloned()
	}

	pub fn history(&self, address: &Address) -> Vec<ValidatorHistoryEntry> {
		let collections = self.collections.read().expect("Lock acquired");
		collections
			.history
			.get(address)
			.map(|entries| {
				entries
					.iter()
					.map(|(&slot, &status)| ValidatorHistoryEntry { slot, status })
					.collect()
			})
			.unwrap_or_default()
	}

	pub fn snapshot(&self, epoch: u64) -> Option<NetworkStatsSnapshot> {
		let collections = self.collections.read().expect("Lock acquired");
		collections.snapshots.get(&epoch).cloned()
	}

	pub fn len(&self) -> usize {
		let collections = self.collections.read().expect("Lock acquired");
		collections.validators.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[async_trait]
impl RecordStore for MemoryStore {
	async fn ensure_exists(&self, address: &Address) -> Result<(), StoreError> {
		let mut collections = self.collections.write().expect("Lock acquired");
		collections
			.validators
			.entry(address.clone())
			.or_insert_with(|| ValidatorRecord::new(address.clone()));
		Ok(())
	}

	async fn batch_update(&self, updates: Vec<ValidatorUpdate>) -> Result<usize, StoreError> {
		let now = Utc::now();
		let mut collections = self.collections.write().expect("Lock acquired");
		let mut updated = 0;
		for ValidatorUpdate { address, fields } in updates {
			if let Some(record) = collections.validators.get_mut(&address) {
				record.apply(fields, now);
				updated += 1;
			}
		}
		Ok(updated)
	}

	async fn paginated_scan(
		&self,
		continuation: Option<String>,
		page_size: usize,
	) -> Result<ScanPage, StoreError> {
		let collections = self.collections.read().expect("Lock acquired");
		let lower = match continuation {
			Some(token) => Bound::Excluded(Address::new(&token)),
			None => Bound::Unbounded,
		};

		let mut remaining = collections
			.validators
			.range((lower, Bound::Unbounded))
			.map(|(_, record)| record);
		let items: Vec<ValidatorRecord> = remaining.by_ref().take(page_size.max(1)).cloned().collect();

		let next_token = match (remaining.next(), items.last()) {
			(Some(_), Some(last)) => Some(last.address.to_string()),
			_ => None,
		};
		Ok(ScanPage { items, next_token })
	}

	async fn latest_history_slot(&self, address: &Address) -> Result<Option<u64>, StoreError> {
		let collections = self.collections.read().expect("Lock acquired");
		Ok(collections
			.history
			.get(address)
			.and_then(|entries| entries.last_key_value())
			.map(|(&slot, _)| slot))
	}

	async fn latest_history_slots(
		&self,
		addresses: &[Address],
	) -> Result<HashMap<Address, u64>, StoreError> {
		let collections = self.collections.read().expect("Lock acquired");
		Ok(addresses
			.iter()
			.filter_map(|address| {
				let (&slot, _) = collections.history.get(address)?.last_key_value()?;
				Some((address.clone(), slot))
			})
			.collect())
	}

	async fn insert_history(
		&self,
		address: &Address,
		entries: Vec<ValidatorHistoryEntry>,
	) -> Result<usize, StoreError> {
		let mut collections = self.collections.write().expect("Lock acquired");
		let stored = collections.history.entry(address.clone()).or_default();
		let mut inserted = 0;
		for ValidatorHistoryEntry { slot, status } in entries {
			if let std::collections::btree_map::Entry::Vacant(entry) = stored.entry(slot) {
				entry.insert(status);
				inserted += 1;
			}
		}
		Ok(inserted)
	}

	async fn upsert_snapshot(&self, snapshot: NetworkStatsSnapshot) -> Result<(), StoreError> {
		let mut collections = self.collections.write().expect("Lock acquired");
		collections.snapshots.insert(snapshot.epoch, snapshot);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{PerformanceFields, ValidatorFields};

	fn entry(slot: u64) -> ValidatorHistoryEntry {
		ValidatorHistoryEntry {
			slot,
			status: HistoryStatus::Attested,
		}
	}

	#[tokio::test]
	async fn test_ensure_exists_keeps_existing_record() {
		let store = MemoryStore::default();
		let address = Address::new("0xa");
		let mut record = ValidatorRecord::new(address.clone());
		record.operator = Some("operator".to_string());
		store.put_record(record);

		store.ensure_exists(&address).await.unwrap();

		assert_eq!(
			store.record(&address).unwrap().operator.as_deref(),
			Some("operator")
		);
	}

	#[tokio::test]
	async fn test_batch_update_skips_unknown() {
		let store = MemoryStore::default();
		store.ensure_exists(&Address::new("0xa")).await.unwrap();

		let fields = ValidatorFields::Performance(PerformanceFields::default());
		let updated = store
			.batch_update(vec![
				ValidatorUpdate::new(Address::new("0xa"), fields.clone()),
				ValidatorUpdate::new(Address::new("0xb"), fields),
			])
			.await
			.unwrap();

		assert_eq!(updated, 1);
		assert!(store.record(&Address::new("0xb")).is_none());
	}

	#[tokio::test]
	async fn test_paginated_scan_pages() {
		let store = MemoryStore::default();
		for name in ["0xa", "0xb", "0xc"] {
			store.ensure_exists(&Address::new(name)).await.unwrap();
		}

		let first = store.paginated_scan(None, 2).await.unwrap();
		assert_eq!(first.items.len(), 2);
		assert_eq!(first.next_token.as_deref(), Some("0xb"));

		let second = store.paginated_scan(first.next_token, 2).await.unwrap();
		assert_eq!(second.items.len(), 1);
		assert_eq!(second.next_token, None);
	}

	#[tokio::test]
	async fn test_insert_history_is_append_only() {
		let store = MemoryStore::default();
		let address = Address::new("0xa");

		let inserted = store
			.insert_history(&address, vec![entry(1), entry(2)])
			.await
			.unwrap();
		assert_eq!(inserted, 2);

		let replaced = ValidatorHistoryEntry {
			slot: 2,
			status: HistoryStatus::Missed,
		};
		let inserted = store
			.insert_history(&address, vec![replaced, entry(3)])
			.await
			.unwrap();
		assert_eq!(inserted, 1);

		let history = store.history(&address);
		assert_eq!(history.len(), 3);
		assert_eq!(history[1].status, HistoryStatus::Attested);
		assert_eq!(store.latest_history_slot(&address).await.unwrap(), Some(3));
	}

	#[tokio::test]
	async fn test_latest_history_slots_omits_empty() {
		let store = MemoryStore::default();
		let a = Address::new("0xa");
		let b = Address::new("0xb");
		store.insert_history(&a, vec![entry(5), entry(9)]).await.unwrap();

		let slots = store
			.latest_history_slots(&[a.clone(), b.clone()])
			.await
			.unwrap();
		assert_eq!(slots.get(&a), Some(&9));
		assert!(!slots.contains_key(&b));
	}
}
