use crate::{
	data::{scan_all, RecordStore, StoreError},
	types::Address,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::info;

/// Progress carried between sync passes.
///
/// Lives in process memory and is rebuilt from the store on startup,
/// except for the telemetry and peer markers which start empty.
#[derive(Clone, Debug, Default)]
pub struct SyncCheckpoint {
	known_addresses: HashSet<Address>,
	last_attestation_slot: Option<u64>,
	last_peer_seen: Option<DateTime<Utc>>,
}

impl SyncCheckpoint {
	/// Seeds the known address set with every address present in the store.
	pub async fn rebuild<S: RecordStore + ?Sized>(
		store: &S,
		page_size: usize,
	) -> Result<Self, StoreError> {
		let records = scan_all(store, page_size).await?;
		let known_addresses = records
			.into_iter()
			.map(|record| record.address)
			.collect::<HashSet<_>>();
		info!(
			known = known_addresses.len(),
			"Rebuilt sync checkpoint from store"
		);
		Ok(Self {
			known_addresses,
			..Default::default()
		})
	}

	pub fn is_known(&self, address: &Address) -> bool {
		self.known_addresses.contains(address)
	}

	pub fn known_count(&self) -> usize {
		self.known_addresses.len()
	}

	/// Distinct addresses not known to exist in the store, in input order.
	pub fn unknown(&self, addresses: &[Address]) -> Vec<Address> {
		let mut seen = HashSet::new();
		addresses
			.iter()
			.filter(|address| !self.is_known(address) && seen.insert(*address))
			.cloned()
			.collect()
	}

	pub(crate) fn mark_known(&mut self, addresses: impl IntoIterator<Item = Address>) {
		self.known_addresses.extend(addresses);
	}

	pub fn last_attestation_slot(&self) -> Option<u64> {
		self.last_attestation_slot
	}

	/// Records the slot last reported by the telemetry source.
	pub(crate) fn set_attestation_slot(&mut self, slot: u64) {
		self.last_attestation_slot = Some(slot);
	}

	pub fn last_peer_seen(&self) -> Option<DateTime<Utc>> {
		self.last_peer_seen
	}

	pub(crate) fn advance_peer_seen(&mut self, last_seen: DateTime<Utc>) {
		if self.last_peer_seen.map_or(true, |current| last_seen > current) {
			self.last_peer_seen = Some(last_seen);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{data::MemoryStore, types::ValidatorRecord};
	use chrono::TimeZone;

	#[tokio::test]
	async fn test_rebuild_seeds_known_addresses() {
		let store = MemoryStore::default();
		for address in ["0xa", "0xb", "0xc"] {
			store.put_record(ValidatorRecord::new(address.into()));
		}

		let checkpoint = SyncCheckpoint::rebuild(&store, 2).await.unwrap();

		assert_eq!(checkpoint.known_count(), 3);
		assert!(checkpoint.is_known(&"0xB".into()));
		assert_eq!(checkpoint.last_attestation_slot(), None);
		assert_eq!(checkpoint.last_peer_seen(), None);
	}

	#[test]
	fn test_unknown_dedups_and_skips_known() {
		let mut checkpoint = SyncCheckpoint::default();
		checkpoint.mark_known(["0xa".into()]);

		let unknown = checkpoint.unknown(&["0xb".into(), "0xa".into(), "0xB ".into(), "0xc".into()]);

		assert_eq!(unknown, vec![Address::from("0xb"), Address::from("0xc")]);
	}

	#[test]
	fn test_markers() {
		let mut checkpoint = SyncCheckpoint::default();
		checkpoint.set_attestation_slot(100);
		checkpoint.set_attestation_slot(90);
		assert_eq!(checkpoint.last_attestation_slot(), Some(90));

		let newer = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
		let older = Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap();
		checkpoint.advance_peer_seen(newer);
		checkpoint.advance_peer_seen(older);
		assert_eq!(checkpoint.last_peer_seen(), Some(newer));
	}
}
