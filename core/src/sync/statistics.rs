use super::{BestEffort, SyncConfig};
use crate::{
	data::{scan_all, RecordStore},
	network::crawler::Peer,
	types::{
		Bucket, Distribution, MissRates, NetworkStatsSnapshot, PeerCounts, ValidatorCounts,
		ValidatorRecord,
	},
};
use chrono::{DateTime, Utc};
use color_eyre::{eyre::WrapErr, Result};
use itertools::Itertools;
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, HashSet};
use tracing::{error, info};

/// Inputs gathered by the earlier stages of the pass.
pub struct StatisticsInput<'a> {
	pub epoch: u64,
	pub on_chain: usize,
	pub current_slot: Option<u64>,
	pub peers: &'a [Peer],
	pub now: DateTime<Utc>,
}

/// Computes and stores the network snapshot of the epoch. Never fails the pass.
pub async fn aggregate<S: RecordStore + ?Sized>(
	store: &S,
	input: StatisticsInput<'_>,
	config: &SyncConfig,
) -> BestEffort<NetworkStatsSnapshot> {
	let epoch = input.epoch;
	match compute_and_store(store, input, config).await {
		Ok(snapshot) => BestEffort::Completed(snapshot),
		Err(error) => {
			error!(epoch, "Unable to aggregate network statistics: {error:#}");
			BestEffort::Failed(error)
		},
	}
}

async fn compute_and_store<S: RecordStore + ?Sized>(
	store: &S,
	input: StatisticsInput<'_>,
	config: &SyncConfig,
) -> Result<NetworkStatsSnapshot> {
	let records = scan_all(store, config.scan_page_size)
		.await
		.wrap_err("Unable to scan validator records")?;

	let active_since = input.now
		- chrono::Duration::from_std(config.activity_window)
			.wrap_err("Activity window out of range")?;
	let snapshot = compute_snapshot(&records, &input, active_since, config.top_entries);
	store
		.upsert_snapshot(snapshot.clone())
		.await
		.wrap_err("Unable to store network snapshot")?;

	info!(
		epoch = snapshot.epoch,
		known = snapshot.validators.known,
		active_24h = snapshot.validators.active_24h,
		"Stored network statistics"
	);
	Ok(snapshot)
}

/// Validators count as active when their last attestation is newer than `active_since`.
pub fn compute_snapshot(
	records: &[ValidatorRecord],
	input: &StatisticsInput<'_>,
	active_since: DateTime<Utc>,
	top_entries: usize,
) -> NetworkStatsSnapshot {
	let listed = input
		.peers
		.iter()
		.map(|peer| peer.id.as_str())
		.collect::<HashSet<_>>();

	let validators = ValidatorCounts {
		on_chain: input.on_chain,
		known: records.len(),
		active_24h: records
			.iter()
			.filter_map(|record| record.performance.last_attestation.as_ref())
			.filter(|mark| mark.timestamp > active_since)
			.count(),
		with_operator: records.iter().filter(|record| record.operator.is_some()).count(),
		with_peer: records.iter().filter(|record| record.peer_id.is_some()).count(),
	};

	let measured = records
		.iter()
		.map(|record| &record.performance)
		.filter(|performance| performance.total_slots > 0)
		.collect::<Vec<_>>();

	let miss_rates = MissRates {
		attestation: mean_rate(measured.iter().map(|performance| {
			performance.missed_attestations as f64 / performance.total_slots as f64
		})),
		proposal: mean_rate(measured.iter().map(|performance| {
			performance.missed_proposals as f64 / performance.total_slots as f64
		})),
	};

	let peers = PeerCounts {
		network: input.peers.len(),
		matched: records
			.iter()
			.filter_map(|record| record.peer_id.as_deref())
			.filter(|peer_id| listed.contains(peer_id))
			.count(),
	};

	let first_geo = |peer: &Peer| peer.addresses.first().and_then(|address| address.geo.clone());

	NetworkStatsSnapshot {
		epoch: input.epoch,
		current_slot: input.current_slot,
		validators,
		miss_rates,
		peers,
		countries: distribution(
			input.peers.iter().filter_map(|peer| first_geo(peer)?.country),
			top_entries,
		),
		clients: distribution(input.peers.iter().map(|peer| peer.client.clone()), top_entries),
		isps: distribution(
			input.peers.iter().filter_map(|peer| first_geo(peer)?.isp),
			top_entries,
		),
		computed_at: input.now,
	}
}

/// Mean of the rates, 0 when there are none.
fn mean_rate(rates: impl Iterator<Item = f64>) -> f64 {
	let rates = rates.collect::<Vec<_>>();
	if rates.is_empty() {
		return 0.0;
	}
	rates.mean()
}

/// Counts values, keeping the `top` most frequent ones ordered by count, then name.
pub fn distribution(values: impl Iterator<Item = String>, top: usize) -> Distribution {
	let histogram = values.counts().into_iter().collect::<BTreeMap<_, _>>();

	let top_n = histogram
		.iter()
		.sorted_by(|(a_name, a_count), (b_name, b_count)| {
			b_count.cmp(a_count).then_with(|| a_name.cmp(b_name))
		})
		.take(top)
		.map(|(name, count)| Bucket {
			name: name.clone(),
			count: *count,
		})
		.collect::<Vec<_>>();

	Distribution {
		top: top_n.first().cloned(),
		top_n,
		histogram,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		data::{tests::TestStore, MemoryStore, ScanPage, StoreError},
		network::crawler::{Geo, NetworkAddress},
		types::{Address, PerformanceFields, SlotMark, ValidatorHistoryEntry, ValidatorUpdate},
	};
	use async_trait::async_trait;
	use chrono::TimeZone;
	use std::collections::HashMap;

	fn now() -> DateTime<Utc> {
		Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap()
	}

	fn day_ago() -> DateTime<Utc> {
		now() - chrono::Duration::hours(24)
	}

	fn peer(id: &str, client: &str, country: Option<&str>) -> Peer {
		Peer {
			id: id.to_string(),
			client: client.to_string(),
			last_seen: now(),
			block_height: None,
			synced: None,
			addresses: vec![NetworkAddress {
				ip: "10.0.0.1".to_string(),
				port: 30333,
				geo: Some(Geo {
					country: country.map(str::to_string),
					city: None,
					isp: Some("Hetzner".to_string()),
				}),
			}],
		}
	}

	fn record(address: &str, missed: u64, total: u64) -> ValidatorRecord {
		let mut record = ValidatorRecord::new(address.into());
		record.performance = PerformanceFields {
			missed_attestations: missed,
			total_slots: total,
			..Default::default()
		};
		record
	}

	fn input(peers: &[Peer]) -> StatisticsInput<'_> {
		StatisticsInput {
			epoch: 7,
			on_chain: 3,
			current_slot: Some(100),
			peers,
			now: now(),
		}
	}

	#[test]
	fn test_zero_total_slots_gives_zero_miss_rates() {
		let records = vec![record("0xa", 0, 0), record("0xb", 0, 0)];

		let snapshot = compute_snapshot(&records, &input(&[]), day_ago(), 3);

		assert_eq!(snapshot.miss_rates.attestation, 0.0);
		assert_eq!(snapshot.miss_rates.proposal, 0.0);
		assert!(!snapshot.miss_rates.attestation.is_nan());
	}

	#[test]
	fn test_miss_rate_averages_measured_validators() {
		let records = vec![record("0xa", 1, 10), record("0xb", 3, 10), record("0xc", 0, 0)];

		let snapshot = compute_snapshot(&records, &input(&[]), day_ago(), 3);

		assert!((snapshot.miss_rates.attestation - 0.2).abs() < f64::EPSILON);
		assert_eq!(snapshot.validators.known, 3);
	}

	#[test]
	fn test_distributions_and_peer_counts() {
		let peers = vec![
			peer("p1", "lighthouse", Some("DE")),
			peer("p2", "prysm", Some("US")),
			peer("p3", "lighthouse", Some("DE")),
			peer("p4", "teku", Some("FR")),
			peer("p5", "nimbus", None),
		];
		let mut matched = record("0xa", 0, 0);
		matched.peer_id = Some("p1".to_string());
		let mut unmatched = record("0xb", 0, 0);
		unmatched.peer_id = Some("gone".to_string());

		let snapshot = compute_snapshot(&[matched, unmatched], &input(&peers), day_ago(), 2);

		assert_eq!(snapshot.peers.network, 5);
		assert_eq!(snapshot.peers.matched, 1);
		assert_eq!(snapshot.validators.with_peer, 2);
		assert_eq!(
			snapshot.countries.top,
			Some(Bucket {
				name: "DE".to_string(),
				count: 2
			})
		);
		let top_countries = snapshot
			.countries
			.top_n
			.iter()
			.map(|bucket| bucket.name.as_str())
			.collect::<Vec<_>>();
		assert_eq!(top_countries, vec!["DE", "FR"]);
		assert_eq!(snapshot.countries.histogram.len(), 3);
		assert_eq!(snapshot.isps.histogram["Hetzner"], 5);
		assert_eq!(snapshot.clients.histogram["lighthouse"], 2);
	}

	#[tokio::test]
	async fn test_active_count_uses_snapshot_time() {
		let store = MemoryStore::default();
		let attested = |address: &str, hours_ago: i64, flag: bool| {
			let mut record = ValidatorRecord::new(address.into());
			let timestamp = now() - chrono::Duration::hours(hours_ago);
			record.performance.last_attestation = Some(SlotMark::new(1, timestamp));
			record.performance.recently_active = flag;
			record
		};
		// flag written by an older pass, attestation now outside the window
		store.put_record(attested("0xa", 30, true));
		store.put_record(attested("0xb", 1, false));
		store.put_record(record("0xc", 0, 0));

		let snapshot = aggregate(&store, input(&[]), &SyncConfig::default())
			.await
			.completed()
			.cloned()
			.unwrap();

		assert_eq!(snapshot.validators.known, 3);
		assert_eq!(snapshot.validators.active_24h, 1);
	}

	#[test]
	fn test_empty_distribution() {
		let distribution = distribution(std::iter::empty(), 3);
		assert_eq!(distribution, Distribution::default());
	}

	#[tokio::test]
	async fn test_snapshot_is_stored_per_epoch() {
		let store = TestStore::new(MemoryStore::default());
		store.inner.put_record(record("0xa", 1, 4));

		let result = aggregate(&store, input(&[]), &SyncConfig::default()).await;

		let snapshot = result.completed().cloned().unwrap();
		assert_eq!(store.inner.snapshot(7), Some(snapshot));
	}

	struct BrokenStore;

	#[async_trait]
	impl RecordStore for BrokenStore {
		async fn ensure_exists(&self, _: &Address) -> Result<(), StoreError> {
			Ok(())
		}
		async fn batch_update(&self, _: Vec<ValidatorUpdate>) -> Result<usize, StoreError> {
			Ok(0)
		}
		async fn paginated_scan(&self, _: Option<String>, _: usize) -> Result<ScanPage, StoreError> {
			Err(StoreError::Backend("unreachable".to_string()))
		}
		async fn latest_history_slot(&self, _: &Address) -> Result<Option<u64>, StoreError> {
			Ok(None)
		}
		async fn latest_history_slots(
			&self,
			_: &[Address],
		) -> Result<HashMap<Address, u64>, StoreError> {
			Ok(HashMap::new())
		}
		async fn insert_history(
			&self,
			_: &Address,
			_: Vec<ValidatorHistoryEntry>,
		) -> Result<usize, StoreError> {
			Ok(0)
		}
		async fn upsert_snapshot(&self, _: NetworkStatsSnapshot) -> Result<(), StoreError> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn test_store_failure_is_contained() {
		let result = aggregate(&BrokenStore, input(&[]), &SyncConfig::default()).await;
		assert!(result.is_failed());
	}
}
