//! Shared validator sync structs and enums.
use chrono::{DateTime, NaiveDate, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

/// Canonical validator address.
///
/// Addresses coming from different sources differ in casing and may carry
/// surrounding whitespace, so every address is trimmed and lower-cased on
/// construction. Two `Address` values are equal iff they denote the same validator.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Address(String);

impl Address {
	pub fn new(raw: &str) -> Self {
		Self(raw.trim().to_lowercase())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<String> for Address {
	fn from(value: String) -> Self {
		Address::new(&value)
	}
}

impl From<&str> for Address {
	fn from(value: &str) -> Self {
		Address::new(value)
	}
}

impl From<Address> for String {
	fn from(value: Address) -> Self {
		value.0
	}
}

/// Slot at which a validator last attested or proposed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotMark {
	pub slot: u64,
	pub timestamp: DateTime<Utc>,
	pub date: NaiveDate,
}

impl SlotMark {
	pub fn new(slot: u64, timestamp: DateTime<Utc>) -> Self {
		Self {
			slot,
			timestamp,
			date: timestamp.date_naive(),
		}
	}
}

/// Performance counters derived from the attestation telemetry source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceFields {
	/// Validator attested within the recent activity window (24h by default).
	pub recently_active: bool,
	pub last_attestation: Option<SlotMark>,
	pub last_proposal: Option<SlotMark>,
	pub missed_attestations: u64,
	pub missed_proposals: u64,
	pub total_slots: u64,
}

/// Flat peer metadata derived from the peer crawler listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetadata {
	pub client: String,
	pub country: Option<String>,
	pub city: Option<String>,
	pub isp: Option<String>,
	pub ip: Option<String>,
	pub port: Option<u16>,
	pub synced: Option<bool>,
	pub block_height: Option<u64>,
	pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRecord {
	pub address: Address,
	/// Operator association, assigned by external administrative flows.
	pub operator: Option<String>,
	/// Member of the current on-chain validator set.
	pub in_active_set: bool,
	#[serde(flatten)]
	pub performance: PerformanceFields,
	/// Peer identity, assigned by external administrative flows.
	pub peer_id: Option<String>,
	pub peer: Option<PeerMetadata>,
	pub updated_at: Option<DateTime<Utc>>,
}

impl ValidatorRecord {
	pub fn new(address: Address) -> Self {
		Self {
			address,
			operator: None,
			in_active_set: false,
			performance: PerformanceFields::default(),
			peer_id: None,
			peer: None,
			updated_at: None,
		}
	}

	/// Overwrites the field group carried by `fields`.
	pub fn apply(&mut self, fields: ValidatorFields, now: DateTime<Utc>) {
		match fields {
			ValidatorFields::ActiveSet(in_active_set) => self.in_active_set = in_active_set,
			ValidatorFields::Performance(performance) => self.performance = performance,
			ValidatorFields::Peer(peer) => self.peer = Some(peer),
		}
		self.updated_at = Some(now);
	}
}

/// Field group written by a single reconciliation stage.
///
/// Each stage owns its group, and a write replaces the group as a whole.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "fields", rename_all = "snake_case")]
pub enum ValidatorFields {
	ActiveSet(bool),
	Performance(PerformanceFields),
	Peer(PeerMetadata),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorUpdate {
	pub address: Address,
	pub fields: ValidatorFields,
}

impl ValidatorUpdate {
	pub fn new(address: Address, fields: ValidatorFields) -> Self {
		Self { address, fields }
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
	Attested,
	Proposed,
	Missed,
	MissedAttestation,
	MissedProposal,
	#[serde(other)]
	Unknown,
}

/// One history entry, keyed by (validator address, slot) in the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorHistoryEntry {
	pub slot: u64,
	pub status: HistoryStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
	pub name: String,
	pub count: usize,
}

/// Histogram reduced to its most frequent entries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
	pub top: Option<Bucket>,
	pub top_n: Vec<Bucket>,
	pub histogram: BTreeMap<String, usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorCounts {
	pub on_chain: usize,
	pub known: usize,
	pub active_24h: usize,
	pub with_operator: usize,
	pub with_peer: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MissRates {
	pub attestation: f64,
	pub proposal: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCounts {
	/// Peers listed by the crawler during this pass.
	pub network: usize,
	/// Validators whose peer identity matched a listed peer.
	pub matched: usize,
}

/// Network-wide statistics, one per epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatsSnapshot {
	pub epoch: u64,
	pub current_slot: Option<u64>,
	pub validators: ValidatorCounts,
	pub miss_rates: MissRates,
	pub peers: PeerCounts,
	pub countries: Distribution,
	pub clients: Distribution,
	pub isps: Distribution,
	pub computed_at: DateTime<Utc>,
}

pub mod tracing_level_format {
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::str::FromStr;
	use tracing::Level;

	pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&level.to_string())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		Level::from_str(&value).map_err(serde::de::Error::custom)
	}
}

pub mod duration_seconds_format {
	use super::Duration;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_secs())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_secs(value))
	}
}

pub mod duration_millis_format {
	use super::Duration;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_millis() as u64)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_millis(value))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_case::test_case;

	#[test_case("0xAbCd" => "0xabcd")]
	#[test_case("  0xabcd \n" => "0xabcd")]
	#[test_case("0XABCD" => "0xabcd")]
	fn test_address_canonical_form(raw: &str) -> String {
		Address::new(raw).to_string()
	}

	#[test]
	fn test_address_deserialize_canonicalizes() {
		let address: Address = serde_json::from_str("\"0xDEADBEEF\"").unwrap();
		assert_eq!(address, Address::new("0xdeadbeef"));
	}

	#[test]
	fn test_history_status_unknown_variant() {
		let status: HistoryStatus = serde_json::from_str("\"orphaned\"").unwrap();
		assert_eq!(status, HistoryStatus::Unknown);
		let status: HistoryStatus = serde_json::from_str("\"missed_attestation\"").unwrap();
		assert_eq!(status, HistoryStatus::MissedAttestation);
	}

	#[test]
	fn test_apply_overwrites_field_group() {
		let now = Utc::now();
		let mut record = ValidatorRecord::new(Address::new("0xa"));
		record.performance.missed_attestations = 7;

		record.apply(
			ValidatorFields::Performance(PerformanceFields {
				missed_proposals: 2,
				..Default::default()
			}),
			now,
		);

		assert_eq!(record.performance.missed_attestations, 0);
		assert_eq!(record.performance.missed_proposals, 2);
		assert_eq!(record.updated_at, Some(now));
	}
}
