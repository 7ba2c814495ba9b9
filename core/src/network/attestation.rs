use super::rpc;
use crate::types::{duration_seconds_format, ValidatorHistoryEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

pub const LOCAL_ATTESTATION_ENDPOINT: &str = "http://127.0.0.1:9933";

const VALIDATOR_STATS_METHOD: &str = "telemetry_validatorStats";

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct AttestationConfig {
	/// JSON-RPC endpoint of the node exposing attestation telemetry (default: http://127.0.0.1:9933).
	pub attestation_endpoint: String,
	/// Telemetry request timeout in seconds. The call returns data for every validator,
	/// so it is allowed to take longer than chain reads (default: 60).
	#[serde(with = "duration_seconds_format")]
	pub attestation_request_timeout: Duration,
}

impl Default for AttestationConfig {
	fn default() -> Self {
		Self {
			attestation_endpoint: LOCAL_ATTESTATION_ENDPOINT.to_string(),
			attestation_request_timeout: Duration::from_secs(60),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SlotEvent {
	pub slot: u64,
	#[serde(with = "chrono::serde::ts_seconds")]
	pub timestamp: DateTime<Utc>,
}

/// Raw per-validator telemetry, as reported by the node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ValidatorStats {
	pub last_attestation: Option<SlotEvent>,
	pub last_proposal: Option<SlotEvent>,
	pub missed_attestations: u64,
	pub missed_proposals: u64,
	pub total_slots: u64,
	/// Recent history slice, not necessarily contiguous.
	pub history: Vec<ValidatorHistoryEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AttestationStats {
	/// Stats keyed by validator address, in the casing used by the node.
	pub per_address: HashMap<String, ValidatorStats>,
	/// Last slot the node has processed.
	pub last_processed_slot: Option<u64>,
}

/// Fetches attestation and proposal telemetry for all validators in a single call.
#[async_trait]
#[automock]
pub trait AttestationSource: Send + Sync {
	async fn fetch_stats(&self) -> Result<AttestationStats>;
}

#[derive(Clone)]
pub struct Client {
	rpc: rpc::Client,
}

impl Client {
	pub fn new(config: &AttestationConfig) -> Result<Self> {
		Ok(Self {
			rpc: rpc::Client::new(
				&config.attestation_endpoint,
				config.attestation_request_timeout,
			)?,
		})
	}
}

#[async_trait]
impl AttestationSource for Client {
	async fn fetch_stats(&self) -> Result<AttestationStats> {
		self.rpc.call(VALIDATOR_STATS_METHOD).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::HistoryStatus;

	#[test]
	fn test_stats_deserialize_with_missing_fields() {
		let json = r#"{
			"perAddress": {
				"0xABC": {
					"lastAttestation": { "slot": 120, "timestamp": 1700000000 },
					"missedAttestations": 3,
					"totalSlots": 40,
					"history": [{ "slot": 119, "status": "attested" }]
				},
				"0xdef": {}
			},
			"lastProcessedSlot": 120
		}"#;

		let stats: AttestationStats = serde_json::from_str(json).unwrap();
		assert_eq!(stats.last_processed_slot, Some(120));

		let abc = &stats.per_address["0xABC"];
		assert_eq!(abc.last_attestation.as_ref().map(|event| event.slot), Some(120));
		assert_eq!(abc.missed_attestations, 3);
		assert_eq!(abc.missed_proposals, 0);
		assert_eq!(abc.history[0].status, HistoryStatus::Attested);

		assert_eq!(stats.per_address["0xdef"], ValidatorStats::default());
	}
}
