/// Column families used for persistence:
/// Column family for validator records, keyed by address
#[cfg_attr(not(feature = "rocksdb"), allow(dead_code))]
pub const VALIDATORS_CF: &str = "validators_cf";
/// Column family for validator history, keyed by address and slot
#[cfg_attr(not(feature = "rocksdb"), allow(dead_code))]
pub const HISTORY_CF: &str = "history_cf";
/// Column family for network statistics snapshots, keyed by epoch
#[cfg_attr(not(feature = "rocksdb"), allow(dead_code))]
pub const SNAPSHOTS_CF: &str = "snapshots_cf";

/// Separator between address and slot in history keys
const HISTORY_SEPARATOR: char = ':';

/// History key for the given address and slot.
/// Slots are zero padded so that byte order matches numeric order.
#[cfg_attr(not(feature = "rocksdb"), allow(dead_code))]
pub fn history_key(address: &str, slot: u64) -> String {
	format!("{address}{HISTORY_SEPARATOR}{slot:020}")
}

/// Key prefix shared by all history entries of an address.
#[cfg_attr(not(feature = "rocksdb"), allow(dead_code))]
pub fn history_prefix(address: &str) -> String {
	format!("{address}{HISTORY_SEPARATOR}")
}

/// Upper bound sorting right after every history key of an address.
#[cfg_attr(not(feature = "rocksdb"), allow(dead_code))]
pub fn history_upper_bound(address: &str) -> String {
	// ';' directly follows ':' in byte order
	format!("{address};")
}

/// Parses the slot from a history key with a known prefix.
#[cfg_attr(not(feature = "rocksdb"), allow(dead_code))]
pub fn history_slot(key: &[u8], prefix: &str) -> Option<u64> {
	let key = std::str::from_utf8(key).ok()?;
	key.strip_prefix(prefix)?.parse().ok()
}

/// Snapshot key for the given epoch.
#[cfg_attr(not(feature = "rocksdb"), allow(dead_code))]
pub fn snapshot_key(epoch: u64) -> [u8; 8] {
	epoch.to_be_bytes()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_history_keys_sort_numerically() {
		let low = history_key("0xa", 9);
		let high = history_key("0xa", 10);
		assert!(low < high);
		assert!(high < history_upper_bound("0xa"));
	}

	#[test]
	fn test_history_slot_roundtrip() {
		let key = history_key("0xa", 42);
		assert_eq!(history_slot(key.as_bytes(), &history_prefix("0xa")), Some(42));
		assert_eq!(history_slot(key.as_bytes(), &history_prefix("0xb")), None);
	}
}
