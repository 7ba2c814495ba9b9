use super::{SyncCheckpoint, SyncConfig};
use crate::{
	data::{scan_all, RecordStore},
	network::crawler::{Peer, PeerCrawler},
	types::{Address, PeerMetadata, ValidatorFields, ValidatorUpdate},
};
use color_eyre::{eyre::WrapErr, Result};
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerOutcome {
	/// Validators carrying a peer identity.
	pub validators_with_peer: usize,
	/// Peers returned by the crawler.
	pub listed: usize,
	/// Listed peers seen since the previous pass.
	pub fresh: usize,
	pub updated: usize,
}

/// Refreshes peer metadata of validators whose peer was seen since the previous pass.
///
/// Returns the outcome together with the full crawler listing, which feeds the
/// network distributions. Without any validator carrying a peer identity the
/// crawler is not queried.
pub async fn reconcile<S, P>(
	store: &S,
	crawler: &P,
	checkpoint: &mut SyncCheckpoint,
	config: &SyncConfig,
) -> Result<(PeerOutcome, Vec<Peer>)>
where
	S: RecordStore + ?Sized,
	P: PeerCrawler + ?Sized,
{
	let records = scan_all(store, config.scan_page_size)
		.await
		.wrap_err("Unable to scan validator records")?;

	let mut by_peer: HashMap<String, Vec<Address>> = HashMap::new();
	for record in records {
		if let Some(peer_id) = record.peer_id {
			by_peer.entry(peer_id).or_default().push(record.address);
		}
	}

	if by_peer.is_empty() {
		info!("No validators with peer identity, skipping peer sync");
		return Ok((PeerOutcome::default(), vec![]));
	}

	let PeerListing { peers, truncated } =
		list_all_peers(crawler, config.crawler_page_size, config.crawler_max_pages)
			.await
			.wrap_err("Unable to list crawler peers")?;

	let since = checkpoint.last_peer_seen();
	let mut outcome = PeerOutcome {
		validators_with_peer: by_peer.values().map(Vec::len).sum(),
		listed: peers.len(),
		..Default::default()
	};

	let mut updates = vec![];
	for peer in peers
		.iter()
		.filter(|peer| since.map_or(true, |since| peer.last_seen > since))
	{
		outcome.fresh += 1;
		let Some(addresses) = by_peer.get(&peer.id) else {
			continue;
		};
		let metadata = peer_metadata(peer);
		updates.extend(addresses.iter().map(|address| {
			ValidatorUpdate::new(address.clone(), ValidatorFields::Peer(metadata.clone()))
		}));
	}

	if !updates.is_empty() {
		outcome.updated = store
			.batch_update(updates)
			.await
			.wrap_err("Unable to write peer metadata")?;
	}

	// unread pages may hold peers older than the ones listed
	if truncated {
		warn!("Crawler listing incomplete, keeping peer checkpoint");
	} else if let Some(latest) = peers.iter().map(|peer| peer.last_seen).max() {
		checkpoint.advance_peer_seen(latest);
	}

	info!(
		listed = outcome.listed,
		fresh = outcome.fresh,
		updated = outcome.updated,
		"Merged peer metadata"
	);
	Ok((outcome, peers))
}

#[derive(Debug, Default)]
pub struct PeerListing {
	pub peers: Vec<Peer>,
	/// Listing stopped before the crawler ran out of pages.
	pub truncated: bool,
}

/// Follows continuation tokens up to `max_pages` pages.
pub async fn list_all_peers<P: PeerCrawler + ?Sized>(
	crawler: &P,
	page_size: usize,
	max_pages: usize,
) -> Result<PeerListing> {
	let mut peers = vec![];
	let mut continuation: Option<String> = None;

	for page in 0..max_pages {
		let listing = crawler.list_peers(page_size, continuation.clone()).await?;
		debug!(page, peers = listing.peers.len(), "Fetched crawler page");
		peers.extend(listing.peers);

		match listing.next_token {
			None => {
				return Ok(PeerListing {
					peers,
					truncated: false,
				})
			},
			Some(token) if continuation.as_ref() == Some(&token) => {
				warn!(token, "Crawler continuation token did not advance, stopping");
				return Ok(PeerListing {
					peers,
					truncated: true,
				});
			},
			Some(token) => continuation = Some(token),
		}
	}

	warn!(max_pages, "Crawler listing truncated at page limit");
	Ok(PeerListing {
		peers,
		truncated: true,
	})
}

/// Flattens a crawler peer, taking network details from its first address.
pub fn peer_metadata(peer: &Peer) -> PeerMetadata {
	let address = peer.addresses.first();
	let geo = address.and_then(|address| address.geo.clone()).unwrap_or_default();

	PeerMetadata {
		client: peer.client.clone(),
		country: geo.country,
		city: geo.city,
		isp: geo.isp,
		ip: address.map(|address| address.ip.clone()),
		port: address.map(|address| address.port),
		synced: peer.synced,
		block_height: peer.block_height,
		last_seen: peer.last_seen,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		data::{tests::TestStore, MemoryStore},
		network::crawler::{Geo, MockPeerCrawler, NetworkAddress, PeerPage},
		types::ValidatorRecord,
	};
	use chrono::{DateTime, TimeZone, Utc};

	fn at(hour: u32) -> DateTime<Utc> {
		Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
	}

	fn peer(id: &str, last_seen: DateTime<Utc>) -> Peer {
		Peer {
			id: id.to_string(),
			client: "lighthouse".to_string(),
			last_seen,
			block_height: Some(10),
			synced: Some(true),
			addresses: vec![NetworkAddress {
				ip: "10.0.0.1".to_string(),
				port: 9000,
				geo: Some(Geo {
					country: Some("DE".to_string()),
					city: Some("Berlin".to_string()),
					isp: Some("Hetzner".to_string()),
				}),
			}],
		}
	}

	fn crawler_listing(peers: Vec<Peer>) -> MockPeerCrawler {
		let mut crawler = MockPeerCrawler::new();
		crawler.expect_list_peers().returning(move |_, _| {
			let peers = peers.clone();
			Box::pin(async move {
				Ok(PeerPage {
					peers,
					next_token: None,
				})
			})
		});
		crawler
	}

	fn store_with_peer(address: &str, peer_id: &str) -> TestStore {
		let store = TestStore::new(MemoryStore::default());
		let mut record = ValidatorRecord::new(address.into());
		record.peer_id = Some(peer_id.to_string());
		store.inner.put_record(record);
		store.inner.put_record(ValidatorRecord::new("0xother".into()));
		store
	}

	#[tokio::test]
	async fn test_unchanged_last_seen_is_not_rewritten() {
		let store = store_with_peer("0xa", "peer-1");
		let crawler = crawler_listing(vec![peer("peer-1", at(10)), peer("peer-2", at(11))]);
		let mut checkpoint = SyncCheckpoint::default();
		let config = SyncConfig::default();

		let (first, listing) = reconcile(&store, &crawler, &mut checkpoint, &config)
			.await
			.unwrap();
		assert_eq!(first.updated, 1);
		assert_eq!(listing.len(), 2);
		assert_eq!(checkpoint.last_peer_seen(), Some(at(11)));

		let record = store.inner.record(&"0xa".into()).unwrap();
		let metadata = record.peer.unwrap();
		assert_eq!(metadata.country.as_deref(), Some("DE"));
		assert_eq!(metadata.last_seen, at(10));

		let writes = store.writes();
		let (second, _) = reconcile(&store, &crawler, &mut checkpoint, &config)
			.await
			.unwrap();
		assert_eq!(second.fresh, 0);
		assert_eq!(second.updated, 0);
		assert_eq!(store.writes(), writes);
	}

	#[tokio::test]
	async fn test_skips_crawler_without_peer_identities() {
		let store = TestStore::new(MemoryStore::default());
		store.inner.put_record(ValidatorRecord::new("0xa".into()));
		let mut crawler = MockPeerCrawler::new();
		crawler.expect_list_peers().never();
		let mut checkpoint = SyncCheckpoint::default();

		let (outcome, listing) = reconcile(&store, &crawler, &mut checkpoint, &SyncConfig::default())
			.await
			.unwrap();

		assert_eq!(outcome, PeerOutcome::default());
		assert!(listing.is_empty());
		assert_eq!(checkpoint.last_peer_seen(), None);
	}

	#[tokio::test]
	async fn test_listing_stops_at_page_limit() {
		let mut crawler = MockPeerCrawler::new();
		crawler.expect_list_peers().times(3).returning(|_, continuation| {
			let page = continuation.map_or(0, |token| token.parse::<u32>().unwrap());
			Box::pin(async move {
				Ok(PeerPage {
					peers: vec![peer(&format!("peer-{page}"), at(page))],
					next_token: Some((page + 1).to_string()),
				})
			})
		});

		let listing = list_all_peers(&crawler, 1, 3).await.unwrap();
		assert_eq!(listing.peers.len(), 3);
		assert!(listing.truncated);
	}

	#[tokio::test]
	async fn test_listing_stops_on_repeated_token() {
		let mut crawler = MockPeerCrawler::new();
		crawler.expect_list_peers().times(2).returning(|_, _| {
			Box::pin(async {
				Ok(PeerPage {
					peers: vec![peer("peer-1", at(1))],
					next_token: Some("same".to_string()),
				})
			})
		});

		let listing = list_all_peers(&crawler, 1, 10).await.unwrap();
		assert_eq!(listing.peers.len(), 2);
		assert!(listing.truncated);
	}

	#[tokio::test]
	async fn test_truncated_listing_keeps_checkpoint() {
		let store = store_with_peer("0xa", "mine");
		let mut crawler = MockPeerCrawler::new();
		crawler.expect_list_peers().returning(|_, continuation| {
			let (peers, next_token) = match continuation {
				None => (vec![peer("other", at(10))], Some("2".to_string())),
				Some(_) => (vec![peer("mine", at(5))], None),
			};
			Box::pin(async move { Ok(PeerPage { peers, next_token }) })
		});
		let mut checkpoint = SyncCheckpoint::default();

		let limited = SyncConfig {
			crawler_max_pages: 1,
			..Default::default()
		};
		let (first, _) = reconcile(&store, &crawler, &mut checkpoint, &limited)
			.await
			.unwrap();
		assert_eq!(first.updated, 0);
		assert_eq!(checkpoint.last_peer_seen(), None);

		let (second, listing) = reconcile(&store, &crawler, &mut checkpoint, &SyncConfig::default())
			.await
			.unwrap();
		assert_eq!(listing.len(), 2);
		assert_eq!(second.updated, 1);
		let metadata = store.inner.record(&"0xa".into()).unwrap().peer.unwrap();
		assert_eq!(metadata.last_seen, at(5));
		assert_eq!(checkpoint.last_peer_seen(), Some(at(10)));
	}

	#[test]
	fn test_peer_metadata_without_addresses() {
		let mut bare = peer("peer-1", at(1));
		bare.addresses.clear();

		let metadata = peer_metadata(&bare);
		assert_eq!(metadata.client, "lighthouse");
		assert_eq!(metadata.ip, None);
		assert_eq!(metadata.country, None);
	}
}
