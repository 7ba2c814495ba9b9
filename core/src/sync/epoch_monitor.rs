use super::{Orchestrator, SyncCheckpoint, SyncReport};
use crate::{
	data::RecordStore,
	network::{attestation::AttestationSource, chain::ChainReader, crawler::PeerCrawler},
	telemetry::SyncMetrics,
	utils::spawn_in_span,
};
use color_eyre::Result;
use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};
use tokio::{
	task::JoinHandle,
	time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Result of a single poll.
#[derive(Debug)]
pub enum Tick {
	/// A previous sync is still running.
	InFlight,
	/// The epoch was already synced.
	Unchanged(u64),
	/// The chain could not be read, retried next tick.
	ChainUnavailable,
	/// Sync of the new epoch started in the background.
	Started {
		epoch: u64,
		handle: JoinHandle<Result<SyncReport>>,
	},
}

struct State {
	in_flight: AtomicBool,
	last_synced_epoch: Mutex<Option<u64>>,
	checkpoint: tokio::sync::Mutex<SyncCheckpoint>,
}

impl State {
	fn last_synced_epoch(&self) -> Option<u64> {
		*self
			.last_synced_epoch
			.lock()
			.unwrap_or_else(|e| e.into_inner())
	}
}

/// Clears the in-flight flag when the sync task ends, whatever the outcome.
struct InFlightGuard(Arc<State>);

impl InFlightGuard {
	fn acquire(state: &Arc<State>) -> Option<Self> {
		state
			.in_flight
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.ok()
			.map(|_| Self(state.clone()))
	}
}

impl Drop for InFlightGuard {
	fn drop(&mut self) {
		self.0.in_flight.store(false, Ordering::SeqCst);
	}
}

/// Polls the chain and runs at most one sync at a time, once per new epoch.
pub struct EpochMonitor<C, S: ?Sized, A, P> {
	chain: C,
	orchestrator: Arc<Orchestrator<S, A, P>>,
	metrics: Arc<dyn SyncMetrics>,
	interval: Duration,
	state: Arc<State>,
}

impl<C, S, A, P> EpochMonitor<C, S, A, P>
where
	C: ChainReader,
	S: RecordStore + ?Sized + 'static,
	A: AttestationSource + 'static,
	P: PeerCrawler + 'static,
{
	pub fn new(
		chain: C,
		orchestrator: Orchestrator<S, A, P>,
		metrics: Arc<dyn SyncMetrics>,
		interval: Duration,
	) -> Self {
		Self {
			chain,
			orchestrator: Arc::new(orchestrator),
			metrics,
			interval,
			state: Arc::new(State {
				in_flight: AtomicBool::new(false),
				last_synced_epoch: Mutex::new(None),
				checkpoint: tokio::sync::Mutex::new(SyncCheckpoint::default()),
			}),
		}
	}

	pub fn last_synced_epoch(&self) -> Option<u64> {
		self.state.last_synced_epoch()
	}

	pub fn is_in_flight(&self) -> bool {
		self.state.in_flight.load(Ordering::SeqCst)
	}

	/// Rebuilds the known address set from the store.
	/// On failure the monitor starts with an empty checkpoint.
	pub async fn initialize(&self) {
		let page_size = self.orchestrator.config().scan_page_size;
		match SyncCheckpoint::rebuild(self.orchestrator.store(), page_size).await {
			Ok(checkpoint) => *self.state.checkpoint.lock().await = checkpoint,
			Err(error) => {
				warn!(%error, "Unable to rebuild sync checkpoint, starting empty");
			},
		}
	}

	/// Polls the current epoch and starts a sync when it advanced.
	pub async fn tick(&self) -> Tick {
		if self.is_in_flight() {
			warn!("Previous sync is still running, skipping tick");
			return Tick::InFlight;
		}

		let epoch = match self.chain.current_epoch().await {
			Ok(epoch) => epoch,
			Err(error) => {
				error!("Unable to read current epoch: {error:#}");
				return Tick::ChainUnavailable;
			},
		};

		if self.state.last_synced_epoch() == Some(epoch) {
			debug!(epoch, "Epoch already synced");
			return Tick::Unchanged(epoch);
		}

		let Some(guard) = InFlightGuard::acquire(&self.state) else {
			return Tick::InFlight;
		};
		// re-check under the guard
		if self.state.last_synced_epoch() == Some(epoch) {
			return Tick::Unchanged(epoch);
		}

		let on_chain = match self.chain.current_validator_set().await {
			Ok(on_chain) => on_chain,
			Err(error) => {
				error!(epoch, "Unable to read validator set: {error:#}");
				return Tick::ChainUnavailable;
			},
		};

		info!(epoch, validators = on_chain.len(), "New epoch, starting sync");

		let orchestrator = self.orchestrator.clone();
		let metrics = self.metrics.clone();
		let state = self.state.clone();
		let interval = self.interval;

		let handle = spawn_in_span(async move {
			let _guard = guard;
			let started = Instant::now();

			let result = {
				let mut checkpoint = state.checkpoint.lock().await;
				orchestrator.run(epoch, on_chain, &mut checkpoint).await
			};

			let elapsed = started.elapsed();
			if elapsed > interval {
				warn!(epoch, ?elapsed, ?interval, "Sync took longer than the poll interval");
				metrics.count_overrun();
			}

			match &result {
				Ok(_) => {
					*state
						.last_synced_epoch
						.lock()
						.unwrap_or_else(|e| e.into_inner()) = Some(epoch);
					metrics.record_synced_epoch(epoch);
				},
				Err(error) => error!(epoch, "Sync failed, retrying on next tick: {error:#}"),
			}
			result
		});

		Tick::Started { epoch, handle }
	}

	/// Initializes the checkpoint, then ticks on a fixed interval forever.
	pub async fn run(self) {
		self.initialize().await;

		let mut interval = time::interval(self.interval);
		interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			interval.tick().await;
			if let Tick::Started { epoch, .. } = self.tick().await {
				debug!(epoch, "Sync running in background");
			}
		}
	}
}
