use futures::Future;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Coordinates graceful shutdown of the sync tasks.
///
/// The first call to [`Controller::trigger_shutdown`] stores the reason and
/// cancels every future wrapped with [`Controller::with_cancel`].
pub struct Controller<T: Clone> {
	token: CancellationToken,
	reason: Arc<Mutex<Option<T>>>,
}

impl<T: Clone> Clone for Controller<T> {
	fn clone(&self) -> Self {
		Self {
			token: self.token.clone(),
			reason: self.reason.clone(),
		}
	}
}

impl<T: Clone> Default for Controller<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Clone> Controller<T> {
	pub fn new() -> Self {
		Self {
			token: CancellationToken::new(),
			reason: Arc::new(Mutex::new(None)),
		}
	}

	/// Starts the shutdown. Returns the already stored reason if shutdown has begun before.
	pub fn trigger_shutdown(&self, reason: T) -> Result<(), T> {
		let mut stored = self.reason.lock().unwrap_or_else(|e| e.into_inner());
		if let Some(existing) = stored.as_ref() {
			return Err(existing.clone());
		}
		*stored = Some(reason);
		drop(stored);
		self.token.cancel();
		Ok(())
	}

	pub fn is_shutdown_triggered(&self) -> bool {
		self.token.is_cancelled()
	}

	fn stored_reason(&self) -> Option<T> {
		self.reason
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.clone()
	}

	/// Resolves with the shutdown reason once shutdown has been triggered.
	pub async fn triggered_shutdown(&self) -> Option<T> {
		self.token.cancelled().await;
		self.stored_reason()
	}

	/// Runs the future until it completes or shutdown is triggered,
	/// in which case the shutdown reason is returned as error.
	pub fn with_cancel<F>(&self, future: F) -> impl Future<Output = Result<F::Output, T>>
	where
		F: Future,
	{
		let controller = self.clone();
		async move {
			tokio::select! {
				biased;
				_ = controller.token.cancelled() => {
					Err(controller.stored_reason().expect("Reason is stored before cancel"))
				},
				output = future => Ok(output),
			}
		}
	}

	/// Resolves after triggering shutdown with the given reason on the first termination signal.
	pub fn on_user_signal(&self, reason: T) -> impl Future<Output = ()> {
		let controller = self.clone();
		async move {
			user_signal().await;
			info!("Received termination signal");
			let _ = controller.trigger_shutdown(reason);
		}
	}
}

/// Completes upon receiving one of the default termination signals.
///
/// On Unix-based systems, these signals are Ctrl-C (SIGINT) or SIGTERM,
/// and on Windows, they are Ctrl-C, Ctrl-Close, Ctrl-Shutdown.
pub async fn user_signal() {
	let ctrl_c = tokio::signal::ctrl_c();
	#[cfg(all(unix, not(windows)))]
	{
		let sig = async {
			let mut os_sig =
				tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
			os_sig.recv().await;
			std::io::Result::Ok(())
		};

		tokio::select! {
			_ = ctrl_c => {},
			_ = sig => {}
		}
	}

	#[cfg(all(not(unix), windows))]
	{
		let ctrl_close = async {
			let mut sig = tokio::signal::windows::ctrl_close()?;
			sig.recv().await;
			std::io::Result::Ok(())
		};
		let ctrl_shutdown = async {
			let mut sig = tokio::signal::windows::ctrl_shutdown()?;
			sig.recv().await;
			std::io::Result::Ok(())
		};
		tokio::select! {
			_ = ctrl_c => {},
			_ = ctrl_close => {},
			_ = ctrl_shutdown => {},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::Controller;
	use std::time::Duration;

	#[tokio::test]
	async fn with_cancel_returns_reason() {
		let shutdown = Controller::<String>::new();

		let task = tokio::spawn(
			shutdown.with_cancel(tokio::time::sleep(Duration::from_secs(3600))),
		);
		shutdown.trigger_shutdown("stop".to_string()).unwrap();

		assert_eq!(task.await.unwrap(), Err("stop".to_string()));
	}

	#[tokio::test]
	async fn with_cancel_passes_output() {
		let shutdown = Controller::<String>::new();
		assert_eq!(shutdown.with_cancel(async { 7 }).await, Ok(7));
	}

	#[tokio::test]
	async fn first_reason_wins() {
		let shutdown = Controller::new();
		assert!(shutdown.trigger_shutdown("first").is_ok());
		assert_eq!(shutdown.trigger_shutdown("second"), Err("first"));
		assert_eq!(shutdown.triggered_shutdown().await, Some("first"));
		assert!(shutdown.is_shutdown_triggered());
	}
}
