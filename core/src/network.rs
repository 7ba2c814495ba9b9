//! Upstream sources of truth.
//!
//! Each source is a trait seam with one HTTP implementation:
//! - [`chain`] reads the current epoch and the on-chain validator set,
//! - [`attestation`] fetches attestation and proposal telemetry for all validators at once,
//! - [`crawler`] lists network peers with their geo and client metadata, page by page.
use color_eyre::{eyre::WrapErr, Result};
use std::time::Duration;

pub mod attestation;
pub mod chain;
pub mod crawler;
pub mod rpc;

/// Builds the HTTP client shared by the source clients. Timeouts are enforced here.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
	reqwest::Client::builder()
		.timeout(timeout)
		.build()
		.wrap_err("Unable to build HTTP client")
}
