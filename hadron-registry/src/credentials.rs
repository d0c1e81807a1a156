//! Service account credential polling.
//!
//! The store only ever looks up the service account's API keys once per call. This module owns
//! the retry loop around that lookup for callers which need to wait for the keys to be issued.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::broadcast;

use crate::database::Database;
use crate::error::RegistryError;
use crate::models::ApiKeys;
use crate::store::MembershipStore;

/// Retry backoff bounds.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    /// The delay before the first retry.
    pub initial: Duration,
    /// The upper bound of the delay between retries, before jitter.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Wait for the service account's API keys to become available.
///
/// The store is polled with capped exponential backoff for as long as it reports the keys as
/// not ready. Storage faults are returned immediately. Returns `None` if shutdown is
/// signaled before the keys become available.
pub async fn await_api_keys(store: Arc<dyn MembershipStore>, backoff: Backoff, mut shutdown: broadcast::Receiver<()>) -> Result<Option<ApiKeys>> {
    let mut delay = backoff.initial;
    loop {
        let lookup = store.clone();
        match Database::spawn_blocking(move || lookup.api_keys()).await? {
            Ok(keys) => return Ok(Some(keys)),
            Err(RegistryError::NotReady) => (),
            Err(err) => return Err(err.into()),
        }

        let jitter = rand::thread_rng().gen_range(0..=(delay.as_millis() as u64 / 4));
        tokio::select! {
            _ = tokio::time::sleep(delay + Duration::from_millis(jitter)) => (),
            _ = shutdown.recv() => return Ok(None),
        }
        delay = (delay * 2).min(backoff.max);
    }
}
