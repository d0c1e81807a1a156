use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::assignment::IndexAssigner;
use crate::config::Config;
use crate::credentials::{await_api_keys, Backoff};
use crate::database::Database;
use crate::heartbeat::{Heartbeat, MemberViewRx};
use crate::server::spawn_http_server;
use crate::store::{HttpStore, MembershipStore, SledStore};

/// The application object for when the registry is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system, only opened by the registry host.
    _db: Option<Database>,
    /// This member's view of its own registration.
    _member_view: MemberViewRx,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of this member's heartbeat.
    heartbeat_handle: JoinHandle<Result<()>>,
    /// The join handle of the index assigner, when this instance is the registry host.
    assigner_handle: Option<JoinHandle<Result<()>>>,
    /// The join handle of the API keys waiter, when configured.
    api_keys_handle: Option<JoinHandle<Result<()>>>,
    /// The join handle of the HTTP server.
    http_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);

        // Initialize the registry's storage, or a client of the registry host.
        let (db, store): (Option<Database>, Arc<dyn MembershipStore>) = match &config.registry_url {
            None => {
                let db = Database::new(config.clone()).await.context("error opening database")?;
                let store = SledStore::new(&db, config.service_account_uuid.as_str())?;
                (Some(db), Arc::new(store))
            }
            Some(url) => (None, Arc::new(HttpStore::new(url.as_str(), config.registry_timeout())?)),
        };
        let bootstrap_store = store.clone();
        Database::spawn_blocking(move || bootstrap_store.bootstrap())
            .await?
            .context("error bootstrapping registry storage")?;

        // Spawn various core tasks.
        let (assigner_handle, served_store) = if db.is_some() {
            let assigner = IndexAssigner::new(config.clone(), store.clone(), shutdown_tx.subscribe());
            (Some(assigner.spawn()), Some(store.clone()))
        } else {
            (None, None)
        };
        let http_server = spawn_http_server(&config, served_store, shutdown_tx.subscribe())?;

        let (heartbeat, member_view) = Heartbeat::new(config.clone(), store.clone(), shutdown_tx.subscribe());
        let heartbeat_handle = heartbeat.spawn();

        let api_keys_handle = if config.await_api_keys {
            Some(spawn_api_keys_waiter(store, shutdown_tx.subscribe()))
        } else {
            None
        };

        Ok(Self {
            _config: config,
            _db: db,
            _member_view: member_view,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            heartbeat_handle,
            assigner_handle,
            api_keys_handle,
            http_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Hadron registry is shutting down");
        if let Err(err) = self.heartbeat_handle.await.context("error joining heartbeat handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down member heartbeat");
        }
        if let Some(handle) = self.assigner_handle {
            if let Err(err) = handle.await.context("error joining index assigner handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down index assigner");
            }
        }
        if let Some(handle) = self.api_keys_handle {
            if let Err(err) = handle.await.context("error joining API keys waiter handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down API keys waiter");
            }
        }
        if let Err(err) = self.http_server.await.context("error joining http server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down http server");
        }

        tracing::debug!("Hadron registry shutdown complete");
        Ok(())
    }
}

/// Spawn a task which waits for the service account's API keys to become available.
fn spawn_api_keys_waiter(store: Arc<dyn MembershipStore>, shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        match await_api_keys(store, Backoff::default(), shutdown).await? {
            Some(keys) => tracing::info!(access_key = %keys.access_key, "service account API keys are available"),
            None => tracing::debug!("stopped waiting for service account API keys"),
        }
        Ok(())
    })
}
