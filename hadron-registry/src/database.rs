//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult};

pub type Tree = sled::Tree;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/hadron/registry";
/// The DB tree used for cluster member rows, keyed by storage ID.
const TREE_CLUSTER: &str = "cluster";
/// The DB tree used to index cluster member storage IDs by UUID.
const TREE_CLUSTER_UUID: &str = "cluster_uuid";
/// The DB tree used for service accounts.
const TREE_ACCOUNT: &str = "account";
/// The DB tree used for service account credentials.
const TREE_CREDENTIAL: &str = "credential";
/// The DB tree used for registry metadata.
const TREE_REGISTRY_METADATA: &str = "registry_meta";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the Hadron registry database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// System runtime config.
    #[allow(dead_code)]
    config: Arc<Config>,
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path);
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for hadron registry database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).open()?;
            let inner = Arc::new(DatabaseInner { config, db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Get a handle to the DB tree for cluster member rows.
    pub fn get_cluster_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_CLUSTER)
    }

    /// Get a handle to the DB tree indexing cluster members by UUID.
    pub fn get_cluster_uuid_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_CLUSTER_UUID)
    }

    /// Get a handle to the DB tree for service accounts.
    pub fn get_account_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_ACCOUNT)
    }

    /// Get a handle to the DB tree for service account credentials.
    pub fn get_credential_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_CREDENTIAL)
    }

    /// Get a handle to the DB tree for registry metadata.
    pub fn get_metadata_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_REGISTRY_METADATA)
    }

    fn open_tree(&self, name: &str) -> ShutdownResult<Tree> {
        self.inner
            .db
            .open_tree(IVec::from(name))
            .map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", name, err)))
    }
}
