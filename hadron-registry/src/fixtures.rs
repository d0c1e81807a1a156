use anyhow::Result;

use crate::config::{Config, DEFAULT_SERVICE_ACCOUNT};
use crate::database::Database;
use crate::models::{Account, Credential, Member, ResourceState};
use crate::store::{MemoryStore, SledStore};

/// The storage ID of the service account created by these fixtures.
pub const SERVICE_ACCOUNT_ID: u64 = 7;
/// The access key of the credential created by these fixtures.
pub const ACCESS_KEY: &str = "access-key";
/// The secret key of the credential created by these fixtures.
pub const SECRET_KEY: &str = "secret-key";

/// Open a sled store over a temporary database.
///
/// The returned `TempDir` must be kept alive for as long as the store is in use.
pub async fn sled_store() -> Result<(SledStore, Database, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let store = SledStore::new(&db, config.service_account_uuid.as_str())?;
    Ok((store, db, tmpdir))
}

/// Create a new in-memory store.
pub fn memory_store() -> MemoryStore {
    MemoryStore::new(DEFAULT_SERVICE_ACCOUNT)
}

/// A new member for checkin.
pub fn member(uuid: &str, requested_index: u32) -> Member {
    Member::new(uuid, format!("10.0.0.{}", uuid.len()))
        .with_name(format!("member-{}", uuid))
        .with_requested_index(requested_index)
}

/// The well-known service account in the given state.
pub fn service_account(state: ResourceState) -> Account {
    Account {
        id: SERVICE_ACCOUNT_ID,
        uuid: DEFAULT_SERVICE_ACCOUNT.into(),
        state,
    }
}

/// A credential of the well-known service account in the given state.
pub fn credential(id: u64, state: ResourceState) -> Credential {
    Credential {
        id,
        account_id: SERVICE_ACCOUNT_ID,
        public_value: ACCESS_KEY.into(),
        secret_value: SECRET_KEY.into(),
        state,
    }
}
