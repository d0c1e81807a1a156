use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use sled::transaction::{abort, ConflictableTransactionResult, TransactionError};
use sled::Transactional;

use crate::database::{Database, Tree};
use crate::error::{RegistryError, RegistryResult, ShutdownResult, ERR_DB_FLUSH, ERR_DECODE_MEMBER, ERR_ITER_FAILURE};
use crate::models::{Account, ApiKeys, Credential, Member, ResourceState};
use crate::ports::PortSet;
use crate::store::{not_ready, Checkin, MembershipStore};
use crate::utils;

/// The key under which the schema version of the registry is recorded.
pub(crate) const KEY_SCHEMA_VERSION: &[u8; 1] = b"v";
/// The key under which the last storage ID handed out is recorded.
pub(crate) const KEY_LAST_ID: &[u8; 7] = b"last_id";
/// The current schema version of the registry.
const SCHEMA_VERSION: u64 = 1;

/// A membership store backed by the registry's sled database.
///
/// Member rows are stored as JSON keyed by their big-endian storage ID, so that iterating the
/// tree yields members in ID order. A second tree maps UUIDs to storage IDs.
#[derive(Clone)]
pub struct SledStore {
    /// Member rows keyed by storage ID.
    cluster: Tree,
    /// Storage IDs keyed by member UUID.
    cluster_uuid: Tree,
    accounts: Tree,
    credentials: Tree,
    metadata: Tree,
    /// The identity of the service account whose API keys are looked up.
    service_account: String,
}

impl SledStore {
    /// Create a new instance.
    pub fn new(db: &Database, service_account: impl Into<String>) -> ShutdownResult<Self> {
        Ok(Self {
            cluster: db.get_cluster_tree()?,
            cluster_uuid: db.get_cluster_uuid_tree()?,
            accounts: db.get_account_tree()?,
            credentials: db.get_credential_tree()?,
            metadata: db.get_metadata_tree()?,
            service_account: service_account.into(),
        })
    }

    /// Update the row of the given storage ID in place, returning `false` if the ID is unknown.
    fn update_by_id<F>(&self, id: u64, f: F) -> RegistryResult<bool>
    where
        F: Fn(&mut Member),
    {
        let key = utils::encode_u64(id);
        self.cluster
            .transaction(|cluster| -> ConflictableTransactionResult<bool, anyhow::Error> {
                let row = match cluster.get(&key[..])? {
                    Some(row) => row,
                    None => return Ok(false),
                };
                let mut current: Member = match utils::decode_model(&row) {
                    Ok(current) => current,
                    Err(err) => return abort(err.context(ERR_DECODE_MEMBER)),
                };
                f(&mut current);
                let encoded = match utils::encode_model(&current) {
                    Ok(encoded) => encoded,
                    Err(err) => return abort(err),
                };
                cluster.insert(&key[..], encoded)?;
                Ok(true)
            })
            .map_err(map_tx_err)
    }

    /// Update the row of the given UUID in place, returning its ID, or `None` if the UUID is unknown.
    fn update_by_uuid<F>(&self, uuid: &str, f: F) -> RegistryResult<Option<u64>>
    where
        F: Fn(&mut Member),
    {
        (&self.cluster, &self.cluster_uuid)
            .transaction(|(cluster, uuids)| -> ConflictableTransactionResult<Option<u64>, anyhow::Error> {
                let key = match uuids.get(uuid.as_bytes())? {
                    Some(key) => key,
                    None => return Ok(None),
                };
                let row = match cluster.get(&key)? {
                    Some(row) => row,
                    None => return abort(anyhow!("member {} is indexed at a missing row", uuid)),
                };
                let mut member: Member = match utils::decode_model(&row) {
                    Ok(member) => member,
                    Err(err) => return abort(err.context(ERR_DECODE_MEMBER)),
                };
                f(&mut member);
                let encoded = match utils::encode_model(&member) {
                    Ok(encoded) => encoded,
                    Err(err) => return abort(err),
                };
                cluster.insert(key, encoded)?;
                Ok(Some(member.id))
            })
            .map_err(map_tx_err)
    }
}

impl MembershipStore for SledStore {
    #[tracing::instrument(level = "debug", skip(self), err)]
    fn bootstrap(&self) -> RegistryResult<()> {
        let marker = self.metadata.get(KEY_SCHEMA_VERSION).context("error reading registry schema version")?;
        if marker.is_some() && self.list_members().is_ok() {
            return Ok(());
        }
        self.metadata
            .insert(&KEY_SCHEMA_VERSION[..], &utils::encode_u64(SCHEMA_VERSION)[..])
            .context("error writing registry schema version")?;
        self.metadata.flush().context(ERR_DB_FLUSH)?;
        tracing::info!(schema_version = SCHEMA_VERSION, "registry storage bootstrapped");
        Ok(())
    }

    fn list_members(&self) -> RegistryResult<Vec<Member>> {
        let mut members = Vec::new();
        for kv_res in self.cluster.iter() {
            let (_, row) = kv_res.context(ERR_ITER_FAILURE)?;
            let member: Member = utils::decode_model(&row).context(ERR_DECODE_MEMBER)?;
            members.push(member);
        }
        Ok(members)
    }

    #[tracing::instrument(level = "trace", skip(self, member), fields(uuid = %member.uuid), err)]
    fn checkin(&self, member: &Member, heartbeat: i64) -> RegistryResult<Checkin> {
        let res = (&self.cluster, &self.cluster_uuid, &self.metadata)
            .transaction(|(cluster, uuids, metadata)| -> ConflictableTransactionResult<Checkin, anyhow::Error> {
                // Known UUID, only refresh the heartbeat.
                if let Some(key) = uuids.get(member.uuid.as_bytes())? {
                    let row = match cluster.get(&key)? {
                        Some(row) => row,
                        None => return abort(anyhow!("member {} is indexed at a missing row", member.uuid)),
                    };
                    let mut current: Member = match utils::decode_model(&row) {
                        Ok(current) => current,
                        Err(err) => return abort(err.context(ERR_DECODE_MEMBER)),
                    };
                    current.heartbeat = heartbeat;
                    let encoded = match utils::encode_model(&current) {
                        Ok(encoded) => encoded,
                        Err(err) => return abort(err),
                    };
                    cluster.insert(key, encoded)?;
                    return Ok(Checkin::Refreshed { id: current.id });
                }

                // Unknown UUID, insert a new row. IDs start at 1.
                let id = match metadata.get(KEY_LAST_ID)? {
                    Some(last_id) => match utils::decode_u64(&last_id) {
                        Ok(last_id) => last_id + 1,
                        Err(err) => return abort(err.context("error decoding last storage ID")),
                    },
                    None => 1,
                };
                metadata.insert(&KEY_LAST_ID[..], &utils::encode_u64(id)[..])?;
                let row = Member {
                    id,
                    name: member.name.clone(),
                    uuid: member.uuid.clone(),
                    ip_address: member.ip_address.clone(),
                    requested_index: member.requested_index,
                    ..Default::default()
                };
                let encoded = match utils::encode_model(&row) {
                    Ok(encoded) => encoded,
                    Err(err) => return abort(err),
                };
                cluster.insert(&utils::encode_u64(id)[..], encoded)?;
                uuids.insert(member.uuid.as_bytes(), &utils::encode_u64(id)[..])?;
                Ok(Checkin::Inserted { id })
            })
            .map_err(map_tx_err)?;
        self.cluster.flush().context(ERR_DB_FLUSH)?;
        Ok(res)
    }

    #[tracing::instrument(level = "debug", skip(self, indexes), err)]
    fn assign_indices(&self, indexes: &BTreeMap<u32, Member>) -> RegistryResult<()> {
        for (slot, member) in indexes {
            let slot = *slot;
            let applied = self.update_by_id(member.id, |current| {
                current.assigned_index = slot;
                current.requested_index = 0;
            })?;
            if !applied {
                tracing::debug!(id = member.id, uuid = %member.uuid, slot, "skipping index assignment of missing member");
            }
        }
        self.cluster.flush().context(ERR_DB_FLUSH)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, members), err)]
    fn revoke_indices(&self, members: &[Member]) -> RegistryResult<()> {
        for member in members {
            if !self.update_by_id(member.id, |current| current.assigned_index = 0)? {
                tracing::debug!(id = member.id, uuid = %member.uuid, "skipping index revocation of missing member");
            }
        }
        self.cluster.flush().context(ERR_DB_FLUSH)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    fn delete_member(&self, uuid: &str) -> RegistryResult<()> {
        (&self.cluster, &self.cluster_uuid)
            .transaction(|(cluster, uuids)| -> ConflictableTransactionResult<(), anyhow::Error> {
                if let Some(key) = uuids.remove(uuid.as_bytes())? {
                    cluster.remove(key)?;
                }
                Ok(())
            })
            .map_err(map_tx_err)?;
        self.cluster.flush().context(ERR_DB_FLUSH)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    fn set_ports(&self, uuid: &str, ports: &PortSet) -> RegistryResult<()> {
        let descriptor = ports.to_string();
        if self.update_by_uuid(uuid, |member| member.ports = descriptor.clone())?.is_none() {
            tracing::debug!(uuid, "skipping port provisioning of unknown member");
        }
        self.cluster.flush().context(ERR_DB_FLUSH)?;
        Ok(())
    }

    fn api_keys(&self) -> RegistryResult<ApiKeys> {
        let mut account_ids = Vec::new();
        for kv_res in self.accounts.iter() {
            let (_, row) = kv_res.context(ERR_ITER_FAILURE)?;
            let account: Account = utils::decode_model(&row).context("error decoding service account from storage")?;
            if account.state == ResourceState::Active && account.uuid == self.service_account {
                account_ids.push(account.id);
            }
        }
        if account_ids.is_empty() {
            return Err(not_ready(&self.service_account));
        }

        for kv_res in self.credentials.iter() {
            let (_, row) = kv_res.context(ERR_ITER_FAILURE)?;
            let credential: Credential = utils::decode_model(&row).context("error decoding service account credential from storage")?;
            if credential.state == ResourceState::Active && account_ids.contains(&credential.account_id) {
                return Ok(ApiKeys {
                    access_key: credential.public_value,
                    secret_key: credential.secret_value,
                });
            }
        }
        Err(not_ready(&self.service_account))
    }

    #[tracing::instrument(level = "debug", skip(self, account), fields(id = account.id), err)]
    fn put_account(&self, account: &Account) -> RegistryResult<()> {
        let encoded = utils::encode_model(account)?;
        self.accounts
            .insert(&utils::encode_u64(account.id)[..], encoded)
            .context("error writing service account")?;
        self.accounts.flush().context(ERR_DB_FLUSH)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, credential), fields(id = credential.id), err)]
    fn put_credential(&self, credential: &Credential) -> RegistryResult<()> {
        let encoded = utils::encode_model(credential)?;
        self.credentials
            .insert(&utils::encode_u64(credential.id)[..], encoded)
            .context("error writing service account credential")?;
        self.credentials.flush().context(ERR_DB_FLUSH)?;
        Ok(())
    }
}

/// Map a failed transaction into a storage fault.
fn map_tx_err(err: TransactionError<anyhow::Error>) -> RegistryError {
    match err {
        TransactionError::Abort(err) => RegistryError::StorageFault(err),
        TransactionError::Storage(err) => RegistryError::from(err),
    }
}
