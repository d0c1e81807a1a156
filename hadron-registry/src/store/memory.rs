use std::collections::BTreeMap;

use anyhow::anyhow;
use parking_lot::Mutex;

use crate::error::RegistryResult;
use crate::models::{Account, ApiKeys, Credential, Member, ResourceState};
use crate::ports::PortSet;
use crate::store::{not_ready, Checkin, MembershipStore};

/// An in-process membership store.
///
/// All state lives behind a single lock which is held for the duration of each operation, so
/// every operation is atomic with respect to the others.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    /// The identity of the service account whose API keys are looked up.
    service_account: String,
}

#[derive(Default)]
struct MemoryState {
    /// The last storage ID handed out.
    last_id: u64,
    /// Member rows keyed by storage ID.
    members: BTreeMap<u64, Member>,
    accounts: Vec<Account>,
    credentials: Vec<Credential>,
    /// The number of row writes which may succeed before writes start failing.
    write_budget: Option<usize>,
}

impl MemoryState {
    /// Consume one unit of the write budget, failing once it is exhausted.
    fn charge_write(&mut self) -> RegistryResult<()> {
        match self.write_budget {
            Some(0) => Err(anyhow!("write rejected by memory store").into()),
            Some(ref mut budget) => {
                *budget -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl MemoryStore {
    /// Create a new instance.
    pub fn new(service_account: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            service_account: service_account.into(),
        }
    }

    /// Allow only the given number of further row writes to succeed.
    #[cfg(test)]
    pub(crate) fn fail_writes_after(&self, writes: usize) {
        self.state.lock().write_budget = Some(writes);
    }
}

impl MembershipStore for MemoryStore {
    fn bootstrap(&self) -> RegistryResult<()> {
        Ok(())
    }

    fn list_members(&self) -> RegistryResult<Vec<Member>> {
        Ok(self.state.lock().members.values().cloned().collect())
    }

    fn checkin(&self, member: &Member, heartbeat: i64) -> RegistryResult<Checkin> {
        let mut state = self.state.lock();
        state.charge_write()?;
        if let Some(current) = state.members.values_mut().find(|current| current.uuid == member.uuid) {
            current.heartbeat = heartbeat;
            return Ok(Checkin::Refreshed { id: current.id });
        }

        state.last_id += 1;
        let id = state.last_id;
        state.members.insert(
            id,
            Member {
                id,
                name: member.name.clone(),
                uuid: member.uuid.clone(),
                ip_address: member.ip_address.clone(),
                requested_index: member.requested_index,
                ..Default::default()
            },
        );
        Ok(Checkin::Inserted { id })
    }

    fn assign_indices(&self, indexes: &BTreeMap<u32, Member>) -> RegistryResult<()> {
        let mut state = self.state.lock();
        for (slot, member) in indexes {
            state.charge_write()?;
            match state.members.get_mut(&member.id) {
                Some(current) => {
                    current.assigned_index = *slot;
                    current.requested_index = 0;
                }
                None => tracing::debug!(id = member.id, uuid = %member.uuid, slot, "skipping index assignment of missing member"),
            }
        }
        Ok(())
    }

    fn revoke_indices(&self, members: &[Member]) -> RegistryResult<()> {
        let mut state = self.state.lock();
        for member in members {
            state.charge_write()?;
            match state.members.get_mut(&member.id) {
                Some(current) => current.assigned_index = 0,
                None => tracing::debug!(id = member.id, uuid = %member.uuid, "skipping index revocation of missing member"),
            }
        }
        Ok(())
    }

    fn delete_member(&self, uuid: &str) -> RegistryResult<()> {
        let mut state = self.state.lock();
        state.charge_write()?;
        state.members.retain(|_, member| member.uuid != uuid);
        Ok(())
    }

    fn set_ports(&self, uuid: &str, ports: &PortSet) -> RegistryResult<()> {
        let mut state = self.state.lock();
        state.charge_write()?;
        if let Some(member) = state.members.values_mut().find(|member| member.uuid == uuid) {
            member.ports = ports.to_string();
        }
        Ok(())
    }

    fn api_keys(&self) -> RegistryResult<ApiKeys> {
        let state = self.state.lock();
        let keys = state
            .credentials
            .iter()
            .filter(|credential| credential.state == ResourceState::Active)
            .find(|credential| {
                state
                    .accounts
                    .iter()
                    .any(|account| account.id == credential.account_id && account.state == ResourceState::Active && account.uuid == self.service_account)
            })
            .map(|credential| ApiKeys {
                access_key: credential.public_value.clone(),
                secret_key: credential.secret_value.clone(),
            });
        keys.ok_or_else(|| not_ready(&self.service_account))
    }

    fn put_account(&self, account: &Account) -> RegistryResult<()> {
        let mut state = self.state.lock();
        state.accounts.retain(|existing| existing.id != account.id);
        state.accounts.push(account.clone());
        state.accounts.sort_by_key(|account| account.id);
        Ok(())
    }

    fn put_credential(&self, credential: &Credential) -> RegistryResult<()> {
        let mut state = self.state.lock();
        state.credentials.retain(|existing| existing.id != credential.id);
        state.credentials.push(credential.clone());
        state.credentials.sort_by_key(|credential| credential.id);
        Ok(())
    }
}
