//! Membership storage.
//!
//! The `MembershipStore` trait is the single capability through which membership state is
//! read and written. It is injected into every component which needs membership state, so
//! that the durable `SledStore`, the in-process `MemoryStore` and the `HttpStore` client of a
//! remote registry host are interchangeable.
//!
//! ## Checkin
//! A checkin is an upsert keyed on the member's UUID with insert-only-on-miss semantics. When
//! a row for the UUID exists only its heartbeat is written, otherwise a new row is inserted
//! carrying the member's name, UUID, IP and requested index, with its heartbeat and assigned
//! index at zero. The local backends perform the lookup and the write as one atomic operation, so
//! concurrent checkins for the same UUID never produce duplicate rows.
//!
//! ## Index Assignment
//! `assign_indices` applies one independent update per (slot, member) pair, keyed by storage
//! ID, in ascending slot order. The first failure aborts the remaining updates and is
//! returned, while updates already applied stay committed. Concurrent callers must be
//! serialized externally to a single authority. Revocations follow the same rules.

mod http;
mod memory;
#[cfg(test)]
mod mod_test;
mod sled_store;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};
use crate::models::{Account, ApiKeys, Credential, Member};
use crate::ports::PortSet;

pub use http::HttpStore;
pub use memory::MemoryStore;
pub use sled_store::SledStore;

/// The outcome of a successful checkin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Checkin {
    /// The UUID was unknown and a new row was inserted with the given storage ID.
    Inserted { id: u64 },
    /// The UUID was known and only the heartbeat of its row was updated.
    Refreshed { id: u64 },
}

impl Checkin {
    /// The storage ID of the checked in member.
    pub fn id(&self) -> u64 {
        match self {
            Self::Inserted { id } | Self::Refreshed { id } => *id,
        }
    }
}

/// The storage capability of the membership registry.
///
/// All operations are synchronous and may block on storage I/O.
pub trait MembershipStore: Send + Sync {
    /// Ensure the backing storage exists.
    ///
    /// This is idempotent, and is a no-op when the storage has already been bootstrapped.
    fn bootstrap(&self) -> RegistryResult<()>;

    /// List all members ordered by storage ID ascending.
    ///
    /// A row which can not be decoded aborts the whole read.
    fn list_members(&self) -> RegistryResult<Vec<Member>>;

    /// Check in the given member with the given heartbeat value.
    fn checkin(&self, member: &Member, heartbeat: i64) -> RegistryResult<Checkin>;

    /// Commit the given mapping of slots to members.
    ///
    /// After success each given member has its assigned index set to its slot and its
    /// requested index reset to `0`. Members which no longer exist are skipped.
    fn assign_indices(&self, indexes: &BTreeMap<u32, Member>) -> RegistryResult<()>;

    /// Revoke the slots of the given members, keyed by storage ID.
    ///
    /// After success each given member has its assigned index reset to `0`. Members which no
    /// longer exist are skipped. Failures abort the remaining updates like `assign_indices`.
    fn revoke_indices(&self, members: &[Member]) -> RegistryResult<()>;

    /// Delete the member of the given UUID. Deleting an unknown UUID succeeds.
    fn delete_member(&self, uuid: &str) -> RegistryResult<()>;

    /// Provision the service ports of the member of the given UUID.
    ///
    /// An unknown UUID is a no-op.
    fn set_ports(&self, uuid: &str, ports: &PortSet) -> RegistryResult<()>;

    /// Look up the active API key pair of the service account.
    ///
    /// Returns `RegistryError::NotReady` when no active pair exists yet. This never waits;
    /// callers own any retry policy, see `crate::credentials::await_api_keys`.
    fn api_keys(&self) -> RegistryResult<ApiKeys>;

    /// Write the given service account record, replacing any record of the same ID.
    ///
    /// Accounts are issued by the external credential subsystem, this is its write path.
    fn put_account(&self, account: &Account) -> RegistryResult<()>;

    /// Write the given credential record, replacing any record of the same ID.
    fn put_credential(&self, credential: &Credential) -> RegistryResult<()>;
}

/// Record that the API keys of the given service account are not yet available.
fn not_ready(service_account: &str) -> RegistryError {
    tracing::info!(service_account, "waiting for API keys for service account");
    RegistryError::NotReady
}
