use std::fmt;

use serde::{Deserialize, Serialize};

/// The lifecycle state of an account or credential.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Active,
    Inactive,
    Removed,
}

/// A service account, as issued by the external credential subsystem.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: u64,
    /// The well-known identity of this account.
    pub uuid: String,
    pub state: ResourceState,
}

/// A credential pair bound to an account.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub id: u64,
    /// The ID of the account to which this credential is bound.
    pub account_id: u64,
    pub public_value: String,
    pub secret_value: String,
    pub state: ResourceState,
}

/// The active API key pair of the service account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeys {
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeys")
            .field("access_key", &self.access_key)
            .field("secret_key", &"****")
            .finish()
    }
}
