use serde::{Deserialize, Serialize};

use crate::ports::PortSet;

/// A participant of the cluster ensemble.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    /// The storage-assigned identity of this member, monotonic across the registry.
    ///
    /// A value of `0` indicates a member which has not yet been persisted.
    pub id: u64,
    /// An optional human readable label.
    pub name: Option<String>,
    /// The caller-supplied stable identity of this member.
    pub uuid: String,
    /// The address at which this member is reachable.
    pub ip_address: String,
    /// The comma-separated service port descriptor, see `crate::ports`.
    pub ports: String,
    /// The slot this member asked for when it first checked in.
    ///
    /// Reset to `0` once an index has been assigned.
    pub requested_index: u32,
    /// The slot granted to this member by the assignment authority, `0` until assigned.
    pub assigned_index: u32,
    /// The last liveness token written by this member.
    pub heartbeat: i64,
}

impl Member {
    /// Create a new member for checkin.
    pub fn new(uuid: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            ip_address: ip_address.into(),
            ..Default::default()
        }
    }

    /// Set the human readable label of this member.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the slot which this member will request when first checking in.
    pub fn with_requested_index(mut self, index: u32) -> Self {
        self.requested_index = index;
        self
    }

    /// The service ports this member should bind.
    pub fn port_set(&self) -> PortSet {
        PortSet::resolve(&self.ports)
    }

    /// The port bound for the service of the given tag, `None` if the tag is not recognized.
    pub fn port_by_service(&self, tag: &str) -> Option<u16> {
        self.port_set().port_by_service(tag)
    }

    /// Check if this member has been granted a slot.
    pub fn is_assigned(&self) -> bool {
        self.assigned_index != 0
    }
}
