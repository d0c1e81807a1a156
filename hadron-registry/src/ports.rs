//! Service port resolution.
//!
//! Every member of the ensemble binds four service ports: the ZooKeeper peer port, the
//! ZooKeeper leader election port, the ZooKeeper client port and the cache-store port. They are
//! stored on the member record as a comma-separated descriptor `"peer,election,client,cache"`.
//!
//! A descriptor which is empty or malformed is treated as absent, in which case the static
//! default ports are used. The defaults are the same for every member regardless of its
//! assigned index, so members which share a host must be provisioned with an explicit
//! descriptor.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The service tag of the ZooKeeper peer port.
pub const SERVICE_ZK: &str = "zk";
/// The service tag of the ZooKeeper leader election port.
pub const SERVICE_ZK_ELECTION: &str = "zk2";
/// The service tag of the ZooKeeper client port.
pub const SERVICE_ZK_CLIENT: &str = "zk-client";
/// The service tag of the cache-store port.
pub const SERVICE_REDIS: &str = "redis";

/// The default ZooKeeper peer port.
pub const DEFAULT_ZK_PEER_PORT: u16 = 2888;
/// The default ZooKeeper leader election port.
pub const DEFAULT_ZK_ELECTION_PORT: u16 = 3888;
/// The default ZooKeeper client port.
pub const DEFAULT_ZK_CLIENT_PORT: u16 = 2181;
/// The default cache-store port.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// The services for which a member binds a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Service {
    ZkPeer,
    ZkElection,
    ZkClient,
    Redis,
}

impl Service {
    /// Look up a service by its tag, returning `None` for unrecognized tags.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            SERVICE_ZK => Some(Self::ZkPeer),
            SERVICE_ZK_ELECTION => Some(Self::ZkElection),
            SERVICE_ZK_CLIENT => Some(Self::ZkClient),
            SERVICE_REDIS => Some(Self::Redis),
            _ => None,
        }
    }
}

/// The four service ports of a member.
///
/// Renders as a descriptor suitable for storage on a member record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSet {
    pub zk_peer: u16,
    pub zk_election: u16,
    pub zk_client: u16,
    pub redis: u16,
}

impl Default for PortSet {
    fn default() -> Self {
        Self {
            zk_peer: DEFAULT_ZK_PEER_PORT,
            zk_election: DEFAULT_ZK_ELECTION_PORT,
            zk_client: DEFAULT_ZK_CLIENT_PORT,
            redis: DEFAULT_REDIS_PORT,
        }
    }
}

impl PortSet {
    /// Resolve the ports of the given descriptor.
    ///
    /// Tokens are parsed until the first one which is not a valid port number. Exactly four
    /// parsed ports are required, else the defaults are returned.
    pub fn resolve(descriptor: &str) -> Self {
        let ports: Vec<u16> = descriptor.split(',').map_while(|token| token.parse().ok()).collect();
        match ports.as_slice() {
            [zk_peer, zk_election, zk_client, redis] => Self {
                zk_peer: *zk_peer,
                zk_election: *zk_election,
                zk_client: *zk_client,
                redis: *redis,
            },
            _ => Self::default(),
        }
    }

    /// The port bound for the given service.
    pub fn port(&self, service: Service) -> u16 {
        match service {
            Service::ZkPeer => self.zk_peer,
            Service::ZkElection => self.zk_election,
            Service::ZkClient => self.zk_client,
            Service::Redis => self.redis,
        }
    }

    /// The port bound for the service of the given tag, `None` if the tag is not recognized.
    pub fn port_by_service(&self, tag: &str) -> Option<u16> {
        Service::from_tag(tag).map(|service| self.port(service))
    }
}

impl fmt::Display for PortSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.zk_peer, self.zk_election, self.zk_client, self.redis)
    }
}
