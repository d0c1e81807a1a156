//! The Hadron ensemble membership registry.
//!
//! Members of a small fixed-role ensemble periodically check in with the registry host. The
//! host owns the registry database and grants each live member a stable slot. Each member
//! derives the service ports it binds from its registration.

pub mod app;
pub mod assignment;
pub mod config;
pub mod credentials;
pub mod database;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod heartbeat;
#[cfg(test)]
mod heartbeat_test;
pub mod models;
pub mod ports;
pub mod prom;
pub mod server;
pub mod store;
mod utils;

pub use error::{RegistryError, RegistryResult};
pub use models::{ApiKeys, Member};
pub use ports::PortSet;
pub use store::{HttpStore, MembershipStore, MemoryStore, SledStore};
