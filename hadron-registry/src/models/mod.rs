//! Registry data models.

mod credential;
mod member;

pub use credential::{Account, ApiKeys, Credential, ResourceState};
pub use member::Member;
