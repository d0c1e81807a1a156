use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::error::RegistryError;
use crate::fixtures;
use crate::models::{Account, Member, ResourceState};
use crate::ports::{PortSet, SERVICE_REDIS, SERVICE_ZK};
use crate::store::{Checkin, MembershipStore};
use crate::utils;

fn find<'a>(members: &'a [Member], uuid: &str) -> Result<&'a Member> {
    members.iter().find(|member| member.uuid == uuid).with_context(|| format!("expected member {} to be listed", uuid))
}

fn assert_checkin_is_idempotent(store: &dyn MembershipStore) -> Result<()> {
    let first = store.checkin(&fixtures::member("a", 2), 10)?;
    let second = store.checkin(&fixtures::member("a", 2), 11)?;

    assert!(matches!(first, Checkin::Inserted { .. }), "expected first checkin to insert, got {:?}", first);
    assert_eq!(second, Checkin::Refreshed { id: first.id() }, "expected second checkin to refresh row {}, got {:?}", first.id(), second);
    let members = store.list_members()?;
    assert_eq!(members.len(), 1, "expected exactly 1 row, got {}", members.len());
    assert_eq!(members[0].heartbeat, 11, "expected heartbeat 11, got {}", members[0].heartbeat);

    Ok(())
}

fn assert_checkin_inserts_on_miss(store: &dyn MembershipStore) -> Result<()> {
    store.checkin(&fixtures::member("a", 3), 42)?;

    let members = store.list_members()?;
    assert_eq!(members.len(), 1, "expected exactly 1 row, got {}", members.len());
    let member = &members[0];
    assert_eq!(member.requested_index, 3, "expected requested index 3, got {}", member.requested_index);
    assert_eq!(member.heartbeat, 0, "expected zero heartbeat on insert, got {}", member.heartbeat);
    assert_eq!(member.assigned_index, 0, "expected zero assigned index on insert, got {}", member.assigned_index);
    assert_eq!(member.name.as_deref(), Some("member-a"), "unexpected name {:?}", member.name);
    assert!(member.ports.is_empty(), "expected empty port descriptor on insert, got {:?}", member.ports);
    assert_eq!(member.id, 1, "expected first storage ID to be 1, got {}", member.id);

    Ok(())
}

fn assert_assignment_commits(store: &dyn MembershipStore) -> Result<()> {
    store.checkin(&fixtures::member("x", 2), 1)?;
    store.checkin(&fixtures::member("y", 4), 1)?;
    let members = store.list_members()?;
    let x = find(&members, "x")?.clone();

    store.assign_indices(&BTreeMap::from([(5, x)]))?;

    let members = store.list_members()?;
    let (x, y) = (find(&members, "x")?, find(&members, "y")?);
    assert_eq!(x.assigned_index, 5, "expected assigned index 5, got {}", x.assigned_index);
    assert_eq!(x.requested_index, 0, "expected requested index reset to 0, got {}", x.requested_index);
    assert_eq!(y.assigned_index, 0, "expected untouched member to stay unassigned, got {}", y.assigned_index);
    assert_eq!(y.requested_index, 4, "expected untouched member to keep its request, got {}", y.requested_index);

    Ok(())
}

fn assert_assignment_skips_missing_members(store: &dyn MembershipStore) -> Result<()> {
    store.checkin(&fixtures::member("x", 0), 1)?;
    let x = store.list_members()?.remove(0);
    let ghost = Member { id: 99, ..fixtures::member("ghost", 0) };

    store.assign_indices(&BTreeMap::from([(1, ghost), (2, x)]))?;

    let members = store.list_members()?;
    assert_eq!(members.len(), 1, "expected no row to be created for a missing member, got {}", members.len());
    assert_eq!(members[0].assigned_index, 2, "expected assigned index 2, got {}", members[0].assigned_index);

    Ok(())
}

fn assert_list_orders_by_id(store: &dyn MembershipStore) -> Result<()> {
    for uuid in ["c", "a", "b"] {
        store.checkin(&fixtures::member(uuid, 0), 1)?;
    }

    let members = store.list_members()?;
    let ids: Vec<_> = members.iter().map(|member| member.id).collect();
    let uuids: Vec<_> = members.iter().map(|member| member.uuid.as_str()).collect();
    assert_eq!(ids, vec![1, 2, 3], "expected members in ID order, got {:?}", ids);
    assert_eq!(uuids, vec!["c", "a", "b"], "expected members in insertion order, got {:?}", uuids);

    Ok(())
}

fn assert_delete_is_idempotent(store: &dyn MembershipStore) -> Result<()> {
    store.checkin(&fixtures::member("a", 0), 1)?;
    store.checkin(&fixtures::member("b", 0), 1)?;

    store.delete_member("a")?;
    store.delete_member("a")?;
    store.delete_member("never-seen")?;

    let members = store.list_members()?;
    assert_eq!(members.len(), 1, "expected 1 remaining row, got {}", members.len());
    assert_eq!(members[0].uuid, "b", "expected member b to remain, got {}", members[0].uuid);

    // A deleted UUID checks back in as a brand new member.
    let res = store.checkin(&fixtures::member("a", 0), 2)?;
    assert!(matches!(res, Checkin::Inserted { id } if id > 2), "expected re-insert with a fresh ID, got {:?}", res);

    Ok(())
}

fn assert_ports_are_provisioned(store: &dyn MembershipStore) -> Result<()> {
    store.checkin(&fixtures::member("a", 0), 1)?;
    let ports = PortSet::resolve("12888,13888,12181,16379");

    store.set_ports("a", &ports)?;
    store.set_ports("unknown", &ports)?;

    let members = store.list_members()?;
    assert_eq!(members.len(), 1, "expected provisioning to never insert, got {} rows", members.len());
    let member = &members[0];
    assert_eq!(member.port_set(), ports, "unexpected resolved ports {:?}", member.port_set());
    assert_eq!(member.port_by_service(SERVICE_ZK), Some(12888), "unexpected zk port");
    assert_eq!(member.port_by_service(SERVICE_REDIS), Some(16379), "unexpected redis port");

    // A heartbeat refresh leaves the provisioned ports in place.
    store.checkin(&fixtures::member("a", 0), 2)?;
    let members = store.list_members()?;
    assert_eq!(members[0].port_set(), ports, "expected checkin to preserve ports, got {:?}", members[0].port_set());

    Ok(())
}

fn assert_revocation_resets_slot(store: &dyn MembershipStore) -> Result<()> {
    store.checkin(&fixtures::member("a", 0), 1)?;
    store.checkin(&fixtures::member("b", 0), 1)?;
    let members = store.list_members()?;
    let (a, b) = (find(&members, "a")?.clone(), find(&members, "b")?.clone());
    store.assign_indices(&BTreeMap::from([(1, a.clone()), (2, b)]))?;
    let ghost = Member { id: 99, ..fixtures::member("ghost", 0) };

    store.revoke_indices(&[ghost, a])?;

    let members = store.list_members()?;
    assert_eq!(members.len(), 2, "expected no row to be created for a missing member, got {}", members.len());
    let (a, b) = (find(&members, "a")?, find(&members, "b")?);
    assert_eq!(a.assigned_index, 0, "expected revoked member to be unassigned, got {}", a.assigned_index);
    assert_eq!(b.assigned_index, 2, "expected untouched member to keep its slot, got {}", b.assigned_index);

    Ok(())
}

fn assert_api_keys_not_ready(store: &dyn MembershipStore, put: &dyn Fn(Account, ResourceState) -> Result<()>) -> Result<()> {
    let res = store.api_keys();
    assert!(matches!(res, Err(RegistryError::NotReady)), "expected NotReady with no credentials, got {:?}", res);

    // An active credential bound to an inactive account is still not ready.
    put(fixtures::service_account(ResourceState::Inactive), ResourceState::Active)?;
    let res = store.api_keys();
    assert!(matches!(res, Err(RegistryError::NotReady)), "expected NotReady with inactive account, got {:?}", res);

    // And so is an inactive credential bound to an active account.
    put(fixtures::service_account(ResourceState::Active), ResourceState::Inactive)?;
    let res = store.api_keys();
    assert!(matches!(res, Err(RegistryError::NotReady)), "expected NotReady with inactive credential, got {:?}", res);

    // Until both sides are active.
    put(fixtures::service_account(ResourceState::Active), ResourceState::Active)?;
    let keys = store.api_keys()?;
    assert_eq!(keys.access_key, fixtures::ACCESS_KEY, "unexpected access key {}", keys.access_key);
    assert_eq!(keys.secret_key, fixtures::SECRET_KEY, "unexpected secret key");

    Ok(())
}

//////////////////////////////////////////////////////////////////////////////
// MemoryStore ///////////////////////////////////////////////////////////////

#[test]
fn memory_checkin_is_idempotent() -> Result<()> {
    assert_checkin_is_idempotent(&fixtures::memory_store())
}

#[test]
fn memory_checkin_inserts_on_miss() -> Result<()> {
    assert_checkin_inserts_on_miss(&fixtures::memory_store())
}

#[test]
fn memory_assign_indices_commits() -> Result<()> {
    assert_assignment_commits(&fixtures::memory_store())
}

#[test]
fn memory_assign_indices_skips_missing_members() -> Result<()> {
    assert_assignment_skips_missing_members(&fixtures::memory_store())
}

#[test]
fn memory_list_members_orders_by_id() -> Result<()> {
    assert_list_orders_by_id(&fixtures::memory_store())
}

#[test]
fn memory_delete_member_is_idempotent() -> Result<()> {
    assert_delete_is_idempotent(&fixtures::memory_store())
}

#[test]
fn memory_set_ports_provisions_descriptor() -> Result<()> {
    assert_ports_are_provisioned(&fixtures::memory_store())
}

#[test]
fn memory_revoke_indices_resets_slot() -> Result<()> {
    assert_revocation_resets_slot(&fixtures::memory_store())
}

#[test]
fn memory_api_keys_not_ready_until_active() -> Result<()> {
    let store = fixtures::memory_store();
    let put = |account: Account, state: ResourceState| -> Result<()> {
        store.put_account(&account)?;
        store.put_credential(&fixtures::credential(1, state))?;
        Ok(())
    };
    assert_api_keys_not_ready(&store, &put)
}

#[test]
fn memory_assign_indices_keeps_applied_updates_on_failure() -> Result<()> {
    let store = fixtures::memory_store();
    store.checkin(&fixtures::member("a", 1), 1)?;
    store.checkin(&fixtures::member("b", 2), 1)?;
    let members = store.list_members()?;
    let mapping = BTreeMap::from([(1, find(&members, "a")?.clone()), (2, find(&members, "b")?.clone())]);

    store.fail_writes_after(1);
    let res = store.assign_indices(&mapping);

    assert!(matches!(res, Err(RegistryError::StorageFault(_))), "expected StorageFault, got {:?}", res);
    store.fail_writes_after(usize::MAX);
    let members = store.list_members()?;
    let (a, b) = (find(&members, "a")?, find(&members, "b")?);
    assert_eq!(a.assigned_index, 1, "expected first update to stay committed, got {}", a.assigned_index);
    assert_eq!(b.assigned_index, 0, "expected second update to be aborted, got {}", b.assigned_index);
    assert_eq!(b.requested_index, 2, "expected aborted member to keep its request, got {}", b.requested_index);

    Ok(())
}

//////////////////////////////////////////////////////////////////////////////
// SledStore /////////////////////////////////////////////////////////////////

#[tokio::test]
async fn sled_checkin_is_idempotent() -> Result<()> {
    let (store, _db, _tmpdir) = fixtures::sled_store().await?;
    assert_checkin_is_idempotent(&store)
}

#[tokio::test]
async fn sled_checkin_inserts_on_miss() -> Result<()> {
    let (store, _db, _tmpdir) = fixtures::sled_store().await?;
    assert_checkin_inserts_on_miss(&store)
}

#[tokio::test]
async fn sled_assign_indices_commits() -> Result<()> {
    let (store, _db, _tmpdir) = fixtures::sled_store().await?;
    assert_assignment_commits(&store)
}

#[tokio::test]
async fn sled_assign_indices_skips_missing_members() -> Result<()> {
    let (store, _db, _tmpdir) = fixtures::sled_store().await?;
    assert_assignment_skips_missing_members(&store)
}

#[tokio::test]
async fn sled_list_members_orders_by_id() -> Result<()> {
    let (store, _db, _tmpdir) = fixtures::sled_store().await?;
    assert_list_orders_by_id(&store)
}

#[tokio::test]
async fn sled_delete_member_is_idempotent() -> Result<()> {
    let (store, _db, _tmpdir) = fixtures::sled_store().await?;
    assert_delete_is_idempotent(&store)
}

#[tokio::test]
async fn sled_set_ports_provisions_descriptor() -> Result<()> {
    let (store, _db, _tmpdir) = fixtures::sled_store().await?;
    assert_ports_are_provisioned(&store)
}

#[tokio::test]
async fn sled_revoke_indices_resets_slot() -> Result<()> {
    let (store, _db, _tmpdir) = fixtures::sled_store().await?;
    assert_revocation_resets_slot(&store)
}

#[tokio::test]
async fn sled_storage_ids_continue_across_deletes() -> Result<()> {
    let (store, db, _tmpdir) = fixtures::sled_store().await?;
    store.checkin(&fixtures::member("a", 0), 1)?;
    store.checkin(&fixtures::member("b", 0), 1)?;
    store.delete_member("b")?;

    let res = store.checkin(&fixtures::member("c", 0), 1)?;

    assert_eq!(res, Checkin::Inserted { id: 3 }, "expected deleted IDs to never be reused, got {:?}", res);
    let last_id = db.get_metadata_tree()?.get(super::sled_store::KEY_LAST_ID)?.context("expected last ID to be recorded")?;
    assert_eq!(utils::decode_u64(&last_id)?, 3, "unexpected recorded last ID");

    Ok(())
}

#[tokio::test]
async fn sled_api_keys_not_ready_until_active() -> Result<()> {
    let (store, _db, _tmpdir) = fixtures::sled_store().await?;
    let put = |account: Account, state: ResourceState| -> Result<()> {
        store.put_account(&account)?;
        store.put_credential(&fixtures::credential(1, state))?;
        Ok(())
    };
    assert_api_keys_not_ready(&store, &put)
}

#[tokio::test]
async fn sled_bootstrap_is_idempotent() -> Result<()> {
    let (store, db, _tmpdir) = fixtures::sled_store().await?;

    store.bootstrap()?;
    store.checkin(&fixtures::member("a", 0), 1)?;
    store.bootstrap()?;

    let marker = db.get_metadata_tree()?.get(super::sled_store::KEY_SCHEMA_VERSION)?;
    assert!(marker.is_some(), "expected schema version marker to be recorded");
    let members = store.list_members()?;
    assert_eq!(members.len(), 1, "expected bootstrap to preserve existing rows, got {}", members.len());

    Ok(())
}

#[tokio::test]
async fn sled_list_members_aborts_on_undecodable_row() -> Result<()> {
    let (store, db, _tmpdir) = fixtures::sled_store().await?;
    store.checkin(&fixtures::member("a", 0), 1)?;
    db.get_cluster_tree()?
        .insert(&utils::encode_u64(1_000)[..], &b"garbage"[..])
        .context("error inserting undecodable row")?;

    let res = store.list_members();

    assert!(matches!(res, Err(RegistryError::StorageFault(_))), "expected StorageFault, got {:?}", res);

    Ok(())
}

#[tokio::test]
async fn sled_concurrent_checkins_never_duplicate() -> Result<()> {
    let (store, _db, _tmpdir) = fixtures::sled_store().await?;

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8i64)
            .map(|heartbeat| {
                let store = &store;
                scope.spawn(move || store.checkin(&fixtures::member("racer", 0), heartbeat))
            })
            .collect();
        for handle in handles {
            let res = handle.join().expect("checkin thread panicked");
            assert!(res.is_ok(), "expected concurrent checkin to succeed, got {:?}", res);
        }
    });

    let members = store.list_members()?;
    assert_eq!(members.len(), 1, "expected concurrent checkins to produce exactly 1 row, got {}", members.len());

    Ok(())
}
