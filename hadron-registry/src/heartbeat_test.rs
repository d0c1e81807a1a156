use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use crate::config::Config;
use crate::fixtures;
use crate::heartbeat::{next_heartbeat, Heartbeat, MemberView, MemberViewRx};
use crate::ports::PortSet;
use crate::store::MembershipStore;

/// Wait until the published view satisfies the given predicate.
async fn wait_for_view<F: Fn(&MemberView) -> bool>(rx: &mut MemberViewRx, f: F) -> Result<MemberView> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(view) = *rx.borrow() {
                if f(&view) {
                    return Ok::<_, anyhow::Error>(view);
                }
            }
            rx.changed().await.context("member view channel closed")?;
        }
    })
    .await
    .context("timed out waiting for member view")?
}

#[test]
fn next_heartbeat_follows_clock() {
    assert_eq!(next_heartbeat(10, 500), 500, "expected heartbeat to follow the clock");
}

#[test]
fn next_heartbeat_advances_when_clock_steps_back() {
    assert_eq!(next_heartbeat(500, 10), 501, "expected heartbeat to advance past the last value");
    assert_eq!(next_heartbeat(i64::MAX, 10), i64::MAX, "expected heartbeat to saturate");
}

#[tokio::test]
async fn heartbeat_registers_and_observes_assignment() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let store = Arc::new(fixtures::memory_store());
    let (shutdown_tx, _) = broadcast::channel(1);

    let (heartbeat, mut view_rx) = Heartbeat::new(config.clone(), store.clone(), shutdown_tx.subscribe());
    let handle = heartbeat.spawn();

    let view = wait_for_view(&mut view_rx, |_| true).await?;
    assert_eq!(view.assigned_index, 0, "expected member to start unassigned, got {}", view.assigned_index);
    assert_eq!(view.ports, PortSet::default(), "expected default ports before provisioning, got {:?}", view.ports);
    let members = store.list_members()?;
    assert_eq!(members.len(), 1, "expected 1 registered member, got {}", members.len());
    assert_eq!(members[0].uuid, config.member_uuid(), "unexpected member uuid {}", members[0].uuid);

    // Assign a slot and provision ports, then wait for the member to pick them up.
    let ports = PortSet::resolve("12888,13888,12181,16379");
    store.set_ports(config.member_uuid(), &ports)?;
    store.assign_indices(&[(2, members[0].clone())].into_iter().collect())?;
    let view = wait_for_view(&mut view_rx, |view| view.assigned_index == 2 && view.ports == ports).await?;
    assert_eq!(view.id, members[0].id, "unexpected member id {}", view.id);

    let members = store.list_members()?;
    assert!(members[0].heartbeat > 0, "expected heartbeat to be written, got {}", members[0].heartbeat);

    let _ = shutdown_tx.send(());
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .context("timed out waiting for heartbeat to shutdown")?
        .context("error joining heartbeat")??;

    Ok(())
}

#[tokio::test]
async fn heartbeat_refreshes_row_in_sled_store() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let (store, _db, _store_tmpdir) = fixtures::sled_store().await?;
    let store = Arc::new(store);
    let (shutdown_tx, _) = broadcast::channel(1);

    let (heartbeat, mut view_rx) = Heartbeat::new(config.clone(), store.clone(), shutdown_tx.subscribe());
    let handle = heartbeat.spawn();

    // The first checkin inserts with a zero heartbeat, the next one writes the real value.
    let first = wait_for_view(&mut view_rx, |_| true).await?;
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let members = store.list_members()?;
            if members.len() == 1 && members[0].heartbeat > 0 {
                return Ok::<_, anyhow::Error>(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("timed out waiting for heartbeat to be refreshed")??;

    let members = store.list_members()?;
    assert_eq!(members.len(), 1, "expected repeated checkins to keep a single row, got {}", members.len());
    assert_eq!(members[0].id, first.id, "expected the row to keep its storage ID, got {}", members[0].id);
    assert_eq!(members[0].id, 1, "expected first storage ID to be 1, got {}", members[0].id);

    let _ = shutdown_tx.send(());
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .context("timed out waiting for heartbeat to shutdown")?
        .context("error joining heartbeat")??;

    Ok(())
}
