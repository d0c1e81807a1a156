//! Member checkin.
//!
//! Each member of the ensemble periodically checks in with a strictly increasing heartbeat,
//! then re-reads its own row so that the hosting process can observe the slot granted by the
//! assignment authority along with the service ports it should bind.

use std::sync::Arc;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::database::Database;
use crate::models::Member;
use crate::ports::PortSet;
use crate::prom::{register_member_metrics, METRIC_ASSIGNED_SLOT, METRIC_CHECKINS, METRIC_CHECKIN_ERRORS};
use crate::store::{Checkin, MembershipStore};
use crate::utils;

/// A member's view of its own registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemberView {
    /// The storage ID of the member.
    pub id: u64,
    /// The slot granted to the member, `0` until assigned.
    pub assigned_index: u32,
    /// The service ports the member should bind.
    pub ports: PortSet,
}

impl From<&Member> for MemberView {
    fn from(member: &Member) -> Self {
        Self {
            id: member.id,
            assigned_index: member.assigned_index,
            ports: member.port_set(),
        }
    }
}

/// A channel of this member's latest view of its own registration.
pub type MemberViewRx = watch::Receiver<Option<MemberView>>;

/// A periodic task which checks this member in.
pub struct Heartbeat {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The membership store.
    store: Arc<dyn MembershipStore>,
    /// The member record used for checkin.
    member: Member,
    /// The last heartbeat value successfully written.
    last_heartbeat: i64,

    /// A channel used for publishing this member's view of its registration.
    view_tx: watch::Sender<Option<MemberView>>,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,
}

impl Heartbeat {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, store: Arc<dyn MembershipStore>, shutdown: broadcast::Receiver<()>) -> (Self, MemberViewRx) {
        let mut member = Member::new(config.member_uuid(), config.member_ip.as_str()).with_requested_index(config.requested_index);
        member.name = config.member_name.clone();
        let (view_tx, view_rx) = watch::channel(None);
        register_member_metrics();
        (
            Self {
                config,
                store,
                member,
                last_heartbeat: 0,
                view_tx,
                shutdown: BroadcastStream::new(shutdown),
            },
            view_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(uuid = %self.member.uuid, "member heartbeat has started");
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => self.handle_tick().await,
                _ = self.shutdown.next() => break,
            }
        }
        tracing::debug!(uuid = %self.member.uuid, "member heartbeat has shutdown");
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_tick(&mut self) {
        let view_opt = match self.checkin().await {
            Ok(view_opt) => view_opt,
            Err(err) => {
                metrics::increment_counter!(METRIC_CHECKIN_ERRORS);
                tracing::error!(error = ?err, uuid = %self.member.uuid, "error checking in member");
                return;
            }
        };
        metrics::increment_counter!(METRIC_CHECKINS);
        let view = match view_opt {
            Some(view) => view,
            // The row may have been deleted concurrently, it is re-created on the next checkin.
            None => {
                tracing::warn!(uuid = %self.member.uuid, "member row not found after checkin");
                return;
            }
        };
        let previous = *self.view_tx.borrow();
        if previous == Some(view) {
            return;
        }
        if previous.map(|prev| prev.assigned_index) != Some(view.assigned_index) && view.assigned_index != 0 {
            tracing::info!(
                uuid = %self.member.uuid,
                slot = view.assigned_index,
                zk_peer = view.ports.zk_peer,
                zk_election = view.ports.zk_election,
                zk_client = view.ports.zk_client,
                redis = view.ports.redis,
                "member has been assigned a slot",
            );
        }
        metrics::gauge!(METRIC_ASSIGNED_SLOT, view.assigned_index as f64);
        let _ = self.view_tx.send(Some(view));
    }

    /// Check in, then read back this member's row.
    async fn checkin(&mut self) -> Result<Option<MemberView>> {
        let heartbeat = next_heartbeat(self.last_heartbeat, utils::now_unix_ms());
        let (store, member) = (self.store.clone(), self.member.clone());
        let outcome = Database::spawn_blocking(move || store.checkin(&member, heartbeat)).await??;
        self.last_heartbeat = heartbeat;
        if let Checkin::Inserted { id } = outcome {
            tracing::info!(id, uuid = %self.member.uuid, ip = %self.member.ip_address, "member registered");
        }

        let (store, id) = (self.store.clone(), outcome.id());
        let members = Database::spawn_blocking(move || store.list_members()).await??;
        Ok(members.iter().find(|member| member.id == id).map(MemberView::from))
    }
}

/// Compute the next heartbeat value.
///
/// Heartbeats follow the wall clock in milliseconds, but always advance past the last value
/// written even if the clock steps backwards.
pub(crate) fn next_heartbeat(last: i64, now_ms: i64) -> i64 {
    now_ms.max(last.saturating_add(1))
}
