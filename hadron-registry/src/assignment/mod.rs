//! Index assignment.
//!
//! The assignment authority periodically lists all members, restricts the listing to members
//! whose heartbeats are still advancing, computes a slot assignment through its `SlotPolicy`
//! and commits the result through the store. Members pick up their slot the next time they
//! read their own row.
//!
//! Members which lose their slot, either to a lower storage ID or to a live member taking over
//! the slot of a dead one, have it revoked before any new slot is granted.
//!
//! Only a single authority may run against a store at any point in time. Commits are not
//! transactional across members, so concurrent authorities may interleave their updates.

mod liveness;
mod policy;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::database::Database;
use crate::error::RegistryResult;
use crate::models::Member;
use crate::store::MembershipStore;

pub use liveness::LivenessTracker;
pub use policy::{SlotPlan, SlotPolicy, StableSlots};

const METRIC_MEMBERS: &str = "hadron_registry_members";
const METRIC_LIVE_MEMBERS: &str = "hadron_registry_live_members";
const METRIC_ASSIGNMENTS_COMMITTED: &str = "hadron_registry_assignments_committed";
const METRIC_REVOCATIONS_COMMITTED: &str = "hadron_registry_revocations_committed";

/// The outcome of a single assignment round.
#[derive(Clone, Debug, Default)]
pub struct AssignmentRound {
    /// The number of members listed.
    pub members: usize,
    /// The number of members considered live.
    pub live: usize,
    /// The slot assignments committed during the round.
    pub committed: BTreeMap<u32, Member>,
    /// The members whose slot was revoked during the round.
    pub revoked: Vec<Member>,
}

/// Run a single assignment round against the given store.
///
/// Nothing is written when the policy finds the cluster already converged.
pub fn run_assignment(store: &dyn MembershipStore, policy: &dyn SlotPolicy, liveness: &mut LivenessTracker, now: Instant) -> RegistryResult<AssignmentRound> {
    let members = store.list_members()?;
    let plan = plan_round(&members, policy, liveness, now);
    if !plan.revoke.is_empty() {
        store.revoke_indices(&plan.revoke)?;
    }
    if !plan.assign.is_empty() {
        store.assign_indices(&plan.assign)?;
    }
    Ok(AssignmentRound {
        members: members.len(),
        live: plan.live,
        committed: plan.assign,
        revoked: plan.revoke,
    })
}

/// A slot plan over a listing of members.
struct RoundPlan {
    live: usize,
    assign: BTreeMap<u32, Member>,
    revoke: Vec<Member>,
}

/// Plan an assignment round over the given listing of members.
///
/// Dead members keep their slot until a live member is placed in it.
fn plan_round(members: &[Member], policy: &dyn SlotPolicy, liveness: &mut LivenessTracker, now: Instant) -> RoundPlan {
    let live = liveness.observe(members, now);
    let live_ids: HashSet<u64> = live.iter().map(|member| member.id).collect();
    let SlotPlan { assign, mut revoke, held } = policy.plan(&live);
    revoke.extend(
        members
            .iter()
            .filter(|member| !live_ids.contains(&member.id) && held.contains(&member.assigned_index))
            .cloned(),
    );
    RoundPlan {
        live: live.len(),
        assign,
        revoke,
    }
}

/// A periodic task acting as the index assignment authority.
pub struct IndexAssigner {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The membership store.
    store: Arc<dyn MembershipStore>,
    /// The policy used to compute slot assignments.
    policy: Arc<dyn SlotPolicy>,
    /// Liveness observations across rounds.
    liveness: LivenessTracker,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,
}

impl IndexAssigner {
    /// Create a new instance using the `StableSlots` policy.
    pub fn new(config: Arc<Config>, store: Arc<dyn MembershipStore>, shutdown: broadcast::Receiver<()>) -> Self {
        metrics::register_gauge!(METRIC_MEMBERS, metrics::Unit::Count, "the number of members registered");
        metrics::register_gauge!(METRIC_LIVE_MEMBERS, metrics::Unit::Count, "the number of members with an advancing heartbeat");
        metrics::register_counter!(METRIC_ASSIGNMENTS_COMMITTED, metrics::Unit::Count, "the number of slot assignments committed");
        metrics::register_counter!(METRIC_REVOCATIONS_COMMITTED, metrics::Unit::Count, "the number of slot revocations committed");
        Self {
            policy: Arc::new(StableSlots::new(config.cluster_size)),
            liveness: LivenessTracker::new(config.heartbeat_timeout()),
            shutdown: BroadcastStream::new(shutdown),
            config,
            store,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(cluster_size = self.config.cluster_size, "index assigner has started");
        let mut ticker = tokio::time::interval(self.config.assignment_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => self.handle_tick().await,
                _ = self.shutdown.next() => break,
            }
        }
        tracing::debug!("index assigner has shutdown");
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_tick(&mut self) {
        let round = match self.assign_round().await {
            Ok(round) => round,
            Err(err) => {
                tracing::error!(error = ?err, "error running index assignment round");
                return;
            }
        };
        metrics::gauge!(METRIC_MEMBERS, round.members as f64);
        metrics::gauge!(METRIC_LIVE_MEMBERS, round.live as f64);
        metrics::counter!(METRIC_REVOCATIONS_COMMITTED, round.revoked.len() as u64);
        metrics::counter!(METRIC_ASSIGNMENTS_COMMITTED, round.committed.len() as u64);
        for member in round.revoked.iter() {
            tracing::info!(slot = member.assigned_index, id = member.id, uuid = %member.uuid, "revoked slot of member");
        }
        for (slot, member) in round.committed.iter() {
            tracing::info!(slot, id = member.id, uuid = %member.uuid, ip = %member.ip_address, "assigned slot to member");
        }
    }

    /// Run an assignment round on the blocking pool.
    async fn assign_round(&mut self) -> Result<AssignmentRound> {
        let (store, policy) = (self.store.clone(), self.policy.clone());
        let mut liveness = std::mem::replace(&mut self.liveness, LivenessTracker::new(self.config.heartbeat_timeout()));
        let (liveness, res) = Database::spawn_blocking(move || {
            let res = run_assignment(store.as_ref(), policy.as_ref(), &mut liveness, Instant::now());
            (liveness, res)
        })
        .await?;
        self.liveness = liveness;
        Ok(res?)
    }
}
