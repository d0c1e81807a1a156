use std::collections::{BTreeMap, BTreeSet};

use crate::models::Member;

/// The changes which bring the stored slot layout in line with a policy.
#[derive(Clone, Debug, Default)]
pub struct SlotPlan {
    /// The (slot, member) pairs to commit.
    pub assign: BTreeMap<u32, Member>,
    /// The members which must give up the slot they hold.
    pub revoke: Vec<Member>,
    /// The slots held by the planned members once the plan is committed.
    pub held: BTreeSet<u32>,
}

impl SlotPlan {
    /// Check if the plan requires no writes.
    pub fn is_empty(&self) -> bool {
        self.assign.is_empty() && self.revoke.is_empty()
    }
}

/// A scheduling policy which maps slots to members.
pub trait SlotPolicy: Send + Sync {
    /// Compute the slot layout for the given members, ordered by storage ID.
    ///
    /// Only the pairs which need to be committed are returned for assignment. Members left
    /// without a slot which still hold one are returned for revocation, so that no two of the
    /// given members ever hold the same slot.
    fn plan(&self, members: &[Member]) -> SlotPlan;
}

/// A policy which keeps members in the slots they already hold.
///
/// Slots are numbered `1..=cluster_size`. Members keep an in-range slot they already hold,
/// with the lowest storage ID winning a contested slot. Members which do not hold a slot are
/// granted their requested slot if it is in range and still free, else the lowest free slot.
/// Members beyond the cluster's capacity stay unassigned.
#[derive(Clone, Copy, Debug)]
pub struct StableSlots {
    cluster_size: u32,
}

impl StableSlots {
    /// Create a new instance.
    pub fn new(cluster_size: u32) -> Self {
        Self { cluster_size }
    }

    fn in_range(&self, slot: u32) -> bool {
        (1..=self.cluster_size).contains(&slot)
    }
}

impl SlotPolicy for StableSlots {
    fn plan(&self, members: &[Member]) -> SlotPlan {
        let mut slots: BTreeMap<u32, &Member> = BTreeMap::new();

        // Members already holding a slot.
        let mut unplaced = Vec::new();
        for member in members {
            if self.in_range(member.assigned_index) && !slots.contains_key(&member.assigned_index) {
                slots.insert(member.assigned_index, member);
            } else {
                unplaced.push(member);
            }
        }

        // Members with a satisfiable request.
        let mut remaining = Vec::new();
        for member in unplaced {
            if self.in_range(member.requested_index) && !slots.contains_key(&member.requested_index) {
                slots.insert(member.requested_index, member);
            } else {
                remaining.push(member);
            }
        }

        // Everyone else, lowest free slot first.
        let free: Vec<u32> = (1..=self.cluster_size).filter(|slot| !slots.contains_key(slot)).collect();
        let mut remaining = remaining.into_iter();
        for (slot, member) in free.into_iter().zip(remaining.by_ref()) {
            slots.insert(slot, member);
        }

        // Beyond capacity.
        let revoke = remaining.filter(|member| member.assigned_index != 0).cloned().collect();

        SlotPlan {
            held: slots.keys().copied().collect(),
            assign: slots
                .into_iter()
                .filter(|(slot, member)| member.assigned_index != *slot || member.requested_index != 0)
                .map(|(slot, member)| (slot, member.clone()))
                .collect(),
            revoke,
        }
    }
}
