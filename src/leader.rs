/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Bookkeeping of which replica is believed to lead each execution and round.
//!
//! No consensus logic lives here. The module exists so that the
//! [Acceptor](crate::acceptor::Acceptor) can reject a proposal from a replica that is not the
//! recorded leader for an `(eid, round)` without re-deriving leadership from scratch, and so that
//! upper layers can ask who to forward client requests to.
//!
//! Leadership follows a round-robin rule: the leader of round `r` of an execution is the round-0
//! leader advanced `r` positions. The round-0 leader of an execution is inherited from the leader
//! observed when the closest preceding execution decided.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::types::{ExecutionId, ReplicaId, RoundNumber};

pub struct LeaderModule {
    n: u32,
    inner: Mutex<LeaderHistory>,
}

struct LeaderHistory {
    /// Leader of round 0 per execution, where explicitly recorded (e.g. seeded by state transfer).
    round_zero: BTreeMap<ExecutionId, ReplicaId>,
    /// Leader observed at decision time, per decided execution. Append-only except for pruning.
    decided: BTreeMap<ExecutionId, ReplicaId>,
}

impl LeaderModule {
    pub(crate) fn new(n: usize) -> LeaderModule {
        LeaderModule {
            n: n as u32,
            inner: Mutex::new(LeaderHistory {
                round_zero: BTreeMap::new(),
                decided: BTreeMap::new(),
            }),
        }
    }

    /// The replica this module believes leads the given round of the given execution.
    pub fn get_leader(&self, eid: ExecutionId, round: RoundNumber) -> ReplicaId {
        let history = self.inner.lock().unwrap();
        let base = Self::round_zero_leader(&history, eid);
        (base + round % self.n) % self.n
    }

    /// Record the leader observed when `eid` decided. Subsequent executions inherit it as their
    /// round-0 leader until a leader change moves it along.
    pub(crate) fn decided(&self, eid: ExecutionId, leader: ReplicaId) {
        let mut history = self.inner.lock().unwrap();
        history.decided.insert(eid, leader % self.n);
    }

    /// Record the round-0 leader of an execution directly. Used when state transfer seeds this
    /// module with checkpointed leader history.
    pub(crate) fn set_round_zero_leader(&self, eid: ExecutionId, leader: ReplicaId) {
        let mut history = self.inner.lock().unwrap();
        history.round_zero.insert(eid, leader % self.n);
    }

    /// Drop the history of an execution that is below the stability boundary. Idempotent; keeps
    /// memory bounded by the admission window.
    pub(crate) fn remove_stable_consensus_info(&self, eid: ExecutionId) {
        let mut history = self.inner.lock().unwrap();
        history.round_zero.remove(&eid);
        history.decided.remove(&eid);
    }

    fn round_zero_leader(history: &LeaderHistory, eid: ExecutionId) -> ReplicaId {
        if let Some(leader) = history.round_zero.get(&eid) {
            return *leader;
        }
        if let Some((_, leader)) = history.decided.range(..eid).next_back() {
            return *leader;
        }
        // No history at all: the group starts out led by replica 0.
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_within_an_execution() {
        let leaders = LeaderModule::new(4);
        assert_eq!(leaders.get_leader(0, 0), 0);
        assert_eq!(leaders.get_leader(0, 1), 1);
        assert_eq!(leaders.get_leader(0, 4), 0);
    }

    #[test]
    fn later_executions_inherit_the_decided_leader() {
        let leaders = LeaderModule::new(4);
        leaders.decided(7, 2);
        assert_eq!(leaders.get_leader(8, 0), 2);
        assert_eq!(leaders.get_leader(8, 1), 3);
        // The decision of execution 7 says nothing about execution 7 itself or earlier ones.
        assert_eq!(leaders.get_leader(7, 0), 0);
    }

    #[test]
    fn pruned_history_is_forgotten() {
        let leaders = LeaderModule::new(4);
        leaders.decided(3, 1);
        leaders.decided(4, 2);
        leaders.remove_stable_consensus_info(3);
        // Execution 5 still inherits from the surviving entry.
        assert_eq!(leaders.get_leader(5, 0), 2);
        leaders.remove_stable_consensus_info(4);
        assert_eq!(leaders.get_leader(5, 0), 0);
    }

    #[test]
    fn state_transfer_seed_takes_precedence() {
        let leaders = LeaderModule::new(4);
        leaders.decided(9, 1);
        leaders.set_round_zero_leader(10, 3);
        assert_eq!(leaders.get_leader(10, 0), 3);
        assert_eq!(leaders.get_leader(10, 2), 1);
    }
}
