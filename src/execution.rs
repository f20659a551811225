/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! In-memory state of a single consensus instance: its rounds, their votes, and its decision.
//!
//! An [Execution] owns one mutex guarding all of its round state. Every mutation sequence (record
//! a vote, recount the quorum, mark a decision) happens under that single lock, so two threads
//! crossing a quorum threshold at the same time cannot double-decide. The vote-processing
//! components hold the lock across the whole sequence and send messages only after the state
//! transition is complete.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::messages::SignedFreezeProof;
use crate::types::{CryptoHash, ExecutionId, ReplicaId, RoundNumber};

/// Where a round stands in its lifecycle. `Frozen` is terminal for the round only; the execution
/// continues at the next round number.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RoundStage {
    Init,
    Proposed,
    WeakQuorumReached,
    Decided,
    Frozen,
}

/// One round of one execution: the proposal (set at most once) and one vote slot per replica for
/// each vote kind. A replica's first vote of a kind wins; later ones are ignored.
pub(crate) struct Round {
    stage: RoundStage,
    proposed_value: Option<Vec<u8>>,
    proposed_value_hash: Option<CryptoHash>,
    weak: Vec<Option<CryptoHash>>,
    strong: Vec<Option<CryptoHash>>,
    decide: Vec<Option<CryptoHash>>,
    freeze: Vec<bool>,
    collect_proofs: Vec<Option<SignedFreezeProof>>,
    sent_weak: bool,
    sent_strong: bool,
    sent_collect: bool,
    sent_propose: bool,
}

impl Round {
    pub(crate) fn new(n: usize) -> Round {
        Round {
            stage: RoundStage::Init,
            proposed_value: None,
            proposed_value_hash: None,
            weak: vec![None; n],
            strong: vec![None; n],
            decide: vec![None; n],
            freeze: vec![false; n],
            collect_proofs: vec![None; n],
            sent_weak: false,
            sent_strong: false,
            sent_collect: false,
            sent_propose: false,
        }
    }

    pub(crate) fn stage(&self) -> RoundStage {
        self.stage
    }

    pub(crate) fn set_stage(&mut self, stage: RoundStage) {
        self.stage = stage;
    }

    /// Record the round's proposal. Returns false without effect if a proposal was already
    /// recorded: only one propose is accepted per round.
    pub(crate) fn set_proposed_value(&mut self, value: Vec<u8>, hash: CryptoHash) -> bool {
        if self.proposed_value.is_some() {
            return false;
        }
        self.proposed_value = Some(value);
        self.proposed_value_hash = Some(hash);
        true
    }

    pub(crate) fn proposed_value(&self) -> Option<&Vec<u8>> {
        self.proposed_value.as_ref()
    }

    pub(crate) fn proposed_value_hash(&self) -> Option<CryptoHash> {
        self.proposed_value_hash
    }

    pub(crate) fn register_weak(&mut self, replica: ReplicaId, hash: CryptoHash) {
        if let Some(slot @ None) = self.weak.get_mut(replica as usize) {
            *slot = Some(hash);
        }
    }

    pub(crate) fn register_strong(&mut self, replica: ReplicaId, hash: CryptoHash) {
        if let Some(slot @ None) = self.strong.get_mut(replica as usize) {
            *slot = Some(hash);
        }
    }

    pub(crate) fn register_decide(&mut self, replica: ReplicaId, hash: CryptoHash) {
        if let Some(slot @ None) = self.decide.get_mut(replica as usize) {
            *slot = Some(hash);
        }
    }

    pub(crate) fn register_freeze(&mut self, replica: ReplicaId) {
        if let Some(slot) = self.freeze.get_mut(replica as usize) {
            *slot = true;
        }
    }

    pub(crate) fn register_collect_proof(&mut self, replica: ReplicaId, proof: SignedFreezeProof) {
        if let Some(slot @ None) = self.collect_proofs.get_mut(replica as usize) {
            *slot = Some(proof);
        }
    }

    pub(crate) fn count_weak(&self, hash: &CryptoHash) -> usize {
        self.weak.iter().flatten().filter(|h| *h == hash).count()
    }

    pub(crate) fn count_strong(&self, hash: &CryptoHash) -> usize {
        self.strong.iter().flatten().filter(|h| *h == hash).count()
    }

    pub(crate) fn count_decide(&self, hash: &CryptoHash) -> usize {
        self.decide.iter().flatten().filter(|h| *h == hash).count()
    }

    pub(crate) fn count_freeze(&self) -> usize {
        self.freeze.iter().filter(|frozen| **frozen).count()
    }

    pub(crate) fn my_weak_vote(&self, me: ReplicaId) -> Option<CryptoHash> {
        self.weak.get(me as usize).copied().flatten()
    }

    pub(crate) fn my_strong_vote(&self, me: ReplicaId) -> Option<CryptoHash> {
        self.strong.get(me as usize).copied().flatten()
    }

    pub(crate) fn collect_proofs(&self) -> &Vec<Option<SignedFreezeProof>> {
        &self.collect_proofs
    }

    pub(crate) fn sent_weak(&self) -> bool {
        self.sent_weak
    }

    pub(crate) fn mark_sent_weak(&mut self) {
        self.sent_weak = true;
    }

    pub(crate) fn sent_strong(&self) -> bool {
        self.sent_strong
    }

    pub(crate) fn mark_sent_strong(&mut self) {
        self.sent_strong = true;
    }

    pub(crate) fn sent_collect(&self) -> bool {
        self.sent_collect
    }

    pub(crate) fn mark_sent_collect(&mut self) {
        self.sent_collect = true;
    }

    pub(crate) fn sent_propose(&self) -> bool {
        self.sent_propose
    }

    pub(crate) fn mark_sent_propose(&mut self) {
        self.sent_propose = true;
    }
}

/// The value a consensus instance settled on, and where it did so.
#[derive(Clone)]
pub struct Decision {
    pub eid: ExecutionId,
    pub round: RoundNumber,
    pub value: Vec<u8>,
    pub value_hash: CryptoHash,
}

/// The lock-guarded state of an [Execution].
pub(crate) struct ExecutionState {
    n: usize,
    current_round: RoundNumber,
    rounds: BTreeMap<RoundNumber, Round>,
    decision: Option<Decision>,
    superseded: bool,
}

impl ExecutionState {
    /// The round whose messages are currently meaningful. Messages for lower rounds are stale.
    pub(crate) fn current_round(&self) -> RoundNumber {
        self.current_round
    }

    /// Advance to a later round. Round numbers never move backwards.
    pub(crate) fn advance_round(&mut self, round: RoundNumber) {
        if round > self.current_round {
            self.current_round = round;
        }
    }

    pub(crate) fn round(&self, round: RoundNumber) -> Option<&Round> {
        self.rounds.get(&round)
    }

    pub(crate) fn round_mut(&mut self, round: RoundNumber) -> &mut Round {
        let n = self.n;
        self.rounds.entry(round).or_insert_with(|| Round::new(n))
    }

    /// Find the preimage of a value hash among the proposals recorded in any round of this
    /// execution. Used to resolve a safe value back into the bytes to re-propose.
    pub(crate) fn value_with_hash(&self, hash: &CryptoHash) -> Option<Vec<u8>> {
        self.rounds
            .values()
            .find(|round| round.proposed_value_hash().as_ref() == Some(hash))
            .and_then(|round| round.proposed_value().cloned())
    }

    pub(crate) fn decision(&self) -> Option<&Decision> {
        self.decision.as_ref()
    }

    pub(crate) fn set_decision(&mut self, decision: Decision) {
        if self.decision.is_none() {
            self.decision = Some(decision);
        }
    }
}

/// The state of one consensus instance, created lazily by the
/// [ExecutionManager](crate::execution_manager::ExecutionManager) and retired once decided and
/// consumed, or replaced wholesale by state transfer.
pub struct Execution {
    eid: ExecutionId,
    state: Mutex<ExecutionState>,
    decided_signal: Condvar,
}

impl Execution {
    pub(crate) fn new(eid: ExecutionId, n: usize) -> Execution {
        Execution {
            eid,
            state: Mutex::new(ExecutionState {
                n,
                current_round: 0,
                rounds: BTreeMap::new(),
                decision: None,
                superseded: false,
            }),
            decided_signal: Condvar::new(),
        }
    }

    pub fn eid(&self) -> ExecutionId {
        self.eid
    }

    pub(crate) fn lock(&self) -> MutexGuard<ExecutionState> {
        self.state.lock().unwrap()
    }

    /// Wake up callers blocked in [Execution::wait_decision]. Called after the decision has been
    /// recorded and the state lock released.
    pub(crate) fn notify_decided(&self) {
        self.decided_signal.notify_all();
    }

    /// Mark this execution as replaced by state transfer and wake up blocked callers, which will
    /// observe that no decision is coming from this object.
    pub(crate) fn supersede(&self) {
        let mut state = self.state.lock().unwrap();
        state.superseded = true;
        drop(state);
        self.decided_signal.notify_all();
    }

    /// The decision of this execution, if it has been reached.
    pub fn decision(&self) -> Option<Decision> {
        self.state.lock().unwrap().decision.clone()
    }

    /// Block until this execution decides, the deadline passes, or the execution is superseded by
    /// state transfer.
    pub fn wait_decision(&self, timeout: Duration) -> Option<Decision> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(decision) = &state.decision {
                return Some(decision.clone());
            }
            if state.superseded {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .decided_signal
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::hash_value;

    #[test]
    fn only_one_proposal_is_recorded_per_round() {
        let mut round = Round::new(4);
        let first = b"first".to_vec();
        let second = b"second".to_vec();
        assert!(round.set_proposed_value(first.clone(), hash_value(&first)));
        assert!(!round.set_proposed_value(second.clone(), hash_value(&second)));
        assert_eq!(round.proposed_value(), Some(&first));
        assert_eq!(round.proposed_value_hash(), Some(hash_value(&first)));
    }

    #[test]
    fn first_vote_per_replica_wins() {
        let mut round = Round::new(4);
        let a = hash_value(b"a");
        let b = hash_value(b"b");
        round.register_weak(2, a);
        round.register_weak(2, b);
        assert_eq!(round.count_weak(&a), 1);
        assert_eq!(round.count_weak(&b), 0);
    }

    #[test]
    fn votes_from_outside_the_group_are_ignored() {
        let mut round = Round::new(4);
        let a = hash_value(b"a");
        round.register_weak(17, a);
        round.register_strong(17, a);
        assert_eq!(round.count_weak(&a), 0);
        assert_eq!(round.count_strong(&a), 0);
    }

    #[test]
    fn round_numbers_never_move_backwards() {
        let execution = Execution::new(5, 4);
        let mut state = execution.lock();
        state.advance_round(2);
        state.advance_round(1);
        assert_eq!(state.current_round(), 2);
    }

    #[test]
    fn superseded_execution_unblocks_waiters() {
        let execution = std::sync::Arc::new(Execution::new(9, 4));
        let waiter = {
            let execution = execution.clone();
            std::thread::spawn(move || execution.wait_decision(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(50));
        execution.supersede();
        assert!(waiter.join().unwrap().is_none());
    }
}
