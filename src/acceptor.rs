/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The vote-counting half of the protocol: processing of PROPOSE, WEAK, STRONG, DECIDE, and
//! FREEZE messages, and the freeze triggered by the watchdog.
//!
//! A replica's own broadcasts come back to it through the network loopback and are counted like
//! everyone else's, so this module never registers its own votes directly. All threshold checks
//! are strict (`count > threshold`) and are re-evaluated both when a vote arrives and when a
//! proposal arrives, because votes may outrun the proposal they refer to.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use crate::app::App;
use crate::config::CoreConfig;
use crate::events::{
    CollectEvent, DecideEvent, Event, FreezeEvent, ReceiveFreezeEvent, ReceiveProposalEvent,
    ReceiveVoteEvent, VoteEvent, VoteKind,
};
use crate::execution::{Decision, Execution, ExecutionState, RoundStage};
use crate::execution_manager::ExecutionManager;
use crate::leader::LeaderModule;
use crate::messages::{
    CollectProof, ConsensusMessage, Freeze, FreezeProof, Propose, SignedFreezeProof, Vote,
};
use crate::networking::{Network, SenderHandle};
use crate::proof_verifier::{ProofVerifier, SafeValue};
use crate::timeouts::Watchdog;
use crate::types::{hash_value, CryptoHash, ExecutionId, ReplicaId, RoundNumber, VerifyingKey};

pub(crate) struct Acceptor<N: Network, A: App> {
    config: Arc<CoreConfig>,
    manager: Arc<ExecutionManager>,
    leader_module: Arc<LeaderModule>,
    proof_verifier: ProofVerifier,
    sender: Arc<SenderHandle<N>>,
    app: Arc<Mutex<A>>,
    watchdog: Watchdog,
    dispatch_queue: Sender<(VerifyingKey, ConsensusMessage)>,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network, A: App> Acceptor<N, A> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<CoreConfig>,
        manager: Arc<ExecutionManager>,
        leader_module: Arc<LeaderModule>,
        sender: Arc<SenderHandle<N>>,
        app: Arc<Mutex<A>>,
        watchdog: Watchdog,
        dispatch_queue: Sender<(VerifyingKey, ConsensusMessage)>,
        event_publisher: Option<Sender<Event>>,
    ) -> Acceptor<N, A> {
        let proof_verifier = ProofVerifier::new(config.clone());
        Acceptor {
            config,
            manager,
            leader_module,
            proof_verifier,
            sender,
            app,
            watchdog,
            dispatch_queue,
            event_publisher,
        }
    }

    /// Process a message that passed origin verification and window admission. COLLECT messages
    /// are routed to the [Proposer](crate::proposer::Proposer) instead and never arrive here.
    pub(crate) fn process_message(&self, msg: ConsensusMessage) {
        match msg {
            ConsensusMessage::Propose(propose) => self.receive_propose(propose),
            ConsensusMessage::Weak(vote) => self.receive_vote(VoteKind::Weak, vote),
            ConsensusMessage::Strong(vote) => self.receive_vote(VoteKind::Strong, vote),
            ConsensusMessage::Decide(vote) => self.receive_vote(VoteKind::Decide, vote),
            ConsensusMessage::Freeze(freeze) => self.receive_freeze(freeze),
            ConsensusMessage::Collect(_) => (),
        }
    }

    fn receive_propose(&self, propose: Propose) {
        let value_hash = hash_value(&propose.value);
        Event::publish(
            &self.event_publisher,
            Event::ReceiveProposal(ReceiveProposalEvent {
                timestamp: SystemTime::now(),
                origin: propose.sender,
                eid: propose.eid,
                round: propose.round,
                value_hash,
            }),
        );

        if self.leader_module.get_leader(propose.eid, propose.round) != propose.sender {
            log::debug!(
                "ProposalFromNonLeader, {}, {}, {}",
                propose.eid,
                propose.round,
                propose.sender
            );
            return;
        }

        // A proposal for a round after a freeze must justify itself with the proofs the new
        // leader collected; this replica re-derives the safe value and cross-checks.
        if propose.round > 0 {
            let proof = match &propose.proof {
                Some(proof) => proof,
                None => return,
            };
            // The leader commits to the hash of the value it derived from the proofs. It must
            // be the hash of the value actually proposed, or the bundle is inconsistent.
            if proof.next_propose_hash != Some(value_hash) {
                return;
            }
            let valid =
                self.proof_verifier
                    .valid_proofs(propose.eid, propose.round - 1, &proof.proofs);
            if !self.proof_verifier.is_the_leader(&valid, propose.sender) {
                return;
            }
            if !self.proof_verifier.enough_proofs(&valid) {
                return;
            }
            match self.proof_verifier.good_value(&valid) {
                SafeValue::Any => (),
                SafeValue::Only(safe_hash) if safe_hash == value_hash => (),
                _ => return,
            }
        }

        // A value the delivery layer rejects behaves like a proposal that was never received.
        if self
            .app
            .lock()
            .unwrap()
            .validate_proposed_value(propose.eid, &propose.value)
            .is_none()
        {
            return;
        }

        let execution = self.manager.get_execution(propose.eid);
        let mut state = execution.lock();
        if state.decision().is_some() || propose.round < state.current_round() {
            return;
        }
        let round = state.round_mut(propose.round);
        if !round.set_proposed_value(propose.value, value_hash) {
            return;
        }
        let frozen = round.stage() == RoundStage::Frozen;
        if !frozen {
            round.set_stage(RoundStage::Proposed);
            if !round.sent_weak() {
                round.mark_sent_weak();
                self.sender.broadcast(ConsensusMessage::weak(
                    self.config.me,
                    propose.eid,
                    propose.round,
                    value_hash,
                ));
                self.publish_vote(VoteKind::Weak, propose.eid, propose.round, value_hash);
                self.manager.note_in_execution(propose.eid);
                self.watchdog.watch(propose.eid);
            }
        }
        // Votes may have outrun this proposal.
        let decision = self.evaluate_round(propose.eid, &mut state, propose.round);
        drop(state);
        if let Some(decision) = decision {
            self.finish_decision(&execution, decision);
        }
    }

    fn receive_vote(&self, kind: VoteKind, vote: Vote) {
        Event::publish(
            &self.event_publisher,
            Event::ReceiveVote(ReceiveVoteEvent {
                timestamp: SystemTime::now(),
                origin: vote.sender,
                kind,
                eid: vote.eid,
                round: vote.round,
                value_hash: vote.value_hash,
            }),
        );

        let execution = self.manager.get_execution(vote.eid);
        let mut state = execution.lock();
        if state.decision().is_some() {
            return;
        }
        // WEAK and STRONG votes for rounds this replica has moved past are stale; DECIDE votes
        // count regardless, since a decision in any round settles the execution.
        if kind != VoteKind::Decide && vote.round < state.current_round() {
            return;
        }
        let round = state.round_mut(vote.round);
        match kind {
            VoteKind::Weak => round.register_weak(vote.sender, vote.value_hash),
            VoteKind::Strong => round.register_strong(vote.sender, vote.value_hash),
            VoteKind::Decide => round.register_decide(vote.sender, vote.value_hash),
        }
        let decision = self.evaluate_round(vote.eid, &mut state, vote.round);
        drop(state);
        if let Some(decision) = decision {
            self.finish_decision(&execution, decision);
        }
    }

    fn receive_freeze(&self, freeze: Freeze) {
        Event::publish(
            &self.event_publisher,
            Event::ReceiveFreeze(ReceiveFreezeEvent {
                timestamp: SystemTime::now(),
                origin: freeze.sender,
                eid: freeze.eid,
                round: freeze.round,
            }),
        );

        let execution = self.manager.get_execution(freeze.eid);
        let mut state = execution.lock();
        if state.decision().is_some() {
            return;
        }
        let current_round = state.current_round();
        let round = state.round_mut(freeze.round);
        round.register_freeze(freeze.sender);
        let quorum = round.count_freeze() > self.config.quorum_f();
        if !quorum || freeze.round < current_round {
            return;
        }
        let collect = self.freeze_round(freeze.eid, &mut state, freeze.round);
        drop(state);
        self.after_freeze(freeze.eid, freeze.round, collect);
    }

    /// Watchdog callback: the execution stayed undecided past its deadline, so give up on the
    /// round in progress and tell everyone.
    pub(crate) fn trigger_freeze(&self, eid: ExecutionId) {
        let execution = self.manager.get_execution(eid);
        let mut state = execution.lock();
        if state.decision().is_some() {
            return;
        }
        let frozen_round = state.current_round();
        let collect = self.freeze_round(eid, &mut state, frozen_round);
        drop(state);
        if collect.is_none() {
            return;
        }
        // Own freeze declaration; the loopback registers this replica's freeze bit.
        self.sender
            .broadcast(ConsensusMessage::freeze(self.config.me, eid, frozen_round));
        self.after_freeze(eid, frozen_round, collect);
    }

    /// Freeze a round under the execution lock: mark it terminal, sign this replica's account of
    /// its votes in it, and advance to the next round. Returns the COLLECT message for the
    /// prospective leader, or None if the round was already frozen or decided.
    fn freeze_round(
        &self,
        eid: ExecutionId,
        state: &mut MutexGuard<ExecutionState>,
        frozen_round: RoundNumber,
    ) -> Option<(ReplicaId, ConsensusMessage)> {
        let me = self.config.me;
        let next_round = frozen_round + 1;
        let new_leader = self.leader_module.get_leader(eid, next_round);
        let round = state.round_mut(frozen_round);
        if round.stage() == RoundStage::Frozen
            || round.stage() == RoundStage::Decided
            || round.sent_collect()
        {
            return None;
        }
        round.set_stage(RoundStage::Frozen);
        round.mark_sent_collect();
        let proof = FreezeProof {
            eid,
            round: frozen_round,
            weak_value_hash: round.my_weak_vote(me),
            strong_value_hash: round.my_strong_vote(me),
            leader: new_leader,
        };
        let signed = SignedFreezeProof::sign(proof, me, &self.config.keypair);
        state.advance_round(next_round);
        let mut proofs = vec![None; self.config.n()];
        proofs[me as usize] = Some(signed);
        let collect = ConsensusMessage::collect(
            me,
            eid,
            frozen_round,
            CollectProof {
                leader: new_leader,
                proofs,
            },
        );
        Some((new_leader, collect))
    }

    fn after_freeze(
        &self,
        eid: ExecutionId,
        frozen_round: RoundNumber,
        collect: Option<(ReplicaId, ConsensusMessage)>,
    ) {
        let (new_leader, collect) = match collect {
            Some(collect) => collect,
            None => return,
        };
        Event::publish(
            &self.event_publisher,
            Event::Freeze(FreezeEvent {
                timestamp: SystemTime::now(),
                eid,
                round: frozen_round,
            }),
        );
        Event::publish(
            &self.event_publisher,
            Event::Collect(CollectEvent {
                timestamp: SystemTime::now(),
                eid,
                round: frozen_round,
                leader: new_leader,
            }),
        );
        self.sender.send(new_leader, collect);
        // The replacement round runs under a fresh deadline.
        self.watchdog.watch(eid);
    }

    /// Re-check every quorum of one round against its proposal. Returns the decision if one was
    /// just reached; the caller completes it after releasing the lock.
    fn evaluate_round(
        &self,
        eid: ExecutionId,
        state: &mut MutexGuard<ExecutionState>,
        round_number: RoundNumber,
    ) -> Option<Decision> {
        let round = state.round_mut(round_number);
        // Quorums are only meaningful against a validated proposal; without the value's preimage
        // no decision could be delivered anyway.
        let proposal_hash = round.proposed_value_hash()?;
        let weaks = round.count_weak(&proposal_hash);
        let strongs = round.count_strong(&proposal_hash);
        let decides = round.count_decide(&proposal_hash);

        let decided = weaks > self.config.quorum_fast_decide()
            || strongs > self.config.quorum_2f()
            || decides > self.config.quorum_f();
        if decided {
            round.set_stage(RoundStage::Decided);
            let decision = Decision {
                eid,
                round: round_number,
                value: round.proposed_value().cloned()?,
                value_hash: proposal_hash,
            };
            state.set_decision(decision.clone());
            return Some(decision);
        }

        if weaks > self.config.quorum_strong() && round.stage() != RoundStage::Frozen {
            round.set_stage(RoundStage::WeakQuorumReached);
            if !round.sent_strong() {
                round.mark_sent_strong();
                self.sender.broadcast(ConsensusMessage::strong(
                    self.config.me,
                    eid,
                    round_number,
                    proposal_hash,
                ));
                self.publish_vote(VoteKind::Strong, eid, round_number, proposal_hash);
            }
        }
        None
    }

    /// Complete a freshly reached decision outside the execution lock: wake waiters, deliver to
    /// the delivery layer, tell laggards, and replay whatever was buffered for the next execution.
    fn finish_decision(&self, execution: &Execution, decision: Decision) {
        execution.notify_decided();
        self.watchdog.unwatch(decision.eid);
        self.leader_module.decided(
            decision.eid,
            self.leader_module.get_leader(decision.eid, decision.round),
        );
        self.sender.broadcast(ConsensusMessage::decide(
            self.config.me,
            decision.eid,
            decision.round,
            decision.value_hash,
        ));
        self.publish_vote(
            VoteKind::Decide,
            decision.eid,
            decision.round,
            decision.value_hash,
        );
        Event::publish(
            &self.event_publisher,
            Event::Decide(DecideEvent {
                timestamp: SystemTime::now(),
                eid: decision.eid,
                round: decision.round,
                value_hash: decision.value_hash,
            }),
        );
        self.app.lock().unwrap().deliver_decision(decision.clone());
        // Requeue rather than recurse: messages for the next execution go back through dispatch.
        for msg in self.manager.decided(decision.eid) {
            if let Some(pk) = self.config.replicas.get(msg.sender()) {
                let _ = self.dispatch_queue.send((*pk, msg));
            }
        }
    }

    fn publish_vote(
        &self,
        kind: VoteKind,
        eid: ExecutionId,
        round: RoundNumber,
        value_hash: CryptoHash,
    ) {
        Event::publish(
            &self.event_publisher,
            Event::Vote(VoteEvent {
                timestamp: SystemTime::now(),
                kind,
                eid,
                round,
                value_hash,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::messages::Proof;
    use crate::testing::{self, NullStateTransfer, RecordingApp, RecordingNetwork};
    use crate::types::{Keypair, SigningKey};

    fn acceptor(
        n: usize,
        f: u32,
    ) -> (
        Acceptor<RecordingNetwork, RecordingApp>,
        RecordingNetwork,
        Arc<Mutex<RecordingApp>>,
        Vec<SigningKey>,
    ) {
        let (keypairs, config) = testing::core_config(n, f);
        let leader_module = Arc::new(LeaderModule::new(n));
        let manager = Arc::new(ExecutionManager::new(
            config.clone(),
            leader_module.clone(),
            Box::new(NullStateTransfer),
            None,
        ));
        let network = RecordingNetwork::new();
        let sender = Arc::new(SenderHandle::new(config.clone(), network.clone()));
        let app = Arc::new(Mutex::new(RecordingApp::new()));
        let (dispatch_queue, _dispatch) = mpsc::channel();
        let acceptor = Acceptor::new(
            config,
            manager,
            leader_module,
            sender,
            app.clone(),
            Watchdog::new(std::time::Duration::from_secs(60)),
            dispatch_queue,
            None,
        );
        (acceptor, network, app, keypairs)
    }

    #[test]
    fn weak_quorum_triggers_strong_and_strong_quorum_decides() {
        let (acceptor, network, app, _) = acceptor(4, 1);
        let value = b"batch".to_vec();
        let hash = hash_value(&value);

        acceptor.process_message(ConsensusMessage::propose(0, 5, 0, value.clone(), None));
        // The proposal was accepted: this replica (id 0) broadcast its WEAK vote.
        assert_eq!(network.broadcasts_of_kind("Weak"), 1);

        for replica in 0..3 {
            acceptor.process_message(ConsensusMessage::weak(replica, 5, 0, hash));
        }
        // Three weak votes exceed quorum_strong = 2.
        assert_eq!(network.broadcasts_of_kind("Strong"), 1);
        assert!(app.lock().unwrap().decisions.is_empty());

        for replica in 0..3 {
            acceptor.process_message(ConsensusMessage::strong(replica, 5, 0, hash));
        }
        // Three strong votes exceed quorum_2f = 2: decided.
        let app = app.lock().unwrap();
        assert_eq!(app.decisions.len(), 1);
        assert_eq!(app.decisions[0].eid, 5);
        assert_eq!(app.decisions[0].value, value);
        assert_eq!(network.broadcasts_of_kind("Decide"), 1);
    }

    #[test]
    fn four_weak_votes_decide_fast() {
        let (acceptor, network, app, _) = acceptor(4, 1);
        let value = b"batch".to_vec();
        let hash = hash_value(&value);

        acceptor.process_message(ConsensusMessage::propose(0, 0, 0, value, None));
        for replica in 0..4 {
            acceptor.process_message(ConsensusMessage::weak(replica, 0, 0, hash));
        }
        // Four weak votes exceed quorum_fast_decide = 3: decided without a STRONG round trip.
        assert_eq!(app.lock().unwrap().decisions.len(), 1);
        assert_eq!(network.broadcasts_of_kind("Decide"), 1);
    }

    #[test]
    fn only_the_first_proposal_of_a_round_is_voted_on() {
        let (acceptor, network, _, _) = acceptor(4, 1);
        acceptor.process_message(ConsensusMessage::propose(0, 0, 0, b"first".to_vec(), None));
        acceptor.process_message(ConsensusMessage::propose(0, 0, 0, b"second".to_vec(), None));
        assert_eq!(network.broadcasts_of_kind("Weak"), 1);
    }

    #[test]
    fn proposals_from_non_leaders_are_discarded() {
        let (acceptor, network, _, _) = acceptor(4, 1);
        // Replica 2 does not lead round 0 of execution 0.
        acceptor.process_message(ConsensusMessage::propose(2, 0, 0, b"batch".to_vec(), None));
        assert_eq!(network.broadcasts_of_kind("Weak"), 0);
    }

    #[test]
    fn freezing_needs_more_than_quorum_f_declarations() {
        let (acceptor, network, _, _) = acceptor(4, 1);
        acceptor.process_message(ConsensusMessage::freeze(1, 0, 0));
        assert_eq!(network.sends_of_kind("Collect"), 0);

        acceptor.process_message(ConsensusMessage::freeze(2, 0, 0));
        // Two declarations exceed quorum_f = 1: this replica freezes and sends its proof to the
        // leader of round 1.
        assert_eq!(network.sends_of_kind("Collect"), 1);

        // Further declarations do not re-freeze.
        acceptor.process_message(ConsensusMessage::freeze(3, 0, 0));
        assert_eq!(network.sends_of_kind("Collect"), 1);
    }

    #[test]
    fn takeover_proposals_must_commit_to_the_hash_of_their_value() {
        let (acceptor, network, _, keypairs) = acceptor(4, 1);
        // Round 0 of execution 0 froze before anyone voted, electing replica 1 for round 1. With
        // no recorded votes any value is safe, so only the bundled hash is at stake.
        let mut proofs = vec![None; 4];
        for signer in [1u32, 2, 3] {
            let proof = FreezeProof {
                eid: 0,
                round: 0,
                weak_value_hash: None,
                strong_value_hash: None,
                leader: 1,
            };
            proofs[signer as usize] = Some(SignedFreezeProof::sign(
                proof,
                signer,
                &Keypair::new(keypairs[signer as usize].clone()),
            ));
        }
        let value = b"batch".to_vec();

        acceptor.process_message(ConsensusMessage::propose(
            1,
            0,
            1,
            value.clone(),
            Some(Proof {
                proofs: proofs.clone(),
                next_propose_hash: Some(hash_value(b"completely unrelated")),
            }),
        ));
        // The bundled hash does not match the proposed value: no vote.
        assert_eq!(network.broadcasts_of_kind("Weak"), 0);

        acceptor.process_message(ConsensusMessage::propose(
            1,
            0,
            1,
            value.clone(),
            Some(Proof {
                proofs,
                next_propose_hash: Some(hash_value(&value)),
            }),
        ));
        assert_eq!(network.broadcasts_of_kind("Weak"), 1);
    }

    #[test]
    fn votes_arriving_before_the_proposal_still_decide() {
        let (acceptor, _, app, _) = acceptor(4, 1);
        let value = b"batch".to_vec();
        let hash = hash_value(&value);

        for replica in 0..3 {
            acceptor.process_message(ConsensusMessage::strong(replica, 0, 0, hash));
        }
        assert!(app.lock().unwrap().decisions.is_empty());
        acceptor.process_message(ConsensusMessage::propose(0, 0, 0, value, None));
        assert_eq!(app.lock().unwrap().decisions.len(), 1);
    }

    #[test]
    fn decide_votes_let_a_laggard_catch_up() {
        let (acceptor, _, app, _) = acceptor(4, 1);
        let value = b"batch".to_vec();
        let hash = hash_value(&value);

        acceptor.process_message(ConsensusMessage::propose(0, 0, 0, value, None));
        for replica in 1..3 {
            acceptor.process_message(ConsensusMessage::decide(replica, 0, 0, hash));
        }
        // Two DECIDE votes exceed quorum_f = 1.
        assert_eq!(app.lock().unwrap().decisions.len(), 1);
    }
}
