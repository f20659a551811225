/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The proposing half of the protocol: starting fresh executions when this replica leads them,
//! and taking over frozen ones when the freeze proofs elect this replica as the new leader.
//!
//! A takeover proposal is never free-form. The new leader aggregates the signed freeze proofs it
//! received in COLLECT messages, and may only propose once more than `quorum_strong` of them are
//! valid. The value it proposes is the safe value those proofs determine; the proofs travel with
//! the proposal, together with the hash the leader derived from them, so every replica re-derives
//! the same conclusion and checks it against both the bundled hash and the proposed value.

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::CoreConfig;
use crate::events::{Event, ProposeEvent, ReceiveCollectEvent, StartExecutionEvent};
use crate::execution_manager::ExecutionManager;
use crate::leader::LeaderModule;
use crate::messages::{Collect, ConsensusMessage, Proof};
use crate::networking::{Network, SenderHandle};
use crate::proof_verifier::{ProofVerifier, SafeValue};
use crate::timeouts::Watchdog;
use crate::types::{hash_value, ExecutionId, ReplicaId};

pub(crate) struct Proposer<N: Network> {
    config: Arc<CoreConfig>,
    manager: Arc<ExecutionManager>,
    leader_module: Arc<LeaderModule>,
    proof_verifier: ProofVerifier,
    sender: Arc<SenderHandle<N>>,
    watchdog: Watchdog,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network> Proposer<N> {
    pub(crate) fn new(
        config: Arc<CoreConfig>,
        manager: Arc<ExecutionManager>,
        leader_module: Arc<LeaderModule>,
        sender: Arc<SenderHandle<N>>,
        watchdog: Watchdog,
        event_publisher: Option<Sender<Event>>,
    ) -> Proposer<N> {
        let proof_verifier = ProofVerifier::new(config.clone());
        Proposer {
            config,
            manager,
            leader_module,
            proof_verifier,
            sender,
            watchdog,
            event_publisher,
        }
    }

    /// Propose `value` for the next execution, if this replica leads it and no other instance is
    /// in execution. Returns the execution id the value was proposed for.
    ///
    /// The proposal is broadcast to the whole group, this replica included; its own vote on it
    /// follows the same path as everyone else's.
    pub(crate) fn start_execution(&self, value: Vec<u8>) -> Option<ExecutionId> {
        let me = self.config.me;
        let eid = self.manager.try_start_execution()?;
        if self.leader_module.get_leader(eid, 0) != me {
            self.manager.abort_execution(eid);
            return None;
        }
        let value_hash = hash_value(&value);
        Event::publish(
            &self.event_publisher,
            Event::StartExecution(StartExecutionEvent {
                timestamp: SystemTime::now(),
                eid,
                value_hash,
            }),
        );
        self.watchdog.watch(eid);
        self.sender
            .broadcast(ConsensusMessage::propose(me, eid, 0, value, None));
        Event::publish(
            &self.event_publisher,
            Event::Propose(ProposeEvent {
                timestamp: SystemTime::now(),
                eid,
                round: 0,
                value_hash,
            }),
        );
        Some(eid)
    }

    /// Process a COLLECT message addressed to this replica as the prospective leader of the round
    /// after the frozen one. Invalid proofs are dropped individually; once the aggregated proofs
    /// both elect this replica and number more than `quorum_strong`, the safe value is re-proposed.
    pub(crate) fn collect_received(&self, collect: Collect) {
        Event::publish(
            &self.event_publisher,
            Event::ReceiveCollect(ReceiveCollectEvent {
                timestamp: SystemTime::now(),
                origin: collect.sender,
                eid: collect.eid,
                round: collect.round,
                leader: collect.proof.leader,
            }),
        );

        let me = self.config.me;
        if collect.proof.leader != me {
            return;
        }
        let frozen_round = collect.round;
        let next_round = frozen_round + 1;

        let execution = self.manager.get_execution(collect.eid);
        let mut state = execution.lock();
        if state.decision().is_some() || next_round < state.current_round() {
            return;
        }

        let valid = self
            .proof_verifier
            .valid_proofs(collect.eid, frozen_round, &collect.proof.proofs);
        let round = state.round_mut(frozen_round);
        for (pos, slot) in valid.into_iter().enumerate() {
            if let Some(signed) = slot {
                round.register_collect_proof(pos as ReplicaId, signed);
            }
        }
        let proofs = round.collect_proofs().clone();
        if !self.proof_verifier.is_the_leader(&proofs, me)
            || !self.proof_verifier.enough_proofs(&proofs)
        {
            return;
        }
        if state.round_mut(next_round).sent_propose() {
            return;
        }

        let value = match self.proof_verifier.good_value(&proofs) {
            SafeValue::Only(hash) => match state.value_with_hash(&hash) {
                Some(value) => value,
                // The safe value's preimage never reached this replica; it cannot propose.
                None => return,
            },
            SafeValue::Any => {
                match state
                    .round(frozen_round)
                    .and_then(|round| round.proposed_value().cloned())
                {
                    Some(value) => value,
                    None => return,
                }
            }
            SafeValue::Unknown => return,
        };
        let value_hash = hash_value(&value);
        state.round_mut(next_round).mark_sent_propose();
        state.advance_round(next_round);
        drop(state);

        self.watchdog.watch(collect.eid);
        self.sender.broadcast(ConsensusMessage::propose(
            me,
            collect.eid,
            next_round,
            value,
            Some(Proof {
                proofs,
                next_propose_hash: Some(value_hash),
            }),
        ));
        Event::publish(
            &self.event_publisher,
            Event::Propose(ProposeEvent {
                timestamp: SystemTime::now(),
                eid: collect.eid,
                round: next_round,
                value_hash,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CollectProof, FreezeProof, SignedFreezeProof};
    use crate::testing::{self, NullStateTransfer, RecordingNetwork};
    use crate::types::{CryptoHash, Keypair, RoundNumber, SigningKey};
    use std::time::Duration;

    fn proposer(
        n: usize,
        f: u32,
    ) -> (
        Proposer<RecordingNetwork>,
        Arc<ExecutionManager>,
        RecordingNetwork,
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
        let proposer = Proposer::new(
            config,
            manager.clone(),
            leader_module,
            sender,
            Watchdog::new(Duration::from_secs(60)),
            None,
        );
        (proposer, manager, network, keypairs)
    }

    fn collect_from(
        keypairs: &[SigningKey],
        sender: ReplicaId,
        eid: ExecutionId,
        frozen_round: RoundNumber,
        weak: Option<CryptoHash>,
        strong: Option<CryptoHash>,
        leader: ReplicaId,
        n: usize,
    ) -> Collect {
        let proof = FreezeProof {
            eid,
            round: frozen_round,
            weak_value_hash: weak,
            strong_value_hash: strong,
            leader,
        };
        let signed =
            SignedFreezeProof::sign(proof, sender, &Keypair::new(keypairs[sender as usize].clone()));
        let mut proofs = vec![None; n];
        proofs[sender as usize] = Some(signed);
        Collect {
            sender,
            eid,
            round: frozen_round,
            proof: CollectProof { leader, proofs },
        }
    }

    #[test]
    fn the_leader_of_the_next_execution_can_start_it() {
        let (proposer, manager, network, _) = proposer(4, 1);
        // With no history, replica 0 (this replica) leads execution 0.
        assert_eq!(proposer.start_execution(b"batch".to_vec()), Some(0));
        assert_eq!(network.broadcasts_of_kind("Propose"), 1);

        // A second value cannot start while execution 0 is in flight.
        assert_eq!(proposer.start_execution(b"another".to_vec()), None);
        manager.decided(0);
        // Execution 1 inherits no decided leader record here, so replica 0 still leads it.
        assert_eq!(proposer.start_execution(b"another".to_vec()), Some(1));
    }

    #[test]
    fn enough_valid_proofs_make_the_new_leader_repropose() {
        let (proposer, manager, network, keypairs) = proposer(4, 1);
        let value = b"batch".to_vec();
        let hash = hash_value(&value);
        // Round 3 of execution 0 froze; its proposal is known locally, and this replica (id 0)
        // leads round 4.
        manager
            .get_execution(0)
            .lock()
            .round_mut(3)
            .set_proposed_value(value, hash);

        for sender in [1, 2] {
            proposer.collect_received(collect_from(
                &keypairs,
                sender,
                0,
                3,
                Some(hash),
                Some(hash),
                0,
                4,
            ));
        }
        // Two proofs do not exceed quorum_strong = 2.
        assert_eq!(network.broadcasts_of_kind("Propose"), 0);

        proposer.collect_received(collect_from(
            &keypairs,
            3,
            0,
            3,
            Some(hash),
            None,
            0,
            4,
        ));
        assert_eq!(network.broadcasts_of_kind("Propose"), 1);

        // A late fourth proof does not re-propose.
        proposer.collect_received(collect_from(&keypairs, 1, 0, 3, Some(hash), None, 0, 4));
        assert_eq!(network.broadcasts_of_kind("Propose"), 1);
    }

    #[test]
    fn collects_electing_someone_else_are_ignored() {
        let (proposer, _, network, keypairs) = proposer(4, 1);
        let hash = hash_value(b"batch");
        for sender in [1, 2, 3] {
            proposer.collect_received(collect_from(
                &keypairs,
                sender,
                0,
                3,
                Some(hash),
                Some(hash),
                2,
                4,
            ));
        }
        assert_eq!(network.broadcasts_of_kind("Propose"), 0);
    }
}
