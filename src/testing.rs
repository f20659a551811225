/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Shared scaffolding for the unit tests: a canned group configuration and inert stand-ins for
//! the user-provided collaborators.

use std::sync::{Arc, Mutex};

use rand_core::OsRng;

use crate::app::{App, StateTransfer};
use crate::config::{Configuration, CoreConfig};
use crate::execution::Decision;
use crate::messages::ConsensusMessage;
use crate::networking::Network;
use crate::types::{ExecutionId, ReplicaId, ReplicaSet, SigningKey, VerifyingKey};

/// A validated configuration for a group of `n` replicas tolerating `f` faults, from this
/// replica's perspective as replica 0. Returns all of the group's keypairs so tests can sign as
/// any member.
pub(crate) fn core_config(n: usize, f: u32) -> (Vec<SigningKey>, Arc<CoreConfig>) {
    let mut csprg = OsRng {};
    let keypairs: Vec<SigningKey> = (0..n).map(|_| SigningKey::generate(&mut csprg)).collect();
    let replicas = ReplicaSet::new(keypairs.iter().map(|kp| kp.verifying_key()).collect());
    let config = Configuration::builder()
        .me(keypairs[0].clone())
        .replicas(replicas)
        .f(f)
        .paxos_high_mark(100)
        .revival_high_mark(10_000)
        .request_timeout(std::time::Duration::from_secs(2))
        .log_events(false)
        .build()
        .into_core()
        .expect("the test configuration is valid");
    (keypairs, Arc::new(config))
}

fn kind(msg: &ConsensusMessage) -> &'static str {
    match msg {
        ConsensusMessage::Propose(_) => "Propose",
        ConsensusMessage::Weak(_) => "Weak",
        ConsensusMessage::Strong(_) => "Strong",
        ConsensusMessage::Decide(_) => "Decide",
        ConsensusMessage::Freeze(_) => "Freeze",
        ConsensusMessage::Collect(_) => "Collect",
    }
}

/// A [Network] that records what was sent and never receives anything.
#[derive(Clone)]
pub(crate) struct RecordingNetwork {
    broadcasts: Arc<Mutex<Vec<ConsensusMessage>>>,
    sends: Arc<Mutex<Vec<(VerifyingKey, ConsensusMessage)>>>,
}

impl RecordingNetwork {
    pub(crate) fn new() -> RecordingNetwork {
        RecordingNetwork {
            broadcasts: Arc::new(Mutex::new(Vec::new())),
            sends: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn broadcasts_of_kind(&self, wanted: &str) -> usize {
        self.broadcasts
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| kind(msg) == wanted)
            .count()
    }

    pub(crate) fn sends_of_kind(&self, wanted: &str) -> usize {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, msg)| kind(msg) == wanted)
            .count()
    }
}

impl Network for RecordingNetwork {
    fn init_replica_set(&mut self, _replicas: ReplicaSet) {}

    fn broadcast(&mut self, message: ConsensusMessage) {
        self.broadcasts.lock().unwrap().push(message);
    }

    fn send(&mut self, peer: VerifyingKey, message: ConsensusMessage) {
        self.sends.lock().unwrap().push((peer, message));
    }

    fn recv(&mut self) -> Option<(VerifyingKey, ConsensusMessage)> {
        None
    }
}

/// An [App] that admits every value and records the decisions it is handed.
pub(crate) struct RecordingApp {
    pub(crate) decisions: Vec<Decision>,
}

impl RecordingApp {
    pub(crate) fn new() -> RecordingApp {
        RecordingApp {
            decisions: Vec::new(),
        }
    }
}

impl App for RecordingApp {
    fn validate_proposed_value(&mut self, _eid: ExecutionId, value: &[u8]) -> Option<Vec<u8>> {
        Some(value.to_vec())
    }

    fn deliver_decision(&mut self, decision: Decision) {
        self.decisions.push(decision);
    }
}

/// A [StateTransfer] that never retrieves anything.
pub(crate) struct NullStateTransfer;

impl StateTransfer for NullStateTransfer {
    fn request_transfer(&mut self, _me: ReplicaId, _peers: &[ReplicaId], _eid: ExecutionId) {}

    fn is_retrieving_state(&self) -> bool {
        false
    }
}
