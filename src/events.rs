/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of consensus events for event handling and logging.
//!
//! Events are an optional observability side-channel keyed by `(eid, round)`: protocol messages
//! carry no timestamps or latency fields themselves. An event for a given action indicates that
//! the action has been completed.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::{CryptoHash, ExecutionId, ReplicaId, RoundNumber};

pub enum Event {
    // Events that involve broadcasting/sending a protocol message.
    StartExecution(StartExecutionEvent),
    Propose(ProposeEvent),
    Vote(VoteEvent),
    Freeze(FreezeEvent),
    Collect(CollectEvent),
    // Events that involve receiving a protocol message.
    ReceiveProposal(ReceiveProposalEvent),
    ReceiveVote(ReceiveVoteEvent),
    ReceiveFreeze(ReceiveFreezeEvent),
    ReceiveCollect(ReceiveCollectEvent),
    // Progress and recovery events.
    Decide(DecideEvent),
    RequestStateTransfer(RequestStateTransferEvent),
    DeliverState(DeliverStateEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus outlives every publisher, so sending cannot fail.
            let _ = event_publisher.send(event);
        }
    }
}

/// The three vote-carrying message kinds, for events that report a vote.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VoteKind {
    Weak,
    Strong,
    Decide,
}

pub struct StartExecutionEvent {
    pub timestamp: SystemTime,
    pub eid: ExecutionId,
    pub value_hash: CryptoHash,
}

pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub eid: ExecutionId,
    pub round: RoundNumber,
    pub value_hash: CryptoHash,
}

pub struct VoteEvent {
    pub timestamp: SystemTime,
    pub kind: VoteKind,
    pub eid: ExecutionId,
    pub round: RoundNumber,
    pub value_hash: CryptoHash,
}

pub struct FreezeEvent {
    pub timestamp: SystemTime,
    pub eid: ExecutionId,
    pub round: RoundNumber,
}

pub struct CollectEvent {
    pub timestamp: SystemTime,
    pub eid: ExecutionId,
    pub round: RoundNumber,
    pub leader: ReplicaId,
}

pub struct ReceiveProposalEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaId,
    pub eid: ExecutionId,
    pub round: RoundNumber,
    pub value_hash: CryptoHash,
}

pub struct ReceiveVoteEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaId,
    pub kind: VoteKind,
    pub eid: ExecutionId,
    pub round: RoundNumber,
    pub value_hash: CryptoHash,
}

pub struct ReceiveFreezeEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaId,
    pub eid: ExecutionId,
    pub round: RoundNumber,
}

pub struct ReceiveCollectEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaId,
    pub eid: ExecutionId,
    pub round: RoundNumber,
    pub leader: ReplicaId,
}

pub struct DecideEvent {
    pub timestamp: SystemTime,
    pub eid: ExecutionId,
    pub round: RoundNumber,
    pub value_hash: CryptoHash,
}

pub struct RequestStateTransferEvent {
    pub timestamp: SystemTime,
    pub eid: ExecutionId,
}

pub struct DeliverStateEvent {
    pub timestamp: SystemTime,
    pub last_eid: ExecutionId,
}
