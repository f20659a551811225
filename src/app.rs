/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait definitions for the external collaborators the consensus core is wired to: the delivery
//! layer above it and the state transfer mechanism beside it.

use crate::execution::Decision;
use crate::types::{ExecutionId, ReplicaId};

/// The delivery layer that consumes the totally-ordered sequence of decided values.
///
/// Implementors are expected to be *deterministic*: every replica must accept or reject the same
/// proposed value the same way, or correct replicas could be split by a Byzantine leader.
pub trait App: Send {
    /// Validate a value proposed for the given execution before any vote is cast on it.
    ///
    /// Returning `Some` admits the value; the deserialized form is returned for the layer's own
    /// use and is not inspected by the core. Returning `None` makes the proposal behave exactly
    /// like one that was never received; it is not an error.
    fn validate_proposed_value(&mut self, eid: ExecutionId, value: &[u8]) -> Option<Vec<u8>>;

    /// Called exactly once per execution id, when the instance decides.
    fn deliver_decision(&mut self, decision: Decision);
}

/// The out-of-band mechanism that fast-forwards a lagging replica past a gap the core cannot
/// bridge by replay alone.
///
/// The core requests transfers through this trait and receives the resulting snapshot through
/// [Replica::deliver_state](crate::replica::Replica::deliver_state).
pub trait StateTransfer: Send {
    /// Ask the collaborator to retrieve state from `peers`, triggered by a message for `eid`,
    /// which lies beyond the admission window.
    fn request_transfer(&mut self, me: ReplicaId, peers: &[ReplicaId], eid: ExecutionId);

    /// Whether a transfer is currently in flight. While true, the admission window is widened and
    /// no further transfer is requested.
    fn is_retrieving_state(&self) -> bool;
}
