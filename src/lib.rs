/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of the Paxos-at-War Byzantine consensus algorithm, the agreement core of
//! a total-order multicast layer for state machine replication.
//!
//! A group of `n` replicas, up to `f` of which may be Byzantine (`n >= 3f + 1`), agrees on one
//! value per *execution*: a consensus instance identified by a monotonically increasing id.
//! Within an execution, agreement is attempted in numbered *rounds*. The happy path of a round is
//! a leader's PROPOSE followed by two all-to-all vote phases, WEAK and STRONG, with a fast path
//! that decides on WEAK votes alone when enough of them agree. A round that stalls is *frozen*:
//! the replicas that gave up on it sign statements of how they voted, and the next leader in
//! round-robin order aggregates these freeze proofs to compute the unique value it may safely
//! re-propose.
//!
//! ## Using this library
//!
//! Users provide three collaborators, implementing respectively [App](app::App) (validates
//! proposed values and consumes decisions), [Network](networking::Network) (moves messages
//! between replicas), and [StateTransfer](app::StateTransfer) (fast-forwards a replica that has
//! fallen too far behind), then describe the replica with a
//! [ReplicaSpec](replica::ReplicaSpec) and start it. The returned
//! [Replica](replica::Replica) is the handle for submitting values, querying leadership and
//! decisions, and completing state transfers.
//!
//! This library deliberately stops at agreement on opaque byte values. Client sessions, request
//! batching, and the replicated application itself live above the [App](app::App) seam;
//! snapshotting and snapshot shipping live behind the [StateTransfer](app::StateTransfer) seam.

pub mod app;

pub mod config;

pub mod events;

pub mod execution;

pub mod execution_manager;

pub mod leader;

pub mod logging;

pub mod messages;

pub mod networking;

pub mod proof_verifier;

pub mod replica;

pub mod types;

pub(crate) mod acceptor;

pub(crate) mod proposer;

pub(crate) mod timeouts;

pub(crate) mod event_bus;
pub use event_bus::HandlerPtr;

#[cfg(test)]
pub(crate) mod testing;
