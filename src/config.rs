/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! User-provided configuration of a replica, and the quorum thresholds derived from it.
//!
//! A deployment of `n` replicas tolerates up to `f` Byzantine members only if `n >= 3f + 1`; a
//! configuration violating this is rejected when the replica is started, never discovered at
//! runtime. The four derived thresholds gate the phase transitions of every round:
//! - `quorum_f = f`: leadership evidence and catch-up decisions.
//! - `quorum_strong = (n + f) / 2`: WEAK votes needed before broadcasting STRONG.
//! - `quorum_2f = 2f`: STRONG votes needed to decide.
//! - `quorum_fast_decide = (n + 3f) / 2`: WEAK votes needed to decide in a single round trip.
//!
//! All thresholds are compared strictly (`count > threshold`).

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::types::{ExecutionId, Keypair, ReplicaId, ReplicaSet, SigningKey};

/// Stores the user-defined parameters required to start a replica.
///
/// Constructed with the builder pattern:
///
/// ```ignore
/// let configuration = Configuration::builder()
///     .me(signing_key)
///     .replicas(replica_set)
///     .f(1)
///     .paxos_high_mark(100)
///     .revival_high_mark(10_000)
///     .request_timeout(Duration::from_secs(2))
///     .log_events(true)
///     .build();
/// ```
#[derive(TypedBuilder)]
pub struct Configuration {
    #[builder(setter(doc = "Set the replica's keypair, used to sign freeze proofs. Required."))]
    pub me: SigningKey,
    #[builder(setter(doc = "Set the ordered set of replica public keys. The keypair set with `me` must appear in it. Required."))]
    pub replicas: ReplicaSet,
    #[builder(setter(doc = "Set the maximum number of Byzantine replicas tolerated. The replica set must have at least `3f + 1` members. Required."))]
    pub f: u32,
    #[builder(setter(doc = "Set the width of the window of processable execution ids beyond the last executed one. Required."))]
    pub paxos_high_mark: ExecutionId,
    #[builder(setter(doc = "Set the widened window width used while the replica is retrieving state. Required."))]
    pub revival_high_mark: ExecutionId,
    #[builder(setter(doc = "Set the time a watched request may stay undecided before the replica freezes the round in progress. Required."))]
    pub request_timeout: Duration,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

impl Configuration {
    /// Validate the configuration and derive the internal form shared by the protocol components.
    ///
    /// Fails if the deployment cannot be a valid BFT group: fewer than `3f + 1` replicas, a keypair
    /// that is not a group member, or a zero-width admission window.
    pub(crate) fn into_core(self) -> Result<CoreConfig, ConfigurationError> {
        let n = self.replicas.len();
        if n < 3 * self.f as usize + 1 {
            return Err(ConfigurationError::TooFewReplicas { n, f: self.f });
        }
        if self.paxos_high_mark == 0 || self.revival_high_mark < self.paxos_high_mark {
            return Err(ConfigurationError::InvalidHighMarks {
                paxos_high_mark: self.paxos_high_mark,
                revival_high_mark: self.revival_high_mark,
            });
        }
        let keypair = Keypair::new(self.me);
        let me = self
            .replicas
            .position(&keypair.public())
            .ok_or(ConfigurationError::KeypairNotInReplicaSet)?;
        Ok(CoreConfig {
            me,
            keypair,
            replicas: self.replicas,
            f: self.f,
            paxos_high_mark: self.paxos_high_mark,
            revival_high_mark: self.revival_high_mark,
            request_timeout: self.request_timeout,
            log_events: self.log_events,
        })
    }
}

/// The reasons a [Configuration] can be rejected at startup.
#[derive(Debug)]
pub enum ConfigurationError {
    TooFewReplicas { n: usize, f: u32 },
    KeypairNotInReplicaSet,
    InvalidHighMarks {
        paxos_high_mark: ExecutionId,
        revival_high_mark: ExecutionId,
    },
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConfigurationError::TooFewReplicas { n, f } => write!(
                formatter,
                "a group of {} replicas cannot tolerate f = {} Byzantine members: at least 3f + 1 are required",
                n, f
            ),
            ConfigurationError::KeypairNotInReplicaSet => {
                write!(formatter, "the configured keypair is not a member of the replica set")
            }
            ConfigurationError::InvalidHighMarks {
                paxos_high_mark,
                revival_high_mark,
            } => write!(
                formatter,
                "invalid admission window: paxos_high_mark = {}, revival_high_mark = {}",
                paxos_high_mark, revival_high_mark
            ),
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// Validated configuration in the form the protocol components share.
pub(crate) struct CoreConfig {
    pub(crate) me: ReplicaId,
    pub(crate) keypair: Keypair,
    pub(crate) replicas: ReplicaSet,
    pub(crate) f: u32,
    pub(crate) paxos_high_mark: ExecutionId,
    pub(crate) revival_high_mark: ExecutionId,
    pub(crate) request_timeout: Duration,
    pub(crate) log_events: bool,
}

impl CoreConfig {
    pub(crate) fn n(&self) -> usize {
        self.replicas.len()
    }

    pub(crate) fn quorum_f(&self) -> usize {
        self.f as usize
    }

    pub(crate) fn quorum_strong(&self) -> usize {
        (self.n() + self.f as usize) / 2
    }

    pub(crate) fn quorum_2f(&self) -> usize {
        2 * self.f as usize
    }

    pub(crate) fn quorum_fast_decide(&self) -> usize {
        (self.n() + 3 * self.f as usize) / 2
    }
}
