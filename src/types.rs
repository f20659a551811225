/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for 'inert' types, i.e., those that are sent around and inspected, but have no active behavior.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::Signer;
use rand::seq::SliceRandom;
use sha2::Digest;

pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
pub use sha2::Sha256 as CryptoHasher;

/// Identifier of a consensus instance: the sequence number being agreed upon. Monotonically assigned.
pub type ExecutionId = u64;

/// One attempt, within an execution, to reach agreement. Rounds increase monotonically within an
/// execution after a freeze.
pub type RoundNumber = u32;

/// Position of a replica in the group's [ReplicaSet]. Replica ids are dense: `0..n`.
pub type ReplicaId = u32;

pub type CryptoHash = [u8; 32];
pub type SignatureBytes = [u8; 64];

/// Compute the hash under which a proposed value is voted on.
pub fn hash_value(value: &[u8]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update(value);
    hasher.finalize().into()
}

/// Identities of the replicas in the group, in a fixed order agreed upon out-of-band.
///
/// The position of a replica's public key in this order is its [ReplicaId], which is what protocol
/// messages carry on the wire. The set is immutable for the lifetime of a deployment;
/// reconfiguration is an external concern.
#[derive(Clone)]
pub struct ReplicaSet {
    replicas: Vec<VerifyingKey>,
}

impl ReplicaSet {
    pub fn new(replicas: Vec<VerifyingKey>) -> ReplicaSet {
        Self { replicas }
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn get(&self, replica: ReplicaId) -> Option<&VerifyingKey> {
        self.replicas.get(replica as usize)
    }

    pub fn contains(&self, key: &VerifyingKey) -> bool {
        self.replicas.contains(key)
    }

    pub fn position(&self, key: &VerifyingKey) -> Option<ReplicaId> {
        self.replicas
            .iter()
            .position(|k| k == key)
            .map(|pos| pos as ReplicaId)
    }

    /// Get an iterator through replica ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = ReplicaId> {
        0..self.replicas.len() as ReplicaId
    }

    /// Get an iterator through the replicas' public keys in id order.
    pub fn keys(&self) -> std::slice::Iter<VerifyingKey> {
        self.replicas.iter()
    }

    /// Get all replica ids in uniformly random order, e.g. for choosing which peers to try first
    /// when retrieving state, so the load does not always land on the same replica.
    pub fn shuffled_ids(&self) -> Vec<ReplicaId> {
        let mut ids: Vec<ReplicaId> = self.ids().collect();
        ids.shuffle(&mut rand::thread_rng());
        ids
    }
}

/// A wrapper around [SigningKey](ed25519_dalek::SigningKey) which implements a convenience method
/// for creating signatures.
#[derive(Clone)]
pub(crate) struct Keypair(pub(crate) SigningKey);

impl Keypair {
    pub(crate) fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Convenience method for creating signatures over values or messages represented as vectors of bytes.
    pub(crate) fn sign(&self, message: &[u8]) -> SignatureBytes {
        self.0.sign(message).to_bytes()
    }

    pub(crate) fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }
}

/// Snapshot handed to the core by the state transfer collaborator to fast-forward this replica past
/// a gap it cannot bridge by replay alone.
///
/// The core only reads the checkpoint fields, to seed leader history and to learn which executions
/// are now settled. The batch metadata is carried for the delivery layer and is opaque here.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct TransferableState {
    pub last_checkpoint_eid: ExecutionId,
    pub last_checkpoint_round: RoundNumber,
    pub last_checkpoint_leader: ReplicaId,
    pub last_eid: ExecutionId,
    pub batch_metadata: Vec<(ExecutionId, Vec<u8>)>,
}
