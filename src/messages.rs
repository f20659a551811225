/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between replicas.
//!
//! Every message kind carries the common envelope `{sender, eid, round}`. The serialization
//! derived here fixes a schema, not a wire format: framing, authentication and encryption of the
//! bytes on the wire are the transport's concern.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::types::{CryptoHash, ExecutionId, Keypair, ReplicaId, RoundNumber, SignatureBytes};

/// The six protocol message kinds. Constructed through the methods on this type so that envelope
/// fields are filled in uniformly.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub enum ConsensusMessage {
    Propose(Propose),
    Weak(Vote),
    Strong(Vote),
    Decide(Vote),
    Freeze(Freeze),
    Collect(Collect),
}

impl ConsensusMessage {
    pub fn propose(
        sender: ReplicaId,
        eid: ExecutionId,
        round: RoundNumber,
        value: Vec<u8>,
        proof: Option<Proof>,
    ) -> ConsensusMessage {
        ConsensusMessage::Propose(Propose {
            sender,
            eid,
            round,
            value,
            proof,
        })
    }

    pub fn weak(
        sender: ReplicaId,
        eid: ExecutionId,
        round: RoundNumber,
        value_hash: CryptoHash,
    ) -> ConsensusMessage {
        ConsensusMessage::Weak(Vote {
            sender,
            eid,
            round,
            value_hash,
        })
    }

    pub fn strong(
        sender: ReplicaId,
        eid: ExecutionId,
        round: RoundNumber,
        value_hash: CryptoHash,
    ) -> ConsensusMessage {
        ConsensusMessage::Strong(Vote {
            sender,
            eid,
            round,
            value_hash,
        })
    }

    pub fn decide(
        sender: ReplicaId,
        eid: ExecutionId,
        round: RoundNumber,
        value_hash: CryptoHash,
    ) -> ConsensusMessage {
        ConsensusMessage::Decide(Vote {
            sender,
            eid,
            round,
            value_hash,
        })
    }

    pub fn freeze(sender: ReplicaId, eid: ExecutionId, round: RoundNumber) -> ConsensusMessage {
        ConsensusMessage::Freeze(Freeze { sender, eid, round })
    }

    pub fn collect(
        sender: ReplicaId,
        eid: ExecutionId,
        round: RoundNumber,
        proof: CollectProof,
    ) -> ConsensusMessage {
        ConsensusMessage::Collect(Collect {
            sender,
            eid,
            round,
            proof,
        })
    }

    pub fn sender(&self) -> ReplicaId {
        match self {
            ConsensusMessage::Propose(Propose { sender, .. }) => *sender,
            ConsensusMessage::Weak(Vote { sender, .. }) => *sender,
            ConsensusMessage::Strong(Vote { sender, .. }) => *sender,
            ConsensusMessage::Decide(Vote { sender, .. }) => *sender,
            ConsensusMessage::Freeze(Freeze { sender, .. }) => *sender,
            ConsensusMessage::Collect(Collect { sender, .. }) => *sender,
        }
    }

    pub fn eid(&self) -> ExecutionId {
        match self {
            ConsensusMessage::Propose(Propose { eid, .. }) => *eid,
            ConsensusMessage::Weak(Vote { eid, .. }) => *eid,
            ConsensusMessage::Strong(Vote { eid, .. }) => *eid,
            ConsensusMessage::Decide(Vote { eid, .. }) => *eid,
            ConsensusMessage::Freeze(Freeze { eid, .. }) => *eid,
            ConsensusMessage::Collect(Collect { eid, .. }) => *eid,
        }
    }

    pub fn round(&self) -> RoundNumber {
        match self {
            ConsensusMessage::Propose(Propose { round, .. }) => *round,
            ConsensusMessage::Weak(Vote { round, .. }) => *round,
            ConsensusMessage::Strong(Vote { round, .. }) => *round,
            ConsensusMessage::Decide(Vote { round, .. }) => *round,
            ConsensusMessage::Freeze(Freeze { round, .. }) => *round,
            ConsensusMessage::Collect(Collect { round, .. }) => *round,
        }
    }
}

/// A leader's proposal of a value for one round of one execution. `proof` is present only when the
/// proposal re-proposes a safe value after a freeze; recipients re-derive the safe value from it.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Propose {
    pub sender: ReplicaId,
    pub eid: ExecutionId,
    pub round: RoundNumber,
    pub value: Vec<u8>,
    pub proof: Option<Proof>,
}

/// A WEAK, STRONG, or DECIDE vote for the hash of a proposed value.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Vote {
    pub sender: ReplicaId,
    pub eid: ExecutionId,
    pub round: RoundNumber,
    pub value_hash: CryptoHash,
}

/// A declaration that the sender has given up on the identified round.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Freeze {
    pub sender: ReplicaId,
    pub eid: ExecutionId,
    pub round: RoundNumber,
}

/// A replica's contribution to leader change: its own signed freeze proof (and, when sent by the
/// prospective leader, the proofs it aggregated), addressed to the leader candidate named inside.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Collect {
    pub sender: ReplicaId,
    pub eid: ExecutionId,
    pub round: RoundNumber,
    pub proof: CollectProof,
}

/// The payload of a [Collect] message: the prospective leader and per-replica signed freeze
/// proofs, indexed by replica id. A slot is `None` for replicas whose proof the sender does not
/// hold.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct CollectProof {
    pub leader: ReplicaId,
    pub proofs: Vec<Option<SignedFreezeProof>>,
}

/// The justification attached to a post-freeze [Propose]: the raw signed freeze proofs the new
/// leader collected, plus the hash of the value it derived from them for the new round, so that
/// every replica can re-derive the safe value and cross-check both against what was proposed.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Proof {
    pub proofs: Vec<Option<SignedFreezeProof>>,
    pub next_propose_hash: Option<CryptoHash>,
}

/// A replica's record of its own vote state in a round it froze. Never mutated after signing.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FreezeProof {
    pub eid: ExecutionId,
    pub round: RoundNumber,
    pub weak_value_hash: Option<CryptoHash>,
    pub strong_value_hash: Option<CryptoHash>,
    pub leader: ReplicaId,
}

/// A [FreezeProof] together with its creator's signature over the proof's serialization: an
/// explicit `{payload, signature, signer}` triple so that verification is reproducible.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct SignedFreezeProof {
    pub proof: FreezeProof,
    pub signature: SignatureBytes,
    pub signer: ReplicaId,
}

impl SignedFreezeProof {
    pub(crate) fn sign(proof: FreezeProof, signer: ReplicaId, keypair: &Keypair) -> SignedFreezeProof {
        let signature = keypair.sign(&proof.try_to_vec().unwrap());
        SignedFreezeProof {
            proof,
            signature,
            signer,
        }
    }
}

impl SignedMessage for SignedFreezeProof {
    fn message_bytes(&self) -> Vec<u8> {
        self.proof.try_to_vec().unwrap()
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

/// A signed message must consist of:
/// 1. Message bytes [SignedMessage::message_bytes]: the values that the signature is over, and
/// 2. Signature bytes [SignedMessage::signature_bytes]: the signature in bytes.
/// Given the two values satisfying the above, and a public key of the signer,
/// the signature can be verified against the message.
pub(crate) trait SignedMessage {
    // The values contained in the message that should be signed (represented as a vector of bytes).
    fn message_bytes(&self) -> Vec<u8>;

    // The signature (in bytes) over the message bytes.
    fn signature_bytes(&self) -> SignatureBytes;

    // Verifies the correctness of the signature given the values that should be signed.
    fn is_correct(&self, pk: &VerifyingKey) -> bool {
        let signature = Signature::from_bytes(&self.signature_bytes());
        pk.verify(&self.message_bytes(), &signature).is_ok()
    }
}
