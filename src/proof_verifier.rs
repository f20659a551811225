/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Validation of signed freeze proofs and computation of the unique value that may legally be
//! re-proposed after a round freeze.
//!
//! The safe value is derived from two sets over the collected proofs:
//! - `Poss`: hashes that *possibly* decided in the frozen round, i.e. those appearing as the weak
//!   vote of more than `quorum_strong` proofs, or as the strong vote of more than `quorum_f`
//!   proofs.
//! - `Acc`: hashes that are *acceptable*, i.e. those appearing as the weak vote of more than
//!   `quorum_f` proofs.
//!
//! If `Poss` is empty, nothing can have decided and any value is safe. Otherwise only a value in
//! both sets is safe: a value that some correct replica may already have decided cannot be
//! silently overwritten. Candidates are examined in sorted hash order, so the result does not
//! depend on the order in which proofs arrived.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::CoreConfig;
use crate::messages::{SignedFreezeProof, SignedMessage};
use crate::types::{CryptoHash, ExecutionId, ReplicaId, RoundNumber};

/// What the collected freeze proofs say may be re-proposed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SafeValue {
    /// Nothing can have decided in the frozen round; any value is safe.
    Any,
    /// Only the value with this hash is safe.
    Only(CryptoHash),
    /// The proofs admit a possibly-decided value, but none is acceptable; no safe re-proposal can
    /// be derived from this set.
    Unknown,
}

pub struct ProofVerifier {
    config: Arc<CoreConfig>,
}

impl ProofVerifier {
    pub(crate) fn new(config: Arc<CoreConfig>) -> ProofVerifier {
        ProofVerifier { config }
    }

    /// Whether one signed proof is acceptable evidence about the given frozen round: it must match
    /// the round exactly, claim the replica slot it sits in, and carry that replica's signature.
    //
    // TODO: revisit whether proofs from earlier rounds of the same execution should be admitted
    // here (`proof.round <= round`); strict equality is what ships today.
    pub fn valid_proof(
        &self,
        eid: ExecutionId,
        round: RoundNumber,
        claimed_signer: ReplicaId,
        signed: &SignedFreezeProof,
    ) -> bool {
        if signed.signer != claimed_signer {
            return false;
        }
        if signed.proof.eid != eid || signed.proof.round != round {
            return false;
        }
        match self.config.replicas.get(signed.signer) {
            Some(pk) => signed.is_correct(pk),
            None => false,
        }
    }

    /// Filter a per-replica proof array down to the entries that are valid for the given frozen
    /// round. An invalid signature or a mismatched `(eid, round)` discards only that entry.
    pub fn valid_proofs(
        &self,
        eid: ExecutionId,
        round: RoundNumber,
        proofs: &[Option<SignedFreezeProof>],
    ) -> Vec<Option<SignedFreezeProof>> {
        let mut valid = vec![None; self.config.n()];
        for (pos, slot) in proofs.iter().enumerate().take(self.config.n()) {
            if let Some(signed) = slot {
                if self.valid_proof(eid, round, pos as ReplicaId, signed) {
                    valid[pos] = Some(signed.clone());
                }
            }
        }
        valid
    }

    /// Whether more than `quorum_f` of the proofs name `candidate` as the leader to take over.
    pub fn is_the_leader(&self, proofs: &[Option<SignedFreezeProof>], candidate: ReplicaId) -> bool {
        let count = proofs
            .iter()
            .flatten()
            .filter(|signed| signed.proof.leader == candidate)
            .count();
        count > self.config.quorum_f()
    }

    /// Whether enough proofs were collected for a new leader to propose: more than `quorum_strong`.
    pub fn enough_proofs(&self, proofs: &[Option<SignedFreezeProof>]) -> bool {
        proofs.iter().flatten().count() > self.config.quorum_strong()
    }

    pub fn count_weaks(proofs: &[Option<SignedFreezeProof>], hash: &CryptoHash) -> usize {
        proofs
            .iter()
            .flatten()
            .filter(|signed| signed.proof.weak_value_hash.as_ref() == Some(hash))
            .count()
    }

    pub fn count_strongs(proofs: &[Option<SignedFreezeProof>], hash: &CryptoHash) -> usize {
        proofs
            .iter()
            .flatten()
            .filter(|signed| signed.proof.strong_value_hash.as_ref() == Some(hash))
            .count()
    }

    /// Compute the safe value from a set of (already validated) proofs. Deterministic: the result
    /// is a pure function of the set, independent of iteration order.
    pub fn good_value(&self, proofs: &[Option<SignedFreezeProof>]) -> SafeValue {
        let candidates: BTreeSet<CryptoHash> = proofs
            .iter()
            .flatten()
            .flat_map(|signed| {
                signed
                    .proof
                    .weak_value_hash
                    .into_iter()
                    .chain(signed.proof.strong_value_hash)
            })
            .collect();

        let in_poss = |hash: &CryptoHash| {
            Self::count_weaks(proofs, hash) > self.config.quorum_strong()
                || Self::count_strongs(proofs, hash) > self.config.quorum_f()
        };
        let in_acc =
            |hash: &CryptoHash| Self::count_weaks(proofs, hash) > self.config.quorum_f();

        if !candidates.iter().any(in_poss) {
            return SafeValue::Any;
        }
        match candidates.iter().find(|hash| in_acc(hash) && in_poss(hash)) {
            Some(hash) => SafeValue::Only(*hash),
            None => SafeValue::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::FreezeProof;
    use crate::testing;
    use crate::types::hash_value;

    fn proof_for(
        keypairs: &[crate::types::SigningKey],
        signer: ReplicaId,
        eid: ExecutionId,
        round: RoundNumber,
        weak: Option<CryptoHash>,
        strong: Option<CryptoHash>,
        leader: ReplicaId,
    ) -> SignedFreezeProof {
        let proof = FreezeProof {
            eid,
            round,
            weak_value_hash: weak,
            strong_value_hash: strong,
            leader,
        };
        SignedFreezeProof::sign(
            proof,
            signer,
            &crate::types::Keypair::new(keypairs[signer as usize].clone()),
        )
    }

    #[test]
    fn mismatched_round_discards_only_that_proof() {
        let (keypairs, config) = testing::core_config(4, 1);
        let verifier = ProofVerifier::new(config);
        let v = hash_value(b"v");
        let mut proofs = vec![None; 4];
        proofs[0] = Some(proof_for(&keypairs, 0, 5, 0, Some(v), None, 1));
        proofs[1] = Some(proof_for(&keypairs, 1, 5, 3, Some(v), None, 1)); // wrong round
        proofs[2] = Some(proof_for(&keypairs, 2, 5, 0, Some(v), None, 1));
        let valid = verifier.valid_proofs(5, 0, &proofs);
        assert!(valid[0].is_some());
        assert!(valid[1].is_none());
        assert!(valid[2].is_some());
    }

    #[test]
    fn forged_signature_is_rejected() {
        let (keypairs, config) = testing::core_config(4, 1);
        let verifier = ProofVerifier::new(config);
        let mut forged = proof_for(&keypairs, 0, 5, 0, Some(hash_value(b"v")), None, 1);
        // Replica 3 tries to pass off replica 0's proof as its own.
        forged.signer = 3;
        assert!(!verifier.valid_proof(5, 0, 3, &forged));
    }

    #[test]
    fn leadership_needs_more_than_quorum_f_proofs() {
        let (keypairs, config) = testing::core_config(4, 1);
        let verifier = ProofVerifier::new(config);
        let mut proofs: Vec<Option<SignedFreezeProof>> = vec![None; 4];
        proofs[0] = Some(proof_for(&keypairs, 0, 5, 0, None, None, 1));
        assert!(!verifier.is_the_leader(&proofs, 1));
        proofs[2] = Some(proof_for(&keypairs, 2, 5, 0, None, None, 1));
        assert!(verifier.is_the_leader(&proofs, 1));
    }

    #[test]
    fn empty_poss_makes_any_value_safe() {
        let (keypairs, config) = testing::core_config(4, 1);
        let verifier = ProofVerifier::new(config);
        let v = hash_value(b"v");
        // Two weak votes: enough for Acc (> 1) but not Poss (needs > 2 weaks or > 1 strongs).
        let mut proofs = vec![None; 4];
        proofs[0] = Some(proof_for(&keypairs, 0, 5, 0, Some(v), None, 1));
        proofs[1] = Some(proof_for(&keypairs, 1, 5, 0, Some(v), None, 1));
        proofs[2] = Some(proof_for(&keypairs, 2, 5, 0, None, None, 1));
        assert_eq!(verifier.good_value(&proofs), SafeValue::Any);
    }

    #[test]
    fn possibly_decided_value_is_the_only_safe_value() {
        let (keypairs, config) = testing::core_config(4, 1);
        let verifier = ProofVerifier::new(config);
        let v = hash_value(b"v");
        let mut proofs = vec![None; 4];
        proofs[0] = Some(proof_for(&keypairs, 0, 5, 0, Some(v), Some(v), 1));
        proofs[1] = Some(proof_for(&keypairs, 1, 5, 0, Some(v), Some(v), 1));
        proofs[2] = Some(proof_for(&keypairs, 2, 5, 0, Some(v), None, 1));
        // v has 3 weaks (> quorum_strong = 2) so it is in Poss, and in Acc (> quorum_f = 1).
        assert_eq!(verifier.good_value(&proofs), SafeValue::Only(v));
    }

    #[test]
    fn good_value_is_independent_of_proof_order() {
        let (keypairs, config) = testing::core_config(4, 1);
        let verifier = ProofVerifier::new(config);
        let v = hash_value(b"v");
        let w = hash_value(b"w");
        let entries = [
            (0, Some(v), Some(v)),
            (1, Some(v), None),
            (2, Some(v), None),
            (3, Some(w), None),
        ];
        let mut forward: Vec<Option<SignedFreezeProof>> = vec![None; 4];
        let mut backward: Vec<Option<SignedFreezeProof>> = vec![None; 4];
        for (signer, weak, strong) in entries {
            let signed = proof_for(&keypairs, signer, 5, 0, weak, strong, 1);
            forward[signer as usize] = Some(signed.clone());
            backward[signer as usize] = Some(signed);
        }
        backward.reverse();
        // The backward vector is not slot-consistent, but good_value only reads the entries.
        assert_eq!(verifier.good_value(&forward), verifier.good_value(&backward));
        assert_eq!(verifier.good_value(&forward), SafeValue::Only(v));
    }
}
