//! Proof bundle assembly and verification: a Merkle commitment over a
//! run's inputs, outputs, policy, and replay transcript.

use detcore_hash::{domains, Digest, HashEngine};
use detcore_merkle::{MerkleError, MerkleTree};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProofError {
    #[error("cannot build a proof bundle with no leaves")]
    EmptyBundle,
    #[error(transparent)]
    Merkle(#[from] MerkleError),
}

/// A detached signature over a bundle's Merkle root. This crate carries
/// the bytes only; it has no key material of its own, so checking them
/// is delegated to a caller-supplied [`SignatureVerifier`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub signer: String,
    pub bytes: Vec<u8>,
}

/// External collaborator that knows how to validate a detached signature
/// for a named signer. `message` is the bundle's Merkle root bytes.
pub trait SignatureVerifier {
    fn verify(&self, signer: &str, message: &[u8], signature: &[u8]) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofBundle {
    pub merkle_root: Digest,
    pub input_digests: Vec<Digest>,
    pub output_digests: Vec<Digest>,
    pub policy_digest: Digest,
    pub replay_transcript_digest: Digest,
    pub engine_version: String,
    pub contract_version: String,
    pub signature: Option<Signature>,
}

/// Groups leaves as (inputs, outputs, policy, transcript), preserving
/// submission order within each group — the normative pairing tie-break.
fn ordered_leaves(
    input_digests: &[Digest],
    output_digests: &[Digest],
    policy_digest: Digest,
    replay_transcript_digest: Digest,
) -> Vec<Digest> {
    let mut leaves = Vec::with_capacity(input_digests.len() + output_digests.len() + 2);
    leaves.extend_from_slice(input_digests);
    leaves.extend_from_slice(output_digests);
    leaves.push(policy_digest);
    leaves.push(replay_transcript_digest);
    leaves
}

pub struct BuildInput<'a> {
    pub input_digests: &'a [Digest],
    pub output_digests: &'a [Digest],
    pub policy_digest: Digest,
    pub replay_transcript_digest: Digest,
    pub engine_version: String,
    pub contract_version: String,
}

/// Build a [`ProofBundle`] whose `merkle_root` commits to the ordered
/// concatenation `inputs ∥ outputs ∥ policy ∥ transcript`, each leaf
/// hashed under the proof-bundle domain and odd groups duplicated.
pub fn build(input: BuildInput<'_>) -> Result<ProofBundle, ProofError> {
    let leaves = ordered_leaves(
        input.input_digests,
        input.output_digests,
        input.policy_digest,
        input.replay_transcript_digest,
    );
    if leaves.is_empty() {
        return Err(ProofError::EmptyBundle);
    }

    let engine = HashEngine::new();
    let leaf_hashes: Vec<Digest> = leaves
        .iter()
        .map(|d| engine.hash_domain(domains::PROOF_BUNDLE, d.as_bytes()))
        .collect();
    let tree = MerkleTree::from_leaves(leaf_hashes)?;

    Ok(ProofBundle {
        merkle_root: tree.root(),
        input_digests: input.input_digests.to_vec(),
        output_digests: input.output_digests.to_vec(),
        policy_digest: input.policy_digest,
        replay_transcript_digest: input.replay_transcript_digest,
        engine_version: input.engine_version,
        contract_version: input.contract_version,
        signature: None,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub ok: bool,
    pub reason: Option<String>,
}

/// Recompute the Merkle root from the bundle's stored leaves and compare
/// against `merkle_root`. A missing signature is reported in `reason` as
/// informational, never as a failure. If a signature is present, `verifier`
/// must be supplied and actually confirm it — a signed bundle checked
/// without a verifier does not pass silently.
pub fn verify(bundle: &ProofBundle, verifier: Option<&dyn SignatureVerifier>) -> VerifyOutcome {
    let leaves = ordered_leaves(
        &bundle.input_digests,
        &bundle.output_digests,
        bundle.policy_digest,
        bundle.replay_transcript_digest,
    );
    if leaves.is_empty() {
        return VerifyOutcome {
            ok: false,
            reason: Some("empty bundle".to_string()),
        };
    }

    let engine = HashEngine::new();
    let leaf_hashes: Vec<Digest> = leaves
        .iter()
        .map(|d| engine.hash_domain(domains::PROOF_BUNDLE, d.as_bytes()))
        .collect();

    let tree = match MerkleTree::from_leaves(leaf_hashes) {
        Ok(t) => t,
        Err(e) => {
            return VerifyOutcome {
                ok: false,
                reason: Some(e.to_string()),
            }
        }
    };

    if tree.root() != bundle.merkle_root {
        return VerifyOutcome {
            ok: false,
            reason: Some("merkle root mismatch".to_string()),
        };
    }

    match &bundle.signature {
        Some(sig) => match verifier {
            Some(v) => {
                if v.verify(&sig.signer, bundle.merkle_root.as_bytes(), &sig.bytes) {
                    VerifyOutcome {
                        ok: true,
                        reason: None,
                    }
                } else {
                    VerifyOutcome {
                        ok: false,
                        reason: Some("signature verification failed".to_string()),
                    }
                }
            }
            None => VerifyOutcome {
                ok: false,
                reason: Some("signature present but no verifier supplied".to_string()),
            },
        },
        None => VerifyOutcome {
            ok: true,
            reason: Some("unsigned".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(label: &str) -> Digest {
        HashEngine::new().hash(label.as_bytes())
    }

    fn sample_input() -> BuildInput<'static> {
        BuildInput {
            input_digests: &[],
            output_digests: &[],
            policy_digest: Digest::ZERO,
            replay_transcript_digest: Digest::ZERO,
            engine_version: "0.1.0".into(),
            contract_version: "1".into(),
        }
    }

    #[test]
    fn build_then_verify_round_trips() {
        let inputs = vec![digest("in1"), digest("in2")];
        let outputs = vec![digest("out1")];
        let bundle = build(BuildInput {
            input_digests: &inputs,
            output_digests: &outputs,
            policy_digest: digest("policy"),
            replay_transcript_digest: digest("transcript"),
            ..sample_input()
        })
        .unwrap();

        let outcome = verify(&bundle, None);
        assert!(outcome.ok);
        assert_eq!(outcome.reason, Some("unsigned".to_string()));
    }

    #[test]
    fn tampered_merkle_root_fails_verification() {
        let inputs = vec![digest("in1")];
        let mut bundle = build(BuildInput {
            input_digests: &inputs,
            ..sample_input()
        })
        .unwrap();
        bundle.merkle_root = digest("not the real root");
        let outcome = verify(&bundle, None);
        assert!(!outcome.ok);
        assert_eq!(outcome.reason, Some("merkle root mismatch".to_string()));
    }

    #[test]
    fn tampered_leaf_fails_verification() {
        let inputs = vec![digest("in1")];
        let mut bundle = build(BuildInput {
            input_digests: &inputs,
            ..sample_input()
        })
        .unwrap();
        bundle.input_digests[0] = digest("swapped");
        let outcome = verify(&bundle, None);
        assert!(!outcome.ok);
    }

    struct AcceptingVerifier;
    impl SignatureVerifier for AcceptingVerifier {
        fn verify(&self, _signer: &str, _message: &[u8], signature: &[u8]) -> bool {
            signature == [1, 2, 3]
        }
    }

    #[test]
    fn signed_bundle_with_matching_verifier_reports_no_reason() {
        let mut bundle = build(sample_input()).unwrap();
        bundle.signature = Some(Signature {
            signer: "test".into(),
            bytes: vec![1, 2, 3],
        });
        let outcome = verify(&bundle, Some(&AcceptingVerifier));
        assert!(outcome.ok);
        assert_eq!(outcome.reason, None);
    }

    #[test]
    fn signed_bundle_without_a_verifier_does_not_pass() {
        let mut bundle = build(sample_input()).unwrap();
        bundle.signature = Some(Signature {
            signer: "test".into(),
            bytes: vec![1, 2, 3],
        });
        let outcome = verify(&bundle, None);
        assert!(!outcome.ok);
        assert_eq!(
            outcome.reason,
            Some("signature present but no verifier supplied".to_string())
        );
    }

    #[test]
    fn signed_bundle_with_a_verifier_that_rejects_fails() {
        let mut bundle = build(sample_input()).unwrap();
        bundle.signature = Some(Signature {
            signer: "test".into(),
            bytes: vec![9, 9, 9],
        });
        let outcome = verify(&bundle, Some(&AcceptingVerifier));
        assert!(!outcome.ok);
        assert_eq!(
            outcome.reason,
            Some("signature verification failed".to_string())
        );
    }

    #[test]
    fn group_order_affects_root() {
        let a = digest("a");
        let b = digest("b");

        let bundle_inputs_first = build(BuildInput {
            input_digests: &[a],
            output_digests: &[b],
            ..sample_input()
        })
        .unwrap();

        let bundle_swapped = build(BuildInput {
            input_digests: &[b],
            output_digests: &[a],
            ..sample_input()
        })
        .unwrap();

        assert_ne!(bundle_inputs_first.merkle_root, bundle_swapped.merkle_root);
    }

    #[test]
    fn minimal_bundle_with_only_policy_and_transcript_builds() {
        let bundle = build(sample_input()).unwrap();
        assert!(verify(&bundle, None).ok);
    }
}
