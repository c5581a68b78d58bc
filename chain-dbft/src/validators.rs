//! Validator committee and quorum arithmetic

use crate::{ConsensusError, ConsensusResult};
use chain_core::{multisig_address, Address, BlockIndex, PublicKey};
use std::collections::HashSet;

/// Maximum number of Byzantine validators a committee of `n` tolerates
pub fn max_faulty(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// Signatures needed for agreement in a committee of `n`
pub fn quorum_size(n: usize) -> usize {
    n - max_faulty(n)
}

/// Ordered committee for one height
///
/// A validator's index is its position in this list and is what every
/// consensus message carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    height: BlockIndex,
    validators: Vec<PublicKey>,
}

impl ValidatorSet {
    /// Create the committee for `height`
    pub fn new(height: BlockIndex, validators: Vec<PublicKey>) -> ConsensusResult<Self> {
        if validators.is_empty() {
            return Err(ConsensusError::EmptyCommittee { height });
        }
        if validators.len() > u8::MAX as usize {
            return Err(ConsensusError::InvalidCommittee(format!(
                "{} validators exceed the index range",
                validators.len()
            )));
        }
        let unique: HashSet<_> = validators.iter().collect();
        if unique.len() != validators.len() {
            return Err(ConsensusError::InvalidCommittee(
                "duplicate validator key".to_string(),
            ));
        }
        Ok(Self { height, validators })
    }

    pub fn height(&self) -> BlockIndex {
        self.height
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Get validator key by index
    pub fn get(&self, index: u8) -> Option<&PublicKey> {
        self.validators.get(index as usize)
    }

    /// Get validator index by key
    pub fn index_of(&self, key: &PublicKey) -> Option<u8> {
        self.validators
            .iter()
            .position(|v| v == key)
            .map(|i| i as u8)
    }

    pub fn keys(&self) -> &[PublicKey] {
        &self.validators
    }

    pub fn max_faulty(&self) -> usize {
        max_faulty(self.len())
    }

    pub fn quorum(&self) -> usize {
        quorum_size(self.len())
    }

    /// Primary for `view`: `(height - view) mod n`, normalized to be non-negative
    pub fn primary_index(&self, view: u8) -> u8 {
        let n = self.len() as i64;
        let index = (i64::from(self.height) - i64::from(view)).rem_euclid(n);
        index as u8
    }

    pub fn is_primary(&self, index: u8, view: u8) -> bool {
        self.primary_index(view) == index
    }

    /// Multi-signature address of this committee, recorded in block headers
    pub fn next_consensus(&self) -> ConsensusResult<Address> {
        Ok(multisig_address(self.quorum(), &self.validators)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_core::KeyPair;
    use proptest::prelude::*;

    fn keys(n: usize) -> Vec<PublicKey> {
        (0..n)
            .map(|i| KeyPair::from_seed(&[i as u8 + 1; 32]).public_key())
            .collect()
    }

    #[test]
    fn test_quorum_table() {
        let expected = [(1, 1), (2, 2), (3, 3), (4, 3), (5, 4), (6, 5), (7, 5), (10, 7), (21, 15)];
        for (n, m) in expected {
            assert_eq!(quorum_size(n), m, "quorum for n={}", n);
        }
        assert_eq!(max_faulty(4), 1);
        assert_eq!(max_faulty(7), 2);
    }

    #[test]
    fn test_primary_rotation_example() {
        let set = ValidatorSet::new(100, keys(7)).unwrap();
        assert_eq!(set.primary_index(0), 2);
        assert_eq!(set.primary_index(1), 1);
        assert_eq!(set.primary_index(2), 0);
        assert_eq!(set.primary_index(3), 6);
        assert!(set.is_primary(2, 0));
    }

    #[test]
    fn test_primary_index_when_view_exceeds_height() {
        let set = ValidatorSet::new(1, keys(4)).unwrap();
        assert_eq!(set.primary_index(0), 1);
        assert_eq!(set.primary_index(1), 0);
        assert_eq!(set.primary_index(2), 3);
        assert_eq!(set.primary_index(200), (1i64 - 200).rem_euclid(4) as u8);
    }

    #[test]
    fn test_invalid_committees() {
        assert!(matches!(
            ValidatorSet::new(9, vec![]),
            Err(ConsensusError::EmptyCommittee { height: 9 })
        ));

        let mut dup = keys(3);
        dup.push(dup[0]);
        assert!(matches!(
            ValidatorSet::new(1, dup),
            Err(ConsensusError::InvalidCommittee(_))
        ));
    }

    #[test]
    fn test_index_lookup() {
        let committee = keys(4);
        let set = ValidatorSet::new(10, committee.clone()).unwrap();
        assert_eq!(set.index_of(&committee[3]), Some(3));
        assert_eq!(set.get(3), Some(&committee[3]));
        assert_eq!(set.get(4), None);

        let outsider = KeyPair::from_seed(&[99u8; 32]).public_key();
        assert_eq!(set.index_of(&outsider), None);
    }

    #[test]
    fn test_next_consensus_depends_on_order() {
        let committee = keys(4);
        let mut reversed = committee.clone();
        reversed.reverse();

        let a = ValidatorSet::new(1, committee).unwrap().next_consensus().unwrap();
        let b = ValidatorSet::new(1, reversed).unwrap().next_consensus().unwrap();
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn prop_quorum_tolerates_faults(n in 1usize..=255) {
            let m = quorum_size(n);
            let f = max_faulty(n);
            prop_assert!(m <= n);
            prop_assert!(m > 2 * n / 3 || n < 3);
            // two quorums always share an honest validator
            prop_assert!(2 * m > n + f);
            prop_assert_eq!(n - m, f);
        }

        #[test]
        fn prop_primary_rotates_through_committee(height in any::<u32>(), n in 1usize..=21) {
            let set = ValidatorSet::new(height, keys(n)).unwrap();
            let mut seen = HashSet::new();
            for view in 0..n as u8 {
                let primary = set.primary_index(view);
                prop_assert!((primary as usize) < n);
                seen.insert(primary);

                let next = set.primary_index(view + 1);
                prop_assert_eq!(next as usize, (primary as usize + n - 1) % n);
            }
            prop_assert_eq!(seen.len(), n);
        }
    }
}
