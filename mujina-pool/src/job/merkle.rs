//! Merkle branch construction for the coinbase position.

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::TxMerkleNode;

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut engine = sha256d::Hash::engine();
    bitcoin::hashes::HashEngine::input(&mut engine, left);
    bitcoin::hashes::HashEngine::input(&mut engine, right);
    sha256d::Hash::from_engine(engine).to_byte_array()
}

/// Branch that lets a miner climb from the coinbase txid to the root.
///
/// `txids` are the non-coinbase transactions in block order (internal byte
/// order). The coinbase sits at index 0 and is not part of the input.
pub fn coinbase_branch(txids: &[[u8; 32]]) -> Vec<TxMerkleNode> {
    let mut branch = Vec::new();
    let mut level: Vec<[u8; 32]> = txids.to_vec();
    while let Some(first) = level.first().copied() {
        branch.push(TxMerkleNode::from_byte_array(first));
        let mut rest = level.split_off(1);
        if rest.len() % 2 == 1 {
            if let Some(last) = rest.last().copied() {
                rest.push(last);
            }
        }
        level = rest
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    branch
}

/// Climb from `leaf` (the coinbase txid) through `branch`.
pub fn root_from_branch(leaf: [u8; 32], branch: &[TxMerkleNode]) -> TxMerkleNode {
    let root = branch
        .iter()
        .fold(leaf, |acc, node| hash_pair(&acc, node.as_byte_array()));
    TxMerkleNode::from_byte_array(root)
}

/// Plain merkle root over `leaves`; an empty list gives all zeros.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return [0u8; 32];
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn leaf(n: u8) -> [u8; 32] {
        [n; 32]
    }

    #[test_case(0; "coinbase only")]
    #[test_case(1; "one transaction")]
    #[test_case(2; "odd level")]
    #[test_case(5; "several levels")]
    #[test_case(8; "unbalanced")]
    fn test_branch_matches_full_tree(tx_count: u8) {
        let coinbase = [0xcb; 32];
        let txids: Vec<[u8; 32]> = (1..=tx_count).map(leaf).collect();

        let mut all = vec![coinbase];
        all.extend(&txids);
        let expected = merkle_root(&all);

        let branch = coinbase_branch(&txids);
        assert_eq!(root_from_branch(coinbase, &branch).to_byte_array(), expected);
    }

    #[test]
    fn test_single_leaf_root_is_leaf() {
        assert_eq!(merkle_root(&[leaf(7)]), leaf(7));
        assert!(coinbase_branch(&[]).is_empty());
    }
}
