/// Deterministic winning-revision selection.
///
/// Every replica must independently pick the same winner from the same set
/// of leaves:
/// 1. Non-deleted leaves win over deleted leaves
/// 2. Higher generation wins
/// 3. Lexicographically greater hash breaks ties
use crate::revision::Revision;

/// A leaf of a revision tree, as much as the winner rule needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRev {
    pub rev: Revision,
    pub deleted: bool,
}

/// Sort leaves best-first: the winner ends up at index 0.
pub fn sort_leaves(leaves: &mut [LeafRev]) {
    leaves.sort_by(|a, b| {
        a.deleted
            .cmp(&b.deleted)
            .then_with(|| b.rev.cmp(&a.rev))
    });
}

/// Pick the winning leaf. If every leaf is deleted the same ordering applies
/// among the deleted ones and the document as a whole reads as deleted.
pub fn winning_leaf(leaves: &[LeafRev]) -> Option<&LeafRev> {
    leaves
        .iter()
        .filter(|l| !l.deleted)
        .max_by(|a, b| a.rev.cmp(&b.rev))
        .or_else(|| leaves.iter().max_by(|a, b| a.rev.cmp(&b.rev)))
}

/// Non-winning, non-deleted leaves: the conflicts a caller must resolve.
pub fn conflict_leaves(leaves: &[LeafRev]) -> Vec<&LeafRev> {
    let winner = winning_leaf(leaves);
    let mut conflicts: Vec<&LeafRev> = leaves
        .iter()
        .filter(|l| !l.deleted && Some(*l) != winner)
        .collect();
    conflicts.sort_by(|a, b| b.rev.cmp(&a.rev));
    conflicts
}
