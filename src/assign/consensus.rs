use ahash::AHashMap;

use crate::config::{ConsensusMethod, MinSupport};
use crate::types::{Assignment, AssignmentStatus, ResolvedLineage, TaxNode};

/// Consecutive pushes that must leave the agreed depth unchanged before
/// lazy strict-LCA stops consuming hits.
const LCA_STABLE_WINDOW: usize = 5;

/// One taxon competing at some depth of the majority descent.
struct Candidate {
    node: TaxNode,
    votes: usize,
    /// Rank of the strongest hit supporting this taxon (lower = stronger).
    best_rank: usize,
}

/// Outcome of a majority descent: the deepest node meeting the threshold,
/// its vote count, and the smallest lead over a runner-up anywhere along
/// the chosen path.
struct Descent {
    node: TaxNode,
    votes: usize,
    min_margin: usize,
}

/// Incremental consensus accumulator. Lineages are fed in hit order via
/// [`push`](Self::push); [`finish`](Self::finish) produces the Assignment.
/// In lazy mode the caller polls [`saturated`](Self::saturated) after each
/// push and stops resolving further hits once it reports true.
pub struct ConsensusState {
    method: ConsensusMethod,
    min_support: MinSupport,
    /// Upper bound on lineages still to come (the filtered hit count).
    expected: usize,
    lazy: bool,
    pushed: Vec<ResolvedLineage>,
    /// Running longest-common-prefix, maintained for strict LCA only.
    prefix: Option<Vec<TaxNode>>,
    stable_run: usize,
    saturated: bool,
}

impl ConsensusState {
    pub fn new(
        method: ConsensusMethod,
        min_support: MinSupport,
        expected: usize,
        lazy: bool,
    ) -> Self {
        ConsensusState {
            method,
            min_support,
            expected,
            lazy,
            pushed: Vec::new(),
            prefix: None,
            stable_run: 0,
            saturated: false,
        }
    }

    /// Lineages examined so far.
    pub fn considered(&self) -> usize {
        self.pushed.len()
    }

    /// True once additional lineages can no longer change the call
    /// materially. Only meaningful in lazy mode.
    pub fn saturated(&self) -> bool {
        self.saturated
    }

    /// Feeds one resolved lineage into the running consensus.
    pub fn push(&mut self, resolved: ResolvedLineage) {
        match self.method {
            ConsensusMethod::BestHit => {
                // one lineage decides everything
                self.saturated = true;
            }
            ConsensusMethod::Lca => {
                self.intersect_prefix(&resolved);
            }
            ConsensusMethod::Majority => {}
        }
        self.pushed.push(resolved);

        if self.lazy && self.method == ConsensusMethod::Majority {
            self.saturated = self.majority_is_unassailable();
        }
    }

    /// Shrinks the running prefix to the depths where the new lineage
    /// agrees with every earlier one.
    fn intersect_prefix(&mut self, resolved: &ResolvedLineage) {
        let lineage = &resolved.lineage;
        match &mut self.prefix {
            None => {
                self.prefix = Some((**lineage).clone());
            }
            Some(prefix) => {
                let mut depth = 0;
                while depth < prefix.len()
                    && depth < lineage.len()
                    && prefix[depth].taxid == lineage[depth].taxid
                {
                    depth += 1;
                }
                if depth < prefix.len() {
                    prefix.truncate(depth);
                    self.stable_run = 0;
                } else {
                    self.stable_run += 1;
                }
                if prefix.len() <= 1 || self.stable_run >= LCA_STABLE_WINDOW {
                    self.saturated = true;
                }
            }
        }
    }

    /// True when the current majority leader meets the support threshold
    /// against the full expected lineage count and every depth of its path
    /// leads the runner-up by more than the unexamined remainder.
    fn majority_is_unassailable(&self) -> bool {
        let remaining = self.expected.saturating_sub(self.pushed.len());
        if remaining == 0 {
            return true;
        }
        let threshold = self.min_support.threshold(self.expected);
        match descend(&self.pushed, threshold) {
            Some(descent) => descent.min_margin > remaining,
            None => false,
        }
    }

    /// Produces the Assignment from everything pushed so far.
    pub fn finish(self) -> Assignment {
        let considered = self.pushed.len();
        if considered == 0 {
            return Assignment::unresolved(AssignmentStatus::NoLineage);
        }
        // Consensus over one lineage is trivially itself, for every method.
        if considered == 1 {
            if let Some(leaf) = self.pushed[0].lineage.last() {
                return assigned(leaf.clone(), 1, 1);
            }
            return Assignment::unresolved(AssignmentStatus::NoLineage);
        }

        match self.method {
            ConsensusMethod::BestHit => match self.pushed[0].lineage.last() {
                Some(leaf) => assigned(leaf.clone(), 1, considered),
                None => Assignment::unresolved(AssignmentStatus::NoLineage),
            },
            ConsensusMethod::Lca => {
                match self.prefix.as_ref().and_then(|p| p.last()) {
                    Some(node) => assigned(node.clone(), considered, considered),
                    // lineages with no shared root: cannot happen with one
                    // taxonomy, handled as no agreement
                    None => Assignment::unresolved(AssignmentStatus::LowSupport),
                }
            }
            ConsensusMethod::Majority => {
                let threshold = self.min_support.threshold(considered);
                match descend(&self.pushed, threshold) {
                    Some(descent) => assigned(descent.node, descent.votes, considered),
                    None => Assignment::unresolved(AssignmentStatus::LowSupport),
                }
            }
        }
    }
}

fn assigned(node: TaxNode, supported: usize, considered: usize) -> Assignment {
    Assignment {
        taxid: node.taxid,
        rank: node.rank,
        name: node.name,
        supported: supported as u32,
        considered: considered as u32,
        status: AssignmentStatus::Assigned,
    }
}

/// Walks the lineages depth by depth from the root. At each depth the
/// taxon held by the largest subset of the lineages that followed the
/// winning path so far leads; ties go to the taxon with the strongest
/// supporting hit. The descent stops at the first depth whose leader
/// falls below `threshold` votes.
fn descend(pushed: &[ResolvedLineage], threshold: usize) -> Option<Descent> {
    let mut active: Vec<usize> = (0..pushed.len()).collect();
    let mut best: Option<Descent> = None;
    let mut depth = 0;

    loop {
        let mut counts: AHashMap<u32, Candidate> = AHashMap::new();
        for &i in &active {
            if let Some(node) = pushed[i].lineage.get(depth) {
                let cand = counts.entry(node.taxid).or_insert_with(|| Candidate {
                    node: node.clone(),
                    votes: 0,
                    best_rank: usize::MAX,
                });
                cand.votes += 1;
                cand.best_rank = cand.best_rank.min(pushed[i].hit_rank);
            }
        }
        if counts.is_empty() {
            break;
        }

        let mut runner_up = 0usize;
        let mut leader: Option<Candidate> = None;
        for cand in counts.into_values() {
            let takes_the_lead = match &leader {
                Some(best) => {
                    cand.votes > best.votes
                        || (cand.votes == best.votes && cand.best_rank < best.best_rank)
                }
                None => true,
            };
            if takes_the_lead {
                if let Some(prev) = leader.take() {
                    runner_up = runner_up.max(prev.votes);
                }
                leader = Some(cand);
            } else {
                runner_up = runner_up.max(cand.votes);
            }
        }
        let leader = leader?;
        if leader.votes < threshold {
            break;
        }

        let margin = leader.votes - runner_up;
        let leader_taxid = leader.node.taxid;
        best = Some(match best {
            Some(prev) => Descent {
                node: leader.node,
                votes: leader.votes,
                min_margin: prev.min_margin.min(margin),
            },
            None => Descent {
                node: leader.node,
                votes: leader.votes,
                min_margin: margin,
            },
        });

        active.retain(|&i| {
            pushed[i]
                .lineage
                .get(depth)
                .map_or(false, |n| n.taxid == leader_taxid)
        });
        depth += 1;
    }
    best
}

/// Combines a resolved lineage set into one Assignment, examining every
/// lineage (the non-lazy contract).
pub fn assign(
    lineages: &[ResolvedLineage],
    method: ConsensusMethod,
    min_support: MinSupport,
) -> Assignment {
    let mut state = ConsensusState::new(method, min_support, lineages.len(), false);
    for resolved in lineages {
        state.push(resolved.clone());
    }
    state.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Lineage, UNKNOWN_TAXID};
    use std::sync::Arc;

    const RANKS: [&str; 5] = ["no rank", "kingdom", "phylum", "class", "order"];

    fn lineage(taxids: &[u32]) -> Arc<Lineage> {
        Arc::new(
            taxids
                .iter()
                .enumerate()
                .map(|(depth, &taxid)| TaxNode {
                    taxid,
                    rank: RANKS[depth.min(RANKS.len() - 1)].to_string(),
                    name: format!("taxon{}", taxid),
                })
                .collect(),
        )
    }

    fn resolved(taxids: &[u32], hit_rank: usize) -> ResolvedLineage {
        ResolvedLineage {
            lineage: lineage(taxids),
            hit_rank,
            evalue: 1e-30 * (hit_rank + 1) as f64,
        }
    }

    #[test]
    fn empty_input_is_the_unresolved_sentinel() {
        for method in [
            ConsensusMethod::BestHit,
            ConsensusMethod::Lca,
            ConsensusMethod::Majority,
        ] {
            let a = assign(&[], method, MinSupport::Fraction(1.0));
            assert_eq!(a.taxid, UNKNOWN_TAXID);
            assert_eq!(a.supported, 0);
            assert_eq!(a.considered, 0);
            assert!(!a.is_assigned());
        }
    }

    #[test]
    fn single_lineage_returns_its_leaf_for_every_method() {
        let input = [resolved(&[1, 10, 20, 30], 0)];
        for method in [
            ConsensusMethod::BestHit,
            ConsensusMethod::Lca,
            ConsensusMethod::Majority,
        ] {
            let a = assign(&input, method, MinSupport::Count(3));
            assert_eq!(a.taxid, 30, "method {:?}", method);
            assert_eq!(a.supported, 1);
            assert_eq!(a.considered, 1);
        }
    }

    #[test]
    fn lca_over_identical_lineages_is_the_leaf_with_full_support() {
        let input: Vec<_> = (0..4).map(|i| resolved(&[1, 10, 20, 30], i)).collect();
        let a = assign(&input, ConsensusMethod::Lca, MinSupport::Fraction(1.0));
        assert_eq!(a.taxid, 30);
        assert_eq!(a.supported, 4);
        assert_eq!(a.considered, 4);
    }

    #[test]
    fn lca_is_order_independent() {
        let forward = [
            resolved(&[1, 10, 20, 30], 0),
            resolved(&[1, 10, 20, 31], 1),
            resolved(&[1, 10, 21], 2),
        ];
        let backward = [
            resolved(&[1, 10, 21], 0),
            resolved(&[1, 10, 20, 31], 1),
            resolved(&[1, 10, 20, 30], 2),
        ];
        let a = assign(&forward, ConsensusMethod::Lca, MinSupport::Fraction(1.0));
        let b = assign(&backward, ConsensusMethod::Lca, MinSupport::Fraction(1.0));
        assert_eq!(a.taxid, b.taxid);
        assert_eq!(a.taxid, 10);
        assert_eq!(a.rank, "kingdom");
    }

    #[test]
    fn best_hit_trusts_the_first_lineage() {
        let input = [
            resolved(&[1, 10, 20, 30], 0),
            resolved(&[1, 99, 98, 97], 1),
        ];
        let a = assign(&input, ConsensusMethod::BestHit, MinSupport::Count(1));
        assert_eq!(a.taxid, 30);
        assert_eq!(a.supported, 1);
        assert_eq!(a.considered, 2);
    }

    #[test]
    fn worked_example_lca_stops_at_class() {
        // A and B share the full chain, C diverges at order
        let input = [
            resolved(&[1, 11, 12, 13, 14], 0), // K1 P1 C1 O1
            resolved(&[1, 11, 12, 13, 14], 1), // K1 P1 C1 O1
            resolved(&[1, 11, 12, 13, 15], 2), // K1 P1 C1 O2
        ];
        let a = assign(&input, ConsensusMethod::Lca, MinSupport::Fraction(1.0));
        assert_eq!(a.taxid, 13);
        assert_eq!(a.rank, "class");
        assert_eq!(a.supported, 3);
        assert_eq!(a.considered, 3);
    }

    #[test]
    fn worked_example_majority_descends_to_order() {
        let input = [
            resolved(&[1, 11, 12, 13, 14], 0),
            resolved(&[1, 11, 12, 13, 14], 1),
            resolved(&[1, 11, 12, 13, 15], 2),
        ];
        let a = assign(
            &input,
            ConsensusMethod::Majority,
            MinSupport::Fraction(2.0 / 3.0),
        );
        assert_eq!(a.taxid, 14);
        assert_eq!(a.rank, "order");
        assert_eq!(a.supported, 2);
        assert_eq!(a.considered, 3);
    }

    #[test]
    fn majority_at_full_support_matches_strict_lca() {
        let inputs: Vec<Vec<ResolvedLineage>> = vec![
            vec![
                resolved(&[1, 11, 12, 13, 14], 0),
                resolved(&[1, 11, 12, 13, 14], 1),
                resolved(&[1, 11, 12, 13, 15], 2),
            ],
            vec![
                resolved(&[1, 11, 12], 0),
                resolved(&[1, 11, 12, 13], 1),
            ],
            vec![
                resolved(&[1, 11], 0),
                resolved(&[1, 22], 1),
                resolved(&[1, 33], 2),
            ],
        ];
        for input in inputs {
            let lca = assign(&input, ConsensusMethod::Lca, MinSupport::Fraction(1.0));
            let maj = assign(&input, ConsensusMethod::Majority, MinSupport::Fraction(1.0));
            assert_eq!(lca.taxid, maj.taxid);
            assert_eq!(lca.rank, maj.rank);
            assert_eq!(lca.supported, maj.supported);
        }
    }

    #[test]
    fn majority_tie_breaks_toward_the_strongest_hit() {
        // two branches with one vote each at phylum; hit 0 is stronger
        let input = [
            resolved(&[1, 11, 40, 41], 0),
            resolved(&[1, 11, 50, 51], 1),
        ];
        let a = assign(&input, ConsensusMethod::Majority, MinSupport::Count(1));
        assert_eq!(a.taxid, 41);
    }

    #[test]
    fn majority_below_threshold_is_unresolved() {
        let input = [
            resolved(&[1, 11, 12], 0),
            resolved(&[1, 11, 13], 1),
        ];
        // an absolute count higher than the lineage count can never be met
        let a = assign(&input, ConsensusMethod::Majority, MinSupport::Count(3));
        assert_eq!(a.taxid, UNKNOWN_TAXID);
        assert_eq!(a.status, AssignmentStatus::LowSupport);
        assert_eq!(a.considered, 0);
    }

    #[test]
    fn lazy_and_nonlazy_agree_when_the_exit_cannot_fire() {
        // deep shared prefix, few lineages: neither the stabilization
        // window nor the root floor can trigger before the set is exhausted
        let input = [
            resolved(&[1, 11, 12, 13, 14], 0),
            resolved(&[1, 11, 12, 13, 15], 1),
            resolved(&[1, 11, 12, 13, 16], 2),
        ];

        let eager = assign(&input, ConsensusMethod::Lca, MinSupport::Fraction(1.0));

        let mut lazy = ConsensusState::new(
            ConsensusMethod::Lca,
            MinSupport::Fraction(1.0),
            input.len(),
            true,
        );
        for resolved in &input {
            assert!(!lazy.saturated());
            lazy.push(resolved.clone());
        }
        let lazy = lazy.finish();

        assert_eq!(eager.taxid, lazy.taxid);
        assert_eq!(eager.rank, lazy.rank);
        assert_eq!(eager.supported, lazy.supported);
    }

    #[test]
    fn lazy_lca_saturates_once_the_prefix_stabilizes() {
        let mut state = ConsensusState::new(
            ConsensusMethod::Lca,
            MinSupport::Fraction(1.0),
            100,
            true,
        );
        // identical lineages keep the agreed depth unchanged
        for i in 0..LCA_STABLE_WINDOW + 1 {
            state.push(resolved(&[1, 11, 12, 13, 14], i));
        }
        assert!(state.saturated());
        let a = state.finish();
        assert_eq!(a.taxid, 14);
    }

    #[test]
    fn lazy_majority_saturates_on_an_unreachable_lead() {
        // 10 expected; after 8 unanimous votes the 2 unexamined hits
        // cannot overturn any depth of the path
        let mut state = ConsensusState::new(
            ConsensusMethod::Majority,
            MinSupport::Fraction(0.5),
            10,
            true,
        );
        for i in 0..8 {
            state.push(resolved(&[1, 11, 12, 13, 14], i));
        }
        assert!(state.saturated());
        let a = state.finish();
        assert_eq!(a.taxid, 14);
    }

    #[test]
    fn lazy_majority_keeps_consuming_while_contested() {
        // 4 of 10 votes split two ways: remaining hits can still flip it
        let mut state = ConsensusState::new(
            ConsensusMethod::Majority,
            MinSupport::Fraction(0.5),
            10,
            true,
        );
        state.push(resolved(&[1, 11, 12], 0));
        state.push(resolved(&[1, 22, 23], 1));
        state.push(resolved(&[1, 11, 12], 2));
        state.push(resolved(&[1, 22, 23], 3));
        assert!(!state.saturated());
    }
}
