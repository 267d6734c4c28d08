//! Global constraint solve over block hypotheses.
//!
//! Each block takes exactly one of: a debit variant, a credit variant, or
//! null (noise). The search minimizes the number of nulls subject to the
//! balance equation `|start + Σcredits − Σdebits − end| ≤ tolerance`,
//! depth-first in block order with a max-remaining pruning bound. Among
//! assignments with equally few nulls, the first found in try order (debit
//! variants, credit variants, then null) wins, deterministically.

use conciliar_core::Direction;
use log::debug;

use crate::segment::Block;

/// Backstop on search size; a statement has at most a few hundred blocks
/// and the bound prunes aggressively, so this is rarely approached.
const MAX_NODES: u64 = 2_000_000;

/// Chosen interpretation for one block. `(group, variant)` index into
/// `block.candidates`.
#[derive(Debug, Clone, Copy)]
pub struct Choice {
    pub direction: Direction,
    pub group: usize,
    pub variant: usize,
}

#[derive(Debug, Clone)]
pub struct CspSolution {
    /// One entry per block, in block order. `None` marks a noise block.
    pub choices: Vec<Option<Choice>>,
    pub nulls: usize,
    pub nodes_visited: u64,
    pub nodes_pruned: u64,
    pub cap_hit: bool,
}

struct Search<'a> {
    blocks: &'a [Block],
    target_delta: i64,
    tolerance: i64,
    /// `max_remaining[i]` = sum over blocks `j >= i` of the largest absolute
    /// variant value, the pruning bound.
    max_remaining: Vec<i64>,
    stack: Vec<Option<Choice>>,
    best: Option<(usize, Vec<Option<Choice>>)>,
    nodes_visited: u64,
    nodes_pruned: u64,
    cap_hit: bool,
}

/// Solve the document-level CSP. `target_delta` is
/// `end_balance − start_balance` in cents.
pub fn solve(blocks: &[Block], target_delta: i64, tolerance: i64) -> Option<CspSolution> {
    let mut max_remaining = vec![0i64; blocks.len() + 1];
    for i in (0..blocks.len()).rev() {
        let block_max = blocks[i]
            .candidates
            .iter()
            .flatten()
            .map(|v| v.value_cents.abs())
            .max()
            .unwrap_or(0);
        max_remaining[i] = max_remaining[i + 1] + block_max;
    }

    let mut search = Search {
        blocks,
        target_delta,
        tolerance,
        max_remaining,
        stack: Vec::with_capacity(blocks.len()),
        best: None,
        nodes_visited: 0,
        nodes_pruned: 0,
        cap_hit: false,
    };

    search.descend(0, 0, 0);

    debug!(
        "csp: nodes={} pruned={} cap_hit={}",
        search.nodes_visited, search.nodes_pruned, search.cap_hit
    );

    let (nulls, choices) = search.best?;
    Some(CspSolution {
        choices,
        nulls,
        nodes_visited: search.nodes_visited,
        nodes_pruned: search.nodes_pruned,
        cap_hit: search.cap_hit,
    })
}

impl<'a> Search<'a> {
    fn best_nulls(&self) -> usize {
        self.best.as_ref().map(|(n, _)| *n).unwrap_or(usize::MAX)
    }

    /// True once the search can stop outright: a zero-null assignment is
    /// optimal by definition.
    fn done(&self) -> bool {
        self.cap_hit || self.best_nulls() == 0
    }

    fn descend(&mut self, index: usize, current_delta: i64, nulls: usize) {
        if self.done() {
            return;
        }
        self.nodes_visited += 1;
        if self.nodes_visited >= MAX_NODES {
            self.cap_hit = true;
            return;
        }

        // A branch that already carries as many nulls as the incumbent
        // cannot improve it.
        if nulls >= self.best_nulls() {
            self.nodes_pruned += 1;
            return;
        }

        if index == self.blocks.len() {
            if (current_delta - self.target_delta).abs() <= self.tolerance {
                self.best = Some((nulls, self.stack.clone()));
            }
            return;
        }

        if (self.target_delta - current_delta).abs()
            > self.max_remaining[index] + self.tolerance
        {
            self.nodes_pruned += 1;
            return;
        }

        let block = &self.blocks[index];

        // Debit variants, then credit variants, then null.
        for direction in [Direction::Debit, Direction::Credit] {
            for (group, variants) in block.candidates.iter().enumerate() {
                for (variant, v) in variants.iter().enumerate() {
                    let next_delta = current_delta + direction.sign() * v.value_cents;
                    self.stack.push(Some(Choice {
                        direction,
                        group,
                        variant,
                    }));
                    self.descend(index + 1, next_delta, nulls);
                    self.stack.pop();
                    if self.done() {
                        return;
                    }
                }
            }
        }

        self.stack.push(None);
        self.descend(index + 1, current_delta, nulls + 1);
        self.stack.pop();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypothesis::variants;
    use chrono::NaiveDate;

    fn block(id: usize, tokens: &[&str]) -> Block {
        Block {
            id,
            page: 1,
            row: id as u32,
            date: NaiveDate::from_ymd_opt(2024, 3, 1 + id as u32).unwrap(),
            candidates: tokens
                .iter()
                .map(|t| variants(t))
                .filter(|v| !v.is_empty())
                .collect(),
            description: String::new(),
        }
    }

    fn selected_deltas(blocks: &[Block], sol: &CspSolution) -> Vec<i64> {
        sol.choices
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                c.map(|c| {
                    let v = &blocks[i].candidates[c.group][c.variant];
                    c.direction.sign() * v.value_cents
                })
            })
            .collect()
    }

    #[test]
    fn all_debits_balance() {
        let blocks = vec![block(0, &["150.00"]), block(1, &["50.00"])];
        // start 1000.00, end 800.00 -> target -20000
        let sol = solve(&blocks, -20_000, 100).unwrap();
        assert_eq!(sol.nulls, 0);
        assert_eq!(selected_deltas(&blocks, &sol), vec![-15_000, -5_000]);
    }

    #[test]
    fn mixed_direction_preferred_over_null() {
        // -150.00 - 100.00 + 50.00 = -20000: the zero-null assignment must
        // win over (debit, debit, null) which also balances.
        let blocks = vec![
            block(0, &["150.00"]),
            block(1, &["50.00"]),
            block(2, &["100.00"]),
        ];
        let sol = solve(&blocks, -20_000, 100).unwrap();
        assert_eq!(sol.nulls, 0);
        let deltas = selected_deltas(&blocks, &sol);
        assert_eq!(deltas.iter().sum::<i64>(), -20_000);
        assert_eq!(deltas.len(), 3);
    }

    #[test]
    fn ocr_fix_variants_recovered() {
        let blocks = vec![
            block(0, &["150.0O"]),
            block(1, &["50.00"]),
            block(2, &["l00.00"]),
        ];
        let sol = solve(&blocks, -20_000, 100).unwrap();
        assert_eq!(sol.nulls, 0);
        let deltas = selected_deltas(&blocks, &sol);
        assert_eq!(deltas.iter().sum::<i64>(), -20_000);
    }

    #[test]
    fn noise_block_goes_null() {
        // Only 150.00 fits; the 999.99 block must be noise.
        let blocks = vec![block(0, &["150.00"]), block(1, &["999.99"])];
        let sol = solve(&blocks, -15_000, 100).unwrap();
        assert_eq!(sol.nulls, 1);
        assert!(sol.choices[1].is_none());
    }

    #[test]
    fn infeasible_returns_none() {
        let blocks = vec![block(0, &["150.00"])];
        assert!(solve(&blocks, -999_999, 100).is_none());
    }

    #[test]
    fn tolerance_absorbs_small_residue() {
        let blocks = vec![block(0, &["150.00"])];
        // off by 40 cents, within the 100-cent tolerance
        let sol = solve(&blocks, -15_040, 100).unwrap();
        assert_eq!(sol.nulls, 0);
    }

    #[test]
    fn deterministic_on_reruns() {
        let blocks = vec![
            block(0, &["100.00"]),
            block(1, &["100.00"]),
            block(2, &["200.00"]),
        ];
        let a = solve(&blocks, -40_000, 0).unwrap();
        let b = solve(&blocks, -40_000, 0).unwrap();
        assert_eq!(selected_deltas(&blocks, &a), selected_deltas(&blocks, &b));
    }
}
