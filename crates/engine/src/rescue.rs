//! Rescue loop for clusters the solver flagged.
//!
//! For each flagged cluster, decide whether to accept its result anyway
//! (an instalment invoice explains the remainder, or the matches score
//! high), attempt a repair (append a delta-sized orphan, or merge with a
//! tax-id-adjacent cluster and re-solve), or escalate to an ambiguous case
//! for human review. Merges past the hard-stop size are logged and
//! escalate immediately.

use std::collections::BTreeSet;

use conciliar_core::{AmbiguousCase, AuditAction, AuditEntry, Txn};
use log::{debug, info};

use crate::cluster::Cluster;
use crate::config::EngineConfig;
use crate::solver::{ClusterSolution, LexSolver};

/// Orphans within this many cents of the solver delta count as the likely
/// missing transaction.
const ORPHAN_DELTA_TOLERANCE_CENTS: i64 = 10;

/// How many adjacent clusters a rescue may try to merge with.
const MAX_MERGE_CANDIDATES: usize = 3;

#[derive(Debug)]
pub struct RescueOutcome {
    /// Final solutions for the flagged clusters (resolved or accepted
    /// as-is).
    pub solutions: Vec<ClusterSolution>,
    /// Previously accepted cluster ids whose solutions were revoked
    /// because a merge consumed them; the merged solution replaces them.
    pub revoked_cluster_ids: Vec<String>,
    pub manual_review: Vec<AmbiguousCase>,
    pub audit: Vec<AuditEntry>,
    pub iterations: u32,
    pub hard_stopped: bool,
}

enum Verdict {
    Accept(&'static str),
    Rescue(&'static str),
}

/// Acceptance and trigger predicates, in order.
fn verdict(
    solution: &ClusterSolution,
    cluster: Option<&Cluster>,
    orphan_invoices: &[Txn],
    orphan_payments: &[Txn],
    config: &EngineConfig,
) -> Verdict {
    if solution.infeasible {
        return Verdict::Rescue("no_solution");
    }

    // A non-zero remainder on an instalment invoice is expected, not an
    // error.
    if let Some(cluster) = cluster {
        let has_instalment = cluster.invoices.iter().any(|inv| inv.expects_partial());
        if has_instalment && solution.total_remainder_cents > 0 {
            return Verdict::Accept("partial_payment_expected");
        }
    }

    if solution.mean_match_score > config.rescue_semantic_threshold {
        return Verdict::Accept("high_confidence_match");
    }

    if solution.delta_cents > 0 && solution.total_remainder_cents == 0 {
        return Verdict::Rescue("unbalanced_error");
    }

    if solution.delta_cents > 0 {
        let delta = solution.delta_cents;
        if orphan_invoices.iter().any(|o| o.amount_cents == delta) {
            return Verdict::Rescue("delta_matches_orphan_invoice");
        }
        if orphan_payments.iter().any(|o| o.amount_cents == delta) {
            return Verdict::Rescue("delta_matches_orphan_payment");
        }
    }

    Verdict::Accept("no_rescue_needed")
}

/// Append the orphan whose amount sits within tolerance of the delta.
fn augment_with_orphan(
    cluster: &Cluster,
    delta: i64,
    orphan_invoices: &[Txn],
    orphan_payments: &[Txn],
) -> Option<(Cluster, String)> {
    let near = |amount: i64| (amount - delta).abs() <= ORPHAN_DELTA_TOLERANCE_CENTS;

    if let Some(orphan) = orphan_invoices.iter().find(|o| near(o.amount_cents)) {
        let mut augmented = cluster.clone();
        augmented.id = format!("{}_aug", cluster.id);
        augmented.invoice_total_cents += orphan.amount_cents;
        augmented.invoices.push(orphan.clone());
        return Some((augmented, orphan.id.clone()));
    }
    if let Some(orphan) = orphan_payments.iter().find(|o| near(o.amount_cents)) {
        let mut augmented = cluster.clone();
        augmented.id = format!("{}_aug", cluster.id);
        augmented.payment_total_cents += orphan.amount_cents;
        augmented.payments.push(orphan.clone());
        return Some((augmented, orphan.id.clone()));
    }
    None
}

/// Clusters sharing any tax id with `cluster`, smallest first, excluding
/// already-consumed ones.
fn adjacent_clusters<'c>(
    cluster: &Cluster,
    all: &'c [Cluster],
    consumed: &BTreeSet<String>,
) -> Vec<&'c Cluster> {
    let own = cluster.tax_ids();
    if own.is_empty() {
        return vec![];
    }
    let mut adjacent: Vec<&Cluster> = all
        .iter()
        .filter(|c| c.id != cluster.id && !consumed.contains(&c.id))
        .filter(|c| !c.tax_ids().is_disjoint(&own))
        .collect();
    adjacent.sort_by_key(|c| (c.size(), c.id.clone()));
    adjacent.truncate(MAX_MERGE_CANDIDATES);
    adjacent
}

pub fn rescue(
    flagged: Vec<ClusterSolution>,
    clusters: &[Cluster],
    orphan_invoices: &[Txn],
    orphan_payments: &[Txn],
    solver: &LexSolver<'_>,
    config: &EngineConfig,
) -> RescueOutcome {
    info!(
        "rescue loop: {} flagged cluster(s), {} orphan invoice(s), {} orphan payment(s)",
        flagged.len(),
        orphan_invoices.len(),
        orphan_payments.len()
    );

    let mut outcome = RescueOutcome {
        solutions: vec![],
        revoked_cluster_ids: vec![],
        manual_review: vec![],
        audit: vec![],
        iterations: 0,
        hard_stopped: false,
    };
    // Clusters merged away or orphans consumed by earlier rescues.
    let mut consumed_clusters: BTreeSet<String> = BTreeSet::new();
    let mut consumed_orphans: BTreeSet<String> = BTreeSet::new();

    for solution in flagged {
        let cluster = clusters.iter().find(|c| c.id == solution.cluster_id);
        if consumed_clusters.contains(&solution.cluster_id) {
            // Already folded into an earlier merge.
            continue;
        }

        let free_inv: Vec<Txn> = orphan_invoices
            .iter()
            .filter(|o| !consumed_orphans.contains(&o.id))
            .cloned()
            .collect();
        let free_pay: Vec<Txn> = orphan_payments
            .iter()
            .filter(|o| !consumed_orphans.contains(&o.id))
            .cloned()
            .collect();

        let reason = match verdict(&solution, cluster, &free_inv, &free_pay, config) {
            Verdict::Accept(reason) => {
                debug!("cluster {}: rescue skipped ({reason})", solution.cluster_id);
                outcome.solutions.push(solution);
                continue;
            }
            Verdict::Rescue(reason) => reason,
        };

        outcome.audit.push(
            AuditEntry::new(
                AuditAction::RescueTriggered,
                format!("rescue triggered: {reason}"),
            )
            .with_cluster(solution.cluster_id.clone())
            .with_details(serde_json::json!({
                "delta_cents": solution.delta_cents,
                "reason": reason,
            })),
        );
        outcome.iterations += 1;

        let Some(cluster) = cluster else {
            // Nothing to repair without the cluster itself.
            escalate(&mut outcome, &solution, None, reason);
            continue;
        };

        // Attempt 1: append an orphan matching the delta.
        if let Some((augmented, orphan_id)) =
            augment_with_orphan(cluster, solution.delta_cents, &free_inv, &free_pay)
        {
            if augmented.size() <= config.hard_stop_cluster_size {
                outcome.audit.push(
                    AuditEntry::new(
                        AuditAction::RescueTriggered,
                        format!("appended orphan {orphan_id} to {}", cluster.id),
                    )
                    .with_cluster(cluster.id.clone())
                    .with_txns(vec![orphan_id.clone()]),
                );
                let retry = solver.solve(&augmented);
                outcome.audit.extend(retry.audit.clone());
                if !retry.needs_rescue && !retry.infeasible {
                    consumed_orphans.insert(orphan_id);
                    outcome.solutions.push(retry);
                    continue;
                }
            }
        }

        // Attempt 2: merge with adjacent clusters, smallest first.
        let mut resolved = false;
        let mut hard_stopped_here = false;
        for adjacent in adjacent_clusters(cluster, clusters, &consumed_clusters) {
            let merged_id = format!("{}+{}", cluster.id, adjacent.id);
            let merged = cluster.merged(adjacent, merged_id.clone());

            if merged.size() > config.hard_stop_cluster_size {
                outcome.hard_stopped = true;
                hard_stopped_here = true;
                outcome.audit.push(
                    AuditEntry::new(
                        AuditAction::HardStop,
                        format!(
                            "merge {merged_id} reaches {} nodes, over the {} hard stop",
                            merged.size(),
                            config.hard_stop_cluster_size
                        ),
                    )
                    .with_cluster(merged_id),
                );
                break;
            }

            outcome.audit.push(
                AuditEntry::new(
                    AuditAction::RescueTriggered,
                    format!("merging {} with adjacent cluster {}", cluster.id, adjacent.id),
                )
                .with_cluster(cluster.id.clone()),
            );

            let retry = solver.solve(&merged);
            outcome.audit.extend(retry.audit.clone());
            if !retry.needs_rescue && !retry.infeasible {
                consumed_clusters.insert(adjacent.id.clone());
                outcome.revoked_cluster_ids.push(adjacent.id.clone());
                outcome.solutions.push(retry);
                resolved = true;
                break;
            }
        }
        if resolved {
            continue;
        }

        let escalation_reason = if hard_stopped_here {
            "merge exceeded the hard-stop size"
        } else {
            "rescue failed to resolve the balance discrepancy"
        };
        escalate(&mut outcome, &solution, Some(cluster), escalation_reason);
    }

    info!(
        "rescue loop complete: {} resolved/accepted, {} manual review, hard_stopped={}",
        outcome.solutions.len(),
        outcome.manual_review.len(),
        outcome.hard_stopped
    );

    outcome
}

fn escalate(
    outcome: &mut RescueOutcome,
    solution: &ClusterSolution,
    cluster: Option<&Cluster>,
    reason: &str,
) {
    let (invoice_ids, payment_ids) = match cluster {
        Some(c) => (
            c.invoices.iter().map(|t| t.id.clone()).collect(),
            c.payments.iter().map(|t| t.id.clone()).collect(),
        ),
        None => (
            solution.unmatched_invoices.clone(),
            solution.unmatched_payments.clone(),
        ),
    };

    outcome.audit.push(
        AuditEntry::new(
            AuditAction::ManualReviewRequired,
            format!("cluster {} routed to manual review: {reason}", solution.cluster_id),
        )
        .with_cluster(solution.cluster_id.clone()),
    );

    outcome.manual_review.push(AmbiguousCase {
        id: format!("amb_{}", outcome.manual_review.len()),
        invoice_ids,
        payment_ids,
        reason: reason.to_string(),
        solver_delta_cents: solution.delta_cents,
        best_score: solution.mean_match_score,
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterEdge;
    use chrono::NaiveDate;
    use conciliar_core::{Direction, PaymentMethod, SourceKind};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn inv(id: &str, amount: i64, d: &str, tax: &str) -> Txn {
        Txn {
            id: id.into(),
            source: SourceKind::Cfdi,
            amount_cents: amount,
            direction: Direction::Debit,
            date: Some(date(d)),
            counterparty_name: Some("Proveedor A".into()),
            counterparty_tax_id: Some(tax.into()),
            ..Default::default()
        }
    }

    fn pay(id: &str, amount: i64, d: &str, tax: &str) -> Txn {
        Txn {
            id: id.into(),
            source: SourceKind::Bank,
            amount_cents: amount,
            direction: Direction::Credit,
            date: Some(date(d)),
            counterparty_name: Some("Proveedor A".into()),
            counterparty_tax_id: Some(tax.into()),
            ..Default::default()
        }
    }

    fn edge(i: &str, p: &str, w: f64) -> ClusterEdge {
        ClusterEdge {
            invoice_id: i.into(),
            payment_id: p.into(),
            weight: w,
            semantic: w,
            temporal: 1.0,
        }
    }

    /// Cluster whose only invoice underruns the payment by 120 cents with
    /// a weak score: delta 20 after gamma, rescue flagged.
    fn flagged_fixture() -> (Cluster, EngineConfig) {
        let cluster = Cluster {
            id: "cluster_0".into(),
            invoices: vec![inv("inv1", 99_880, "2024-01-10", "AAA010101AAA")],
            payments: vec![pay("pay1", 100_000, "2024-01-12", "AAA010101AAA")],
            edges: vec![edge("inv1", "pay1", 0.3)],
            invoice_total_cents: 99_880,
            payment_total_cents: 100_000,
        };
        (cluster, EngineConfig::default())
    }

    #[test]
    fn accepts_high_scoring_solution() {
        let (cluster, config) = flagged_fixture();
        let solver = LexSolver::new(&config);
        let mut solution = solver.solve(&cluster);
        solution.mean_match_score = 0.95; // pretend the affinity was strong

        let out = rescue(vec![solution], &[cluster], &[], &[], &solver, &config);
        assert_eq!(out.solutions.len(), 1);
        assert!(out.manual_review.is_empty());
        assert_eq!(out.iterations, 0);
    }

    #[test]
    fn accepts_expected_partial_on_instalment() {
        let config = EngineConfig::default();
        let mut invoice = inv("inv1", 10_000, "2024-01-10", "AAA010101AAA");
        invoice.payment_method = Some(PaymentMethod::Instalment);
        let cluster = Cluster {
            id: "cluster_0".into(),
            invoices: vec![invoice],
            payments: vec![pay("pay1", 4_000, "2024-01-12", "AAA010101AAA")],
            edges: vec![edge("inv1", "pay1", 0.4)],
            invoice_total_cents: 10_000,
            payment_total_cents: 4_000,
        };
        let solver = LexSolver::new(&config);
        let solution = solver.solve(&cluster);
        assert!(solution.total_remainder_cents > 0);

        let out = rescue(vec![solution], &[cluster], &[], &[], &solver, &config);
        assert_eq!(out.solutions.len(), 1);
        assert_eq!(out.iterations, 0, "instalment remainder is expected");
    }

    #[test]
    fn orphan_augmentation_resolves_delta() {
        let (cluster, config) = flagged_fixture();
        let solver = LexSolver::new(&config);
        let solution = solver.solve(&cluster);
        assert!(solution.needs_rescue);
        assert_eq!(solution.delta_cents, 20);

        // An orphan invoice within 10 cents of the delta closes the gap.
        let orphan = inv("orphan_inv", 120, "2024-01-11", "AAA010101AAA");
        let out = rescue(
            vec![solution],
            std::slice::from_ref(&cluster),
            &[orphan],
            &[],
            &solver,
            &config,
        );
        assert_eq!(out.solutions.len(), 1);
        assert!(out.manual_review.is_empty());
        let resolved = &out.solutions[0];
        assert_eq!(resolved.delta_cents, 0);
        assert!(!resolved.needs_rescue);
        assert!(out
            .audit
            .iter()
            .any(|e| e.action == AuditAction::RescueTriggered));
    }

    #[test]
    fn merge_with_adjacent_cluster() {
        let (cluster, config) = flagged_fixture();
        let solver = LexSolver::new(&config);
        let solution = solver.solve(&cluster);
        assert!(solution.needs_rescue);

        // Adjacent cluster (same tax id) carrying the missing 120 cents as
        // an invoice alongside its own matched pair.
        let neighbor = Cluster {
            id: "cluster_1".into(),
            invoices: vec![
                inv("inv_n", 50_000, "2024-01-11", "AAA010101AAA"),
                inv("inv_fee", 120, "2024-01-11", "AAA010101AAA"),
            ],
            payments: vec![pay("pay_n", 50_000, "2024-01-12", "AAA010101AAA")],
            edges: vec![edge("inv_n", "pay_n", 0.9)],
            invoice_total_cents: 50_120,
            payment_total_cents: 50_000,
        };
        let clusters = vec![cluster, neighbor];

        let out = rescue(vec![solution], &clusters, &[], &[], &solver, &config);
        assert_eq!(out.solutions.len(), 1);
        assert_eq!(out.revoked_cluster_ids, vec!["cluster_1"]);
        let merged = &out.solutions[0];
        assert!(!merged.needs_rescue);
        assert_eq!(merged.delta_cents, 0);
    }

    #[test]
    fn hard_stop_escalates() {
        let (cluster, mut config) = flagged_fixture();
        config.max_cluster_size = 2;
        config.hard_stop_cluster_size = 2;
        let solver = LexSolver::new(&config);
        let solution = solver.solve(&cluster);
        assert!(solution.needs_rescue);

        let neighbor = Cluster {
            id: "cluster_1".into(),
            invoices: vec![inv("inv_n", 50_000, "2024-01-11", "AAA010101AAA")],
            payments: vec![pay("pay_n", 50_000, "2024-01-12", "AAA010101AAA")],
            edges: vec![edge("inv_n", "pay_n", 0.9)],
            invoice_total_cents: 50_000,
            payment_total_cents: 50_000,
        };
        let clusters = vec![cluster, neighbor];

        let out = rescue(vec![solution], &clusters, &[], &[], &solver, &config);
        assert!(out.hard_stopped);
        assert_eq!(out.manual_review.len(), 1);
        assert!(out.audit.iter().any(|e| e.action == AuditAction::HardStop));
    }

    #[test]
    fn unresolvable_cluster_escalates_with_ids() {
        let (cluster, config) = flagged_fixture();
        let solver = LexSolver::new(&config);
        let solution = solver.solve(&cluster);

        let out = rescue(
            vec![solution],
            std::slice::from_ref(&cluster),
            &[],
            &[],
            &solver,
            &config,
        );
        assert!(out.solutions.is_empty());
        assert_eq!(out.manual_review.len(), 1);
        let case = &out.manual_review[0];
        assert_eq!(case.invoice_ids, vec!["inv1"]);
        assert_eq!(case.payment_ids, vec!["pay1"]);
        assert_eq!(case.solver_delta_cents, 20);
        assert!(out
            .audit
            .iter()
            .any(|e| e.action == AuditAction::ManualReviewRequired));
    }
}
