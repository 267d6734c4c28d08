//! Safe peeling: commit only provably unambiguous matches up-front, tagged
//! with a time-based reversibility level, and hand everything else to the
//! clustering stage.
//!
//! Two rules, applied per invoice in order: an exact external-reference
//! match, and a unique-amount match guarded by orthogonal text validation.
//! Amount uniqueness alone never commits; that is the anti-greedy-theft
//! safeguard.

use std::collections::HashMap;

use chrono::{Duration, NaiveDate};
use conciliar_core::similarity;
use conciliar_core::{
    AuditAction, AuditEntry, CommitStatus, Confidence, MatchStage, MatchedPair, Txn,
};
use log::{debug, info};
use serde::Serialize;

use crate::config::EngineConfig;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PeelStats {
    pub total_invoices: usize,
    pub total_payments: usize,
    pub matched: usize,
    pub remaining_invoices: usize,
    pub remaining_payments: usize,
    pub hard_commits: usize,
    pub soft_commits: usize,
    pub shadow_commits: usize,
}

#[derive(Debug)]
pub struct PeelOutcome {
    pub matched_pairs: Vec<MatchedPair>,
    pub remaining_invoices: Vec<Txn>,
    pub remaining_payments: Vec<Txn>,
    pub audit: Vec<AuditEntry>,
    pub stats: PeelStats,
}

/// Mean text similarity over the fields both records populate: token-sort
/// on counterparty names, token-set on descriptions, equality on tax ids.
pub fn text_similarity(a: &Txn, b: &Txn) -> f64 {
    let mut scores = Vec::new();

    if let (Some(na), Some(nb)) = (&a.counterparty_name, &b.counterparty_name) {
        if !na.is_empty() && !nb.is_empty() {
            scores.push(similarity::token_sort_ratio(na, nb));
        }
    }
    if !a.description.is_empty() && !b.description.is_empty() {
        scores.push(similarity::token_set_ratio(&a.description, &b.description));
    }
    if let (Some(ta), Some(tb)) = (&a.counterparty_tax_id, &b.counterparty_tax_id) {
        if !ta.is_empty() && !tb.is_empty() {
            scores.push(if ta.eq_ignore_ascii_case(tb) { 1.0 } else { 0.0 });
        }
    }

    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<f64>() / scores.len() as f64
}

/// Commit level from the latest involved date `d` relative to `T`:
/// `d > T` → Shadow, `T + hard_threshold < d ≤ T` → Soft, else Hard.
/// Unknown dates commit Soft.
fn commit_level(
    latest: Option<NaiveDate>,
    reference_date: NaiveDate,
    config: &EngineConfig,
) -> CommitStatus {
    let Some(d) = latest else {
        return CommitStatus::Soft;
    };
    let hard_cutoff = reference_date + Duration::days(config.hard_commit_threshold_days);
    if d > reference_date {
        CommitStatus::Shadow
    } else if d > hard_cutoff {
        CommitStatus::Soft
    } else {
        CommitStatus::Hard
    }
}

fn latest_date(invoice: &Txn, payment: &Txn) -> Option<NaiveDate> {
    match (invoice.date, payment.date) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

pub fn peel(
    invoices: Vec<Txn>,
    payments: Vec<Txn>,
    reference_date: NaiveDate,
    config: &EngineConfig,
) -> PeelOutcome {
    info!(
        "safe peel: {} invoice(s), {} payment(s), T={reference_date}",
        invoices.len(),
        payments.len()
    );

    let mut stats = PeelStats {
        total_invoices: invoices.len(),
        total_payments: payments.len(),
        ..Default::default()
    };

    // Payment lookup indices
    let mut by_reference: HashMap<String, Vec<usize>> = HashMap::new();
    let mut by_amount: HashMap<i64, Vec<usize>> = HashMap::new();
    for (i, pay) in payments.iter().enumerate() {
        for r in pay.external_refs() {
            by_reference.entry(r).or_default().push(i);
        }
        by_amount.entry(pay.amount_cents).or_default().push(i);
    }

    // Amount occurrence counts over I ∪ P inside the uniqueness window.
    let window_start = reference_date - Duration::days(config.uniqueness_window_days);
    let window_end = reference_date
        + Duration::days(config.buffer_days + config.uniqueness_window_days);
    let mut window_counts: HashMap<i64, usize> = HashMap::new();
    for txn in invoices.iter().chain(payments.iter()) {
        if let Some(d) = txn.date {
            if d >= window_start && d <= window_end {
                *window_counts.entry(txn.amount_cents).or_insert(0) += 1;
            }
        }
    }

    let mut pay_used = vec![false; payments.len()];
    let mut inv_matched = vec![false; invoices.len()];
    let mut matched_pairs = Vec::new();
    let mut audit = Vec::new();

    for (ii, invoice) in invoices.iter().enumerate() {
        // Rule 1: exact reference match with equal amounts.
        let mut hit: Option<(usize, f64, &'static str)> = None;
        for r in invoice.external_refs() {
            let candidates: Vec<usize> = by_reference
                .get(&r)
                .map(|v| v.iter().copied().filter(|pi| !pay_used[*pi]).collect())
                .unwrap_or_default();
            if candidates.len() == 1 {
                let pi = candidates[0];
                if payments[pi].amount_cents == invoice.amount_cents {
                    hit = Some((pi, 1.0, "reference_id_match, exact_amount"));
                    break;
                }
            }
        }

        // Rule 2: unique amount in window, validated by an orthogonal text
        // signal before it may commit.
        if hit.is_none() {
            let amount = invoice.amount_cents;
            if window_counts.get(&amount).copied().unwrap_or(0) == 2 {
                let candidates: Vec<usize> = by_amount
                    .get(&amount)
                    .map(|v| v.iter().copied().filter(|pi| !pay_used[*pi]).collect())
                    .unwrap_or_default();
                if candidates.len() == 1 {
                    let pi = candidates[0];
                    let sim = text_similarity(invoice, &payments[pi]);
                    if sim >= config.text_similarity_threshold {
                        hit = Some((pi, sim, "exact_amount, unique_in_window"));
                    } else {
                        debug!(
                            "amount match rejected on text similarity: {} vs {} ({sim:.2})",
                            invoice.id, payments[pi].id
                        );
                    }
                }
            }
        }

        let Some((pi, sim, reason)) = hit else { continue };
        let payment = &payments[pi];

        let latest = latest_date(invoice, payment);
        let status = commit_level(latest, reference_date, config);
        match status {
            CommitStatus::Hard => stats.hard_commits += 1,
            CommitStatus::Soft => stats.soft_commits += 1,
            CommitStatus::Shadow => stats.shadow_commits += 1,
            CommitStatus::Pending => {}
        }

        let reference_match = reason.starts_with("reference");
        let pair = MatchedPair {
            id: format!("peel_{}", matched_pairs.len()),
            invoice_ids: vec![invoice.id.clone()],
            payment_ids: vec![payment.id.clone()],
            invoice_total_cents: invoice.amount_cents,
            payment_total_cents: payment.amount_cents,
            gap_cents: 0,
            semantic_score: sim,
            confidence: if reference_match {
                Confidence::High
            } else {
                Confidence::Medium
            },
            commit_status: status,
            matched_by: MatchStage::SafePeel,
            match_reason: reason.to_string(),
            latest_date: latest,
        };

        audit.push(
            AuditEntry::new(
                AuditAction::SafePeelMatch,
                format!("safe peel match: {reason}"),
            )
            .with_txns(vec![invoice.id.clone(), payment.id.clone()])
            .with_details(serde_json::json!({
                "commit_status": status.to_string(),
                "text_similarity": sim,
                "reference_match": reference_match,
            })),
        );

        matched_pairs.push(pair);
        inv_matched[ii] = true;
        pay_used[pi] = true;
    }

    let remaining_invoices: Vec<Txn> = invoices
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !inv_matched[*i])
        .map(|(_, t)| t)
        .collect();
    let remaining_payments: Vec<Txn> = payments
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !pay_used[*i])
        .map(|(_, t)| t)
        .collect();

    stats.matched = matched_pairs.len();
    stats.remaining_invoices = remaining_invoices.len();
    stats.remaining_payments = remaining_payments.len();

    info!(
        "safe peel complete: {} match(es), {} hard / {} soft / {} shadow",
        stats.matched, stats.hard_commits, stats.soft_commits, stats.shadow_commits
    );

    PeelOutcome {
        matched_pairs,
        remaining_invoices,
        remaining_payments,
        audit,
        stats,
    }
}

/// Advance commit levels as the clock moves past their windows:
/// `Shadow → Soft` once the latest date is at or before `T'`,
/// `Soft → Hard` once it is at or before `T' + hard_threshold`.
/// One level per pass; every promotion is audited.
pub fn promote(
    pairs: &mut [MatchedPair],
    new_reference_date: NaiveDate,
    config: &EngineConfig,
) -> Vec<AuditEntry> {
    let hard_cutoff =
        new_reference_date + Duration::days(config.hard_commit_threshold_days);
    let mut audit = Vec::new();

    for pair in pairs.iter_mut() {
        let Some(d) = pair.latest_date else { continue };
        let old = pair.commit_status;

        match old {
            CommitStatus::Shadow if d <= new_reference_date => {
                pair.commit_status = CommitStatus::Soft;
            }
            CommitStatus::Soft if d <= hard_cutoff => {
                pair.commit_status = CommitStatus::Hard;
            }
            _ => {}
        }

        if pair.commit_status != old {
            audit.push(
                AuditEntry::new(
                    AuditAction::MatchPromoted,
                    format!("commit promoted: {old} -> {}", pair.commit_status),
                )
                .with_txns(
                    pair.invoice_ids
                        .iter()
                        .chain(pair.payment_ids.iter())
                        .cloned()
                        .collect(),
                ),
            );
        }
    }

    audit
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
