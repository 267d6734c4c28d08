//! Thin sequencer over the pipeline stages. All intelligence lives in the
//! stages; this module validates input, batches the embedding call, wires
//! stage outputs to the next stage's input, and aggregates the final
//! result.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use conciliar_core::{
    AuditAction, AuditEntry, AuditLog, MatchedPair, ReconResult, ReconSummary, RunStatus, Txn,
};
use conciliar_recover as recover;
use conciliar_recover::OcrDocument;
use log::{info, warn};

use crate::cluster;
use crate::config::EngineConfig;
use crate::embed::Embedder;
use crate::error::EngineError;
use crate::peel;
use crate::rescue;
use crate::solver::LexSolver;

/// Single-writer progress channel: stages publish percent-complete and a
/// phase name through this sink.
pub trait ProgressSink {
    fn publish(&self, percent: f32, phase: &str);
}

pub struct Reconciler<'a> {
    config: EngineConfig,
    embedder: &'a dyn Embedder,
    progress: Option<&'a dyn ProgressSink>,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> Reconciler<'a> {
    pub fn new(config: EngineConfig, embedder: &'a dyn Embedder) -> Reconciler<'a> {
        Reconciler {
            config,
            embedder,
            progress: None,
            cancel: None,
        }
    }

    pub fn with_progress(mut self, sink: &'a dyn ProgressSink) -> Reconciler<'a> {
        self.progress = Some(sink);
        self
    }

    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Reconciler<'a> {
        self.cancel = Some(flag);
        self
    }

    fn publish(&self, percent: f32, phase: &str) {
        if let Some(sink) = self.progress {
            sink.publish(percent, phase);
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Run bank recovery first, then reconcile the recovered payment
    /// stream against the invoices.
    pub fn run_statement(
        &self,
        doc: &OcrDocument,
        invoices: Vec<Txn>,
        reference_date: NaiveDate,
    ) -> ReconResult {
        self.publish(2.0, "recovering bank statement");
        match recover::recover(doc) {
            Ok(statement) => {
                let mut result = self.run(invoices, statement.payments, reference_date);
                let mut audit = AuditLog::new();
                audit.extend(statement.audit);
                for entry in result.audit_log.entries() {
                    audit.record(entry.clone());
                }
                result.audit_log = audit;
                result
            }
            Err(e) => {
                let error = EngineError::from(e);
                warn!("statement recovery failed: {error}");
                let mut result = ReconResult::empty();
                result.status = RunStatus::Failed;
                result.errors.push(error.to_string());
                result.unmatched_invoices = invoices.iter().map(|t| t.id.clone()).collect();
                result.summary.total_invoices = invoices.len();
                result
            }
        }
    }

    pub fn run(
        &self,
        invoices: Vec<Txn>,
        payments: Vec<Txn>,
        reference_date: NaiveDate,
    ) -> ReconResult {
        let mut result = ReconResult::empty();
        let mut audit = AuditLog::new();

        self.publish(5.0, "validating input");
        let (mut invoices, mut payments) =
            sanitize(invoices, payments, &mut audit, &mut result.warnings);

        audit.record(AuditEntry::new(
            AuditAction::TransactionIngested,
            format!(
                "working set: {} invoice(s), {} payment(s)",
                invoices.len(),
                payments.len()
            ),
        ));

        let invoice_amounts: Vec<(String, i64)> = invoices
            .iter()
            .map(|t| (t.id.clone(), t.amount_cents))
            .collect();
        let payment_amounts: Vec<(String, i64)> = payments
            .iter()
            .map(|t| (t.id.clone(), t.amount_cents))
            .collect();

        // Embeddings: one batched call over every record's text.
        self.publish(15.0, "computing embeddings");
        if self.cancelled() {
            return self.abort(result, audit);
        }
        embed_all(self.embedder, &mut invoices, &mut payments);

        // Stage: safe peeling.
        self.publish(30.0, "safe peeling");
        if self.cancelled() {
            return self.abort(result, audit);
        }
        let peeled = peel::peel(invoices, payments, reference_date, &self.config);
        audit.extend(peeled.audit);
        result.matched_pairs.extend(peeled.matched_pairs);

        // Stage: clustering.
        self.publish(50.0, "clustering residual");
        if self.cancelled() {
            return self.abort(result, audit);
        }
        let clustered = cluster::cluster(
            peeled.remaining_invoices,
            peeled.remaining_payments,
            &self.config,
        );
        audit.extend(clustered.audit);

        // Stage: per-cluster lexicographic solve. Clusters share no state;
        // a worker pool could run them concurrently, one worker is used.
        let solver = LexSolver::new(&self.config);
        let total_clusters = clustered.clusters.len().max(1);
        let mut accepted = Vec::new();
        let mut flagged = Vec::new();
        for (n, cl) in clustered.clusters.iter().enumerate() {
            if self.cancelled() {
                // In-flight work is discarded; completed clusters are not
                // aggregated either since the run is aborted.
                return self.abort(result, audit);
            }
            self.publish(
                60.0 + 25.0 * (n as f32 + 1.0) / total_clusters as f32,
                &format!("solving cluster {}/{total_clusters}", n + 1),
            );
            let solution = solver.solve(cl);
            audit.extend(solution.audit.clone());
            if solution.needs_rescue {
                flagged.push(solution);
            } else {
                accepted.push(solution);
            }
        }

        // Stage: rescue loop.
        self.publish(90.0, "rescue loop");
        if self.cancelled() {
            return self.abort(result, audit);
        }
        let mut rescue_iterations = 0;
        if !flagged.is_empty() {
            let rescued = rescue::rescue(
                flagged,
                &clustered.clusters,
                &clustered.orphan_invoices,
                &clustered.orphan_payments,
                &solver,
                &self.config,
            );
            audit.extend(rescued.audit);
            rescue_iterations = rescued.iterations;
            result.manual_review.extend(rescued.manual_review);

            let revoked: BTreeSet<String> = rescued.revoked_cluster_ids.into_iter().collect();
            accepted.retain(|s| !revoked.contains(&s.cluster_id));
            accepted.extend(rescued.solutions);
        }

        for solution in accepted {
            result.matched_pairs.extend(solution.matched_pairs);
            result.partial_matches.extend(solution.partial_matches);
        }

        // Aggregation: every id not claimed by a pair or partial is
        // unmatched.
        self.publish(95.0, "aggregating results");
        let used_invoices: BTreeSet<&str> = result
            .matched_pairs
            .iter()
            .flat_map(|p| p.invoice_ids.iter())
            .map(|s| s.as_str())
            .chain(result.partial_matches.iter().map(|p| p.invoice_id.as_str()))
            .collect();
        let used_payments: BTreeSet<&str> = result
            .matched_pairs
            .iter()
            .flat_map(|p| p.payment_ids.iter())
            .map(|s| s.as_str())
            .chain(
                result
                    .partial_matches
                    .iter()
                    .flat_map(|p| p.payment_ids.iter().map(|s| s.as_str())),
            )
            .collect();

        result.unmatched_invoices = invoice_amounts
            .iter()
            .filter(|(id, _)| !used_invoices.contains(id.as_str()))
            .map(|(id, _)| id.clone())
            .collect();
        result.unmatched_payments = payment_amounts
            .iter()
            .filter(|(id, _)| !used_payments.contains(id.as_str()))
            .map(|(id, _)| id.clone())
            .collect();

        let summary = summarize(
            &result,
            &invoice_amounts,
            &payment_amounts,
            clustered.clusters.len(),
            rescue_iterations,
        );
        result.summary = summary;
        result.audit_log = audit;
        result.status = RunStatus::Completed;

        info!(
            "reconciliation complete: {} pair(s), {} partial(s), {} manual review",
            result.matched_pairs.len(),
            result.partial_matches.len(),
            result.manual_review.len()
        );
        self.publish(100.0, "complete");
        result
    }

    /// Advance commit levels of previously emitted pairs as the clock
    /// moves.
    pub fn promote(
        &self,
        pairs: &mut [MatchedPair],
        new_reference_date: NaiveDate,
    ) -> Vec<AuditEntry> {
        peel::promote(pairs, new_reference_date, &self.config)
    }

    fn abort(&self, mut result: ReconResult, audit: AuditLog) -> ReconResult {
        warn!("run cancelled");
        result.status = RunStatus::Failed;
        result.errors.push(EngineError::Cancelled.to_string());
        result.audit_log = audit;
        result
    }
}

/// Drop malformed records (empty id, negative amount, duplicate id) with a
/// warning; the rest of the run proceeds on the clean working set.
fn sanitize(
    invoices: Vec<Txn>,
    payments: Vec<Txn>,
    audit: &mut AuditLog,
    warnings: &mut Vec<String>,
) -> (Vec<Txn>, Vec<Txn>) {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut check = |txn: &Txn, side: &str| -> Option<String> {
        if txn.id.is_empty() {
            return Some(format!("{side} with empty id dropped"));
        }
        if txn.amount_cents < 0 {
            return Some(format!("{side} '{}' has negative amount", txn.id));
        }
        if !seen.insert(txn.id.clone()) {
            return Some(format!("duplicate id '{}' dropped", txn.id));
        }
        None
    };

    let mut keep = |txns: Vec<Txn>, side: &str, audit: &mut AuditLog, warnings: &mut Vec<String>| {
        let mut kept = Vec::with_capacity(txns.len());
        for txn in txns {
            match check(&txn, side) {
                Some(reason) => {
                    warn!("{reason}");
                    audit.record(
                        AuditEntry::new(AuditAction::ValidationFailed, reason.clone())
                            .with_txns(vec![txn.id.clone()]),
                    );
                    warnings.push(reason);
                }
                None => kept.push(txn),
            }
        }
        kept
    };

    let invoices = keep(invoices, "invoice", audit, warnings);
    let payments = keep(payments, "payment", audit, warnings);
    (invoices, payments)
}

/// One batched encode over all texts; vectors are attached in input order.
fn embed_all(embedder: &dyn Embedder, invoices: &mut [Txn], payments: &mut [Txn]) {
    let text_of = |t: &Txn| {
        let mut parts = Vec::new();
        if let Some(ref name) = t.counterparty_name {
            parts.push(name.clone());
        }
        if !t.description.is_empty() {
            parts.push(t.description.clone());
        }
        if let Some(ref r) = t.reference {
            parts.push(r.clone());
        }
        parts.join(" ")
    };

    let texts: Vec<String> = invoices
        .iter()
        .map(&text_of)
        .chain(payments.iter().map(&text_of))
        .collect();
    let vectors = embedder.encode(&texts);
    if vectors.len() != texts.len() {
        warn!(
            "embedder returned {} vector(s) for {} text(s); embeddings skipped",
            vectors.len(),
            texts.len()
        );
        return;
    }

    let mut it = vectors.into_iter();
    for txn in invoices.iter_mut() {
        let v = it.next().unwrap_or_default();
        if !v.is_empty() {
            txn.embedding = Some(v);
        }
    }
    for txn in payments.iter_mut() {
        let v = it.next().unwrap_or_default();
        if !v.is_empty() {
            txn.embedding = Some(v);
        }
    }
}

fn summarize(
    result: &ReconResult,
    invoice_amounts: &[(String, i64)],
    payment_amounts: &[(String, i64)],
    clusters_processed: usize,
    rescue_iterations: u32,
) -> ReconSummary {
    let matched_invoices: BTreeSet<&str> = result
        .matched_pairs
        .iter()
        .flat_map(|p| p.invoice_ids.iter())
        .map(|s| s.as_str())
        .collect();
    let matched_payments: BTreeSet<&str> = result
        .matched_pairs
        .iter()
        .flat_map(|p| p.payment_ids.iter())
        .map(|s| s.as_str())
        .chain(
            result
                .partial_matches
                .iter()
                .flat_map(|p| p.payment_ids.iter().map(|s| s.as_str())),
        )
        .collect();

    let unmatched_inv: BTreeSet<&str> =
        result.unmatched_invoices.iter().map(|s| s.as_str()).collect();
    let unmatched_pay: BTreeSet<&str> =
        result.unmatched_payments.iter().map(|s| s.as_str()).collect();

    ReconSummary {
        total_invoices: invoice_amounts.len(),
        total_payments: payment_amounts.len(),
        matched_invoices: matched_invoices.len(),
        matched_payments: matched_payments.len(),
        partial_invoices: result.partial_matches.len(),
        unmatched_invoices: result.unmatched_invoices.len(),
        unmatched_payments: result.unmatched_payments.len(),
        manual_review_count: result.manual_review.len(),
        total_invoice_cents: invoice_amounts.iter().map(|(_, a)| a).sum(),
        total_payment_cents: payment_amounts.iter().map(|(_, a)| a).sum(),
        matched_invoice_cents: result
            .matched_pairs
            .iter()
            .map(|p| p.invoice_total_cents)
            .sum(),
        unmatched_invoice_cents: invoice_amounts
            .iter()
            .filter(|(id, _)| unmatched_inv.contains(id.as_str()))
            .map(|(_, a)| a)
            .sum(),
        unmatched_payment_cents: payment_amounts
            .iter()
            .filter(|(id, _)| unmatched_pay.contains(id.as_str()))
            .map(|(_, a)| a)
            .sum(),
        remainder_cents: result
            .partial_matches
            .iter()
            .map(|p| p.remainder_cents)
            .sum(),
        total_gap_cents: result.matched_pairs.iter().map(|p| p.gap_cents).sum(),
        clusters_processed,
        rescue_iterations,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::ZeroEmbedder;
    use chrono::Duration;
    use conciliar_core::{CommitStatus, Confidence, Direction, SourceKind};
    use conciliar_recover::{BoundingBox, OcrPage, OcrRow, OcrWord};

    fn t() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn inv(id: &str, amount: i64, days_from_t: i64, name: &str) -> Txn {
        Txn {
            id: id.into(),
            source: SourceKind::Cfdi,
            amount_cents: amount,
            direction: Direction::Debit,
            date: Some(t() + Duration::days(days_from_t)),
            counterparty_name: Some(name.into()),
            ..Default::default()
        }
    }

    fn pay(id: &str, amount: i64, days_from_t: i64, name: &str) -> Txn {
        Txn {
            id: id.into(),
            source: SourceKind::Bank,
            amount_cents: amount,
            direction: Direction::Credit,
            date: Some(t() + Duration::days(days_from_t)),
            counterparty_name: Some(name.into()),
            ..Default::default()
        }
    }

    fn reconciler<'a>() -> Reconciler<'a> {
        Reconciler::new(EngineConfig::default(), &ZeroEmbedder)
    }

    fn assert_ids_unique(result: &ReconResult) {
        let mut inv_ids = BTreeSet::new();
        let mut pay_ids = BTreeSet::new();
        for p in &result.matched_pairs {
            for id in &p.invoice_ids {
                assert!(inv_ids.insert(id.clone()), "invoice {id} appears twice");
            }
            for id in &p.payment_ids {
                assert!(pay_ids.insert(id.clone()), "payment {id} appears twice");
            }
        }
        for p in &result.partial_matches {
            assert!(
                inv_ids.insert(p.invoice_id.clone()),
                "invoice {} appears twice",
                p.invoice_id
            );
            for id in &p.payment_ids {
                assert!(pay_ids.insert(id.clone()), "payment {id} appears twice");
            }
        }
    }

    #[test]
    fn scenario_exact_reference_match() {
        let mut invoice = inv("inv1", 10_000, -5, "Proveedor A");
        invoice.reference = Some("REF-1".into());
        let mut payment = pay("pay1", 10_000, -5, "Proveedor A");
        payment.reference = Some("REF-1".into());

        let result = reconciler().run(vec![invoice], vec![payment], t());
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.matched_pairs.len(), 1);
        let pair = &result.matched_pairs[0];
        assert_eq!(pair.commit_status, CommitStatus::Hard);
        assert_eq!(pair.confidence, Confidence::High);
        assert_eq!(pair.gap_cents, 0);
        assert!(result.unmatched_invoices.is_empty());
        assert!(result.unmatched_payments.is_empty());
        assert_ids_unique(&result);
    }

    #[test]
    fn scenario_greedy_theft_flows_to_solver() {
        // Two same-amount invoices, one payment: safe peel must not touch
        // them, the solver resolves the ambiguity downstream.
        let invoices = vec![
            inv("invA", 10_000, -1, "Proveedor A"),
            inv("invB", 10_000, -1, "Proveedor B"),
        ];
        let payments = vec![pay("pay1", 10_000, -1, "Proveedor A")];

        let result = reconciler().run(invoices, payments, t());
        assert_eq!(result.status, RunStatus::Completed);
        assert!(result
            .audit_log
            .filter(AuditAction::SafePeelMatch)
            .next()
            .is_none());
        // the solver pairs the payment with exactly one invoice
        assert!(result.matched_pairs.len() <= 1);
        assert_ids_unique(&result);
        let accounted = result.matched_pairs.iter().map(|p| p.invoice_ids.len()).sum::<usize>()
            + result.unmatched_invoices.len();
        assert_eq!(accounted, 2);
    }

    #[test]
    fn scenario_balanced_cluster() {
        let invoices = vec![
            inv("inv1", 10_000, -10, "Proveedor A"),
            inv("inv2", 5_000, -8, "Proveedor A"),
        ];
        let payments = vec![
            pay("pay1", 10_000, -9, "Proveedor A"),
            pay("pay2", 5_000, -7, "Proveedor A"),
        ];

        let result = reconciler().run(invoices, payments, t());
        assert_eq!(result.matched_pairs.len(), 2);
        assert!(result.partial_matches.is_empty());
        assert!(result.manual_review.is_empty());
        for pair in &result.matched_pairs {
            assert_eq!(
                pair.invoice_total_cents - pair.payment_total_cents,
                pair.gap_cents
            );
            assert_eq!(pair.gap_cents, 0);
        }
        assert_ids_unique(&result);
    }

    #[test]
    fn scenario_parsimony() {
        let invoices = vec![
            inv("inv_a", 5_000, -10, "Proveedor A"),
            inv("inv_b", 5_000, -10, "Proveedor A"),
            inv("inv_c", 10_000, -10, "Proveedor A"),
        ];
        let payments = vec![pay("pay1", 10_000, -8, "Proveedor A")];

        let result = reconciler().run(invoices, payments, t());
        assert_eq!(result.matched_pairs.len(), 1);
        assert_eq!(result.matched_pairs[0].invoice_ids, vec!["inv_c"]);
        assert_eq!(result.unmatched_invoices.len(), 2);
        assert_ids_unique(&result);
    }

    #[test]
    fn scenario_causality() {
        let invoices = vec![inv("inv_future", 10_000, 0, "Proveedor A")];
        let mut payments = vec![pay("pay_past", 10_000, 0, "Proveedor A")];
        // payment far before the invoice
        payments[0].date = Some(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());

        let result = reconciler().run(invoices, payments, t());
        assert!(result.matched_pairs.is_empty());
        assert!(result.partial_matches.is_empty());
        assert_eq!(result.unmatched_invoices, vec!["inv_future"]);
        assert_eq!(result.unmatched_payments, vec!["pay_past"]);
    }

    #[test]
    fn scenario_statement_recovery_end_to_end() {
        let word = |text: &str, x: f32| OcrWord {
            text: text.into(),
            confidence: 0.93,
            bounding_box: BoundingBox {
                x,
                y: 0.0,
                w: 40.0,
                h: 10.0,
            },
        };
        let row = |y: f32, words: Vec<OcrWord>| OcrRow {
            y_position: y,
            raw_text: words
                .iter()
                .map(|w| w.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            words,
        };
        let doc = OcrDocument {
            file_path: "estado.pdf".into(),
            total_pages: 1,
            pages: vec![OcrPage {
                page_number: 1,
                width: 600.0,
                height: 800.0,
                rows: vec![
                    row(
                        10.0,
                        vec![word("SALDO", 10.0), word("ANTERIOR", 70.0), word("1,000.00", 200.0)],
                    ),
                    row(
                        20.0,
                        vec![word("SALDO", 10.0), word("FINAL", 70.0), word("850.00", 200.0)],
                    ),
                    row(
                        100.0,
                        vec![
                            word("05/06/2024", 10.0),
                            word("PAGO", 120.0),
                            word("PROVEEDOR", 180.0),
                            word("A", 260.0),
                            word("150.00", 450.0),
                        ],
                    ),
                ],
            }],
        };
        let invoices = vec![inv("inv1", 15_000, 4, "PAGO PROVEEDOR A")];

        let result = reconciler().run_statement(&doc, invoices, t() + chrono::Duration::days(10));
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.matched_pairs.len(), 1);
        let pair = &result.matched_pairs[0];
        assert_eq!(pair.invoice_total_cents, 15_000);
        assert_eq!(pair.payment_total_cents, 15_000);
        assert!(result
            .audit_log
            .filter(AuditAction::TransactionIngested)
            .next()
            .is_some());
    }

    #[test]
    fn statement_failure_is_reported() {
        let doc = OcrDocument {
            file_path: "vacio.pdf".into(),
            total_pages: 0,
            pages: vec![],
        };
        let result = reconciler().run_statement(&doc, vec![inv("inv1", 1_000, 0, "A")], t());
        assert_eq!(result.status, RunStatus::Failed);
        assert!(!result.errors.is_empty());
        assert_eq!(result.unmatched_invoices, vec!["inv1"]);
    }

    #[test]
    fn malformed_records_dropped_with_warnings() {
        let bad = Txn {
            id: String::new(),
            ..Default::default()
        };
        let negative = Txn {
            id: "neg".into(),
            amount_cents: -5,
            ..Default::default()
        };
        let dup_a = inv("dup", 1_000, 0, "A");
        let dup_b = inv("dup", 2_000, 0, "B");

        let result = reconciler().run(vec![bad, dup_a, dup_b], vec![negative], t());
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.warnings.len(), 3);
        assert!(result
            .audit_log
            .filter(AuditAction::ValidationFailed)
            .count() == 3);
        // only the first "dup" survived
        assert_eq!(result.summary.total_invoices, 1);
    }

    #[test]
    fn cancellation_aborts_at_stage_boundary() {
        let flag = AtomicBool::new(true);
        let embedder = ZeroEmbedder;
        let r = Reconciler::new(EngineConfig::default(), &embedder).with_cancel(&flag);
        let result = r.run(
            vec![inv("i", 1_000, 0, "A")],
            vec![pay("p", 1_000, 0, "A")],
            t(),
        );
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.errors.iter().any(|e| e.contains("cancelled")));
        assert!(result.matched_pairs.is_empty());
    }

    #[test]
    fn idempotent_pair_sets() {
        let build_inv = || {
            vec![
                inv("inv1", 10_000, -10, "Proveedor A"),
                inv("inv2", 5_000, -8, "Proveedor A"),
                inv("inv3", 7_770, -4, "Otra Empresa"),
            ]
        };
        let build_pay = || {
            vec![
                pay("pay1", 10_000, -9, "Proveedor A"),
                pay("pay2", 5_000, -7, "Proveedor A"),
                pay("pay3", 7_770, -3, "Otra Empresa"),
            ]
        };

        let a = reconciler().run(build_inv(), build_pay(), t());
        let b = reconciler().run(build_inv(), build_pay(), t());

        let key = |r: &ReconResult| {
            let mut pairs: Vec<(Vec<String>, Vec<String>, i64, i64)> = r
                .matched_pairs
                .iter()
                .map(|p| {
                    (
                        p.invoice_ids.clone(),
                        p.payment_ids.clone(),
                        p.invoice_total_cents,
                        p.payment_total_cents,
                    )
                })
                .collect();
            pairs.sort();
            pairs
        };
        assert_eq!(key(&a), key(&b));
        assert_eq!(a.unmatched_invoices, b.unmatched_invoices);
    }

    #[test]
    fn gap_bound_invariant_holds() {
        let config = EngineConfig::default();
        let invoices = vec![inv("inv1", 99_880, -10, "Proveedor A")];
        let payments = vec![pay("pay1", 100_000, -9, "Proveedor A")];

        let result = reconciler().run(invoices, payments, t());
        for pair in &result.matched_pairs {
            assert!(
                pair.gap_cents.abs()
                    <= config.fixed_gap_threshold_cents + config.max_abs_delta_cents
            );
            assert_eq!(
                pair.invoice_total_cents - pair.payment_total_cents,
                pair.gap_cents
            );
        }
        for partial in &result.partial_matches {
            assert!(partial.remainder_cents > 0);
            assert!(partial.remainder_cents < partial.invoice_amount_cents);
            assert_eq!(
                partial.paid_cents + partial.remainder_cents,
                partial.invoice_amount_cents
            );
        }
    }

    struct RecordingSink(std::sync::Mutex<Vec<String>>);
    impl ProgressSink for RecordingSink {
        fn publish(&self, _percent: f32, phase: &str) {
            self.0.lock().unwrap().push(phase.to_string());
        }
    }

    #[test]
    fn progress_is_published() {
        let sink = RecordingSink(std::sync::Mutex::new(vec![]));
        let embedder = ZeroEmbedder;
        let r = Reconciler::new(EngineConfig::default(), &embedder).with_progress(&sink);
        r.run(
            vec![inv("i", 1_000, 0, "A")],
            vec![pay("p", 1_000, 0, "A")],
            t(),
        );
        let phases = sink.0.lock().unwrap();
        assert_eq!(phases.first().map(|s| s.as_str()), Some("validating input"));
        assert_eq!(phases.last().map(|s| s.as_str()), Some("complete"));
    }
}
