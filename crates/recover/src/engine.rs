//! Recovery pipeline: boundaries → year → anchors → blocks → CSP → payments.

use chrono::Datelike;
use conciliar_core::{AuditAction, AuditEntry, SourceKind, Txn};
use log::info;
use serde::Serialize;

use crate::csp;
use crate::error::RecoverError;
use crate::header;
use crate::hypothesis::Method;
use crate::ocr::OcrDocument;
use crate::segment;

/// Tolerance on the global balance equation, in cents.
pub const BALANCE_TOLERANCE_CENTS: i64 = 100;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoverStats {
    pub pages: usize,
    pub blocks: usize,
    pub noise_blocks: usize,
    pub ocr_corrections: usize,
    pub nodes_visited: u64,
    pub nodes_pruned: u64,
}

/// Output of a successful recovery: an ordered, balance-consistent payment
/// list plus the boundary conditions it was solved against.
#[derive(Debug)]
pub struct RecoveredStatement {
    pub payments: Vec<Txn>,
    pub start_balance_cents: i64,
    pub end_balance_cents: i64,
    pub year: i32,
    pub audit: Vec<AuditEntry>,
    pub stats: RecoverStats,
}

/// Recover a statement using the current UTC year as year context.
pub fn recover(doc: &OcrDocument) -> Result<RecoveredStatement, RecoverError> {
    recover_with_year(doc, chrono::Utc::now().date_naive().year())
}

/// Recovery entry point with an explicit current year, for determinism.
pub fn recover_with_year(
    doc: &OcrDocument,
    current_year: i32,
) -> Result<RecoveredStatement, RecoverError> {
    doc.validate()?;

    let boundaries = header::extract_boundaries(&doc.pages)?;
    let year = header::infer_year(&doc.pages, current_year);

    let mut blocks = Vec::new();
    for page in &doc.pages {
        let anchors = segment::detect_anchors(page, year);
        let page_blocks = segment::build_blocks(page, &anchors, blocks.len());
        blocks.extend(page_blocks);
    }
    if blocks.is_empty() {
        return Err(RecoverError::NoAnchors);
    }

    let target_delta = boundaries.end_balance_cents - boundaries.start_balance_cents;
    let solution = csp::solve(&blocks, target_delta, BALANCE_TOLERANCE_CENTS).ok_or(
        RecoverError::CspInfeasible {
            target_delta_cents: target_delta,
            blocks: blocks.len(),
        },
    )?;

    let mut audit = Vec::new();
    let mut payments = Vec::new();
    let mut stats = RecoverStats {
        pages: doc.pages.len(),
        blocks: blocks.len(),
        noise_blocks: solution.nulls,
        ocr_corrections: 0,
        nodes_visited: solution.nodes_visited,
        nodes_pruned: solution.nodes_pruned,
    };

    let mut running = boundaries.start_balance_cents;
    for (block, choice) in blocks.iter().zip(solution.choices.iter()) {
        let Some(choice) = choice else { continue };
        let variant = &block.candidates[choice.group][choice.variant];

        let balance_before = running;
        running += choice.direction.sign() * variant.value_cents;

        let id = format!("bank_p{}_r{}", block.page, block.row);

        if variant.method != Method::Standard {
            stats.ocr_corrections += 1;
            audit.push(
                AuditEntry::new(
                    AuditAction::OcrCorrection,
                    format!(
                        "token '{}' read as {} cents via {}",
                        variant.original_text, variant.value_cents, variant.method
                    ),
                )
                .with_txns(vec![id.clone()]),
            );
        }

        payments.push(Txn {
            id,
            source: SourceKind::Bank,
            amount_cents: variant.value_cents,
            direction: choice.direction,
            date: Some(block.date),
            description: block.description.clone(),
            balance_before_cents: Some(balance_before),
            balance_after_cents: Some(running),
            ocr_confidence: variant.confidence,
            ocr_raw_text: Some(variant.original_text.clone()),
            shadow_amount_cents: if variant.method != Method::Standard {
                Some(variant.value_cents)
            } else {
                None
            },
            source_page: Some(block.page),
            source_row: Some(block.row),
            ..Default::default()
        });
    }

    audit.push(
        AuditEntry::new(
            AuditAction::TransactionIngested,
            format!(
                "recovered {} payment(s) from '{}' ({} block(s), {} noise)",
                payments.len(),
                doc.file_path,
                blocks.len(),
                solution.nulls
            ),
        )
        .with_txns(payments.iter().map(|p| p.id.clone()).collect()),
    );

    info!(
        "recovered {} payment(s), start={} end={}, year={}",
        payments.len(),
        boundaries.start_balance_cents,
        boundaries.end_balance_cents,
        year
    );

    Ok(RecoveredStatement {
        payments,
        start_balance_cents: boundaries.start_balance_cents,
        end_balance_cents: boundaries.end_balance_cents,
        year,
        audit,
        stats,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{BoundingBox, OcrPage, OcrRow, OcrWord};

    fn word(text: &str, x: f32) -> OcrWord {
        OcrWord {
            text: text.into(),
            confidence: 0.93,
            bounding_box: BoundingBox {
                x,
                y: 0.0,
                w: 40.0,
                h: 10.0,
            },
        }
    }

    fn row(y: f32, words: Vec<OcrWord>) -> OcrRow {
        OcrRow {
            y_position: y,
            raw_text: words
                .iter()
                .map(|w| w.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            words,
        }
    }

    fn statement(rows: Vec<OcrRow>) -> OcrDocument {
        OcrDocument {
            file_path: "estado.pdf".into(),
            total_pages: 1,
            pages: vec![OcrPage {
                page_number: 1,
                width: 600.0,
                height: 800.0,
                rows,
            }],
        }
    }

    fn txn_row(y: f32, date: &str, desc: &str, amount: &str) -> OcrRow {
        row(
            y,
            vec![word(date, 10.0), word(desc, 120.0), word(amount, 450.0)],
        )
    }

    fn header_rows() -> Vec<OcrRow> {
        vec![
            row(
                20.0,
                vec![word("SALDO", 10.0), word("ANTERIOR", 70.0), word("1,000.00", 200.0)],
            ),
            row(
                30.0,
                vec![word("SALDO", 10.0), word("FINAL", 70.0), word("800.00", 200.0)],
            ),
        ]
    }

    #[test]
    fn clean_statement_round_trip() {
        let mut rows = header_rows();
        rows.push(txn_row(100.0, "05/03/2024", "TRANSFERENCIA", "150.00"));
        rows.push(txn_row(140.0, "10/03/2024", "PAGO", "50.00"));
        let doc = statement(rows);

        let recovered = recover_with_year(&doc, 2026).unwrap();
        assert_eq!(recovered.start_balance_cents, 100_000);
        assert_eq!(recovered.end_balance_cents, 80_000);
        assert_eq!(recovered.payments.len(), 2);

        let signed: i64 = recovered
            .payments
            .iter()
            .map(|p| p.direction.sign() * p.amount_cents)
            .sum();
        assert_eq!(signed, -20_000);

        for p in &recovered.payments {
            assert!(p.passes_recurrence_check(), "recurrence failed for {}", p.id);
            assert!(p.source_page.is_some());
            assert!(p.source_row.is_some());
        }
        assert_eq!(
            recovered.payments[0].balance_before_cents,
            Some(100_000)
        );
        assert_eq!(
            recovered.payments.last().unwrap().balance_after_cents,
            Some(80_000)
        );
    }

    #[test]
    fn ocr_noise_round_trip() {
        // Scenario: start 1000.00, end 800.00, tokens needing O->0 and l->1.
        let mut rows = header_rows();
        rows.push(txn_row(100.0, "05/03/2024", "CARGO", "150.0O"));
        rows.push(txn_row(140.0, "10/03/2024", "ABONO-SPEI", "50.00"));
        rows.push(txn_row(180.0, "15/03/2024", "CARGO", "l00.00"));
        let doc = statement(rows);

        let recovered = recover_with_year(&doc, 2026).unwrap();
        assert_eq!(recovered.payments.len(), 3);

        let signed: i64 = recovered
            .payments
            .iter()
            .map(|p| p.direction.sign() * p.amount_cents)
            .sum();
        assert_eq!(signed, -20_000);

        assert_eq!(recovered.stats.ocr_corrections, 2);
        let corrected: Vec<_> = recovered
            .payments
            .iter()
            .filter(|p| p.shadow_amount_cents.is_some())
            .collect();
        assert_eq!(corrected.len(), 2);
        assert!(corrected.iter().all(|p| p.ocr_confidence < 0.9));
        assert!(recovered
            .audit
            .iter()
            .any(|e| e.action == AuditAction::OcrCorrection));
    }

    #[test]
    fn statement_without_anchors_fails_typed() {
        let doc = statement(header_rows());
        assert!(matches!(
            recover_with_year(&doc, 2026),
            Err(RecoverError::NoAnchors)
        ));
    }

    #[test]
    fn statement_without_boundaries_fails_typed() {
        let doc = statement(vec![txn_row(100.0, "05/03/2024", "CARGO", "150.00")]);
        assert!(matches!(
            recover_with_year(&doc, 2026),
            Err(RecoverError::BoundariesMissing { .. })
        ));
    }

    #[test]
    fn unreachable_balance_fails_typed() {
        let mut rows = header_rows();
        rows.push(txn_row(100.0, "05/03/2024", "CARGO", "1.00"));
        let doc = statement(rows);
        assert!(matches!(
            recover_with_year(&doc, 2026),
            Err(RecoverError::CspInfeasible { .. })
        ));
    }

    #[test]
    fn idempotent_across_runs() {
        let mut rows = header_rows();
        rows.push(txn_row(100.0, "05/03/2024", "CARGO", "150.0O"));
        rows.push(txn_row(140.0, "10/03/2024", "ABONO", "50.00"));
        rows.push(txn_row(180.0, "15/03/2024", "CARGO", "l00.00"));
        let doc = statement(rows);

        let a = recover_with_year(&doc, 2026).unwrap();
        let b = recover_with_year(&doc, 2026).unwrap();
        let amounts =
            |r: &RecoveredStatement| r.payments.iter().map(|p| (p.id.clone(), p.amount_cents, p.direction.sign())).collect::<Vec<_>>();
        assert_eq!(amounts(&a), amounts(&b));
    }
}
