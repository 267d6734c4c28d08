use chrono::NaiveDate;
use serde::Serialize;

use crate::audit::AuditLog;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Bank,
    Cfdi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    /// Sign of the balance change this direction produces.
    pub fn sign(&self) -> i64 {
        match self {
            Self::Debit => -1,
            Self::Credit => 1,
        }
    }
}

/// Commit levels ordered by irreversibility: `Hard ≺ Soft ≺ Shadow ≺ Pending`.
///
/// `Hard` is final. `Soft` may be overturned by a strictly better match in a
/// later run. `Shadow` is provisional and lives in the forward buffer window
/// past the reconciliation reference date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Hard,
    Soft,
    Shadow,
    Pending,
}

impl std::fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hard => write!(f, "hard"),
            Self::Soft => write!(f, "soft"),
            Self::Shadow => write!(f, "shadow"),
            Self::Pending => write!(f, "pending"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
    Ambiguous,
}

/// CFDI payment-method flag. `Lump` is a single-exhibition payment (PUE);
/// `Instalment` announces partial or deferred payments (PPD), for which a
/// non-zero remainder is expected rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Lump,
    Instalment,
}

/// Which stage produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStage {
    SafePeel,
    LexSolver,
}

impl std::fmt::Display for MatchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SafePeel => write!(f, "safe_peel"),
            Self::LexSolver => write!(f, "lex_solver"),
        }
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// A canonical financial record from either side of the reconciliation.
///
/// Invoices (CFDI) carry `document_id` and `payment_method`; bank payments
/// carry the balance/OCR fields filled by statement recovery. Amounts are
/// non-negative; `direction` encodes the flow.
#[derive(Debug, Clone)]
pub struct Txn {
    pub id: String,
    pub source: SourceKind,
    pub amount_cents: i64,
    pub direction: Direction,
    pub date: Option<NaiveDate>,
    pub counterparty_name: Option<String>,
    pub counterparty_tax_id: Option<String>,
    pub description: String,
    pub reference: Option<String>,

    // CFDI
    pub document_id: Option<String>,
    pub payment_method: Option<PaymentMethod>,

    // NLP
    pub embedding: Option<Vec<f32>>,

    // Bank statement recovery
    pub balance_before_cents: Option<i64>,
    pub balance_after_cents: Option<i64>,
    pub ocr_confidence: f32,
    pub ocr_raw_text: Option<String>,
    pub shadow_amount_cents: Option<i64>,
    pub source_page: Option<u32>,
    pub source_row: Option<u32>,

    pub commit_status: CommitStatus,
}

impl Default for Txn {
    fn default() -> Self {
        Self {
            id: String::new(),
            source: SourceKind::Bank,
            amount_cents: 0,
            direction: Direction::Debit,
            date: None,
            counterparty_name: None,
            counterparty_tax_id: None,
            description: String::new(),
            reference: None,
            document_id: None,
            payment_method: None,
            embedding: None,
            balance_before_cents: None,
            balance_after_cents: None,
            ocr_confidence: 1.0,
            ocr_raw_text: None,
            shadow_amount_cents: None,
            source_page: None,
            source_row: None,
            commit_status: CommitStatus::Pending,
        }
    }
}

impl Txn {
    /// External references this record exposes, lowercased.
    pub fn external_refs(&self) -> Vec<String> {
        let mut refs = Vec::new();
        if let Some(ref doc) = self.document_id {
            if !doc.is_empty() {
                refs.push(doc.to_lowercase());
            }
        }
        if let Some(ref r) = self.reference {
            if !r.is_empty() {
                refs.push(r.to_lowercase());
            }
        }
        refs
    }

    /// Whether a partial payment is announced by the invoice itself.
    pub fn expects_partial(&self) -> bool {
        self.payment_method == Some(PaymentMethod::Instalment)
    }

    /// Balance recurrence `B_after = B_before + sign(direction) * amount`.
    /// False when either balance is unknown.
    pub fn passes_recurrence_check(&self) -> bool {
        match (self.balance_before_cents, self.balance_after_cents) {
            (Some(before), Some(after)) => {
                after - before == self.direction.sign() * self.amount_cents
            }
            _ => false,
        }
    }

    /// Whether an embedding with non-zero norm is attached. Zero vectors from
    /// a degenerate embedder count as absent so the text fallback takes over.
    pub fn has_embedding(&self) -> bool {
        self.embedding
            .as_ref()
            .map(|e| e.iter().any(|v| *v != 0.0))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Match records
// ---------------------------------------------------------------------------

/// A confirmed match between invoice(s) and payment(s). Never mutated after
/// creation except for commit-level promotion.
#[derive(Debug, Clone, Serialize)]
pub struct MatchedPair {
    pub id: String,
    pub invoice_ids: Vec<String>,
    pub payment_ids: Vec<String>,
    pub invoice_total_cents: i64,
    pub payment_total_cents: i64,
    /// `invoice_total - payment_total`. Operational gaps (fees, rounding)
    /// within the configured caps end up here.
    pub gap_cents: i64,
    pub semantic_score: f64,
    pub confidence: Confidence,
    pub commit_status: CommitStatus,
    pub matched_by: MatchStage,
    pub match_reason: String,
    /// Latest member date; drives commit-level promotion.
    pub latest_date: Option<NaiveDate>,
}

impl MatchedPair {
    pub fn is_exact(&self) -> bool {
        self.gap_cents == 0
    }

    /// Number of documents involved in this match.
    pub fn cardinality(&self) -> usize {
        self.invoice_ids.len() + self.payment_ids.len()
    }
}

/// A match with a remaining unpaid balance on the invoice.
#[derive(Debug, Clone, Serialize)]
pub struct PartialMatch {
    pub id: String,
    pub invoice_id: String,
    pub payment_ids: Vec<String>,
    pub invoice_amount_cents: i64,
    pub paid_cents: i64,
    pub remainder_cents: i64,
    /// True when the invoice's payment method announces instalments.
    pub expected_partial: bool,
    pub semantic_score: f64,
    pub confidence: Confidence,
}

impl PartialMatch {
    pub fn percent_paid(&self) -> f64 {
        if self.invoice_amount_cents == 0 {
            return 0.0;
        }
        self.paid_cents as f64 / self.invoice_amount_cents as f64 * 100.0
    }
}

/// A cluster the pipeline could not resolve, routed to human review.
#[derive(Debug, Clone, Serialize)]
pub struct AmbiguousCase {
    pub id: String,
    pub invoice_ids: Vec<String>,
    pub payment_ids: Vec<String>,
    pub reason: String,
    pub solver_delta_cents: i64,
    pub best_score: f64,
}

// ---------------------------------------------------------------------------
// Run result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconSummary {
    pub total_invoices: usize,
    pub total_payments: usize,
    pub matched_invoices: usize,
    pub matched_payments: usize,
    pub partial_invoices: usize,
    pub unmatched_invoices: usize,
    pub unmatched_payments: usize,
    pub manual_review_count: usize,

    pub total_invoice_cents: i64,
    pub total_payment_cents: i64,
    pub matched_invoice_cents: i64,
    pub unmatched_invoice_cents: i64,
    pub unmatched_payment_cents: i64,
    pub remainder_cents: i64,
    pub total_gap_cents: i64,

    pub clusters_processed: usize,
    pub rescue_iterations: u32,
}

impl ReconSummary {
    /// Percentage of invoices matched (full or partial).
    pub fn invoice_match_rate(&self) -> f64 {
        if self.total_invoices == 0 {
            return 0.0;
        }
        (self.matched_invoices + self.partial_invoices) as f64 / self.total_invoices as f64 * 100.0
    }

    pub fn payment_match_rate(&self) -> f64 {
        if self.total_payments == 0 {
            return 0.0;
        }
        self.matched_payments as f64 / self.total_payments as f64 * 100.0
    }
}

/// Complete output of one reconciliation run.
#[derive(Debug, Serialize)]
pub struct ReconResult {
    pub matched_pairs: Vec<MatchedPair>,
    pub partial_matches: Vec<PartialMatch>,
    pub unmatched_invoices: Vec<String>,
    pub unmatched_payments: Vec<String>,
    pub manual_review: Vec<AmbiguousCase>,
    pub audit_log: AuditLog,
    pub summary: ReconSummary,
    pub status: RunStatus,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ReconResult {
    pub fn empty() -> Self {
        Self {
            matched_pairs: vec![],
            partial_matches: vec![],
            unmatched_invoices: vec![],
            unmatched_payments: vec![],
            manual_review: vec![],
            audit_log: AuditLog::new(),
            summary: ReconSummary::default(),
            status: RunStatus::Completed,
            errors: vec![],
            warnings: vec![],
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
