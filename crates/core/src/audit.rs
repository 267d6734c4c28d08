//! Append-only audit trail. Every decision point in the pipeline records an
//! entry with a stable action tag; the log is the human-debuggable trail
//! behind the summarized `errors`/`warnings` of a run.

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    TransactionIngested,
    ValidationFailed,
    OcrCorrection,
    SafePeelMatch,
    MatchPromoted,
    ClusterCreated,
    SolverStarted,
    SolverPhaseCompleted,
    RescueTriggered,
    HardStop,
    ManualReviewRequired,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::TransactionIngested => "transaction_ingested",
            Self::ValidationFailed => "validation_failed",
            Self::OcrCorrection => "ocr_correction",
            Self::SafePeelMatch => "safe_peel_match",
            Self::MatchPromoted => "match_promoted",
            Self::ClusterCreated => "cluster_created",
            Self::SolverStarted => "solver_started",
            Self::SolverPhaseCompleted => "solver_phase_completed",
            Self::RescueTriggered => "rescue_triggered",
            Self::HardStop => "hard_stop",
            Self::ManualReviewRequired => "manual_review_required",
        };
        write!(f, "{tag}")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// RFC 3339 wall-clock timestamp. Ordering within the log reflects
    /// causality between actions, not this field.
    pub timestamp: String,
    pub action: AuditAction,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub txn_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(action: AuditAction, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            action,
            txn_ids: vec![],
            cluster_id: None,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_txns(mut self, ids: Vec<String>) -> Self {
        self.txn_ids = ids;
        self
    }

    pub fn with_cluster(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Append-only audit log.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: AuditEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, entries: Vec<AuditEntry>) {
        self.entries.extend(entries);
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn filter(&self, action: AuditAction) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter().filter(move |e| e.action == action)
    }

    /// Count of entries per action tag.
    pub fn action_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for e in &self.entries {
            *counts.entry(e.action.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Export the full trail as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.entries)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_filter() {
        let mut log = AuditLog::new();
        log.record(AuditEntry::new(AuditAction::SafePeelMatch, "m1").with_txns(vec!["a".into()]));
        log.record(AuditEntry::new(AuditAction::SafePeelMatch, "m2"));
        log.record(AuditEntry::new(AuditAction::RescueTriggered, "r1").with_cluster("c0"));

        assert_eq!(log.len(), 3);
        assert_eq!(log.filter(AuditAction::SafePeelMatch).count(), 2);
        assert_eq!(log.filter(AuditAction::HardStop).count(), 0);

        let counts = log.action_counts();
        assert_eq!(counts["safe_peel_match"], 2);
        assert_eq!(counts["rescue_triggered"], 1);
    }

    #[test]
    fn json_export_includes_tags() {
        let mut log = AuditLog::new();
        log.record(
            AuditEntry::new(AuditAction::SolverPhaseCompleted, "phase 1 done")
                .with_cluster("c3")
                .with_details(serde_json::json!({"delta": 0})),
        );
        let json = log.to_json().unwrap();
        assert!(json.contains("solver_phase_completed"));
        assert!(json.contains("\"delta\": 0"));
    }
}
