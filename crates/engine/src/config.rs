use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;

/// Flat configuration record for the whole pipeline. Every key has a tuned
/// default; unknown keys in the TOML are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Safe peeling
    /// Forward buffer past the reference date in which matches commit
    /// provisionally (SHADOW).
    pub buffer_days: i64,
    /// HARD cutoff offset relative to the reference date. Negative.
    pub hard_commit_threshold_days: i64,
    /// Half-width of the amount-uniqueness window.
    pub uniqueness_window_days: i64,
    /// Orthogonal text-validation floor for unique-amount matches.
    pub text_similarity_threshold: f64,

    // Clustering
    pub max_cluster_size: usize,
    pub leiden_resolution: f64,
    /// α in the temporal weight `1/(1 + α·days)`.
    pub temporal_decay_alpha: f64,

    // Solver
    /// Total MILP budget; each phase gets a third.
    pub solver_timeout_seconds: u64,
    /// Absolute cap on the technical residual δ.
    pub max_abs_delta_cents: i64,
    /// Relative δ cap as a fraction of the cluster's payment total.
    pub rel_delta_ratio: f64,
    /// Cap on the operational gap γ (fees, rounding).
    pub fixed_gap_threshold_cents: i64,
    /// Allowed payment-before-invoice slack.
    pub causality_buffer_days: i64,

    // Rescue loop
    pub hard_stop_cluster_size: usize,
    pub rescue_semantic_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_days: 5,
            hard_commit_threshold_days: -2,
            uniqueness_window_days: 2,
            text_similarity_threshold: 0.7,
            max_cluster_size: 100,
            leiden_resolution: 1.0,
            temporal_decay_alpha: 0.1,
            solver_timeout_seconds: 30,
            max_abs_delta_cents: 50,
            rel_delta_ratio: 0.001,
            fixed_gap_threshold_cents: 100,
            causality_buffer_days: 3,
            hard_stop_cluster_size: 500,
            rescue_semantic_threshold: 0.8,
        }
    }
}

impl EngineConfig {
    pub fn from_toml(input: &str) -> Result<Self, EngineError> {
        let config: EngineConfig =
            toml::from_str(input).map_err(|e| EngineError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.buffer_days < 0 {
            return Err(EngineError::ConfigValidation(
                "buffer_days must be non-negative".into(),
            ));
        }
        if self.hard_commit_threshold_days > 0 {
            return Err(EngineError::ConfigValidation(
                "hard_commit_threshold_days must be zero or negative".into(),
            ));
        }
        if self.uniqueness_window_days < 0 {
            return Err(EngineError::ConfigValidation(
                "uniqueness_window_days must be non-negative".into(),
            ));
        }
        for (name, value) in [
            ("text_similarity_threshold", self.text_similarity_threshold),
            ("rescue_semantic_threshold", self.rescue_semantic_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::ConfigValidation(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.max_cluster_size == 0 {
            return Err(EngineError::ConfigValidation(
                "max_cluster_size must be positive".into(),
            ));
        }
        if self.hard_stop_cluster_size < self.max_cluster_size {
            return Err(EngineError::ConfigValidation(
                "hard_stop_cluster_size must be at least max_cluster_size".into(),
            ));
        }
        if self.leiden_resolution <= 0.0 {
            return Err(EngineError::ConfigValidation(
                "leiden_resolution must be positive".into(),
            ));
        }
        if self.temporal_decay_alpha < 0.0 {
            return Err(EngineError::ConfigValidation(
                "temporal_decay_alpha must be non-negative".into(),
            ));
        }
        if self.max_abs_delta_cents < 0 || self.fixed_gap_threshold_cents < 0 {
            return Err(EngineError::ConfigValidation(
                "delta and gap caps must be non-negative".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.rel_delta_ratio) {
            return Err(EngineError::ConfigValidation(
                "rel_delta_ratio must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// δ cap for a cluster: `min(max_abs_delta_cents, ⌊payment_total · rel_ratio⌋)`.
    pub fn allowed_delta(&self, payment_total_cents: i64) -> i64 {
        let relative = (payment_total_cents as f64 * self.rel_delta_ratio) as i64;
        self.max_abs_delta_cents.min(relative)
    }

    /// Time slice for one solver phase.
    pub fn phase_time_limit(&self) -> Duration {
        Duration::from_secs(self.solver_timeout_seconds.max(3) / 3)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
