//! Three-phase lexicographic integer optimizer, per cluster.
//!
//! The model follows the tripartite residual formulation: inclusion
//! variables `x_i` (invoices) and `y_j` (payments), per-invoice remainders
//! `r_i ∈ [0, a_i]`, an operational gap `γ` capped by
//! `fixed_gap_threshold_cents`, and a technical residual `δ` capped by the
//! hybrid delta allowance, tied together by the balance equation
//! `Σ(x_i·a_i − r_i) − Σ y_j·a_j + γ⁺ − γ⁻ + δ = 0`.
//!
//! Phase 1 minimizes financial error (uncovered payments plus `δ + |γ|`;
//! the uncovered term keeps the empty assignment from being trivially
//! optimal), phase 2 minimizes invoice cardinality within the phase-1 bound
//! plus one cent of integer slack, phase 3 maximizes the integer-scaled
//! affinity score of the selected pairs. A phase that fails or times out
//! falls back to the previous phase's feasible point.
//!
//! The backend is a seam: `SolverBackend` accepts any MILP implementation.
//! The built-in `BranchBoundBackend` is a bounded depth-first search with
//! residual lower bounds, deterministic tie-breaks, a node cap, and
//! deadline checkpoints.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use conciliar_core::{
    AuditAction, AuditEntry, CommitStatus, Confidence, MatchStage, MatchedPair, PartialMatch,
};
use log::{debug, warn};

use crate::cluster::Cluster;
use crate::config::EngineConfig;

/// Affinity weights are scaled by this before entering the integer
/// objective.
pub const SCORE_SCALE: f64 = 1000.0;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ModelEdge {
    pub invoice: usize,
    pub payment: usize,
    /// `⌊1000 · W⌋`
    pub score: i64,
    pub weight: f64,
}

/// Dense per-cluster problem instance: parallel amount tables, edge index
/// tables for both sides, and the causality cuts. One lifetime, the solve
/// call.
#[derive(Debug)]
pub struct ClusterModel {
    pub inv_amounts: Vec<i64>,
    pub pay_amounts: Vec<i64>,
    pub edges: Vec<ModelEdge>,
    pub inv_edges: Vec<Vec<usize>>,
    pub pay_edges: Vec<Vec<usize>>,
    /// Payment index → invoice indices it may not co-select with.
    pub forbids: Vec<Vec<usize>>,
    pub delta_cap: i64,
    pub gamma_cap: i64,
}

impl ClusterModel {
    pub fn build(cluster: &Cluster, config: &EngineConfig) -> ClusterModel {
        let inv_index: HashMap<&str, usize> = cluster
            .invoices
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();
        let pay_index: HashMap<&str, usize> = cluster
            .payments
            .iter()
            .enumerate()
            .map(|(j, t)| (t.id.as_str(), j))
            .collect();

        let mut edges = Vec::new();
        let mut inv_edges = vec![Vec::new(); cluster.invoices.len()];
        let mut pay_edges = vec![Vec::new(); cluster.payments.len()];
        for e in &cluster.edges {
            let (Some(&i), Some(&j)) = (
                inv_index.get(e.invoice_id.as_str()),
                pay_index.get(e.payment_id.as_str()),
            ) else {
                continue;
            };
            let idx = edges.len();
            edges.push(ModelEdge {
                invoice: i,
                payment: j,
                score: (e.weight * SCORE_SCALE) as i64,
                weight: e.weight,
            });
            inv_edges[i].push(idx);
            pay_edges[j].push(idx);
        }

        // Causality: a payment strictly earlier than an invoice minus the
        // buffer may not be selected together with it.
        let buffer = ChronoDuration::days(config.causality_buffer_days);
        let mut forbids = vec![Vec::new(); cluster.payments.len()];
        for (j, pay) in cluster.payments.iter().enumerate() {
            let Some(pay_date) = pay.date else { continue };
            for (i, inv) in cluster.invoices.iter().enumerate() {
                let Some(inv_date) = inv.date else { continue };
                if pay_date < inv_date - buffer {
                    forbids[j].push(i);
                }
            }
        }

        let payment_total: i64 = cluster.payments.iter().map(|t| t.amount_cents).sum();

        ClusterModel {
            inv_amounts: cluster.invoices.iter().map(|t| t.amount_cents).collect(),
            pay_amounts: cluster.payments.iter().map(|t| t.amount_cents).collect(),
            edges,
            inv_edges,
            pay_edges,
            forbids,
            delta_cap: config.allowed_delta(payment_total),
            gamma_cap: config.fixed_gap_threshold_cents,
        }
    }
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Assignment {
    pub invoices: Vec<bool>,
    pub payments: Vec<bool>,
    pub delta_cents: i64,
    /// Signed `γ⁺ − γ⁻`.
    pub gamma_cents: i64,
    pub uncovered_cents: i64,
    /// Phase-1 objective value: `uncovered + δ + |γ|`.
    pub error: i64,
    pub cardinality: usize,
    pub score: i64,
}

#[derive(Debug)]
pub enum SolveOutcome {
    /// Search completed; the assignment is proven optimal for its phase.
    Optimal(Assignment),
    /// Node cap or deadline hit with an incumbent in hand.
    Feasible(Assignment),
    Infeasible,
    /// Deadline hit before any feasible point was found.
    TimedOut,
}

impl SolveOutcome {
    fn into_assignment(self) -> Option<(Assignment, bool)> {
        match self {
            Self::Optimal(a) => Some((a, true)),
            Self::Feasible(a) => Some((a, false)),
            Self::Infeasible | Self::TimedOut => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PhaseObjective {
    MinimizeError,
    MinimizeCardinality {
        error_bound: i64,
    },
    MaximizeScore {
        error_bound: i64,
        cardinality_bound: usize,
    },
}

impl PhaseObjective {
    pub fn number(&self) -> u8 {
        match self {
            Self::MinimizeError => 1,
            Self::MinimizeCardinality { .. } => 2,
            Self::MaximizeScore { .. } => 3,
        }
    }
}

/// Pluggable integer-programming backend. No license-specific code in the
/// core: a Gurobi/HiGHS/CBC adapter implements this trait externally.
pub trait SolverBackend {
    fn solve(
        &self,
        model: &ClusterModel,
        phase: &PhaseObjective,
        time_limit: Duration,
    ) -> SolveOutcome;
}

// ---------------------------------------------------------------------------
// Built-in bounded branch-and-bound backend
// ---------------------------------------------------------------------------

pub struct BranchBoundBackend {
    pub max_nodes: u64,
}

impl Default for BranchBoundBackend {
    fn default() -> Self {
        Self { max_nodes: 500_000 }
    }
}

/// Resolve the residual variables for a fixed selection. `deficit` is
/// `covered payments − selected invoices`; a surplus is absorbed by
/// remainders at no cost, a deficit fills γ first and δ with the rest.
/// `None` when the deficit exceeds both caps: that selection is
/// infeasible.
fn resolve_residuals(
    covered_pay: i64,
    selected_inv: i64,
    gamma_cap: i64,
    delta_cap: i64,
) -> Option<(i64, i64)> {
    let deficit = covered_pay - selected_inv;
    if deficit <= 0 {
        return Some((0, 0));
    }
    let gamma = deficit.min(gamma_cap);
    let delta = deficit - gamma;
    if delta > delta_cap {
        None
    } else {
        Some((gamma, delta))
    }
}

struct Search<'a> {
    model: &'a ClusterModel,
    phase: &'a PhaseObjective,
    deadline: Instant,
    max_nodes: u64,
    nodes: u64,
    timed_out: bool,
    cap_hit: bool,
    proven: bool,

    pay_order: Vec<usize>,
    inv_order: Vec<usize>,
    inv_suffix: Vec<i64>,
    /// Best edge score per payment, suffix-summed over `pay_order`.
    score_suffix: Vec<i64>,
    pay_best_score: Vec<i64>,

    pay_sel: Vec<bool>,
    inv_sel: Vec<bool>,
    forbid_count: Vec<u32>,

    best: Option<Assignment>,
    best_key: i64,
}

impl SolverBackend for BranchBoundBackend {
    fn solve(
        &self,
        model: &ClusterModel,
        phase: &PhaseObjective,
        time_limit: Duration,
    ) -> SolveOutcome {
        let mut pay_order: Vec<usize> = (0..model.pay_amounts.len()).collect();
        pay_order.sort_by_key(|&j| (-model.pay_amounts[j], j));
        let mut inv_order: Vec<usize> = (0..model.inv_amounts.len()).collect();
        inv_order.sort_by_key(|&i| (-model.inv_amounts[i], i));

        let mut inv_suffix = vec![0i64; inv_order.len() + 1];
        for q in (0..inv_order.len()).rev() {
            inv_suffix[q] = inv_suffix[q + 1] + model.inv_amounts[inv_order[q]];
        }

        let pay_best_score: Vec<i64> = (0..model.pay_amounts.len())
            .map(|j| {
                model.pay_edges[j]
                    .iter()
                    .map(|&e| model.edges[e].score)
                    .max()
                    .unwrap_or(0)
            })
            .collect();
        let mut score_suffix = vec![0i64; pay_order.len() + 1];
        for p in (0..pay_order.len()).rev() {
            score_suffix[p] = score_suffix[p + 1] + pay_best_score[pay_order[p]];
        }

        let mut search = Search {
            model,
            phase,
            deadline: Instant::now() + time_limit,
            max_nodes: self.max_nodes,
            nodes: 0,
            timed_out: false,
            cap_hit: false,
            proven: false,
            pay_order,
            inv_order,
            inv_suffix,
            score_suffix,
            pay_best_score,
            pay_sel: vec![false; model.pay_amounts.len()],
            inv_sel: vec![false; model.inv_amounts.len()],
            forbid_count: vec![0; model.inv_amounts.len()],
            best: None,
            best_key: i64::MAX,
        };

        search.branch_payment(0, 0, 0, 0);

        debug!(
            "phase {}: nodes={} timed_out={} cap_hit={}",
            phase.number(),
            search.nodes,
            search.timed_out,
            search.cap_hit
        );

        match search.best {
            Some(a) if search.proven || !(search.timed_out || search.cap_hit) => {
                SolveOutcome::Optimal(a)
            }
            Some(a) => SolveOutcome::Feasible(a),
            None if search.timed_out => SolveOutcome::TimedOut,
            None => SolveOutcome::Infeasible,
        }
    }
}

impl<'a> Search<'a> {
    fn stopped(&mut self) -> bool {
        if self.timed_out || self.cap_hit || self.proven {
            return true;
        }
        self.nodes += 1;
        if self.nodes >= self.max_nodes {
            self.cap_hit = true;
            return true;
        }
        // Deadline checkpoint, amortized.
        if self.nodes % 1024 == 0 && Instant::now() >= self.deadline {
            self.timed_out = true;
            return true;
        }
        false
    }

    fn error_bound(&self) -> i64 {
        match self.phase {
            PhaseObjective::MinimizeError => i64::MAX,
            PhaseObjective::MinimizeCardinality { error_bound } => *error_bound,
            PhaseObjective::MaximizeScore { error_bound, .. } => *error_bound,
        }
    }

    /// Decide payments in order; inclusion first bakes in the preference
    /// for covering the cluster.
    fn branch_payment(&mut self, pos: usize, covered: i64, uncovered: i64, score_ub_lost: i64) {
        if self.stopped() {
            return;
        }

        // Error can only grow past the uncovered value accumulated so far.
        match self.phase {
            PhaseObjective::MinimizeError => {
                if uncovered >= self.best_key {
                    return;
                }
            }
            _ => {
                if uncovered > self.error_bound() {
                    return;
                }
            }
        }
        if let PhaseObjective::MaximizeScore { .. } = self.phase {
            // Optimistic remaining score cannot beat the incumbent.
            let ub = self.score_suffix[0] - score_ub_lost;
            if self.best.is_some() && -ub >= self.best_key {
                return;
            }
        }

        if pos == self.pay_order.len() {
            self.branch_invoice(0, covered, uncovered, 0, 0);
            return;
        }

        let j = self.pay_order[pos];

        // Include
        self.pay_sel[j] = true;
        for &i in &self.model.forbids[j] {
            self.forbid_count[i] += 1;
        }
        self.branch_payment(
            pos + 1,
            covered + self.model.pay_amounts[j],
            uncovered,
            score_ub_lost,
        );
        for &i in &self.model.forbids[j] {
            self.forbid_count[i] -= 1;
        }
        self.pay_sel[j] = false;
        if self.timed_out || self.cap_hit || self.proven {
            return;
        }

        // Exclude
        self.branch_payment(
            pos + 1,
            covered,
            uncovered + self.model.pay_amounts[j],
            score_ub_lost + self.pay_best_score[j],
        );
    }

    fn branch_invoice(
        &mut self,
        pos: usize,
        covered: i64,
        uncovered: i64,
        selected_inv: i64,
        cardinality: usize,
    ) {
        if self.stopped() {
            return;
        }

        // Residual lower bound: even selecting every remaining invoice
        // leaves at least this deficit.
        let min_deficit = covered - selected_inv - self.inv_suffix[pos];
        if min_deficit > self.model.gamma_cap + self.model.delta_cap {
            return;
        }
        let error_lb = uncovered + min_deficit.max(0);
        match self.phase {
            PhaseObjective::MinimizeError => {
                if error_lb >= self.best_key {
                    return;
                }
            }
            _ => {
                if error_lb > self.error_bound() {
                    return;
                }
            }
        }
        match self.phase {
            PhaseObjective::MinimizeCardinality { .. } => {
                if cardinality as i64 >= self.best_key {
                    return;
                }
            }
            PhaseObjective::MaximizeScore {
                cardinality_bound, ..
            } => {
                if cardinality > *cardinality_bound {
                    return;
                }
            }
            PhaseObjective::MinimizeError => {}
        }

        if pos == self.inv_order.len() {
            self.leaf(covered, uncovered, selected_inv, cardinality);
            return;
        }

        let i = self.inv_order[pos];
        let includable = self.forbid_count[i] == 0;

        // Phase 2 hunts for low cardinality, so it tries exclusion first;
        // the other phases prefer inclusion.
        let exclude_first = matches!(self.phase, PhaseObjective::MinimizeCardinality { .. });

        for &include in if exclude_first {
            &[false, true]
        } else {
            &[true, false]
        } {
            if include && !includable {
                continue;
            }
            if include {
                self.inv_sel[i] = true;
                self.branch_invoice(
                    pos + 1,
                    covered,
                    uncovered,
                    selected_inv + self.model.inv_amounts[i],
                    cardinality + 1,
                );
                self.inv_sel[i] = false;
            } else {
                self.branch_invoice(pos + 1, covered, uncovered, selected_inv, cardinality);
            }
            if self.timed_out || self.cap_hit || self.proven {
                return;
            }
        }
    }

    fn leaf(&mut self, covered: i64, uncovered: i64, selected_inv: i64, cardinality: usize) {
        let Some((gamma, delta)) = resolve_residuals(
            covered,
            selected_inv,
            self.model.gamma_cap,
            self.model.delta_cap,
        ) else {
            return;
        };
        let error = uncovered + gamma.abs() + delta;

        match self.phase {
            PhaseObjective::MinimizeError => {}
            PhaseObjective::MinimizeCardinality { error_bound } => {
                if error > *error_bound {
                    return;
                }
            }
            PhaseObjective::MaximizeScore {
                error_bound,
                cardinality_bound,
            } => {
                if error > *error_bound || cardinality > *cardinality_bound {
                    return;
                }
            }
        }

        let score = match self.phase {
            PhaseObjective::MaximizeScore { .. } => self.selection_score(),
            _ => 0,
        };

        let key = match self.phase {
            PhaseObjective::MinimizeError => error,
            PhaseObjective::MinimizeCardinality { .. } => cardinality as i64,
            PhaseObjective::MaximizeScore { .. } => -score,
        };

        // Strict improvement only: the first solution found at a key wins,
        // which keeps the result deterministic.
        if key < self.best_key {
            self.best_key = key;
            self.best = Some(Assignment {
                invoices: self.inv_sel.clone(),
                payments: self.pay_sel.clone(),
                delta_cents: delta,
                gamma_cents: gamma,
                uncovered_cents: uncovered,
                error,
                cardinality,
                score,
            });

            // Nothing can beat a zero objective.
            let optimal_floor = match self.phase {
                PhaseObjective::MinimizeError | PhaseObjective::MinimizeCardinality { .. } => {
                    key == 0
                }
                PhaseObjective::MaximizeScore { .. } => false,
            };
            if optimal_floor {
                self.proven = true;
            }
        }
    }

    /// Maximum pair score for the fixed selection: each covered payment
    /// takes its best edge into the selected invoices.
    fn selection_score(&self) -> i64 {
        let mut total = 0;
        for (j, selected) in self.pay_sel.iter().enumerate() {
            if !selected {
                continue;
            }
            let best = self.model.pay_edges[j]
                .iter()
                .map(|&e| &self.model.edges[e])
                .filter(|e| self.inv_sel[e.invoice])
                .map(|e| e.score)
                .max();
            total += best.unwrap_or(0);
        }
        total
    }
}

// ---------------------------------------------------------------------------
// Lexicographic driver
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ClusterSolution {
    pub cluster_id: String,
    pub matched_pairs: Vec<MatchedPair>,
    pub partial_matches: Vec<PartialMatch>,
    pub unmatched_invoices: Vec<String>,
    pub unmatched_payments: Vec<String>,
    pub delta_cents: i64,
    pub gamma_cents: i64,
    pub total_remainder_cents: i64,
    /// Mean affinity of the emitted matches.
    pub mean_match_score: f64,
    /// Highest phase that produced the assignment in use.
    pub phase_reached: u8,
    pub infeasible: bool,
    pub needs_rescue: bool,
    pub audit: Vec<AuditEntry>,
}

impl ClusterSolution {
    fn unsolved(cluster: &Cluster, audit: Vec<AuditEntry>) -> ClusterSolution {
        ClusterSolution {
            cluster_id: cluster.id.clone(),
            matched_pairs: vec![],
            partial_matches: vec![],
            unmatched_invoices: cluster.invoices.iter().map(|t| t.id.clone()).collect(),
            unmatched_payments: cluster.payments.iter().map(|t| t.id.clone()).collect(),
            delta_cents: 0,
            gamma_cents: 0,
            total_remainder_cents: 0,
            mean_match_score: 0.0,
            phase_reached: 0,
            infeasible: true,
            needs_rescue: true,
            audit,
        }
    }
}

pub struct LexSolver<'a> {
    config: &'a EngineConfig,
    backend: Box<dyn SolverBackend>,
}

impl<'a> LexSolver<'a> {
    pub fn new(config: &'a EngineConfig) -> LexSolver<'a> {
        LexSolver {
            config,
            backend: Box::new(BranchBoundBackend::default()),
        }
    }

    pub fn with_backend(config: &'a EngineConfig, backend: Box<dyn SolverBackend>) -> LexSolver<'a> {
        LexSolver { config, backend }
    }

    pub fn solve(&self, cluster: &Cluster) -> ClusterSolution {
        let model = ClusterModel::build(cluster, self.config);
        let limit = self.config.phase_time_limit();
        let mut audit = Vec::new();

        audit.push(
            AuditEntry::new(
                AuditAction::SolverStarted,
                format!(
                    "solving cluster {}: {} invoice(s), {} payment(s), {} edge(s)",
                    cluster.id,
                    cluster.invoices.len(),
                    cluster.payments.len(),
                    model.edges.len()
                ),
            )
            .with_cluster(cluster.id.clone()),
        );

        // Phase 1: minimize financial error.
        let phase1 = PhaseObjective::MinimizeError;
        let Some((p1, _)) = self
            .backend
            .solve(&model, &phase1, limit)
            .into_assignment()
        else {
            warn!("cluster {}: phase 1 infeasible", cluster.id);
            audit.push(
                AuditEntry::new(
                    AuditAction::SolverPhaseCompleted,
                    "phase 1 found no feasible assignment",
                )
                .with_cluster(cluster.id.clone())
                .with_details(serde_json::json!({"phase": 1, "infeasible": true})),
            );
            return ClusterSolution::unsolved(cluster, audit);
        };
        audit.push(
            AuditEntry::new(AuditAction::SolverPhaseCompleted, "phase 1 complete")
                .with_cluster(cluster.id.clone())
                .with_details(serde_json::json!({
                    "phase": 1,
                    "delta_cents": p1.delta_cents,
                    "gamma_cents": p1.gamma_cents,
                    "uncovered_cents": p1.uncovered_cents,
                })),
        );

        // Phase 2: parsimony within the phase-1 bound (+1 cent of integer
        // slack).
        let phase2 = PhaseObjective::MinimizeCardinality {
            error_bound: p1.error + 1,
        };
        let (p2, mut phase_reached) = match self.backend.solve(&model, &phase2, limit).into_assignment()
        {
            Some((a, _)) => (a, 2u8),
            None => {
                debug!("cluster {}: phase 2 unavailable, reusing phase 1", cluster.id);
                (p1.clone(), 1u8)
            }
        };
        audit.push(
            AuditEntry::new(AuditAction::SolverPhaseCompleted, "phase 2 complete")
                .with_cluster(cluster.id.clone())
                .with_details(serde_json::json!({
                    "phase": 2,
                    "cardinality": p2.cardinality,
                })),
        );

        // Phase 3: quality within the phase-1 and phase-2 bounds.
        let phase3 = PhaseObjective::MaximizeScore {
            error_bound: p1.error + 1,
            cardinality_bound: p2.cardinality + 1,
        };
        let chosen = match self.backend.solve(&model, &phase3, limit).into_assignment() {
            Some((a, _)) => {
                phase_reached = 3;
                a
            }
            None => {
                debug!("cluster {}: phase 3 unavailable, reusing phase 2", cluster.id);
                p2
            }
        };
        audit.push(
            AuditEntry::new(AuditAction::SolverPhaseCompleted, "phase 3 complete")
                .with_cluster(cluster.id.clone())
                .with_details(serde_json::json!({
                    "phase": 3,
                    "score": chosen.score,
                    "delta_cents": chosen.delta_cents,
                })),
        );

        self.extract(cluster, &model, chosen, phase_reached, audit)
    }

    /// Turn an assignment into match records. Each covered payment takes
    /// its best-scoring selected invoice (never overshooting an invoice
    /// beyond the combined gap+delta allowance); per-invoice remainders
    /// then decide between full matches, gap-absorbed matches, and partial
    /// matches.
    fn extract(
        &self,
        cluster: &Cluster,
        model: &ClusterModel,
        assignment: Assignment,
        phase_reached: u8,
        mut audit: Vec<AuditEntry>,
    ) -> ClusterSolution {
        let overshoot = self.config.fixed_gap_threshold_cents + self.config.max_abs_delta_cents;

        let mut paid = vec![0i64; cluster.invoices.len()];
        let mut assigned: Vec<Vec<usize>> = vec![Vec::new(); cluster.invoices.len()];
        let mut pair_weight: Vec<Vec<f64>> = vec![Vec::new(); cluster.invoices.len()];
        let mut pay_paired = vec![false; cluster.payments.len()];

        for j in 0..cluster.payments.len() {
            if !assignment.payments[j] {
                continue;
            }
            let amount = model.pay_amounts[j];
            // Best edge into the selected invoices; ties go to the lower
            // invoice index for determinism.
            let mut best: Option<(i64, usize, f64)> = None;
            for &e in &model.pay_edges[j] {
                let edge = &model.edges[e];
                if !assignment.invoices[edge.invoice] {
                    continue;
                }
                if paid[edge.invoice] + amount > model.inv_amounts[edge.invoice] + overshoot {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((score, inv, _)) => {
                        edge.score > score || (edge.score == score && edge.invoice < inv)
                    }
                };
                if better {
                    best = Some((edge.score, edge.invoice, edge.weight));
                }
            }
            if let Some((_, inv, weight)) = best {
                paid[inv] += amount;
                assigned[inv].push(j);
                pair_weight[inv].push(weight);
                pay_paired[j] = true;
            }
        }

        let mut matched_pairs = Vec::new();
        let mut partial_matches = Vec::new();
        let mut total_remainder = 0i64;
        let mut inv_used = vec![false; cluster.invoices.len()];

        for (i, invoice) in cluster.invoices.iter().enumerate() {
            if !assignment.invoices[i] {
                continue;
            }
            let remainder = model.inv_amounts[i] - paid[i];
            total_remainder += remainder.max(0);
            if assigned[i].is_empty() {
                // Selected purely as a balance absorber; stays unmatched.
                continue;
            }
            inv_used[i] = true;

            let payment_ids: Vec<String> = assigned[i]
                .iter()
                .map(|&j| cluster.payments[j].id.clone())
                .collect();
            let score = pair_weight[i].iter().sum::<f64>() / pair_weight[i].len() as f64;
            let latest = assigned[i]
                .iter()
                .filter_map(|&j| cluster.payments[j].date)
                .chain(invoice.date)
                .max();

            if remainder > self.config.max_abs_delta_cents {
                // A real unpaid portion: partial match.
                partial_matches.push(PartialMatch {
                    id: format!("{}_part_{}", cluster.id, partial_matches.len()),
                    invoice_id: invoice.id.clone(),
                    payment_ids,
                    invoice_amount_cents: invoice.amount_cents,
                    paid_cents: paid[i],
                    remainder_cents: remainder,
                    expected_partial: invoice.expects_partial(),
                    semantic_score: score,
                    confidence: Confidence::Medium,
                });
            } else {
                // Zero or cap-absorbable remainder: full match with a gap.
                matched_pairs.push(MatchedPair {
                    id: format!("{}_pair_{}", cluster.id, matched_pairs.len()),
                    invoice_ids: vec![invoice.id.clone()],
                    payment_ids,
                    invoice_total_cents: invoice.amount_cents,
                    payment_total_cents: paid[i],
                    gap_cents: remainder,
                    semantic_score: score,
                    confidence: Confidence::Medium,
                    commit_status: CommitStatus::Soft,
                    matched_by: MatchStage::LexSolver,
                    match_reason: if phase_reached == 3 {
                        "lexicographic assignment".to_string()
                    } else {
                        "greedy edge assignment".to_string()
                    },
                    latest_date: latest,
                });
            }
        }

        let unmatched_invoices: Vec<String> = cluster
            .invoices
            .iter()
            .enumerate()
            .filter(|(i, _)| !inv_used[*i])
            .map(|(_, t)| t.id.clone())
            .collect();
        let unmatched_payments: Vec<String> = cluster
            .payments
            .iter()
            .enumerate()
            .filter(|(j, _)| !pay_paired[*j])
            .map(|(_, t)| t.id.clone())
            .collect();

        let mean_match_score = {
            let scores: Vec<f64> = matched_pairs
                .iter()
                .map(|p| p.semantic_score)
                .chain(partial_matches.iter().map(|p| p.semantic_score))
                .collect();
            if scores.is_empty() {
                0.0
            } else {
                scores.iter().sum::<f64>() / scores.len() as f64
            }
        };

        let needs_rescue = assignment.delta_cents > 0
            && total_remainder == 0
            && mean_match_score < self.config.rescue_semantic_threshold;

        audit.push(
            AuditEntry::new(
                AuditAction::SolverPhaseCompleted,
                format!(
                    "cluster {} solved: {} pair(s), {} partial(s), delta={} gamma={}",
                    cluster.id,
                    matched_pairs.len(),
                    partial_matches.len(),
                    assignment.delta_cents,
                    assignment.gamma_cents
                ),
            )
            .with_cluster(cluster.id.clone()),
        );

        ClusterSolution {
            cluster_id: cluster.id.clone(),
            matched_pairs,
            partial_matches,
            unmatched_invoices,
            unmatched_payments,
            delta_cents: assignment.delta_cents,
            gamma_cents: assignment.gamma_cents,
            total_remainder_cents: total_remainder,
            mean_match_score,
            phase_reached,
            infeasible: false,
            needs_rescue,
            audit,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterEdge;
    use chrono::NaiveDate;
    use conciliar_core::{Direction, PaymentMethod, SourceKind, Txn};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn inv(id: &str, amount: i64, d: &str) -> Txn {
        Txn {
            id: id.into(),
            source: SourceKind::Cfdi,
            amount_cents: amount,
            direction: Direction::Debit,
            date: Some(date(d)),
            counterparty_name: Some("Proveedor A".into()),
            ..Default::default()
        }
    }

    fn pay(id: &str, amount: i64, d: &str) -> Txn {
        Txn {
            id: id.into(),
            source: SourceKind::Bank,
            amount_cents: amount,
            direction: Direction::Credit,
            date: Some(date(d)),
            counterparty_name: Some("Proveedor A".into()),
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

    fn make_cluster(invoices: Vec<Txn>, payments: Vec<Txn>, edges: Vec<ClusterEdge>) -> Cluster {
        Cluster {
            id: "c0".into(),
            invoice_total_cents: invoices.iter().map(|t| t.amount_cents).sum(),
            payment_total_cents: payments.iter().map(|t| t.amount_cents).sum(),
            invoices,
            payments,
            edges,
        }
    }

    #[test]
    fn balanced_cluster_two_pairs() {
        let cluster = make_cluster(
            vec![inv("inv1", 10_000, "2024-01-10"), inv("inv2", 5_000, "2024-01-15")],
            vec![pay("pay1", 10_000, "2024-01-12"), pay("pay2", 5_000, "2024-01-17")],
            vec![edge("inv1", "pay1", 0.9), edge("inv2", "pay2", 0.85)],
        );
        let config = EngineConfig::default();
        let solution = LexSolver::new(&config).solve(&cluster);

        assert_eq!(solution.delta_cents, 0);
        assert_eq!(solution.matched_pairs.len(), 2);
        assert!(!solution.needs_rescue);
        assert!(solution.unmatched_invoices.is_empty());
        assert!(solution.unmatched_payments.is_empty());
        for pair in &solution.matched_pairs {
            assert_eq!(pair.gap_cents, 0);
            assert_eq!(
                pair.invoice_total_cents - pair.payment_total_cents,
                pair.gap_cents
            );
        }
    }

    #[test]
    fn parsimony_prefers_single_invoice() {
        let cluster = make_cluster(
            vec![
                inv("inv1", 5_000, "2024-01-10"),
                inv("inv2", 5_000, "2024-01-11"),
                inv("inv3", 10_000, "2024-01-12"),
            ],
            vec![pay("pay1", 10_000, "2024-01-15")],
            vec![
                edge("inv1", "pay1", 0.8),
                edge("inv2", "pay1", 0.8),
                edge("inv3", "pay1", 0.85),
            ],
        );
        let config = EngineConfig::default();
        let solution = LexSolver::new(&config).solve(&cluster);

        assert_eq!(solution.matched_pairs.len(), 1);
        let pair = &solution.matched_pairs[0];
        assert_eq!(pair.invoice_ids, vec!["inv3"]);
        assert_eq!(pair.gap_cents, 0);
        // the two 5000s stay unmatched
        assert_eq!(solution.unmatched_invoices.len(), 2);
    }

    #[test]
    fn causality_cut_forbids_pairing() {
        let cluster = make_cluster(
            vec![inv("inv_future", 10_000, "2024-06-15")],
            vec![pay("pay_past", 10_000, "2024-01-01")],
            vec![edge("inv_future", "pay_past", 0.9)],
        );
        let config = EngineConfig::default();
        let solution = LexSolver::new(&config).solve(&cluster);

        assert!(solution.matched_pairs.is_empty());
        assert!(solution.partial_matches.is_empty());
        assert_eq!(solution.unmatched_invoices, vec!["inv_future"]);
        assert_eq!(solution.unmatched_payments, vec!["pay_past"]);
        // the payment stays uncovered, so no technical residual arises
        assert_eq!(solution.delta_cents, 0);
        assert!(!solution.needs_rescue);
    }

    #[test]
    fn underpaid_invoice_becomes_partial_match() {
        let cluster = make_cluster(
            vec![inv("inv1", 10_000, "2024-01-10")],
            vec![pay("pay1", 9_500, "2024-01-12")],
            vec![edge("inv1", "pay1", 0.9)],
        );
        let config = EngineConfig::default();
        let solution = LexSolver::new(&config).solve(&cluster);

        assert!(solution.matched_pairs.is_empty());
        assert_eq!(solution.partial_matches.len(), 1);
        let partial = &solution.partial_matches[0];
        assert_eq!(partial.paid_cents, 9_500);
        assert_eq!(partial.remainder_cents, 500);
        assert_eq!(
            partial.paid_cents + partial.remainder_cents,
            partial.invoice_amount_cents
        );
        assert!(!partial.expected_partial);
        assert_eq!(solution.total_remainder_cents, 500);
        // remainders absorb the imbalance, not delta
        assert_eq!(solution.delta_cents, 0);
    }

    #[test]
    fn small_remainder_becomes_gap() {
        let cluster = make_cluster(
            vec![inv("inv1", 10_030, "2024-01-10")],
            vec![pay("pay1", 10_000, "2024-01-12")],
            vec![edge("inv1", "pay1", 0.9)],
        );
        let config = EngineConfig::default();
        let solution = LexSolver::new(&config).solve(&cluster);

        assert_eq!(solution.matched_pairs.len(), 1);
        let pair = &solution.matched_pairs[0];
        assert_eq!(pair.gap_cents, 30);
        assert!(pair.gap_cents <= config.fixed_gap_threshold_cents + config.max_abs_delta_cents);
        assert!(solution.partial_matches.is_empty());
    }

    #[test]
    fn instalment_invoice_flags_expected_partial() {
        let mut invoice = inv("inv1", 10_000, "2024-01-10");
        invoice.payment_method = Some(PaymentMethod::Instalment);
        let cluster = make_cluster(
            vec![invoice],
            vec![pay("pay1", 4_000, "2024-01-12")],
            vec![edge("inv1", "pay1", 0.9)],
        );
        let config = EngineConfig::default();
        let solution = LexSolver::new(&config).solve(&cluster);

        assert_eq!(solution.partial_matches.len(), 1);
        assert!(solution.partial_matches[0].expected_partial);
    }

    #[test]
    fn overpayment_within_caps_flags_rescue_on_low_score() {
        // payment exceeds the only invoice by 120: gamma absorbs 100,
        // delta takes 20, and the weak affinity trips the rescue flag.
        let cluster = make_cluster(
            vec![inv("inv1", 99_880, "2024-01-10")],
            vec![pay("pay1", 100_000, "2024-01-12")],
            vec![edge("inv1", "pay1", 0.3)],
        );
        let config = EngineConfig::default();
        let solution = LexSolver::new(&config).solve(&cluster);

        assert_eq!(solution.gamma_cents, 100);
        assert_eq!(solution.delta_cents, 20);
        assert_eq!(solution.total_remainder_cents, 0);
        assert!(solution.needs_rescue);
        // the pair itself is emitted with a negative gap within caps
        assert_eq!(solution.matched_pairs.len(), 1);
        assert_eq!(solution.matched_pairs[0].gap_cents, -120);
    }

    #[test]
    fn high_scoring_overpayment_is_accepted() {
        let cluster = make_cluster(
            vec![inv("inv1", 99_880, "2024-01-10")],
            vec![pay("pay1", 100_000, "2024-01-12")],
            vec![edge("inv1", "pay1", 0.95)],
        );
        let config = EngineConfig::default();
        let solution = LexSolver::new(&config).solve(&cluster);
        assert_eq!(solution.delta_cents, 20);
        assert!(!solution.needs_rescue, "high score skips rescue");
    }

    #[test]
    fn uncoverable_payment_left_out() {
        // No invoice can absorb the second payment within caps.
        let cluster = make_cluster(
            vec![inv("inv1", 10_000, "2024-01-10")],
            vec![
                pay("pay1", 10_000, "2024-01-12"),
                pay("stray", 7_777, "2024-01-13"),
            ],
            vec![edge("inv1", "pay1", 0.9)],
        );
        let config = EngineConfig::default();
        let solution = LexSolver::new(&config).solve(&cluster);

        assert_eq!(solution.matched_pairs.len(), 1);
        assert_eq!(solution.unmatched_payments, vec!["stray"]);
        assert_eq!(solution.delta_cents, 0);
    }

    #[test]
    fn phase_errors_never_worsen() {
        let cluster = make_cluster(
            vec![inv("inv1", 10_000, "2024-01-10"), inv("inv2", 5_000, "2024-01-15")],
            vec![pay("pay1", 10_000, "2024-01-12"), pay("pay2", 5_000, "2024-01-17")],
            vec![edge("inv1", "pay1", 0.9), edge("inv2", "pay2", 0.85)],
        );
        let config = EngineConfig::default();
        let model = ClusterModel::build(&cluster, &config);
        let backend = BranchBoundBackend::default();
        let limit = config.phase_time_limit();

        let p1 = match backend.solve(&model, &PhaseObjective::MinimizeError, limit) {
            SolveOutcome::Optimal(a) => a,
            other => panic!("phase 1 should be optimal, got {other:?}"),
        };
        assert_eq!(p1.error, 0);

        let p2 = match backend.solve(
            &model,
            &PhaseObjective::MinimizeCardinality {
                error_bound: p1.error + 1,
            },
            limit,
        ) {
            SolveOutcome::Optimal(a) | SolveOutcome::Feasible(a) => a,
            other => panic!("phase 2 failed: {other:?}"),
        };
        assert!(p2.delta_cents <= p1.delta_cents + 1);

        let p3 = match backend.solve(
            &model,
            &PhaseObjective::MaximizeScore {
                error_bound: p1.error + 1,
                cardinality_bound: p2.cardinality + 1,
            },
            limit,
        ) {
            SolveOutcome::Optimal(a) | SolveOutcome::Feasible(a) => a,
            other => panic!("phase 3 failed: {other:?}"),
        };
        assert!(p3.delta_cents <= p1.delta_cents + 1);
        assert!(p3.score > 0);
    }

    #[test]
    fn deterministic_solutions() {
        let build = || {
            make_cluster(
                vec![
                    inv("inv1", 5_000, "2024-01-10"),
                    inv("inv2", 5_000, "2024-01-11"),
                ],
                vec![pay("pay1", 5_000, "2024-01-12")],
                vec![edge("inv1", "pay1", 0.8), edge("inv2", "pay1", 0.8)],
            )
        };
        let config = EngineConfig::default();
        let a = LexSolver::new(&config).solve(&build());
        let b = LexSolver::new(&config).solve(&build());
        let ids = |s: &ClusterSolution| {
            s.matched_pairs
                .iter()
                .map(|p| (p.invoice_ids.clone(), p.payment_ids.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&a), ids(&b));
        assert_eq!(a.matched_pairs.len(), 1);
    }
}
