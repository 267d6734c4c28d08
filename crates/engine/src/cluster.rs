//! Affinity clustering: build a weighted bipartite graph over residual
//! invoices and payments, then partition it into small solvable clusters
//! with deterministic modularity-based community detection.
//!
//! Edge weight `W(i,j) = semantic · temporal · amount_boost`, kept when
//! `W ≥ 0.1` and clipped to 1. Communities containing only one side are
//! discarded; their members become orphans for the rescue loop. Oversized
//! communities are re-partitioned at doubled resolution, up to depth 3.

use std::collections::{BTreeMap, BTreeSet};

use conciliar_core::similarity;
use conciliar_core::{AuditAction, AuditEntry, Txn};
use log::info;
use serde::Serialize;

use crate::config::EngineConfig;

/// Minimum affinity for an edge to exist.
const MIN_EDGE_WEIGHT: f64 = 0.1;

/// Assumed distance when either side has no date.
const UNKNOWN_DATE_DAYS: i64 = 30;

/// Semantic fallback when no text fields are comparable.
const SEMANTIC_DEFAULT: f64 = 0.3;

/// Maximum re-partitioning depth for oversized communities.
const MAX_SPLIT_DEPTH: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct ClusterEdge {
    pub invoice_id: String,
    pub payment_id: String,
    pub weight: f64,
    pub semantic: f64,
    pub temporal: f64,
}

/// A solvable subproblem: invoices, payments, and the candidate edges
/// between them. Lives from the clustering stage until its solve call.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: String,
    pub invoices: Vec<Txn>,
    pub payments: Vec<Txn>,
    pub edges: Vec<ClusterEdge>,
    pub invoice_total_cents: i64,
    pub payment_total_cents: i64,
}

impl Cluster {
    pub fn size(&self) -> usize {
        self.invoices.len() + self.payments.len()
    }

    /// Uppercased tax ids of all members, for adjacency detection.
    pub fn tax_ids(&self) -> BTreeSet<String> {
        self.invoices
            .iter()
            .chain(self.payments.iter())
            .filter_map(|t| t.counterparty_tax_id.as_ref())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_uppercase())
            .collect()
    }

    /// Concatenate two clusters under a new id.
    pub fn merged(&self, other: &Cluster, id: String) -> Cluster {
        let mut invoices = self.invoices.clone();
        invoices.extend(other.invoices.iter().cloned());
        let mut payments = self.payments.clone();
        payments.extend(other.payments.iter().cloned());
        let mut edges = self.edges.clone();
        edges.extend(other.edges.iter().cloned());
        Cluster {
            id,
            invoices,
            payments,
            edges,
            invoice_total_cents: self.invoice_total_cents + other.invoice_total_cents,
            payment_total_cents: self.payment_total_cents + other.payment_total_cents,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterStats {
    pub total_clusters: usize,
    pub total_edges: usize,
    pub max_cluster_size: usize,
    pub orphan_invoices: usize,
    pub orphan_payments: usize,
}

#[derive(Debug)]
pub struct ClusterOutcome {
    pub clusters: Vec<Cluster>,
    pub orphan_invoices: Vec<Txn>,
    pub orphan_payments: Vec<Txn>,
    pub audit: Vec<AuditEntry>,
    pub stats: ClusterStats,
}

// ---------------------------------------------------------------------------
// Affinity weights
// ---------------------------------------------------------------------------

fn days_between(a: &Txn, b: &Txn) -> i64 {
    match (a.date, b.date) {
        (Some(da), Some(db)) => (da - db).num_days().abs(),
        _ => UNKNOWN_DATE_DAYS,
    }
}

/// Semantic affinity: cosine of embeddings mapped to `[0, 1]` when both are
/// present, else averaged text fallbacks, else 0.3.
pub fn semantic_similarity(a: &Txn, b: &Txn) -> f64 {
    if a.has_embedding() && b.has_embedding() {
        let cos = similarity::cosine(
            a.embedding.as_deref().unwrap_or(&[]),
            b.embedding.as_deref().unwrap_or(&[]),
        );
        return (cos + 1.0) / 2.0;
    }

    let mut scores = Vec::new();
    if let (Some(na), Some(nb)) = (&a.counterparty_name, &b.counterparty_name) {
        if !na.is_empty() && !nb.is_empty() {
            scores.push(similarity::token_sort_ratio(na, nb));
        }
    }
    if let (Some(ta), Some(tb)) = (&a.counterparty_tax_id, &b.counterparty_tax_id) {
        if !ta.is_empty() && !tb.is_empty() {
            scores.push(if ta.eq_ignore_ascii_case(tb) { 1.0 } else { 0.0 });
        }
    }

    if scores.is_empty() {
        SEMANTIC_DEFAULT
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

pub fn temporal_similarity(a: &Txn, b: &Txn, alpha: f64) -> f64 {
    1.0 / (1.0 + alpha * days_between(a, b) as f64)
}

fn amount_boost(a: i64, b: i64) -> f64 {
    let diff_ratio = (a - b).abs() as f64 / (a.max(b).max(1)) as f64;
    if diff_ratio < 0.01 {
        1.5
    } else if diff_ratio < 0.05 {
        1.2
    } else {
        1.0
    }
}

/// Full edge weight, clipped to 1. Returns `(weight, semantic, temporal)`.
pub fn edge_weight(invoice: &Txn, payment: &Txn, config: &EngineConfig) -> (f64, f64, f64) {
    let semantic = semantic_similarity(invoice, payment);
    let temporal = temporal_similarity(invoice, payment, config.temporal_decay_alpha);
    let boost = amount_boost(invoice.amount_cents, payment.amount_cents);
    ((semantic * temporal * boost).min(1.0), semantic, temporal)
}

// ---------------------------------------------------------------------------
// Deterministic modularity communities
// ---------------------------------------------------------------------------

/// Weighted graph for community detection. Node ids are dense indices.
struct WGraph {
    n: usize,
    adj: Vec<Vec<(usize, f64)>>,
    self_loops: Vec<f64>,
    /// Sum of edge weights (each undirected edge once) plus self loops.
    total_weight: f64,
}

impl WGraph {
    fn build(n: usize, edges: &[(usize, usize, f64)]) -> WGraph {
        let mut adj = vec![Vec::new(); n];
        let mut total = 0.0;
        for &(u, v, w) in edges {
            adj[u].push((v, w));
            adj[v].push((u, w));
            total += w;
        }
        WGraph {
            n,
            adj,
            self_loops: vec![0.0; n],
            total_weight: total,
        }
    }

    fn degree(&self, i: usize) -> f64 {
        self.adj[i].iter().map(|(_, w)| w).sum::<f64>() + 2.0 * self.self_loops[i]
    }
}

/// One round of local moving: greedily reassign nodes to the neighbor
/// community with the best modularity gain until a full pass makes no move.
/// Deterministic: nodes visited in index order, ties broken by the smaller
/// community label.
fn local_moving(graph: &WGraph, resolution: f64) -> (Vec<usize>, bool) {
    let two_m = 2.0 * graph.total_weight;
    let mut comm: Vec<usize> = (0..graph.n).collect();
    let mut comm_tot: Vec<f64> = (0..graph.n).map(|i| graph.degree(i)).collect();
    let mut improved = false;

    if two_m == 0.0 {
        return (comm, false);
    }

    loop {
        let mut moved = false;
        for i in 0..graph.n {
            let k_i = graph.degree(i);
            let current = comm[i];

            let mut links: BTreeMap<usize, f64> = BTreeMap::new();
            for &(j, w) in &graph.adj[i] {
                if j != i {
                    *links.entry(comm[j]).or_insert(0.0) += w;
                }
            }

            comm_tot[current] -= k_i;

            let gain = |c: usize, link: f64| link - resolution * k_i * comm_tot[c] / two_m;

            let mut best_comm = current;
            let mut best_gain = gain(current, links.get(&current).copied().unwrap_or(0.0));
            for (&c, &link) in &links {
                if c == current {
                    continue;
                }
                let g = gain(c, link);
                if g > best_gain + 1e-12 || (g > best_gain - 1e-12 && c < best_comm) {
                    best_gain = g;
                    best_comm = c;
                }
            }

            comm_tot[best_comm] += k_i;
            if best_comm != current {
                comm[i] = best_comm;
                moved = true;
                improved = true;
            }
        }
        if !moved {
            break;
        }
    }

    (comm, improved)
}

/// Aggregate communities into super-nodes. Returns the condensed graph and
/// the compact community label per old node.
fn aggregate(graph: &WGraph, comm: &[usize]) -> (WGraph, Vec<usize>) {
    // Compact labels by first appearance for stable numbering.
    let mut compact: BTreeMap<usize, usize> = BTreeMap::new();
    let mut labels = vec![0usize; graph.n];
    for i in 0..graph.n {
        let next = compact.len();
        let label = *compact.entry(comm[i]).or_insert(next);
        labels[i] = label;
    }
    let n_new = compact.len();

    let mut self_loops = vec![0.0; n_new];
    let mut cross: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for i in 0..graph.n {
        self_loops[labels[i]] += graph.self_loops[i];
        for &(j, w) in &graph.adj[i] {
            if j < i {
                continue; // count each undirected edge once
            }
            let (ci, cj) = (labels[i], labels[j]);
            if ci == cj {
                self_loops[ci] += w;
            } else {
                let key = (ci.min(cj), ci.max(cj));
                *cross.entry(key).or_insert(0.0) += w;
            }
        }
    }

    let mut adj = vec![Vec::new(); n_new];
    let mut total = 0.0;
    for (&(u, v), &w) in &cross {
        adj[u].push((v, w));
        adj[v].push((u, w));
        total += w;
    }
    total += self_loops.iter().sum::<f64>();

    (
        WGraph {
            n: n_new,
            adj,
            self_loops,
            total_weight: total,
        },
        labels,
    )
}

/// Full community detection: local moving + aggregation until stable.
/// Returns a community label per node.
pub fn detect_communities(n: usize, edges: &[(usize, usize, f64)], resolution: f64) -> Vec<usize> {
    if n == 0 {
        return vec![];
    }
    let mut graph = WGraph::build(n, edges);
    let mut membership: Vec<usize> = (0..n).collect();

    loop {
        let (comm, improved) = local_moving(&graph, resolution);
        if !improved {
            break;
        }
        let (condensed, labels) = aggregate(&graph, &comm);
        for m in membership.iter_mut() {
            *m = labels[*m];
        }
        if condensed.n == graph.n {
            break;
        }
        graph = condensed;
    }

    membership
}

// ---------------------------------------------------------------------------
// Clustering stage
// ---------------------------------------------------------------------------

/// Node ids: invoices take `0..n_inv`, payments `n_inv..n_inv+n_pay`.
struct Affinity {
    n_inv: usize,
    n_total: usize,
    /// (invoice node, payment node, weight)
    edges: Vec<(usize, usize, f64)>,
    edge_meta: Vec<(f64, f64)>, // (semantic, temporal) per edge
}

fn build_affinity(invoices: &[Txn], payments: &[Txn], config: &EngineConfig) -> Affinity {
    let n_inv = invoices.len();
    let mut edges = Vec::new();
    let mut edge_meta = Vec::new();
    for (i, inv) in invoices.iter().enumerate() {
        for (j, pay) in payments.iter().enumerate() {
            let (w, semantic, temporal) = edge_weight(inv, pay, config);
            if w >= MIN_EDGE_WEIGHT {
                edges.push((i, n_inv + j, w));
                edge_meta.push((semantic, temporal));
            }
        }
    }
    Affinity {
        n_inv,
        n_total: n_inv + payments.len(),
        edges,
        edge_meta,
    }
}

/// Recursively split an oversized node group at doubled resolution.
fn split_group(
    nodes: Vec<usize>,
    affinity: &Affinity,
    config: &EngineConfig,
    depth: u32,
    out: &mut Vec<Vec<usize>>,
) {
    if nodes.len() <= config.max_cluster_size || depth > MAX_SPLIT_DEPTH {
        out.push(nodes);
        return;
    }

    let local_index: BTreeMap<usize, usize> = nodes
        .iter()
        .enumerate()
        .map(|(local, global)| (*global, local))
        .collect();
    let local_edges: Vec<(usize, usize, f64)> = affinity
        .edges
        .iter()
        .filter_map(|(u, v, w)| match (local_index.get(u), local_index.get(v)) {
            (Some(lu), Some(lv)) => Some((*lu, *lv, *w)),
            _ => None,
        })
        .collect();

    let resolution = config.leiden_resolution * f64::powi(2.0, depth as i32 + 1);
    let membership = detect_communities(nodes.len(), &local_edges, resolution);

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (local, label) in membership.iter().enumerate() {
        groups.entry(*label).or_default().push(nodes[local]);
    }

    if groups.len() <= 1 {
        // Could not split further; pass through as-is.
        out.push(nodes);
        return;
    }

    for (_, group) in groups {
        split_group(group, affinity, config, depth + 1, out);
    }
}

pub fn cluster(invoices: Vec<Txn>, payments: Vec<Txn>, config: &EngineConfig) -> ClusterOutcome {
    info!(
        "clustering {} invoice(s) x {} payment(s)",
        invoices.len(),
        payments.len()
    );

    if invoices.is_empty() || payments.is_empty() {
        return ClusterOutcome {
            clusters: vec![],
            orphan_invoices: invoices,
            orphan_payments: payments,
            audit: vec![],
            stats: ClusterStats::default(),
        };
    }

    let affinity = build_affinity(&invoices, &payments, config);
    let membership =
        detect_communities(affinity.n_total, &affinity.edges, config.leiden_resolution);

    let mut communities: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (node, label) in membership.iter().enumerate() {
        communities.entry(*label).or_default().push(node);
    }

    // Oversized communities get re-partitioned under a doubled-resolution
    // schedule before cluster assembly.
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (_, nodes) in communities {
        split_group(nodes, &affinity, config, 0, &mut groups);
    }

    let mut clusters = Vec::new();
    let mut clustered: BTreeSet<usize> = BTreeSet::new();
    let mut audit = Vec::new();

    for nodes in groups {
        let inv_nodes: Vec<usize> = nodes
            .iter()
            .copied()
            .filter(|n| *n < affinity.n_inv)
            .collect();
        let pay_nodes: Vec<usize> = nodes
            .iter()
            .copied()
            .filter(|n| *n >= affinity.n_inv)
            .collect();
        // Single-side communities dissolve into orphans.
        if inv_nodes.is_empty() || pay_nodes.is_empty() {
            continue;
        }

        let node_set: BTreeSet<usize> = nodes.iter().copied().collect();
        let edges: Vec<ClusterEdge> = affinity
            .edges
            .iter()
            .zip(affinity.edge_meta.iter())
            .filter(|((u, v, _), _)| node_set.contains(u) && node_set.contains(v))
            .map(|((u, v, w), (semantic, temporal))| ClusterEdge {
                invoice_id: invoices[*u].id.clone(),
                payment_id: payments[*v - affinity.n_inv].id.clone(),
                weight: *w,
                semantic: *semantic,
                temporal: *temporal,
            })
            .collect();

        let cluster_invoices: Vec<Txn> =
            inv_nodes.iter().map(|n| invoices[*n].clone()).collect();
        let cluster_payments: Vec<Txn> = pay_nodes
            .iter()
            .map(|n| payments[*n - affinity.n_inv].clone())
            .collect();

        clustered.extend(nodes.iter().copied());

        let id = format!("cluster_{}", clusters.len());
        audit.push(
            AuditEntry::new(
                AuditAction::ClusterCreated,
                format!(
                    "cluster {id}: {} invoice(s), {} payment(s), {} edge(s)",
                    cluster_invoices.len(),
                    cluster_payments.len(),
                    edges.len()
                ),
            )
            .with_cluster(id.clone()),
        );

        clusters.push(Cluster {
            id,
            invoice_total_cents: cluster_invoices.iter().map(|t| t.amount_cents).sum(),
            payment_total_cents: cluster_payments.iter().map(|t| t.amount_cents).sum(),
            invoices: cluster_invoices,
            payments: cluster_payments,
            edges,
        });
    }

    let orphan_invoices: Vec<Txn> = invoices
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !clustered.contains(i))
        .map(|(_, t)| t)
        .collect();
    let orphan_payments: Vec<Txn> = payments
        .into_iter()
        .enumerate()
        .filter(|(j, _)| !clustered.contains(&(affinity.n_inv + j)))
        .map(|(_, t)| t)
        .collect();

    let stats = ClusterStats {
        total_clusters: clusters.len(),
        total_edges: affinity.edges.len(),
        max_cluster_size: clusters.iter().map(|c| c.size()).max().unwrap_or(0),
        orphan_invoices: orphan_invoices.len(),
        orphan_payments: orphan_payments.len(),
    };

    info!(
        "clustering complete: {} cluster(s), {} orphan invoice(s), {} orphan payment(s)",
        stats.total_clusters, stats.orphan_invoices, stats.orphan_payments
    );

    ClusterOutcome {
        clusters,
        orphan_invoices,
        orphan_payments,
        audit,
        stats,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
