//! Text and vector similarity primitives.
//!
//! Ratios follow the rapidfuzz token_sort / token_set definitions over
//! lowercased whitespace tokens, with normalized Levenshtein as the core
//! string measure. All results are in `[0, 1]`.

use std::collections::BTreeSet;

use strsim::normalized_levenshtein;

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|t| t.to_string())
        .collect()
}

/// Compare the sorted-token joins of both strings.
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let mut ta = tokens(a);
    let mut tb = tokens(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    ta.sort_unstable();
    tb.sort_unstable();
    normalized_levenshtein(&ta.join(" "), &tb.join(" "))
}

/// Token-set ratio: robust to extra tokens on either side. The shared token
/// core compared against each side's full sorted join; best of the three
/// pairings wins.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let sa: BTreeSet<String> = tokens(a).into_iter().collect();
    let sb: BTreeSet<String> = tokens(b).into_iter().collect();
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }

    let common: Vec<&String> = sa.intersection(&sb).collect();
    let only_a: Vec<&String> = sa.difference(&sb).collect();
    let only_b: Vec<&String> = sb.difference(&sa).collect();

    let join = |parts: &[&String]| -> String {
        parts
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    };

    let base = join(&common);
    let full_a = if only_a.is_empty() {
        base.clone()
    } else if base.is_empty() {
        join(&only_a)
    } else {
        format!("{} {}", base, join(&only_a))
    };
    let full_b = if only_b.is_empty() {
        base.clone()
    } else if base.is_empty() {
        join(&only_b)
    } else {
        format!("{} {}", base, join(&only_b))
    };

    let r1 = normalized_levenshtein(&base, &full_a);
    let r2 = normalized_levenshtein(&base, &full_b);
    let r3 = normalized_levenshtein(&full_a, &full_b);
    r1.max(r2).max(r3)
}

/// Cosine similarity over f32 slices. Zero-norm or mismatched inputs
/// yield 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
