//! Boundary-condition extraction: start/end balances and the statement year
//! from the document headers and footers.

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::error::RecoverError;
use crate::hypothesis;
use crate::ocr::{OcrPage, OcrRow};

pub const START_BAL_KEYS: [&str; 6] = [
    "saldo anterior",
    "saldo inicial",
    "saldo al corte anterior",
    "adeudo del periodo anterior",
    "adeudo anterior",
    "deuda anterior",
];

pub const END_BAL_KEYS: [&str; 7] = [
    "saldo final",
    "nuevo saldo",
    "saldo al corte",
    "saldo actual",
    "total a pagar",
    "pago para no generar intereses",
    "pago para no generar",
];

/// Rows mentioning these alongside a year get double weight in year inference.
const YEAR_CONTEXT_KEYS: [&str; 5] = ["periodo", "fecha", "corte", "date", "year"];

/// Values at or above this are card numbers, not balances (10^13 cents).
const MAX_BALANCE_CENTS: i64 = 10_000_000_000_000;

/// How many leading pages carry the statement summary.
const HEADER_SCAN_PAGES: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct Boundaries {
    pub start_balance_cents: i64,
    pub end_balance_cents: i64,
}

/// Scan the first pages (and the last page as fallback for the end balance)
/// for the boundary balances.
pub fn extract_boundaries(pages: &[OcrPage]) -> Result<Boundaries, RecoverError> {
    let scan_limit = pages.len().min(HEADER_SCAN_PAGES);

    let mut start = None;
    let mut end = None;

    for page in &pages[..scan_limit] {
        if start.is_none() {
            start = find_balance(page, &START_BAL_KEYS);
        }
        if end.is_none() {
            end = find_balance(page, &END_BAL_KEYS);
        }
        if start.is_some() && end.is_some() {
            break;
        }
    }

    // Summary footers sometimes carry the closing balance on the last page.
    if end.is_none() && pages.len() > scan_limit {
        end = find_balance(&pages[pages.len() - 1], &END_BAL_KEYS);
    }

    match (start, end) {
        (Some(start_balance_cents), Some(end_balance_cents)) => {
            debug!(
                "boundary balances: start={start_balance_cents} end={end_balance_cents}"
            );
            Ok(Boundaries {
                start_balance_cents,
                end_balance_cents,
            })
        }
        _ => {
            warn!(
                "boundary balances incomplete: start={:?} end={:?}",
                start, end
            );
            Err(RecoverError::BoundariesMissing {
                start_found: start.is_some(),
                end_found: end.is_some(),
            })
        }
    }
}

fn find_balance(page: &OcrPage, keywords: &[&str]) -> Option<i64> {
    for (i, row) in page.rows.iter().enumerate() {
        let text_lower = row.raw_text.to_lowercase();
        for kw in keywords {
            if !text_lower.contains(kw) {
                continue;
            }
            let mut nums = numbers_from_row(row);
            if nums.is_empty() {
                // Multi-line header: the value may sit on the next row.
                if let Some(next) = page.rows.get(i + 1) {
                    nums = numbers_from_row(next);
                }
            }
            // The balance is the first number after the keyword; larger
            // unrelated numbers can appear later on the same line.
            if let Some(first) = nums.first() {
                return Some(*first);
            }
        }
    }
    None
}

fn numbers_from_row(row: &OcrRow) -> Vec<i64> {
    row.words
        .iter()
        .filter_map(|w| hypothesis::variants(&w.text).first().map(|v| v.value_cents))
        .filter(|v| *v < MAX_BALANCE_CENTS)
        .collect()
}

/// Infer the statement year from four-digit years on the first pages.
/// Candidates co-occurring with period/date keywords weigh double; ties
/// break toward the later year. Defaults to `current_year`.
pub fn infer_year(pages: &[OcrPage], current_year: i32) -> i32 {
    let scan_limit = pages.len().min(HEADER_SCAN_PAGES);
    let mut scores: BTreeMap<i32, u32> = BTreeMap::new();

    for page in &pages[..scan_limit] {
        for row in &page.rows {
            let lower = row.raw_text.to_lowercase();
            let weight = if YEAR_CONTEXT_KEYS.iter().any(|kw| lower.contains(kw)) {
                2
            } else {
                1
            };
            for year in four_digit_years(&row.raw_text) {
                if (2000..=current_year + 1).contains(&year) {
                    *scores.entry(year).or_insert(0) += weight;
                }
            }
        }
    }

    scores
        .into_iter()
        // Max by (score, year): ties prefer the later year.
        .max_by_key(|(year, score)| (*score, *year))
        .map(|(year, _)| year)
        .unwrap_or(current_year)
}

/// Standalone four-digit numbers starting with "20".
fn four_digit_years(text: &str) -> Vec<i32> {
    let bytes = text.as_bytes();
    let mut years = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i - start == 4 && &text[start..start + 2] == "20" {
                if let Ok(y) = text[start..i].parse() {
                    years.push(y);
                }
            }
        } else {
            i += 1;
        }
    }
    years
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
