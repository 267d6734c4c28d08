//! Date anchoring and block segmentation. Rows whose leading tokens form a
//! date open a vertical block; words inside a block split into description
//! text and amount candidates by x-position.

use chrono::NaiveDate;
use log::debug;

use crate::hypothesis::{self, Variant};
use crate::ocr::OcrPage;

/// Left fraction of the page scanned for date anchors.
pub const ANCHOR_ZONE: f32 = 0.40;

/// Words right of this fraction of the page width are amount candidates.
/// Single tuned constant for the amount column.
pub const AMOUNT_COLUMN_SPLIT: f32 = 0.50;

/// Tokens of a row prefix considered when matching a date.
const ANCHOR_SCAN_TOKENS: usize = 6;

/// A block reaches up a little above its anchor and stops short of the next.
const BLOCK_TOP_SLACK: f32 = 5.0;
const BLOCK_BOTTOM_MARGIN: f32 = 2.0;

/// Rows carrying these are statement furniture, never transactions.
const NOISE_KEYWORDS: [&str; 8] = [
    "puntos",
    "points",
    "beneficios",
    "total",
    "abonos",
    "cargos",
    "resumen",
    "tipo de cambio",
];

#[derive(Debug, Clone, Copy)]
pub struct Anchor {
    pub date: NaiveDate,
    pub y: f32,
    pub row: usize,
}

/// A vertical slice of a page anchored by a date, with the amount-token
/// hypotheses found inside it.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: usize,
    pub page: u32,
    pub row: u32,
    pub date: NaiveDate,
    /// One variant group per candidate token.
    pub candidates: Vec<Vec<Variant>>,
    pub description: String,
}

// ---------------------------------------------------------------------------
// Date parsing
// ---------------------------------------------------------------------------

fn is_date_sep(c: char) -> bool {
    matches!(c, '.' | '/' | '-')
}

fn month_from_abbr(abbr: &str) -> Option<u32> {
    Some(match abbr {
        "ene" | "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "abr" | "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "ago" | "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dic" | "dec" => 12,
        _ => return None,
    })
}

/// Read up to `max` consecutive digits starting at `start`.
/// Returns (value, digit_count, next_position).
fn read_digits(chars: &[char], start: usize, max: usize) -> Option<(i32, usize, usize)> {
    let mut value: i32 = 0;
    let mut count = 0;
    let mut pos = start;
    while pos < chars.len() && chars[pos].is_ascii_digit() && count < max {
        value = value * 10 + chars[pos].to_digit(10).unwrap() as i32;
        count += 1;
        pos += 1;
    }
    if count == 0 {
        None
    } else {
        Some((value, count, pos))
    }
}

fn normalize_year(raw: i32, digits: usize) -> Option<i32> {
    match digits {
        2 => Some(2000 + raw),
        4 => Some(raw),
        _ => None,
    }
}

/// Parse the first date occurrence in `text`: numeric `D[./-]M[./-]Y?` or
/// `D MMM Y?` with Spanish/English month abbreviations. A missing year takes
/// `year_context`.
pub fn parse_date_str(text: &str, year_context: i32) -> Option<NaiveDate> {
    let chars: Vec<char> = text.chars().collect();
    for i in 0..chars.len() {
        if chars[i].is_ascii_digit() && (i == 0 || !chars[i - 1].is_ascii_digit()) {
            if let Some(date) = try_parse_at(&chars, i, year_context) {
                return Some(date);
            }
        }
    }
    None
}

fn try_parse_at(chars: &[char], start: usize, year_context: i32) -> Option<NaiveDate> {
    let (day, _, after_day) = read_digits(chars, start, 2)?;
    if !(1..=31).contains(&day) {
        return None;
    }

    // Numeric form
    if after_day < chars.len() && is_date_sep(chars[after_day]) {
        if let Some((month, _, after_month)) = read_digits(chars, after_day + 1, 2) {
            if (1..=12).contains(&month) {
                if after_month < chars.len() && is_date_sep(chars[after_month]) {
                    if let Some((raw, digits, after_year)) =
                        read_digits(chars, after_month + 1, 4)
                    {
                        let ends_clean =
                            after_year >= chars.len() || !chars[after_year].is_ascii_digit();
                        if ends_clean {
                            if let Some(year) = normalize_year(raw, digits) {
                                if let Some(d) =
                                    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
                                {
                                    return Some(d);
                                }
                            }
                        }
                    }
                }
                let ends_clean =
                    after_month >= chars.len() || !chars[after_month].is_ascii_digit();
                if ends_clean {
                    if let Some(d) =
                        NaiveDate::from_ymd_opt(year_context, month as u32, day as u32)
                    {
                        return Some(d);
                    }
                }
            }
        }
    }

    // Month-name form
    let mut p = after_day;
    let mut seen_sep = false;
    while p < chars.len() && (chars[p].is_whitespace() || is_date_sep(chars[p])) {
        p += 1;
        seen_sep = true;
    }
    if seen_sep && p + 3 <= chars.len() {
        let abbr: String = chars[p..p + 3].iter().collect::<String>().to_lowercase();
        if let Some(month) = month_from_abbr(&abbr) {
            let after_month = p + 3;
            // "ene" inside "enero" is not an anchor token
            if after_month < chars.len() && chars[after_month].is_alphanumeric() {
                return None;
            }
            let mut q = after_month;
            let mut sep2 = false;
            while q < chars.len() && (chars[q].is_whitespace() || is_date_sep(chars[q])) {
                q += 1;
                sep2 = true;
            }
            if sep2 {
                if let Some((raw, digits, after_year)) = read_digits(chars, q, 4) {
                    let ends_clean =
                        after_year >= chars.len() || !chars[after_year].is_ascii_digit();
                    if ends_clean {
                        if let Some(year) = normalize_year(raw, digits) {
                            if let Some(d) = NaiveDate::from_ymd_opt(year, month, day as u32) {
                                return Some(d);
                            }
                        }
                    }
                }
            }
            return NaiveDate::from_ymd_opt(year_context, month, day as u32);
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Anchors + blocks
// ---------------------------------------------------------------------------

/// Find all date anchors on a page: rows whose leading tokens inside the
/// anchor zone parse as a date. Ordered by row y.
pub fn detect_anchors(page: &OcrPage, year_context: i32) -> Vec<Anchor> {
    let mut anchors = Vec::new();
    let zone = page.width * ANCHOR_ZONE;

    for (row_idx, row) in page.rows.iter().enumerate() {
        let snippet: String = row
            .words
            .iter()
            .filter(|w| w.bounding_box.x < zone)
            .take(ANCHOR_SCAN_TOKENS)
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        if let Some(date) = parse_date_str(&snippet, year_context) {
            anchors.push(Anchor {
                date,
                y: row.y_position,
                row: row_idx,
            });
        }
    }

    anchors.sort_by(|a, b| a.y.total_cmp(&b.y));
    debug!(
        "page {}: {} date anchor(s) detected",
        page.page_number,
        anchors.len()
    );
    anchors
}

/// True when a token looks like an amount candidate. Masked card fragments
/// and bare four-digit integers (years, card tails) are not amounts.
pub fn is_money_token(text: &str) -> bool {
    if text.contains('*') {
        return false;
    }
    if !text.chars().any(|c| c.is_ascii_digit()) {
        return false;
    }
    let clean: String = text
        .chars()
        .filter(|c| *c != '$' && !c.is_whitespace())
        .collect();
    !(clean.len() == 4 && clean.chars().all(|c| c.is_ascii_digit()))
}

/// Slice a page into blocks, one per anchor, numbering them from `first_id`.
pub fn build_blocks(page: &OcrPage, anchors: &[Anchor], first_id: usize) -> Vec<Block> {
    let amount_zone = page.width * AMOUNT_COLUMN_SPLIT;
    let mut blocks = Vec::new();

    for (i, anchor) in anchors.iter().enumerate() {
        let y_end = anchors.get(i + 1).map(|a| a.y).unwrap_or(page.height);
        let y_min = anchor.y - BLOCK_TOP_SLACK;
        let y_max = y_end - BLOCK_BOTTOM_MARGIN;

        let mut words = Vec::new();
        for row in &page.rows {
            let lower = row.raw_text.to_lowercase();
            if NOISE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
                continue;
            }
            if row.y_position >= y_min && row.y_position < y_max {
                words.extend(row.words.iter());
            }
        }
        words.sort_by(|a, b| a.bounding_box.x.total_cmp(&b.bounding_box.x));

        let description = words
            .iter()
            .filter(|w| !is_money_token(&w.text))
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let mut candidates = Vec::new();
        for w in &words {
            if w.bounding_box.x > amount_zone && is_money_token(&w.text) {
                let variants = hypothesis::variants(&w.text);
                if !variants.is_empty() {
                    candidates.push(variants);
                }
            }
        }

        blocks.push(Block {
            id: first_id + i,
            page: page.page_number,
            row: anchor.row as u32,
            date: anchor.date,
            candidates,
            description,
        });
    }

    blocks
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
