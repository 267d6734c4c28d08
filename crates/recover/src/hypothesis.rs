//! Numeric hypothesis generation. A raw OCR token expands into a small set
//! of value interpretations: standard (`1,234.56`), European separators
//! (`1.234,56`), and OCR character fixes (`l→1, O→0, S/s→5`).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Standard,
    European,
    OcrFix,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::European => write!(f, "european"),
            Self::OcrFix => write!(f, "ocr_fix"),
        }
    }
}

/// One hypothetical value for a numeric token.
#[derive(Debug, Clone)]
pub struct Variant {
    pub value_cents: i64,
    pub confidence: f32,
    pub method: Method,
    pub original_text: String,
}

/// Parse a cleaned numeric string (digits, optional single `.` decimal
/// separator) into integer cents. No floating point: the fractional part is
/// scaled and rounded at two digits.
fn parse_plain_cents(s: &str) -> Option<i64> {
    if s.is_empty() || !s.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let mut parts = s.splitn(2, '.');
    let int_part = parts.next().unwrap_or("");
    let frac_part = parts.next().unwrap_or("");
    if frac_part.contains('.') {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    if int_part.len() > 16 {
        return None;
    }

    let whole: i64 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().ok()?
    };

    let frac: i64 = match frac_part.len() {
        0 => 0,
        1 => frac_part.parse::<i64>().ok()? * 10,
        _ => {
            let two: i64 = frac_part[..2].parse().ok()?;
            let round_up = frac_part.as_bytes()[2..]
                .first()
                .map(|d| *d >= b'5')
                .unwrap_or(false);
            two + if round_up { 1 } else { 0 }
        }
    };

    whole.checked_mul(100).and_then(|w| w.checked_add(frac))
}

fn digit_count(s: &str) -> usize {
    s.chars().filter(|c| c.is_ascii_digit()).count()
}

/// Generate value hypotheses for a raw token, most confident first.
///
/// OCR-fixed variants whose digit count grows by more than one over the raw
/// token are discarded: a correction may repair characters, not change the
/// magnitude of the amount.
pub fn variants(raw: &str) -> Vec<Variant> {
    let clean: String = raw
        .chars()
        .filter(|c| *c != '$' && !c.is_whitespace())
        .collect();
    if clean.is_empty() {
        return vec![];
    }

    let mut out = Vec::new();

    if let Some(value_cents) = parse_plain_cents(&clean.replace(',', "")) {
        out.push(Variant {
            value_cents,
            confidence: 0.9,
            method: Method::Standard,
            original_text: raw.to_string(),
        });
    }

    // European style: dots as thousands, comma as decimal (1.234,56)
    if let (Some(dot), Some(comma)) = (clean.find('.'), clean.find(',')) {
        if dot < comma {
            let swapped = clean.replace('.', "").replace(',', ".");
            if let Some(value_cents) = parse_plain_cents(&swapped) {
                out.push(Variant {
                    value_cents,
                    confidence: 0.8,
                    method: Method::European,
                    original_text: raw.to_string(),
                });
            }
        }
    }

    let fixed: String = clean
        .chars()
        .map(|c| match c {
            'l' => '1',
            'O' => '0',
            'S' | 's' => '5',
            other => other,
        })
        .collect();
    if fixed != clean {
        if let Some(value_cents) = parse_plain_cents(&fixed.replace(',', "")) {
            if digit_count(&fixed).abs_diff(digit_count(&clean)) <= 1 {
                out.push(Variant {
                    value_cents,
                    confidence: 0.7,
                    method: Method::OcrFix,
                    original_text: raw.to_string(),
                });
            }
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
