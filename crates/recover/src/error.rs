use std::fmt;

#[derive(Debug)]
pub enum RecoverError {
    /// Start or end balance not found in the document headers/footers.
    BoundariesMissing { start_found: bool, end_found: bool },
    /// No date anchors detected on any page.
    NoAnchors,
    /// No variant assignment satisfies the global balance equation.
    CspInfeasible { target_delta_cents: i64, blocks: usize },
    /// Malformed OCR document.
    InvalidInput(String),
}

impl fmt::Display for RecoverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BoundariesMissing { start_found, end_found } => write!(
                f,
                "boundary balances missing (start found: {start_found}, end found: {end_found})"
            ),
            Self::NoAnchors => write!(f, "no date anchors detected"),
            Self::CspInfeasible { target_delta_cents, blocks } => write!(
                f,
                "no variant assignment over {blocks} block(s) reaches target delta {target_delta_cents}"
            ),
            Self::InvalidInput(msg) => write!(f, "invalid OCR document: {msg}"),
        }
    }
}

impl std::error::Error for RecoverError {}
