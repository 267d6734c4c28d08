//! `conciliar-recover` — Bank-statement structural recovery.
//!
//! Turns noisy OCR output into a validated, mathematically consistent list
//! of dated debit/credit payments by solving a global constraint problem
//! over OCR-ambiguous numeric tokens: boundary balances anchor a balance
//! equation, date anchors slice the pages into blocks, each numeric token
//! expands into value hypotheses, and a backtracking solver picks one
//! interpretation per block so the statement sums from start balance to end
//! balance.

pub mod csp;
pub mod engine;
pub mod error;
pub mod header;
pub mod hypothesis;
pub mod ocr;
pub mod segment;

pub use engine::{recover, recover_with_year, RecoveredStatement};
pub use error::RecoverError;
pub use ocr::{BoundingBox, OcrDocument, OcrPage, OcrRow, OcrWord};
