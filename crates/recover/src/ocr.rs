//! OCR document model, as delivered by the out-of-scope OCR provider.
//! Pages hold ordered rows; rows hold positioned words with confidence.

use serde::{Deserialize, Serialize};

use crate::error::RecoverError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrWord {
    pub text: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrRow {
    pub y_position: f32,
    pub raw_text: String,
    pub words: Vec<OcrWord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrPage {
    pub page_number: u32,
    pub width: f32,
    pub height: f32,
    pub rows: Vec<OcrRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrDocument {
    pub file_path: String,
    pub total_pages: u32,
    pub pages: Vec<OcrPage>,
}

impl OcrDocument {
    pub fn validate(&self) -> Result<(), RecoverError> {
        if self.pages.is_empty() {
            return Err(RecoverError::InvalidInput("document has no pages".into()));
        }
        for page in &self.pages {
            if page.width <= 0.0 || page.height <= 0.0 {
                return Err(RecoverError::InvalidInput(format!(
                    "page {} has non-positive dimensions {}x{}",
                    page.page_number, page.width, page.height
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_document() {
        let doc = OcrDocument {
            file_path: "x.pdf".into(),
            total_pages: 0,
            pages: vec![],
        };
        assert!(matches!(doc.validate(), Err(RecoverError::InvalidInput(_))));
    }

    #[test]
    fn rejects_degenerate_page() {
        let doc = OcrDocument {
            file_path: "x.pdf".into(),
            total_pages: 1,
            pages: vec![OcrPage {
                page_number: 1,
                width: 0.0,
                height: 800.0,
                rows: vec![],
            }],
        };
        assert!(doc.validate().is_err());
    }
}
