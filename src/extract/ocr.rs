//! Optional OCR hook used as a fallback when a PDF page has no text layer,
//! and directly for image documents.
//!
//! No OCR engine ships with this crate — running one (tesseract bindings,
//! a cloud vision API, …) is an operational choice outside the indexing
//! engine's concern. [`UnavailableOcr`] is the default: pages/images that
//! would need OCR are skipped with a logged warning rather than failing the
//! whole document.

pub trait OcrProvider: Send + Sync {
    fn available(&self) -> bool;

    /// Run OCR over an image (or whole PDF, as a same-granularity fallback
    /// when per-page rasterization isn't available) and return extracted text.
    fn ocr_image(&self, bytes: &[u8]) -> Result<String, String>;
}

pub struct UnavailableOcr;

impl OcrProvider for UnavailableOcr {
    fn available(&self) -> bool {
        false
    }

    fn ocr_image(&self, _bytes: &[u8]) -> Result<String, String> {
        Err("no OCR provider configured".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_ocr_is_never_available() {
        assert!(!UnavailableOcr.available());
        assert!(UnavailableOcr.ocr_image(b"x").is_err());
    }
}
