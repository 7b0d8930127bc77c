//! PDF text-layer extraction with an OCR fallback for image-only pages.

use super::{ExtractError, OcrProvider, Segment};

/// `pdf-extract`'s plain-text output separates pages with a form-feed
/// character; we use that to recover per-page hints without a full layout
/// engine.
const PAGE_BREAK: char = '\x0c';

pub fn extract_pdf(bytes: &[u8], ocr: &dyn OcrProvider) -> Result<Vec<Segment>, ExtractError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;

    let pages: Vec<&str> = if text.contains(PAGE_BREAK) {
        text.split(PAGE_BREAK).collect()
    } else {
        vec![text.as_str()]
    };

    let mut segments = Vec::new();
    for (idx, page_text) in pages.iter().enumerate() {
        let trimmed = page_text.trim();
        if trimmed.is_empty() {
            if ocr.available() {
                // No per-page rasterizer is wired up, so OCR runs against
                // the whole PDF as a best-effort fallback for this page.
                match ocr.ocr_image(bytes) {
                    Ok(text) if !text.trim().is_empty() => {
                        segments.push(Segment {
                            text,
                            page: Some(idx as u32),
                            paragraph: None,
                        });
                    }
                    _ => {
                        tracing::warn!(page = idx, "pdf page has no text layer and OCR produced nothing; skipping");
                    }
                }
            } else {
                tracing::warn!(page = idx, "pdf page has no text layer and no OCR provider is configured; skipping");
            }
            continue;
        }
        segments.push(Segment {
            text: trimmed.to_string(),
            page: Some(idx as u32),
            paragraph: None,
        });
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::UnavailableOcr;

    #[test]
    fn invalid_pdf_bytes_return_pdf_error() {
        let err = extract_pdf(b"not a pdf", &UnavailableOcr).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }
}
