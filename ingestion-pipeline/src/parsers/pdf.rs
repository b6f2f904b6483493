use common::error::{AppError, ErrorCode};
use serde_json::Map;

use super::{normalize_newlines, number_pages, ParsedDocument};

/// Page-boundary sentinel emitted by the layout extractor.
const PAGE_SENTINEL: char = '\u{c}';

/// Structural extraction first, preserving real page boundaries; the
/// layout-based extractor is the fallback when the primary yields nothing
/// or fails outright. Neither path loads external fonts or touches the
/// network.
pub fn parse(bytes: &[u8]) -> Result<ParsedDocument, AppError> {
    match parse_structural(bytes) {
        Ok(doc) if doc.char_count > 0 => Ok(doc),
        Ok(empty_doc) => match parse_layout(bytes) {
            Ok(doc) if doc.char_count > 0 => Ok(doc),
            // Both extractors agree there is no text: keep the structural
            // page count so the gates can tell "empty" from "needs OCR".
            _ => Ok(empty_doc),
        },
        Err(primary_err) => parse_layout(bytes).map_err(|_| primary_err),
    }
}

/// Primary: per-page text extraction over the document structure. A page
/// that fails to extract degrades to an empty page rather than aborting
/// the document.
fn parse_structural(bytes: &[u8]) -> Result<ParsedDocument, AppError> {
    let document = lopdf::Document::load_mem(bytes).map_err(|e| {
        AppError::ingestion(ErrorCode::FileCorrupted, format!("invalid pdf: {e}"))
    })?;

    let mut page_numbers: Vec<u32> = document.get_pages().keys().copied().collect();
    page_numbers.sort_unstable();

    let mut failed_pages = 0usize;
    let pages: Vec<String> = page_numbers
        .iter()
        .map(|&number| match document.extract_text(&[number]) {
            Ok(text) => normalize_newlines(text.trim()),
            Err(e) => {
                failed_pages += 1;
                tracing::debug!(page = number, error = %e, "page extraction failed");
                String::new()
            }
        })
        .collect();

    let mut metadata = Map::new();
    metadata.insert("variant".into(), "structural".into());
    if failed_pages > 0 {
        metadata.insert("failedPages".into(), failed_pages.into());
    }

    Ok(ParsedDocument::new(number_pages(pages), "pdf", metadata))
}

/// Fallback: whole-document layout extraction, re-split on the page
/// sentinel the extractor plants at boundaries.
fn parse_layout(bytes: &[u8]) -> Result<ParsedDocument, AppError> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| AppError::ingestion(ErrorCode::ParseFailed, format!("pdf layout extraction failed: {e}")))?;

    let pages: Vec<String> = text
        .split(PAGE_SENTINEL)
        .map(|segment| normalize_newlines(segment.trim()))
        .collect();
    // Trailing sentinel produces one empty tail segment, not a page.
    let pages = trim_trailing_empty(pages);

    let mut metadata = Map::new();
    metadata.insert("variant".into(), "layout".into());

    Ok(ParsedDocument::new(number_pages(pages), "pdf", metadata))
}

fn trim_trailing_empty(mut pages: Vec<String>) -> Vec<String> {
    while pages.last().is_some_and(|p| p.is_empty()) && pages.len() > 1 {
        pages.pop();
    }
    if pages.len() == 1 && pages[0].is_empty() {
        pages.clear();
    }
    pages
}
