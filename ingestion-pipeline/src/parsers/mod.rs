//! Format-specific extraction behind a single normalized page model.
//!
//! Dispatch is a MIME lookup with a source-type fallback: the declared MIME
//! type wins, and when it is unknown the source type inferred at upload time
//! supplies the canonical MIME. Adding a format means one parser module and
//! one arm in each table.

pub mod csv;
pub mod docx;
pub mod html;
pub mod pdf;
pub mod txt;
pub mod xlsx;

use common::error::{AppError, ErrorCode};
use common::storage::types::source_type::SourceType;
use serde_json::{Map, Value};

/// One logical page of extracted text. Page numbers are 1-based and
/// contiguous within a document.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPage {
    pub page_number: i32,
    pub content: String,
}

/// Normalized output contract shared by every parser. An empty document is
/// zero pages and zero counts, not an error at this layer.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub pages: Vec<ParsedPage>,
    pub char_count: usize,
    pub word_count: usize,
    pub metadata: Map<String, Value>,
    pub parser: &'static str,
}

impl ParsedDocument {
    pub fn new(pages: Vec<ParsedPage>, parser: &'static str, metadata: Map<String, Value>) -> Self {
        let char_count = pages.iter().map(|p| p.content.chars().count()).sum();
        let word_count = pages
            .iter()
            .map(|p| p.content.split_whitespace().count())
            .sum();
        Self {
            pages,
            char_count,
            word_count,
            metadata,
            parser,
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

type ParserFn = fn(&[u8]) -> Result<ParsedDocument, AppError>;

/// Primary dispatch table: MIME type (parameters stripped) to parser.
fn by_mime(mime: &str) -> Option<ParserFn> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_lowercase();
    match essence.as_str() {
        "application/pdf" => Some(pdf::parse),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        | "application/msword" => Some(docx::parse),
        "text/plain" | "text/markdown" => Some(txt::parse),
        "text/csv" | "application/csv" => Some(csv::parse),
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        | "application/vnd.ms-excel" => Some(xlsx::parse),
        "text/html" | "application/xhtml+xml" => Some(html::parse),
        _ => None,
    }
}

/// Routes bytes to a parser. Tries the declared MIME first, then the source
/// type's canonical MIME.
pub fn parse(
    bytes: &[u8],
    mime_type: &str,
    source_type: SourceType,
) -> Result<ParsedDocument, AppError> {
    let parser = by_mime(mime_type)
        .or_else(|| by_mime(source_type.canonical_mime()))
        .ok_or_else(|| {
            AppError::ingestion(
                ErrorCode::UnsupportedFormat,
                format!("no parser for MIME type {mime_type} (source type {source_type})"),
            )
        })?;

    parser(bytes)
}

/// Shared newline normalization: CRLF and bare CR become LF.
pub(crate) fn normalize_newlines(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

/// Renumbers pages 1..n after filtering, preserving order.
pub(crate) fn number_pages(contents: Vec<String>) -> Vec<ParsedPage> {
    contents
        .into_iter()
        .enumerate()
        .map(|(idx, content)| ParsedPage {
            page_number: idx as i32 + 1,
            content,
        })
        .collect()
}
