use std::io::Read;

use common::error::{AppError, ErrorCode};
use serde_json::Map;

use super::{number_pages, ParsedDocument};

/// Paragraphs per synthesized logical page. DOCX has no hard page
/// boundaries, so paragraph count stands in for them.
const PARAGRAPHS_PER_PAGE: usize = 50;
/// Zip-bomb protection for the decompressed document part.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

pub fn parse(bytes: &[u8]) -> Result<ParsedDocument, AppError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| {
        AppError::ingestion(ErrorCode::FileCorrupted, format!("corrupt docx archive: {e}"))
    })?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive.by_name("word/document.xml").map_err(|e| {
            AppError::ingestion(
                ErrorCode::FileCorrupted,
                format!("corrupt docx: word/document.xml missing: {e}"),
            )
        })?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| AppError::Processing(format!("failed to read docx body: {e}")))?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(AppError::ingestion(
                ErrorCode::FileTooLarge,
                "word/document.xml exceeds the size limit",
            ));
        }
    }

    let (paragraphs, warnings) = extract_paragraphs(&doc_xml)?;

    let mut metadata = Map::new();
    metadata.insert("paragraphCount".into(), paragraphs.len().into());
    if !warnings.is_empty() {
        metadata.insert("warnings".into(), warnings.into());
    }

    let pages = paragraphs
        .chunks(PARAGRAPHS_PER_PAGE)
        .map(|chunk| chunk.join("\n\n"))
        .collect();

    Ok(ParsedDocument::new(number_pages(pages), "docx", metadata))
}

/// Walks `word/document.xml`, gathering the text runs of each `w:p` into a
/// paragraph. Formatting is discarded; empty paragraphs are skipped.
fn extract_paragraphs(xml: &[u8]) -> Result<(Vec<String>, Vec<String>), AppError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);

    let mut paragraphs = Vec::new();
    let mut warnings = Vec::new();
    let mut current = String::new();
    let mut in_text_run = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = true,
                b"tab" => current.push('\t'),
                _ => {}
            },
            Ok(quick_xml::events::Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_text_run => {
                match te.unescape() {
                    Ok(text) => current.push_str(&text),
                    Err(e) => warnings.push(format!("unescape failed: {e}")),
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => {
                    let paragraph = current.trim();
                    if !paragraph.is_empty() {
                        paragraphs.push(paragraph.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(AppError::ingestion(
                    ErrorCode::FileCorrupted,
                    format!("corrupt docx XML: {e}"),
                ))
            }
            _ => {}
        }
        buf.clear();
    }

    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }

    Ok((paragraphs, warnings))
}
