use common::error::AppError;
use serde_json::Map;

use super::{number_pages, ParsedDocument};

/// Data rows per synthesized logical page.
const ROWS_PER_PAGE: usize = 100;
/// Hard row cap; anything beyond is dropped and reported via metadata.
const MAX_ROWS: usize = 10_000;

/// Header-row parsing: each data row becomes one line of
/// `Header: value | Header: value | ...`, omitting empty fields. Parse
/// errors on individual records are collected, never fatal.
pub fn parse(bytes: &[u8]) -> Result<ParsedDocument, AppError> {
    let mut reader = ::csv::ReaderBuilder::new()
        .flexible(true)
        .trim(::csv::Trim::All)
        .from_reader(bytes);

    let headers: Vec<String> = match reader.headers() {
        Ok(headers) => headers.iter().map(str::to_string).collect(),
        Err(e) => {
            let mut metadata = Map::new();
            metadata.insert("rowCount".into(), 0.into());
            metadata.insert("truncated".into(), false.into());
            metadata.insert("warnings".into(), vec![e.to_string()].into());
            return Ok(ParsedDocument::new(vec![], "csv", metadata));
        }
    };

    let mut lines: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();
    let mut truncated = false;

    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warnings.push(e.to_string());
                continue;
            }
        };
        if lines.len() >= MAX_ROWS {
            truncated = true;
            break;
        }

        let line = headers
            .iter()
            .enumerate()
            .filter_map(|(idx, header)| {
                let value = record.get(idx).unwrap_or("").trim();
                (!value.is_empty()).then(|| format!("{header}: {value}"))
            })
            .collect::<Vec<_>>()
            .join(" | ");
        lines.push(line);
    }

    let mut metadata = Map::new();
    metadata.insert("columnCount".into(), headers.len().into());
    metadata.insert("rowCount".into(), lines.len().into());
    metadata.insert("truncated".into(), truncated.into());
    if !warnings.is_empty() {
        metadata.insert("warnings".into(), warnings.into());
    }

    let pages = lines
        .chunks(ROWS_PER_PAGE)
        .map(|chunk| chunk.join("\n"))
        .collect();

    Ok(ParsedDocument::new(number_pages(pages), "csv", metadata))
}
