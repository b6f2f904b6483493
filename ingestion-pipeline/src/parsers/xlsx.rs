use std::io::Read;

use chrono::{Duration, NaiveDate};
use common::error::{AppError, ErrorCode};
use serde_json::Map;

use super::{number_pages, ParsedDocument};

/// Hard cap on data rows per sheet; overflow is recorded per sheet.
const MAX_ROWS_PER_SHEET: usize = 5_000;
/// Zip-bomb protection for decompressed XML parts.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Built-in number format ids Excel reserves for date/time formats.
fn is_date_format(num_fmt_id: u32) -> bool {
    matches!(num_fmt_id, 14..=22 | 45..=47)
}

/// One sheet becomes one logical page prefixed with `[Sheet: <name>]`.
/// Empty and header-only sheets are skipped.
pub fn parse(bytes: &[u8]) -> Result<ParsedDocument, AppError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| {
        AppError::ingestion(ErrorCode::FileCorrupted, format!("corrupt xlsx archive: {e}"))
    })?;

    let shared_strings = read_shared_strings(&mut archive)?;
    let date_styles = read_date_styles(&mut archive)?;
    let sheet_names = read_sheet_names(&mut archive)?;
    let worksheet_parts = list_worksheet_parts(&mut archive);

    let mut pages = Vec::new();
    let mut sheet_reports = Vec::new();
    let mut processed = 0usize;

    for (idx, part) in worksheet_parts.iter().enumerate() {
        let name = sheet_names
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("Sheet{}", idx + 1));
        let xml = read_zip_entry_bounded(&mut archive, part)?;
        let rows = extract_rows(&xml, &shared_strings, &date_styles)?;

        let mut report = Map::new();
        report.insert("name".into(), name.clone().into());

        // First non-empty row is the header; a sheet without data rows is
        // skipped entirely.
        let mut row_iter = rows.into_iter().filter(|r| r.iter().any(|c| !c.is_empty()));
        let Some(headers) = row_iter.next() else {
            report.insert("rowCount".into(), 0.into());
            report.insert("skipped".into(), true.into());
            sheet_reports.push(serde_json::Value::Object(report));
            continue;
        };

        let mut lines = Vec::new();
        let mut truncated = false;
        for row in row_iter {
            if lines.len() >= MAX_ROWS_PER_SHEET {
                truncated = true;
                break;
            }
            let line = row
                .iter()
                .enumerate()
                .filter(|(_, value)| !value.is_empty())
                .map(|(col, value)| {
                    let header = headers
                        .get(col)
                        .filter(|h| !h.is_empty())
                        .cloned()
                        .unwrap_or_else(|| format!("Column {}", col + 1));
                    format!("{header}: {value}")
                })
                .collect::<Vec<_>>()
                .join(" | ");
            lines.push(line);
        }

        report.insert("rowCount".into(), lines.len().into());
        report.insert("truncated".into(), truncated.into());

        if lines.is_empty() {
            report.insert("skipped".into(), true.into());
            sheet_reports.push(serde_json::Value::Object(report));
            continue;
        }

        processed += 1;
        sheet_reports.push(serde_json::Value::Object(report));
        pages.push(format!("[Sheet: {name}]\n{}", lines.join("\n")));
    }

    let mut metadata = Map::new();
    metadata.insert("sheetCount".into(), worksheet_parts.len().into());
    metadata.insert("processedSheets".into(), processed.into());
    metadata.insert("sheets".into(), sheet_reports.into());

    Ok(ParsedDocument::new(number_pages(pages), "xlsx", metadata))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, AppError> {
    let entry = archive.by_name(name).map_err(|e| {
        AppError::ingestion(ErrorCode::FileCorrupted, format!("corrupt xlsx: {name}: {e}"))
    })?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| AppError::Processing(format!("failed to read {name}: {e}")))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(AppError::ingestion(
            ErrorCode::FileTooLarge,
            format!("{name} exceeds the size limit"),
        ));
    }
    Ok(out)
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, AppError> {
    if archive.by_name("xl/sharedStrings.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml")?;

    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut in_t = false;
    let mut current = String::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                current.push_str(&te.unescape().unwrap_or_default());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(AppError::ingestion(
                    ErrorCode::FileCorrupted,
                    format!("corrupt sharedStrings.xml: {e}"),
                ))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Style index -> "is a date format" lookup from `xl/styles.xml` cellXfs.
fn read_date_styles(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<bool>, AppError> {
    if archive.by_name("xl/styles.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/styles.xml")?;

    let mut styles = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut in_cell_xfs = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e)) => {
                match e.local_name().as_ref() {
                    b"cellXfs" => in_cell_xfs = true,
                    b"xf" if in_cell_xfs => {
                        let num_fmt_id = attribute_value(&e, b"numFmtId")
                            .and_then(|v| v.parse::<u32>().ok())
                            .unwrap_or(0);
                        styles.push(is_date_format(num_fmt_id));
                    }
                    _ => {}
                }
            }
            Ok(quick_xml::events::Event::End(e)) if e.local_name().as_ref() == b"cellXfs" => {
                in_cell_xfs = false;
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(styles)
}

/// Sheet display names from `xl/workbook.xml`, in workbook order.
fn read_sheet_names(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, AppError> {
    if archive.by_name("xl/workbook.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/workbook.xml")?;

    let mut names = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e)) => {
                if e.local_name().as_ref() == b"sheet" {
                    if let Some(name) = attribute_value(&e, b"name") {
                        names.push(name);
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(names)
}

fn list_worksheet_parts(archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn attribute_value(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        (a.key.as_ref() == key)
            .then(|| String::from_utf8_lossy(a.value.as_ref()).into_owned())
    })
}

/// Column index from a cell reference like `BC12` (A = 0).
fn column_index(cell_ref: &str) -> usize {
    cell_ref
        .bytes()
        .take_while(u8::is_ascii_uppercase)
        .fold(0usize, |acc, b| acc * 26 + (b - b'A' + 1) as usize)
        .saturating_sub(1)
}

/// Excel's day-zero epoch (the 1900 date system with its leap-year quirk).
fn render_date_serial(serial: f64) -> Option<String> {
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    let days = serial.trunc() as i64;
    let date = epoch.checked_add_signed(Duration::days(days))?;
    let seconds = (serial.fract() * 86_400.0).round() as i64;
    if seconds == 0 {
        Some(date.format("%Y-%m-%d").to_string())
    } else {
        let time = date.and_hms_opt(0, 0, 0)? + Duration::seconds(seconds);
        Some(time.format("%Y-%m-%d %H:%M").to_string())
    }
}

/// Extracts the cell grid of one worksheet. Shared strings are resolved,
/// formulas render as their cached text, date-styled numbers as dates.
fn extract_rows(
    xml: &[u8],
    shared_strings: &[String],
    date_styles: &[bool],
) -> Result<Vec<Vec<String>>, AppError> {
    #[derive(Default)]
    struct CellState {
        column: usize,
        cell_type: Vec<u8>,
        is_date: bool,
        in_value: bool,
        in_inline_t: bool,
    }

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut current_row: Vec<String> = Vec::new();
    let mut cell = CellState::default();

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => current_row.clear(),
                b"c" => {
                    cell = CellState {
                        column: attribute_value(&e, b"r")
                            .map(|r| column_index(&r))
                            .unwrap_or(current_row.len()),
                        cell_type: attribute_value(&e, b"t")
                            .map(String::into_bytes)
                            .unwrap_or_default(),
                        is_date: attribute_value(&e, b"s")
                            .and_then(|s| s.parse::<usize>().ok())
                            .and_then(|s| date_styles.get(s).copied())
                            .unwrap_or(false),
                        in_value: false,
                        in_inline_t: false,
                    };
                }
                b"v" => cell.in_value = true,
                b"t" => cell.in_inline_t = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if cell.in_value || cell.in_inline_t => {
                let raw = te.unescape().unwrap_or_default().trim().to_string();
                let value = if cell.in_inline_t {
                    raw
                } else {
                    match cell.cell_type.as_slice() {
                        b"s" => raw
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned())
                            .unwrap_or_default(),
                        b"b" => {
                            if raw == "1" { "TRUE".into() } else { "FALSE".into() }
                        }
                        // "str" carries a formula's cached text verbatim.
                        b"str" => raw,
                        _ => {
                            if cell.is_date {
                                raw.parse::<f64>()
                                    .ok()
                                    .and_then(render_date_serial)
                                    .unwrap_or(raw)
                            } else {
                                raw
                            }
                        }
                    }
                };
                if !value.is_empty() {
                    if current_row.len() <= cell.column {
                        current_row.resize(cell.column + 1, String::new());
                    }
                    current_row[cell.column] = value;
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" => cell.in_value = false,
                b"t" => cell.in_inline_t = false,
                b"row" => rows.push(std::mem::take(&mut current_row)),
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(AppError::ingestion(
                    ErrorCode::FileCorrupted,
                    format!("corrupt worksheet XML: {e}"),
                ))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Builds a minimal xlsx with inline-string cells, one worksheet part
    /// per sheet definition.
    fn xlsx_with_sheets(sheets: &[(&str, Vec<Vec<&str>>)]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();

            let sheet_tags: String = sheets
                .iter()
                .enumerate()
                .map(|(i, (name, _))| format!("<sheet name=\"{name}\" sheetId=\"{}\"/>", i + 1))
                .collect();
            writer.start_file("xl/workbook.xml", options).expect("workbook");
            writer
                .write_all(format!("<workbook><sheets>{sheet_tags}</sheets></workbook>").as_bytes())
                .expect("write workbook");

            for (i, (_, rows)) in sheets.iter().enumerate() {
                let rows_xml: String = rows
                    .iter()
                    .map(|row| {
                        let cells: String = row
                            .iter()
                            .enumerate()
                            .map(|(col, value)| {
                                let col_ref = (b'A' + col as u8) as char;
                                format!(
                                    "<c r=\"{col_ref}1\" t=\"inlineStr\"><is><t>{value}</t></is></c>"
                                )
                            })
                            .collect();
                        format!("<row>{cells}</row>")
                    })
                    .collect();
                writer
                    .start_file(format!("xl/worksheets/sheet{}.xml", i + 1), options)
                    .expect("sheet");
                writer
                    .write_all(
                        format!("<worksheet><sheetData>{rows_xml}</sheetData></worksheet>")
                            .as_bytes(),
                    )
                    .expect("write sheet");
            }
            writer.finish().expect("finish");
        }
        cursor.into_inner()
    }

    #[test]
    fn two_sheets_become_two_pages() {
        let mut big = vec![vec!["name", "score"]];
        for i in 0..100 {
            big.push(vec![if i % 2 == 0 { "a" } else { "b" }, "1"]);
        }
        let mut small = vec![vec!["city", "country"]];
        for _ in 0..10 {
            small.push(vec!["Berlin", "DE"]);
        }

        let bytes = xlsx_with_sheets(&[
            ("Scores", big.clone()),
            ("Places", small.clone()),
        ]);
        let doc = parse(&bytes).expect("parse");

        assert_eq!(doc.page_count(), 2);
        assert!(doc.pages[0].content.starts_with("[Sheet: Scores]"));
        assert!(doc.pages[1].content.starts_with("[Sheet: Places]"));
        assert_eq!(doc.metadata["sheetCount"], 2);
        assert_eq!(doc.metadata["processedSheets"], 2);
    }

    #[test]
    fn header_only_sheet_is_skipped() {
        let bytes = xlsx_with_sheets(&[
            ("Empty", vec![vec!["only", "headers"]]),
            ("Data", vec![vec!["k", "v"], vec!["a", "1"]]),
        ]);
        let doc = parse(&bytes).expect("parse");
        assert_eq!(doc.page_count(), 1);
        assert_eq!(doc.metadata["sheetCount"], 2);
        assert_eq!(doc.metadata["processedSheets"], 1);
    }

    #[test]
    fn rows_render_as_header_value_lines() {
        let bytes = xlsx_with_sheets(&[(
            "S",
            vec![vec!["name", "age"], vec!["Ada", "36"]],
        )]);
        let doc = parse(&bytes).expect("parse");
        assert_eq!(doc.pages[0].content, "[Sheet: S]\nname: Ada | age: 36");
    }

    #[test]
    fn not_a_zip_is_file_corrupted() {
        let err = parse(b"nope").expect_err("should fail");
        assert_eq!(err.code(), ErrorCode::FileCorrupted);
    }

    #[test]
    fn column_index_decodes_references() {
        assert_eq!(column_index("A1"), 0);
        assert_eq!(column_index("B7"), 1);
        assert_eq!(column_index("Z3"), 25);
        assert_eq!(column_index("AA1"), 26);
        assert_eq!(column_index("BC12"), 54);
    }

    #[test]
    fn date_serials_render_as_dates() {
        assert_eq!(render_date_serial(45_292.0).as_deref(), Some("2024-01-01"));
        assert_eq!(render_date_serial(45_292.5).as_deref(), Some("2024-01-01 12:00"));
    }
}
