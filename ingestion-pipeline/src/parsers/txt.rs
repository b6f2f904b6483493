use common::error::AppError;
use serde_json::Map;

use super::{normalize_newlines, number_pages, ParsedDocument};

/// Lines per synthesized logical page.
const LINES_PER_PAGE: usize = 100;

pub fn parse(bytes: &[u8]) -> Result<ParsedDocument, AppError> {
    let text = normalize_newlines(&String::from_utf8_lossy(bytes));

    let mut metadata = Map::new();
    if text.trim().is_empty() {
        metadata.insert("lineCount".into(), 0.into());
        return Ok(ParsedDocument::new(vec![], "txt", metadata));
    }

    let lines: Vec<&str> = text.lines().collect();
    metadata.insert("lineCount".into(), lines.len().into());

    let pages = lines
        .chunks(LINES_PER_PAGE)
        .map(|chunk| chunk.join("\n"))
        .collect();

    Ok(ParsedDocument::new(number_pages(pages), "txt", metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_zero_pages() {
        let doc = parse(b"").expect("parse");
        assert_eq!(doc.page_count(), 0);
        assert_eq!(doc.char_count, 0);
    }

    #[test]
    fn whitespace_only_yields_zero_pages() {
        let doc = parse(b"  \n\t \r\n ").expect("parse");
        assert_eq!(doc.page_count(), 0);
    }

    #[test]
    fn short_file_is_one_page() {
        let doc = parse(b"line one\nline two").expect("parse");
        assert_eq!(doc.page_count(), 1);
        assert_eq!(doc.pages[0].content, "line one\nline two");
    }

    #[test]
    fn pages_split_every_hundred_lines() {
        let text = (0..250).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let doc = parse(text.as_bytes()).expect("parse");
        assert_eq!(doc.page_count(), 3);
        assert_eq!(doc.pages[0].content.lines().count(), 100);
        assert_eq!(doc.pages[1].content.lines().count(), 100);
        assert_eq!(doc.pages[2].content.lines().count(), 50);
        assert_eq!(
            doc.pages.iter().map(|p| p.page_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn crlf_normalized_to_lf() {
        let doc = parse(b"first\r\nsecond\rthird").expect("parse");
        assert_eq!(doc.pages[0].content, "first\nsecond\nthird");
    }
}
