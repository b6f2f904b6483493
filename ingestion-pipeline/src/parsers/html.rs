use common::error::AppError;
use scraper::{ElementRef, Html, Node, Selector};
use serde_json::Map;

use super::{number_pages, ParsedDocument};

/// Target characters per synthesized logical page.
const PAGE_TARGET_CHARS: usize = 5_000;
/// A paragraph boundary is preferred when it falls within the final 30% of
/// a page.
const BOUNDARY_WINDOW: f64 = 0.3;

/// Boilerplate elements removed before extraction.
const REMOVED_ELEMENTS: &[&str] = &[
    "script", "style", "noscript", "iframe", "svg", "nav", "footer", "header", "aside", "form",
    "input", "button",
];
const REMOVED_ROLES: &[&str] = &["banner", "navigation", "contentinfo"];

/// Elements that force a paragraph break around their content.
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "section", "article", "main", "ul", "ol", "li", "table", "tr", "h1", "h2", "h3",
    "h4", "h5", "h6", "blockquote", "pre", "figure", "figcaption",
];

pub fn parse(bytes: &[u8]) -> Result<ParsedDocument, AppError> {
    let source = String::from_utf8_lossy(bytes);
    let document = Html::parse_document(&source);

    let title = extract_title(&document);

    // Prefer the semantic content root, fall back to <body>.
    let mut text = content_root(&document)
        .map(|root| extract_text(root))
        .unwrap_or_default();
    if text.trim().is_empty() {
        if let Some(body) = select_first(&document, "body") {
            text = extract_text(body);
        }
    }

    let text = normalize_whitespace(&text);

    let mut metadata = Map::new();
    if let Some(title) = title {
        metadata.insert("title".into(), title.into());
    }

    let pages = paginate(&text, PAGE_TARGET_CHARS);
    Ok(ParsedDocument::new(number_pages(pages), "html", metadata))
}

fn select_first<'a>(document: &'a Html, selector: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(selector).ok()?;
    document.select(&selector).next()
}

fn content_root(document: &Html) -> Option<ElementRef<'_>> {
    for candidate in ["main", "article", "[role=\"main\"]", "body"] {
        if let Some(root) = select_first(document, candidate) {
            return Some(root);
        }
    }
    None
}

/// Title: `<title>` if present, else the first `<h1>`.
fn extract_title(document: &Html) -> Option<String> {
    for selector in ["title", "h1"] {
        if let Some(element) = select_first(document, selector) {
            let text: String = element.text().collect::<String>().trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Depth-first text collection that skips boilerplate subtrees and inserts
/// paragraph breaks around block-level elements.
fn extract_text(root: ElementRef<'_>) -> String {
    let mut out = String::new();
    collect_text(root, &mut out);
    out
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    let name = element.value().name();
    if REMOVED_ELEMENTS.contains(&name) {
        return;
    }
    if element
        .value()
        .attr("role")
        .is_some_and(|role| REMOVED_ROLES.contains(&role))
    {
        return;
    }
    if name == "br" {
        out.push('\n');
        return;
    }

    let is_block = BLOCK_ELEMENTS.contains(&name);
    if is_block {
        out.push_str("\n\n");
    }
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                if let Some(child_element) = ElementRef::wrap(child) {
                    collect_text(child_element, out);
                }
            }
            _ => {}
        }
    }
    if is_block {
        out.push_str("\n\n");
    }
}

/// Collapses whitespace within lines while preserving paragraph breaks:
/// runs of blank lines shrink to exactly one.
fn normalize_whitespace(input: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut blank_pending = false;
    for line in input.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_pending = !out.is_empty();
        } else {
            if blank_pending {
                out.push(String::new());
                blank_pending = false;
            }
            out.push(collapsed);
        }
    }
    out.join("\n")
}

/// Two-pointer pager: `start` walks forward page by page; for each page a
/// backward cursor looks for a paragraph boundary inside the preference
/// window, otherwise the page breaks at the hard target.
fn paginate(text: &str, target: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut pages = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let hard_end = (start + target).min(chars.len());
        let mut end = hard_end;

        if hard_end < chars.len() {
            let window_start = start + ((target as f64) * (1.0 - BOUNDARY_WINDOW)) as usize;
            let mut cursor = hard_end;
            while cursor > window_start + 1 {
                if chars[cursor - 1] == '\n' && chars[cursor - 2] == '\n' {
                    end = cursor;
                    break;
                }
                cursor -= 1;
            }
        }

        let page: String = chars[start..end].iter().collect::<String>().trim().to_string();
        if !page.is_empty() {
            pages.push(page);
        }
        start = end;
    }

    pages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_boilerplate_elements() {
        let html = b"<html><head><title>Doc</title><script>var x = 1;</script>\
            <style>body { color: red }</style></head>\
            <body><nav>Menu Home About</nav><main><p>Real content here.</p></main>\
            <footer>Copyright</footer></body></html>";
        let doc = parse(html).expect("parse");
        assert_eq!(doc.page_count(), 1);
        assert_eq!(doc.pages[0].content, "Real content here.");
        assert_eq!(doc.metadata["title"], "Doc");
    }

    #[test]
    fn strips_aria_landmark_roles() {
        let html = b"<body><div role=\"banner\">Banner stuff</div>\
            <div role=\"navigation\">Links</div><p>Kept paragraph.</p>\
            <div role=\"contentinfo\">Footer stuff</div></body>";
        let doc = parse(html).expect("parse");
        assert_eq!(doc.pages[0].content, "Kept paragraph.");
    }

    #[test]
    fn prefers_main_over_body() {
        let html = b"<body><p>Sidebar noise</p><main><p>The article body.</p></main></body>";
        let doc = parse(html).expect("parse");
        assert_eq!(doc.pages[0].content, "The article body.");
    }

    #[test]
    fn falls_back_to_body_without_main() {
        let html = b"<body><p>Only body content.</p></body>";
        let doc = parse(html).expect("parse");
        assert_eq!(doc.pages[0].content, "Only body content.");
    }

    #[test]
    fn first_h1_is_title_fallback() {
        let html = b"<body><h1>Heading Title</h1><p>Text.</p></body>";
        let doc = parse(html).expect("parse");
        assert_eq!(doc.metadata["title"], "Heading Title");
    }

    #[test]
    fn paragraph_breaks_survive_normalization() {
        let html = b"<body><main><p>First   paragraph\twith   runs.</p>\
            <p>Second paragraph.</p></main></body>";
        let doc = parse(html).expect("parse");
        assert_eq!(
            doc.pages[0].content,
            "First paragraph with runs.\n\nSecond paragraph."
        );
    }

    #[test]
    fn empty_page_set_for_blank_document() {
        let doc = parse(b"<html><body><script>x()</script></body></html>").expect("parse");
        assert_eq!(doc.page_count(), 0);
    }

    #[test]
    fn pager_prefers_paragraph_boundary_in_window() {
        // One paragraph of 80 chars, boundary, then more text; target 100
        // puts the boundary at 80% of the page, inside the 30% window.
        let first = "a".repeat(80);
        let rest = "b".repeat(150);
        let text = format!("{first}\n\n{rest}");
        let pages = paginate(&text, 100);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0], first);
        assert!(pages[1].starts_with('b'));
    }

    #[test]
    fn pager_breaks_hard_without_boundary() {
        let text = "x".repeat(12_000);
        let pages = paginate(&text, 5_000);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].chars().count(), 5_000);
        assert_eq!(pages[2].chars().count(), 2_000);
    }

    #[test]
    fn boundary_before_window_is_ignored() {
        // Boundary at 20% of the page: too early, the page breaks hard.
        let first = "a".repeat(20);
        let rest = "b".repeat(200);
        let text = format!("{first}\n\n{rest}");
        let pages = paginate(&text, 100);
        assert_eq!(pages[0].chars().count(), 100);
    }
}
