//! Post-extraction quality gates: turn "no text came out" into a
//! classified, actionable error before any pages are persisted.

use common::error::ErrorCode;

use crate::parsers::ParsedPage;

/// A page with more than this many characters counts as non-empty.
const NON_EMPTY_PAGE_CHARS: usize = 10;
/// Minimum total characters for a single-page document.
const MIN_CHARS_SINGLE_PAGE: usize = 20;
/// Minimum total characters per page for multi-page documents.
const MIN_CHARS_PER_PAGE: usize = 50;
/// Two or more accumulated issues fail the document.
const MAX_ISSUES: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Pass { warnings: Vec<String> },
    Fail { code: ErrorCode, reason: String },
}

impl GateOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, GateOutcome::Pass { .. })
    }
}

/// Derived extraction statistics, computed once and reused by every rule.
#[derive(Debug, Clone, Copy)]
struct GateMetrics {
    page_count: usize,
    total_chars: usize,
    non_empty_pages: usize,
    non_empty_ratio: f64,
    avg_chars_per_page: f64,
}

impl GateMetrics {
    fn compute(pages: &[ParsedPage]) -> Self {
        let page_count = pages.len();
        let total_chars: usize = pages.iter().map(|p| p.content.chars().count()).sum();
        let non_empty_pages = pages
            .iter()
            .filter(|p| p.content.chars().count() > NON_EMPTY_PAGE_CHARS)
            .count();
        let non_empty_ratio = if page_count == 0 {
            0.0
        } else {
            non_empty_pages as f64 / page_count as f64
        };
        let avg_chars_per_page = if page_count == 0 {
            0.0
        } else {
            total_chars as f64 / page_count as f64
        };
        Self {
            page_count,
            total_chars,
            non_empty_pages,
            non_empty_ratio,
            avg_chars_per_page,
        }
    }
}

/// Applies the gate rules in order. Deterministic: the same pages always
/// produce the same outcome.
pub fn evaluate(pages: &[ParsedPage]) -> GateOutcome {
    let metrics = GateMetrics::compute(pages);

    if metrics.total_chars == 0 {
        return GateOutcome::Fail {
            code: ErrorCode::ExtractionEmpty,
            reason: "no text extracted from any page".into(),
        };
    }

    if metrics.page_count > 1 && metrics.total_chars < 100 && metrics.non_empty_ratio < 0.3 {
        return GateOutcome::Fail {
            code: ErrorCode::NeedsOcr,
            reason: format!(
                "{} pages produced only {} characters ({} non-empty); likely a scanned document",
                metrics.page_count, metrics.total_chars, metrics.non_empty_pages
            ),
        };
    }

    let mut issues = Vec::new();

    let min_total = if metrics.page_count == 1 {
        MIN_CHARS_SINGLE_PAGE
    } else {
        MIN_CHARS_PER_PAGE * metrics.page_count
    };
    if metrics.total_chars < min_total {
        issues.push(format!(
            "low total text: {} characters, expected at least {min_total}",
            metrics.total_chars
        ));
    }

    if metrics.page_count > 3 && metrics.non_empty_ratio < 0.5 {
        issues.push(format!(
            "only {} of {} pages contain text",
            metrics.non_empty_pages, metrics.page_count
        ));
    }

    if metrics.page_count > 5 && metrics.avg_chars_per_page < 20.0 {
        issues.push(format!(
            "average of {:.1} characters per page",
            metrics.avg_chars_per_page
        ));
    }

    if issues.len() >= MAX_ISSUES {
        GateOutcome::Fail {
            code: ErrorCode::ExtractionLowQuality,
            reason: issues.join("; "),
        }
    } else {
        GateOutcome::Pass { warnings: issues }
    }
}
