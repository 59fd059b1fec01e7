//! Table geometry and Markdown rendering.
//!
//! PDF table handling has two halves: a detector that finds table regions
//! (bounding boxes, parsed cell grids, parser confidence) and the pure
//! geometry here that strips table words out of page text and renders
//! accepted tables as Markdown. Detectors are pluggable via [`TableDetector`];
//! the built-in [`NoTableDetector`] finds nothing, so plain per-page
//! extraction is the out-of-the-box PDF path.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Margin in points added around table regions before the overlap test.
pub const TABLE_EXCLUSION_MARGIN: f64 = 2.0;

/// A detected table on a PDF page.
///
/// Coordinates use a bottom-left origin (`y0` is the lower edge), the
/// convention of PDF-space table detectors; [`exclusion_boxes`] converts to
/// the top-left origin used by word boxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRegion {
    /// 1-based page number.
    pub page: u32,
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
    /// Parser confidence in percent.
    pub accuracy: f64,
    /// Parsed cell grid, rows of cells.
    pub cells: Vec<Vec<String>>,
}

/// A word on a PDF page with its bounding box, top-left origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub x0: f64,
    pub top: f64,
    pub x1: f64,
    pub bottom: f64,
}

/// Words of a page together with the page height needed for coordinate
/// conversion.
#[derive(Debug, Clone, Default)]
pub struct PageWords {
    pub height: f64,
    pub words: Vec<Word>,
}

/// Table detection capability for PDFs.
///
/// Implementations wrap an external table parser; the contract is the region
/// list (with confidence and cell grids) plus word boxes for the pages that
/// need table text stripped out.
pub trait TableDetector: Send + Sync {
    fn detect(&self, pdf_bytes: &[u8]) -> Result<Vec<TableRegion>>;

    fn page_words(&self, pdf_bytes: &[u8], page: u32) -> Result<PageWords>;
}

/// Default detector: detects nothing, never consulted for words.
pub struct NoTableDetector;

impl TableDetector for NoTableDetector {
    fn detect(&self, _pdf_bytes: &[u8]) -> Result<Vec<TableRegion>> {
        Ok(Vec::new())
    }

    fn page_words(&self, _pdf_bytes: &[u8], _page: u32) -> Result<PageWords> {
        Ok(PageWords::default())
    }
}

/// Group regions by page, dropping those below the confidence threshold.
pub fn regions_by_page(
    regions: Vec<TableRegion>,
    min_accuracy: f64,
) -> BTreeMap<u32, Vec<TableRegion>> {
    let mut by_page: BTreeMap<u32, Vec<TableRegion>> = BTreeMap::new();
    for region in regions {
        if region.accuracy < min_accuracy {
            tracing::warn!(
                page = region.page,
                accuracy = region.accuracy,
                "table ignored (accuracy below {min_accuracy}%)"
            );
            continue;
        }
        by_page.entry(region.page).or_default().push(region);
    }
    by_page
}

/// Convert bottom-left-origin table regions to top-left-origin exclusion
/// boxes `(x0, top, x1, bottom)`, padded by `margin` on every side.
pub fn exclusion_boxes(
    regions: &[TableRegion],
    page_height: f64,
    margin: f64,
) -> Vec<(f64, f64, f64, f64)> {
    regions
        .iter()
        .map(|r| {
            let top = (page_height - r.y1 - margin).max(0.0);
            let bottom = (page_height - r.y0 + margin).min(page_height);
            (r.x0 - margin, top, r.x1 + margin, bottom)
        })
        .collect()
}

/// Axis-wise rectangle overlap for `(x0, top, x1, bottom)` boxes. Separation
/// on either axis means no overlap; edge contact does not count.
pub fn boxes_overlap(a: (f64, f64, f64, f64), b: (f64, f64, f64, f64)) -> bool {
    let (ax0, at, ax1, ab) = a;
    let (bx0, bt, bx1, bb) = b;
    if ax1 <= bx0 || bx1 <= ax0 {
        return false;
    }
    if ab <= bt || bb <= at {
        return false;
    }
    true
}

/// Reassemble the words that fall outside every exclusion box into page
/// text: group kept words into lines by rounded y-coordinate (to a tenth of
/// a point), order each line by x, join words with spaces and lines with
/// newlines.
pub fn text_outside_tables(words: &[Word], exclusions: &[(f64, f64, f64, f64)]) -> String {
    let mut lines: BTreeMap<i64, Vec<(f64, &str)>> = BTreeMap::new();

    for word in words {
        let word_box = (word.x0, word.top, word.x1, word.bottom);
        if exclusions.iter().any(|e| boxes_overlap(word_box, *e)) {
            continue;
        }
        let line_key = (word.top * 10.0).round() as i64;
        lines.entry(line_key).or_default().push((word.x0, &word.text));
    }

    let mut out_lines = Vec::with_capacity(lines.len());
    for (_, mut items) in lines {
        items.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        let line = items
            .iter()
            .map(|(_, t)| *t)
            .collect::<Vec<_>>()
            .join(" ");
        if !line.trim().is_empty() {
            out_lines.push(line);
        }
    }
    out_lines.join("\n")
}

/// Flatten a cell for Markdown: newlines become spaces, pipes get escaped,
/// whitespace collapses.
pub fn sanitize_cell(s: &str) -> String {
    let s = s.replace(['\n', '\r'], " ").replace('|', r"\|");
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Render a cell grid as a Markdown table. The first row becomes the header
/// when any of its cells is non-empty; otherwise a blank header row keeps
/// the output valid Markdown.
pub fn render_markdown_table(rows: &[Vec<String>]) -> String {
    if rows.is_empty() {
        return String::new();
    }

    let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
    if width == 0 {
        return String::new();
    }

    let sanitized: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            (0..width)
                .map(|i| row.get(i).map(|c| sanitize_cell(c)).unwrap_or_default())
                .collect()
        })
        .collect();

    let (header, body) = if sanitized[0].iter().any(|c| !c.is_empty()) {
        (sanitized[0].clone(), &sanitized[1..])
    } else {
        (vec![String::new(); width], &sanitized[..])
    };

    let mut out = String::new();
    out.push_str(&format!("| {} |", header.join(" | ")));
    out.push('\n');
    out.push_str(&format!("| {} |", vec!["---"; width].join(" | ")));
    for row in body {
        out.push('\n');
        out.push_str(&format!("| {} |", row.join(" | ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, x0: f64, top: f64) -> Word {
        Word {
            text: text.to_string(),
            x0,
            top,
            x1: x0 + 20.0,
            bottom: top + 10.0,
        }
    }

    #[test]
    fn overlap_requires_both_axes() {
        let a = (0.0, 0.0, 10.0, 10.0);
        assert!(boxes_overlap(a, (5.0, 5.0, 15.0, 15.0)));
        // Horizontally separated.
        assert!(!boxes_overlap(a, (10.0, 0.0, 20.0, 10.0)));
        // Vertically separated.
        assert!(!boxes_overlap(a, (0.0, 10.0, 10.0, 20.0)));
    }

    #[test]
    fn exclusion_boxes_flip_origin_and_pad() {
        let regions = vec![TableRegion {
            page: 1,
            x0: 100.0,
            y0: 500.0,
            x1: 300.0,
            y1: 700.0,
            accuracy: 95.0,
            cells: vec![],
        }];
        let boxes = exclusion_boxes(&regions, 800.0, 2.0);
        let (x0, top, x1, bottom) = boxes[0];
        assert_eq!(x0, 98.0);
        assert_eq!(top, 98.0); // 800 - 700 - 2
        assert_eq!(x1, 302.0);
        assert_eq!(bottom, 302.0); // 800 - 500 + 2
    }

    #[test]
    fn words_inside_tables_are_dropped() {
        let words = vec![
            word("keep", 10.0, 50.0),
            word("drop", 120.0, 150.0),
            word("also", 40.0, 50.0),
        ];
        let exclusions = vec![(100.0, 100.0, 300.0, 200.0)];
        let text = text_outside_tables(&words, &exclusions);
        assert_eq!(text, "keep also");
    }

    #[test]
    fn lines_sort_by_y_then_x() {
        let words = vec![
            word("second", 10.0, 80.0),
            word("first", 10.0, 20.0),
            word("line", 40.0, 20.0),
        ];
        let text = text_outside_tables(&words, &[]);
        assert_eq!(text, "first line\nsecond");
    }

    #[test]
    fn low_accuracy_regions_are_dropped() {
        let regions = vec![
            TableRegion {
                page: 1,
                x0: 0.0,
                y0: 0.0,
                x1: 1.0,
                y1: 1.0,
                accuracy: 60.0,
                cells: vec![],
            },
            TableRegion {
                page: 2,
                x0: 0.0,
                y0: 0.0,
                x1: 1.0,
                y1: 1.0,
                accuracy: 90.0,
                cells: vec![],
            },
        ];
        let by_page = regions_by_page(regions, 80.0);
        assert!(!by_page.contains_key(&1));
        assert_eq!(by_page.get(&2).map(|v| v.len()), Some(1));
    }

    #[test]
    fn markdown_table_with_header() {
        let rows = vec![
            vec!["Name".to_string(), "Role".to_string()],
            vec!["Ada".to_string(), "Engineer".to_string()],
        ];
        let md = render_markdown_table(&rows);
        assert_eq!(md, "| Name | Role |\n| --- | --- |\n| Ada | Engineer |");
    }

    #[test]
    fn markdown_cells_escape_pipes() {
        let rows = vec![vec!["a|b".to_string(), "multi\nline".to_string()]];
        let md = render_markdown_table(&rows);
        assert!(md.contains(r"a\|b"));
        assert!(md.contains("multi line"));
    }

    #[test]
    fn ragged_rows_are_padded() {
        let rows = vec![
            vec!["h1".to_string(), "h2".to_string(), "h3".to_string()],
            vec!["only".to_string()],
        ];
        let md = render_markdown_table(&rows);
        assert!(md.ends_with("| only |  |  |"));
    }
}
