//! Text normalization applied between loading and chunking.
//!
//! Order matters: NFC first, then newline canonicalization, dehyphenation,
//! whitespace collapse, blank-line collapse, trim. The whole pass is
//! idempotent — normalizing twice equals normalizing once.

use std::path::Path;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::loader::file_extension;
use crate::models::Document;

static WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\u{00A0}]+").expect("valid whitespace regex"));
static MULTI_NL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid blank-line regex"));
static DEHYPH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w)-\n(\w)").expect("valid dehyphenation regex"));

/// Normalize a text block: NFC, CRLF/CR → LF, end-of-line dehyphenation,
/// space/tab/NBSP runs → one space, 3+ blank lines → 2, trim.
pub fn clean_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let s: String = text.nfc().collect();
    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    let s = DEHYPH.replace_all(&s, "$1$2");
    let s = WS.replace_all(&s, " ");
    let s = MULTI_NL.replace_all(&s, "\n\n");
    s.trim().to_string()
}

/// Normalize a batch of documents.
///
/// Documents whose normalized content is empty are dropped. Every kept
/// document is stamped with `ingested_at` plus the `ext` and `file_name`
/// derived from its source path.
pub fn normalize(docs: Vec<Document>) -> Vec<Document> {
    let now = Utc::now();
    let mut out = Vec::with_capacity(docs.len());

    for mut doc in docs {
        let content = clean_text(&doc.page_content);
        if content.is_empty() {
            continue;
        }

        let (file_name, ext) = match doc.metadata.source.as_deref() {
            Some(src) => (
                Path::new(src)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                file_extension(src),
            ),
            None => ("unknown".to_string(), String::new()),
        };

        doc.metadata.ingested_at = Some(now);
        doc.metadata.ext = Some(ext);
        doc.metadata.file_name = Some(file_name);
        doc.page_content = content;
        out.push(doc);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocMetadata;

    #[test]
    fn collapses_whitespace_and_newlines() {
        let input = "a  \t b\u{00A0}c\r\nnext\n\n\n\nafter";
        assert_eq!(clean_text(input), "a b c\nnext\n\nafter");
    }

    #[test]
    fn dehyphenates_line_breaks() {
        assert_eq!(clean_text("exam-\nple"), "example");
        // A hyphen before a non-word character stays.
        assert_eq!(clean_text("dash -\n- stays"), "dash -\n- stays");
    }

    #[test]
    fn normalization_is_idempotent() {
        let inputs = [
            "a  \t b\u{00A0}c\r\nnext\n\n\n\nafter",
            "exam-\nple with  runs",
            "  trimmed  ",
            "unicode e\u{0301}", // combining accent folds to é under NFC
        ];
        for input in inputs {
            let once = clean_text(input);
            assert_eq!(clean_text(&once), once, "not idempotent for {:?}", input);
        }
    }

    #[test]
    fn empty_documents_are_dropped() {
        let docs = vec![
            Document::new("   \n\n  ", DocMetadata::default()),
            Document::new("kept", DocMetadata::default()),
        ];
        let out = normalize(docs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].page_content, "kept");
    }

    #[test]
    fn metadata_enriched_from_source() {
        let docs = vec![Document::new(
            "content",
            DocMetadata {
                source: Some("/data/tmp/Report.PDF".to_string()),
                ..DocMetadata::default()
            },
        )];
        let out = normalize(docs);
        let meta = &out[0].metadata;
        assert_eq!(meta.file_name.as_deref(), Some("Report.PDF"));
        assert_eq!(meta.ext.as_deref(), Some(".pdf"));
        assert!(meta.ingested_at.is_some());
    }

    #[test]
    fn missing_source_defaults_to_unknown() {
        let out = normalize(vec![Document::new("x", DocMetadata::default())]);
        assert_eq!(out[0].metadata.file_name.as_deref(), Some("unknown"));
    }
}
