//! Chunking: turn normalized documents into bounded, indexed chunks.
//!
//! Dispatch is by content type and extension:
//! - `content_type=table` — one chunk, never split;
//! - `.pptx` — one chunk per document;
//! - `.md` — split by H1–H3 headers first, re-splitting oversized sections
//!   with composite `{section}-{sub}` indices;
//! - everything else — recursive character splitting over the separator
//!   ladder `["\n\n", "\n", ". ", " ", ""]`.
//!
//! Chunks shorter than `min_chunk_chars` are discarded, not merged. Every
//! emitted chunk gets a fresh `chunk_id`, its index, a splitter version tag,
//! and its character count.

use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::models::{ChunkIndex, ContentType, DocMetadata, Document};

/// Separator ladder for the generic recursive splitter, coarsest first.
pub const SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", " ", ""];

static MD_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,3})\s+(.*)$").expect("valid heading regex"));

pub struct DocumentSplitter {
    chunk_chars: usize,
    chunk_overlap: usize,
    min_chunk_chars: usize,
}

impl Default for DocumentSplitter {
    fn default() -> Self {
        Self {
            chunk_chars: 1024,
            chunk_overlap: 100,
            min_chunk_chars: 50,
        }
    }
}

impl DocumentSplitter {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            chunk_chars: config.chunk_chars,
            chunk_overlap: config.chunk_overlap,
            min_chunk_chars: config.min_chunk_chars,
        }
    }

    pub fn split(&self, docs: Vec<Document>) -> Vec<Document> {
        let mut out = Vec::new();
        for doc in docs {
            out.extend(self.split_one(doc));
        }
        out
    }

    fn split_one(&self, doc: Document) -> Vec<Document> {
        // Tables are never split.
        if doc.metadata.content_type == ContentType::Table {
            let text = doc.page_content;
            if char_len(&text) < self.min_chunk_chars {
                return Vec::new();
            }
            return vec![make_chunk(
                doc.metadata,
                text,
                ChunkIndex::Flat(0),
                "table-v1",
            )];
        }

        let ext = doc.metadata.ext.clone().unwrap_or_default();
        match ext.as_str() {
            ".pptx" => {
                let text = doc.page_content;
                if char_len(&text) < self.min_chunk_chars {
                    return Vec::new();
                }
                vec![make_chunk(
                    doc.metadata,
                    text,
                    ChunkIndex::Flat(0),
                    "pptx-v1",
                )]
            }
            ".md" => self.split_markdown(doc),
            _ => {
                let chunks = split_recursive(
                    &doc.page_content,
                    &SEPARATORS,
                    self.chunk_chars,
                    self.chunk_overlap,
                );
                let mut out = Vec::new();
                for (i, text) in chunks.into_iter().enumerate() {
                    if char_len(&text) < self.min_chunk_chars {
                        continue;
                    }
                    out.push(make_chunk(
                        doc.metadata.clone(),
                        text,
                        ChunkIndex::Flat(i),
                        "char-v1",
                    ));
                }
                out
            }
        }
    }

    /// Header-first Markdown split. Sections shorter than the minimum are
    /// dropped rather than merged into neighbors; sections within the chunk
    /// budget pass through whole; longer ones go back through the recursive
    /// splitter with composite indices.
    fn split_markdown(&self, doc: Document) -> Vec<Document> {
        let sections = split_markdown_sections(&doc.page_content);
        let mut out = Vec::new();
        let mut section_index = 0usize;

        for section in sections {
            let text = section.text.trim().to_string();
            if char_len(&text) < self.min_chunk_chars {
                continue;
            }

            let mut meta = doc.metadata.clone();
            for (level, title) in &section.headers {
                meta.extensions
                    .insert(format!("h{level}"), serde_json::json!(title));
            }

            if char_len(&text) <= self.chunk_chars {
                out.push(make_chunk(
                    meta,
                    text,
                    ChunkIndex::Flat(section_index),
                    "md-v1",
                ));
            } else {
                let subs =
                    split_recursive(&text, &SEPARATORS, self.chunk_chars, self.chunk_overlap);
                for (sub, sub_text) in subs.into_iter().enumerate() {
                    if char_len(&sub_text) < self.min_chunk_chars {
                        continue;
                    }
                    out.push(make_chunk(
                        meta.clone(),
                        sub_text,
                        ChunkIndex::Section {
                            section: section_index,
                            sub,
                        },
                        "md-v1",
                    ));
                }
            }
            section_index += 1;
        }
        out
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn make_chunk(
    mut metadata: DocMetadata,
    text: String,
    index: ChunkIndex,
    version: &str,
) -> Document {
    metadata.chunk_id = Some(Uuid::new_v4());
    metadata.chunk_index = Some(index);
    metadata.chunk_chars = Some(char_len(&text));
    metadata.splitter_version = Some(version.to_string());
    Document::new(text, metadata)
}

// ============ Markdown sectioning ============

struct MdSection {
    /// Active header trail at this section, `(level, title)` pairs.
    headers: Vec<(u8, String)>,
    text: String,
}

/// Split Markdown by H1–H3 headings. Heading lines move into section
/// metadata; text before the first heading forms a headerless section.
fn split_markdown_sections(text: &str) -> Vec<MdSection> {
    let mut sections: Vec<MdSection> = Vec::new();
    let mut trail: Vec<(u8, String)> = Vec::new();
    let mut current = String::new();

    let flush = |sections: &mut Vec<MdSection>, trail: &[(u8, String)], current: &mut String| {
        if !current.trim().is_empty() {
            sections.push(MdSection {
                headers: trail.to_vec(),
                text: std::mem::take(current),
            });
        } else {
            current.clear();
        }
    };

    for line in text.lines() {
        if let Some(caps) = MD_HEADING.captures(line) {
            flush(&mut sections, &trail, &mut current);
            let level = caps[1].len() as u8;
            let title = caps[2].trim().to_string();
            trail.retain(|(l, _)| *l < level);
            trail.push((level, title));
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    flush(&mut sections, &trail, &mut current);
    sections
}

// ============ Recursive character splitting ============

/// Recursive character splitter.
///
/// Picks the first separator from the ladder that occurs in the text, splits
/// on it, recursively re-splits pieces that are still too large with the
/// remaining separators, and greedily merges small pieces back together up
/// to `chunk_size` characters with `chunk_overlap` characters carried
/// between consecutive chunks. Lengths are measured in characters.
pub fn split_recursive(
    text: &str,
    separators: &[&str],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<String> {
    let mut separator = *separators.last().unwrap_or(&"");
    let mut remaining: &[&str] = &[];
    for (i, s) in separators.iter().copied().enumerate() {
        if s.is_empty() {
            separator = "";
            remaining = &[];
            break;
        }
        if text.contains(s) {
            separator = s;
            remaining = &separators[i + 1..];
            break;
        }
    }

    let splits: Vec<String> = if separator.is_empty() {
        text.chars().map(|c| c.to_string()).collect()
    } else {
        text.split(separator)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    };

    let mut final_chunks = Vec::new();
    let mut good: Vec<String> = Vec::new();

    for piece in splits {
        if char_len(&piece) < chunk_size {
            good.push(piece);
        } else {
            if !good.is_empty() {
                merge_splits(&good, separator, chunk_size, chunk_overlap, &mut final_chunks);
                good.clear();
            }
            if remaining.is_empty() {
                final_chunks.push(piece);
            } else {
                final_chunks.extend(split_recursive(
                    &piece,
                    remaining,
                    chunk_size,
                    chunk_overlap,
                ));
            }
        }
    }
    if !good.is_empty() {
        merge_splits(&good, separator, chunk_size, chunk_overlap, &mut final_chunks);
    }

    final_chunks
}

/// Greedy merge of small pieces into chunks of at most `chunk_size`
/// characters, retaining up to `chunk_overlap` trailing characters between
/// consecutive chunks.
fn merge_splits(
    splits: &[String],
    separator: &str,
    chunk_size: usize,
    chunk_overlap: usize,
    out: &mut Vec<String>,
) {
    let sep_len = char_len(separator);
    let mut current: Vec<&str> = Vec::new();
    let mut total = 0usize;

    for piece in splits {
        let piece_len = char_len(piece);
        let extra = if current.is_empty() { 0 } else { sep_len };

        if total + piece_len + extra > chunk_size && !current.is_empty() {
            if let Some(chunk) = join_pieces(&current, separator) {
                out.push(chunk);
            }
            // Slide the window: drop leading pieces until the retained tail
            // fits the overlap budget and leaves room for the next piece.
            loop {
                if current.is_empty() {
                    break;
                }
                let extra = if current.is_empty() { 0 } else { sep_len };
                let over_budget =
                    total + piece_len + extra > chunk_size && total > 0;
                if total > chunk_overlap || over_budget {
                    let head_len =
                        char_len(current[0]) + if current.len() > 1 { sep_len } else { 0 };
                    total = total.saturating_sub(head_len);
                    current.remove(0);
                } else {
                    break;
                }
            }
        }

        current.push(piece);
        total += piece_len + if current.len() > 1 { sep_len } else { 0 };
    }

    if let Some(chunk) = join_pieces(&current, separator) {
        out.push(chunk);
    }
}

fn join_pieces(pieces: &[&str], separator: &str) -> Option<String> {
    let text = pieces.join(separator);
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter(chunk_chars: usize, overlap: usize, min: usize) -> DocumentSplitter {
        DocumentSplitter {
            chunk_chars,
            chunk_overlap: overlap,
            min_chunk_chars: min,
        }
    }

    fn doc(text: &str, ext: &str) -> Document {
        Document::new(
            text,
            DocMetadata {
                ext: Some(ext.to_string()),
                ..DocMetadata::default()
            },
        )
    }

    #[test]
    fn small_text_is_one_chunk() {
        let chunks = splitter(1024, 100, 5).split(vec![doc("A small paragraph.", ".txt")]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.chunk_index, Some(ChunkIndex::Flat(0)));
        assert_eq!(
            chunks[0].metadata.splitter_version.as_deref(),
            Some("char-v1")
        );
        assert!(chunks[0].metadata.chunk_id.is_some());
        assert_eq!(chunks[0].metadata.chunk_chars, Some(18));
    }

    #[test]
    fn paragraphs_split_and_respect_budget() {
        let text = (0..20)
            .map(|i| format!("Paragraph number {} with a little padding text.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = splitter(120, 20, 5).split(vec![doc(&text, ".txt")]);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.page_content.chars().count() <= 120);
        }
    }

    #[test]
    fn tiny_chunks_never_survive() {
        // The last paragraph would form a chunk under 50 chars.
        let text = format!("{}\n\nshort tail", "long paragraph text ".repeat(10));
        let chunks = splitter(201, 0, 50).split(vec![doc(&text, ".txt")]);
        for chunk in &chunks {
            assert!(
                chunk.page_content.chars().count() >= 50,
                "undersized chunk survived: {:?}",
                chunk.page_content
            );
        }
    }

    #[test]
    fn overlap_carries_trailing_text() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let chunks = split_recursive(text, &SEPARATORS, 20, 10);
        assert!(chunks.len() > 1);
        // Consecutive chunks share some suffix/prefix words.
        let first_tail = chunks[0].split(' ').next_back().unwrap();
        assert!(chunks[1].contains(first_tail));
    }

    #[test]
    fn unsplittable_run_falls_through_ladder() {
        let text = "x".repeat(50);
        let chunks = split_recursive(&text, &SEPARATORS, 20, 0);
        assert!(chunks.iter().all(|c| c.chars().count() <= 20));
        assert_eq!(chunks.join(""), text);
    }

    #[test]
    fn table_documents_stay_whole() {
        let table_text = format!("| h |\n| --- |\n{}", "| row |\n".repeat(40));
        let mut d = doc(&table_text, ".pdf");
        d.metadata.content_type = ContentType::Table;

        let chunks = splitter(64, 10, 50).split(vec![d]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page_content, table_text);
        assert_eq!(
            chunks[0].metadata.splitter_version.as_deref(),
            Some("table-v1")
        );
    }

    #[test]
    fn short_table_is_dropped() {
        let mut d = doc("| a |", ".pdf");
        d.metadata.content_type = ContentType::Table;
        assert!(splitter(1024, 100, 50).split(vec![d]).is_empty());
    }

    #[test]
    fn pptx_is_one_chunk_as_is() {
        let text = "Slide one content\n\nSlide two content, long enough to keep.";
        let chunks = splitter(1024, 100, 10).split(vec![doc(text, ".pptx")]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page_content, text);
        assert_eq!(
            chunks[0].metadata.splitter_version.as_deref(),
            Some("pptx-v1")
        );
    }

    #[test]
    fn markdown_sections_carry_headers_and_drop_short_ones() {
        let text = "# Title\n\nIntro section with enough text to be kept around.\n\n\
                    ## Sub\n\ntiny\n\n\
                    ## Kept\n\nAnother section with enough text to clear the bar easily.";
        let chunks = splitter(1024, 100, 40).split(vec![doc(text, ".md")]);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].metadata.extensions["h1"], "Title");
        assert_eq!(chunks[1].metadata.extensions["h2"], "Kept");
        assert_eq!(
            chunks[1].metadata.splitter_version.as_deref(),
            Some("md-v1")
        );
        // The "tiny" section is dropped, not merged into a neighbor.
        assert!(!chunks.iter().any(|c| c.page_content.contains("tiny")));
    }

    #[test]
    fn oversized_markdown_section_gets_composite_indices() {
        let body = "word ".repeat(100);
        let text = format!("# Big\n\n{}", body);
        let chunks = splitter(120, 20, 10).split(vec![doc(&text, ".md")]);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            match chunk.metadata.chunk_index {
                Some(ChunkIndex::Section { section, .. }) => assert_eq!(section, 0),
                other => panic!("expected composite index, got {:?}", other),
            }
        }
        let subs: Vec<usize> = chunks
            .iter()
            .map(|c| match c.metadata.chunk_index {
                Some(ChunkIndex::Section { sub, .. }) => sub,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(subs[0], 0);
        assert!(subs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn header_trail_resets_on_sibling_heading() {
        let text = "# Top\n\n## A\n\nSection A body long enough to be kept here.\n\n\
                    ## B\n\nSection B body long enough to be kept here too.";
        let chunks = splitter(1024, 100, 20).split(vec![doc(text, ".md")]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].metadata.extensions["h2"], "A");
        assert_eq!(chunks[1].metadata.extensions["h2"], "B");
        assert_eq!(chunks[1].metadata.extensions["h1"], "Top");
    }
}
