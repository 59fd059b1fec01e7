//! Multi-format document loading.
//!
//! Dispatches on the lowercased file extension against a fixed table
//! (`.pdf`, `.docx`, `.pptx`, `.txt`, `.md`), enforces the size ceiling, and
//! enriches every loaded document with the source file's SHA-256. A file
//! that fails to load contributes zero documents; the batch continues.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::config::PipelineConfig;
use crate::extract::{self, ExtractError};
use crate::hash;
use crate::models::{ContentType, DocMetadata, Document};
use crate::tables::{self, NoTableDetector, TableDetector, TABLE_EXCLUSION_MARGIN};

/// Extensions the loader knows how to parse.
pub const SUPPORTED_EXTENSIONS: [&str; 5] = [".pdf", ".docx", ".pptx", ".txt", ".md"];

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("file too large: {path} exceeds {limit} bytes")]
    TooLarge { path: String, limit: u64 },
    #[error("unsupported file type: {0}")]
    UnsupportedExtension(String),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("table detection failed: {0}")]
    TableDetection(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Lowercased extension with the leading dot, or an empty string.
pub fn file_extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default()
}

pub struct DocumentLoader {
    max_file_size_bytes: u64,
    extract_pdf_tables: bool,
    min_table_accuracy: f64,
    detector: Arc<dyn TableDetector>,
}

impl DocumentLoader {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            max_file_size_bytes: config.max_file_size_bytes,
            extract_pdf_tables: config.extract_pdf_tables,
            min_table_accuracy: config.min_table_accuracy,
            detector: Arc::new(NoTableDetector),
        }
    }

    /// Swap in an external table detector.
    pub fn with_detector(mut self, detector: Arc<dyn TableDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Load documents from the given paths. Per-file failures are logged
    /// and skipped; the rest of the batch continues.
    pub fn load_documents(&self, paths: &[PathBuf]) -> Vec<Document> {
        let mut all_docs = Vec::new();

        for path in paths {
            match self.load_one(path) {
                Ok(mut docs) => {
                    tracing::info!(path = %path.display(), count = docs.len(), "loaded documents");
                    match hash::compute_sha256(path) {
                        Ok(digest) => {
                            for doc in &mut docs {
                                doc.metadata.file_sha256 = Some(digest.clone());
                            }
                        }
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "failed to hash source file");
                        }
                    }
                    all_docs.extend(docs);
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "failed to load file, skipping");
                }
            }
        }

        all_docs
    }

    /// Load a single file with the proper parser.
    pub fn load_one(&self, path: &Path) -> Result<Vec<Document>, LoadError> {
        let bytes = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LoadError::NotFound(path.display().to_string()),
            _ => LoadError::Io {
                path: path.display().to_string(),
                source: e,
            },
        })?;

        if bytes.len() as u64 > self.max_file_size_bytes {
            return Err(LoadError::TooLarge {
                path: path.display().to_string(),
                limit: self.max_file_size_bytes,
            });
        }

        let ext = file_extension(&path.display().to_string());
        if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
            return Err(LoadError::UnsupportedExtension(ext));
        }

        match ext.as_str() {
            ".pdf" => self.load_pdf(path, &bytes),
            ".docx" => self.load_docx(path, &bytes),
            ".pptx" => self.load_pptx(path, &bytes),
            ".txt" | ".md" => Ok(self.load_text(path, &bytes)),
            _ => Err(LoadError::UnsupportedExtension(ext)),
        }
    }

    fn base_metadata(&self, path: &Path) -> DocMetadata {
        DocMetadata {
            source: Some(path.display().to_string()),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string()),
            ..DocMetadata::default()
        }
    }

    fn load_pdf(&self, path: &Path, bytes: &[u8]) -> Result<Vec<Document>, LoadError> {
        if self.extract_pdf_tables {
            match self.load_pdf_with_table_exclusion(path, bytes) {
                Ok(docs) => return Ok(docs),
                Err(e) => {
                    tracing::error!(
                        path = %path.display(),
                        error = %e,
                        "table-aware PDF load failed, falling back to plain extraction"
                    );
                }
            }
        }
        self.load_pdf_plain(path, bytes)
    }

    fn load_pdf_plain(&self, path: &Path, bytes: &[u8]) -> Result<Vec<Document>, LoadError> {
        let pages = extract::pdf_pages(bytes)?;
        Ok(self.page_documents(path, pages.into_iter().enumerate()))
    }

    /// PDF load that keeps table text out of the page body: words overlapping
    /// a detected table region are dropped before line reassembly, and each
    /// accepted table is emitted as its own `content_type=table` document
    /// rendered as Markdown.
    fn load_pdf_with_table_exclusion(
        &self,
        path: &Path,
        bytes: &[u8],
    ) -> Result<Vec<Document>, LoadError> {
        let regions = self
            .detector
            .detect(bytes)
            .map_err(|e| LoadError::TableDetection(e.to_string()))?;
        let by_page = tables::regions_by_page(regions, self.min_table_accuracy);

        let pages = extract::pdf_pages(bytes)?;
        let mut docs = Vec::new();

        for (i, page_text) in pages.into_iter().enumerate() {
            let page_num = (i + 1) as u32;
            let text = match by_page.get(&page_num) {
                Some(page_regions) => {
                    let page_words = self
                        .detector
                        .page_words(bytes, page_num)
                        .map_err(|e| LoadError::TableDetection(e.to_string()))?;
                    let exclusions = tables::exclusion_boxes(
                        page_regions,
                        page_words.height,
                        TABLE_EXCLUSION_MARGIN,
                    );
                    tables::text_outside_tables(&page_words.words, &exclusions)
                }
                None => page_text,
            };
            if text.trim().is_empty() {
                continue;
            }
            let mut meta = self.base_metadata(path);
            meta.page = Some(page_num);
            docs.push(Document::new(text, meta));
        }

        let mut table_index = 0u32;
        for (page, page_regions) in &by_page {
            for region in page_regions {
                table_index += 1;
                let markdown = tables::render_markdown_table(&region.cells);
                if markdown.trim().is_empty() {
                    continue;
                }
                let mut meta = self.base_metadata(path);
                meta.page = Some(*page);
                meta.content_type = ContentType::Table;
                meta.ext = Some(".pdf".to_string());
                meta.extensions.insert(
                    "table_index".to_string(),
                    serde_json::json!(table_index),
                );
                meta.extensions.insert(
                    "table_accuracy".to_string(),
                    serde_json::json!((region.accuracy * 100.0).round() / 100.0),
                );
                meta.extensions.insert(
                    "table_rows".to_string(),
                    serde_json::json!(region.cells.len()),
                );
                meta.extensions.insert(
                    "table_cols".to_string(),
                    serde_json::json!(region.cells.first().map(|r| r.len()).unwrap_or(0)),
                );
                docs.push(Document::new(markdown, meta));
            }
        }

        if table_index > 0 {
            tracing::info!(path = %path.display(), tables = table_index, "extracted tables from PDF");
        }

        Ok(docs)
    }

    fn page_documents(
        &self,
        path: &Path,
        pages: impl Iterator<Item = (usize, String)>,
    ) -> Vec<Document> {
        pages
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(i, text)| {
                let mut meta = self.base_metadata(path);
                meta.page = Some((i + 1) as u32);
                Document::new(text, meta)
            })
            .collect()
    }

    fn load_docx(&self, path: &Path, bytes: &[u8]) -> Result<Vec<Document>, LoadError> {
        let content = extract::docx_content(bytes)?;
        let mut docs = Vec::new();

        for block in content.text_blocks {
            docs.push(Document::new(block, self.base_metadata(path)));
        }
        for rows in content.tables {
            let markdown = tables::render_markdown_table(&rows);
            if markdown.trim().is_empty() {
                continue;
            }
            let mut meta = self.base_metadata(path);
            meta.content_type = ContentType::Table;
            docs.push(Document::new(markdown, meta));
        }
        Ok(docs)
    }

    fn load_pptx(&self, path: &Path, bytes: &[u8]) -> Result<Vec<Document>, LoadError> {
        let slides = extract::pptx_slides(bytes)?;
        let text = slides
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(vec![Document::new(text, self.base_metadata(path))])
    }

    fn load_text(&self, path: &Path, bytes: &[u8]) -> Vec<Document> {
        let text = String::from_utf8_lossy(bytes).to_string();
        vec![Document::new(text, self.base_metadata(path))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn loader() -> DocumentLoader {
        DocumentLoader::new(&PipelineConfig::default())
    }

    #[test]
    fn extension_is_lowercased_with_dot() {
        assert_eq!(file_extension("Report.PDF"), ".pdf");
        assert_eq!(file_extension("notes.md"), ".md");
        assert_eq!(file_extension("no_extension"), "");
    }

    #[test]
    fn text_file_loads_with_hash_and_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "hello world").unwrap();

        let docs = loader().load_documents(&[path.clone()]);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].page_content, "hello world");
        assert_eq!(
            docs[0].metadata.file_name.as_deref(),
            Some("note.txt")
        );
        assert!(docs[0].metadata.file_sha256.is_some());
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.png");
        std::fs::write(&path, b"\x89PNG").unwrap();

        let err = loader().load_one(&path).unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedExtension(_)));
        // And the batch API drops it silently.
        assert!(loader().load_documents(&[path]).is_empty());
    }

    #[test]
    fn oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        std::fs::write(&path, "x".repeat(128)).unwrap();

        let small = DocumentLoader::new(&PipelineConfig {
            max_file_size_bytes: 64,
            ..PipelineConfig::default()
        });
        assert!(matches!(
            small.load_one(&path).unwrap_err(),
            LoadError::TooLarge { .. }
        ));
    }

    #[test]
    fn docx_archive_yields_text_and_table_documents() {
        let body = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Some prose.</w:t></w:r></w:p>
    <w:tbl>
      <w:tr><w:tc><w:p><w:r><w:t>H</w:t></w:r></w:p></w:tc></w:tr>
      <w:tr><w:tc><w:p><w:r><w:t>V</w:t></w:r></w:p></w:tc></w:tr>
    </w:tbl>
  </w:body>
</w:document>"#;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.docx");
        let file = std::fs::File::create(&path).unwrap();
        let mut archive = zip::ZipWriter::new(file);
        archive
            .start_file(
                "word/document.xml",
                zip::write::SimpleFileOptions::default(),
            )
            .unwrap();
        archive.write_all(body.as_bytes()).unwrap();
        archive.finish().unwrap();

        let docs = loader().load_one(&path).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].metadata.content_type, ContentType::Text);
        assert_eq!(docs[0].page_content, "Some prose.");
        assert_eq!(docs[1].metadata.content_type, ContentType::Table);
        assert!(docs[1].page_content.contains("| H |"));
    }
}
