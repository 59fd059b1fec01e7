//! End-to-end coverage of the pure pipeline stages: load → normalize →
//! split over real files on disk. The store, queues, and object storage are
//! exercised by their own unit tests; nothing here needs a running service.

use std::path::PathBuf;

use knowhub::config::PipelineConfig;
use knowhub::loader::DocumentLoader;
use knowhub::models::{ChunkIndex, ContentType};
use knowhub::normalize;
use knowhub::splitter::DocumentSplitter;

fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig::default()
}

#[test]
fn text_file_flows_through_load_normalize_split() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        "Heading line\r\nwith  messy   spacing.\n\n\n\n{}",
        "A paragraph that is long enough to survive the minimum chunk filter. ".repeat(3)
    );
    let path = write_file(&dir, "notes.txt", &body);

    let loader = DocumentLoader::new(&pipeline_config());
    let loaded = loader.load_documents(&[path]);
    assert_eq!(loaded.len(), 1);

    let normalized = normalize::normalize(loaded);
    assert_eq!(normalized.len(), 1);
    let text = &normalized[0].page_content;
    assert!(text.contains("Heading line\nwith messy spacing."));
    assert!(!text.contains("\n\n\n"));
    assert_eq!(normalized[0].metadata.ext.as_deref(), Some(".txt"));
    assert_eq!(normalized[0].metadata.file_name.as_deref(), Some("notes.txt"));
    assert!(normalized[0].metadata.file_sha256.is_some());
    assert!(normalized[0].metadata.ingested_at.is_some());

    let chunks = DocumentSplitter::new(&pipeline_config()).split(normalized);
    assert!(!chunks.is_empty());
    for chunk in &chunks {
        assert!(chunk.page_content.chars().count() >= 50);
        assert!(chunk.metadata.chunk_id.is_some());
        assert!(chunk.metadata.chunk_index.is_some());
        assert_eq!(
            chunk.metadata.chunk_chars,
            Some(chunk.page_content.chars().count())
        );
    }
}

#[test]
fn renormalizing_chunks_is_a_fixed_point() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        &dir,
        "doc.txt",
        "Some text with  double  spaces\r\nand a carriage return, repeated until it clears the bar.",
    );

    let loader = DocumentLoader::new(&pipeline_config());
    let normalized = normalize::normalize(loader.load_documents(&[path]));
    let again = normalize::normalize(normalized.clone());

    assert_eq!(normalized.len(), again.len());
    for (a, b) in normalized.iter().zip(again.iter()) {
        assert_eq!(a.page_content, b.page_content);
    }
}

#[test]
fn markdown_file_splits_by_headers_with_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let long_section = "This sentence pads the section well past the minimum chunk size. ".repeat(2);
    let content = format!(
        "# Guide\n\n{long_section}\n\n## Short\n\nnope\n\n## Detail\n\n{long_section}"
    );
    let path = write_file(&dir, "guide.md", &content);

    let loader = DocumentLoader::new(&pipeline_config());
    let chunks =
        DocumentSplitter::new(&pipeline_config()).split(normalize::normalize(loader.load_documents(&[path])));

    assert_eq!(chunks.len(), 2);
    assert!(chunks
        .iter()
        .all(|c| c.metadata.splitter_version.as_deref() == Some("md-v1")));
    assert_eq!(chunks[0].metadata.extensions["h1"], "Guide");
    assert_eq!(chunks[1].metadata.extensions["h2"], "Detail");
    assert!(!chunks.iter().any(|c| c.page_content.contains("nope")));
    assert!(matches!(
        chunks[0].metadata.chunk_index,
        Some(ChunkIndex::Flat(_))
    ));
}

#[test]
fn empty_and_unsupported_files_produce_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let empty = write_file(&dir, "empty.txt", "   \n\n  ");
    let unsupported = write_file(&dir, "data.csv", "a,b,c");

    let loader = DocumentLoader::new(&pipeline_config());
    let docs = loader.load_documents(&[empty, unsupported]);
    // The empty file loads but normalization drops it; the csv never loads.
    let normalized = normalize::normalize(docs);
    assert!(normalized.is_empty());
}

#[test]
fn docx_tables_become_atomic_table_chunks() {
    use std::io::Write;

    let body = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Narrative before the table, padded to clear the minimum chunk length filter.</w:t></w:r></w:p>
    <w:tbl>
      <w:tr><w:tc><w:p><w:r><w:t>Quarter</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>Revenue</w:t></w:r></w:p></w:tc></w:tr>
      <w:tr><w:tc><w:p><w:r><w:t>Q1</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>1.2M</w:t></w:r></w:p></w:tc></w:tr>
      <w:tr><w:tc><w:p><w:r><w:t>Q2</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>1.4M</w:t></w:r></w:p></w:tc></w:tr>
    </w:tbl>
  </w:body>
</w:document>"#;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.docx");
    let file = std::fs::File::create(&path).unwrap();
    let mut archive = zip::ZipWriter::new(file);
    archive
        .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
        .unwrap();
    archive.write_all(body.as_bytes()).unwrap();
    archive.finish().unwrap();

    let loader = DocumentLoader::new(&pipeline_config());
    let chunks = DocumentSplitter::new(&pipeline_config())
        .split(normalize::normalize(loader.load_documents(&[path])));

    let table_chunks: Vec<_> = chunks
        .iter()
        .filter(|c| c.metadata.content_type == ContentType::Table)
        .collect();
    assert_eq!(table_chunks.len(), 1);
    assert!(table_chunks[0].page_content.contains("| Quarter | Revenue |"));
    assert!(table_chunks[0].page_content.contains("| Q2 | 1.4M |"));
    assert_eq!(
        table_chunks[0].metadata.splitter_version.as_deref(),
        Some("table-v1")
    );
}
