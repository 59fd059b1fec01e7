//! Ingestion pipeline orchestration.
//!
//! Coordinates the full indexing flow for one promoted object:
//! load → enrich → normalize → split → embed → source-idempotent upsert.

use std::path::Path;

use anyhow::Result;

use crate::embedding::EmbeddingClient;
use crate::loader::DocumentLoader;
use crate::models::{Document, PreparedChunk};
use crate::normalize;
use crate::splitter::DocumentSplitter;
use crate::store::VectorStore;

/// Summary of a completed ingest run.
#[derive(Debug)]
pub struct IngestOutcome {
    pub doc_id: String,
    pub collection: String,
    pub pages_loaded: usize,
    pub chunks_inserted: u64,
}

pub struct IngestPipeline<'a> {
    pub loader: &'a DocumentLoader,
    pub splitter: &'a DocumentSplitter,
}

impl<'a> IngestPipeline<'a> {
    pub fn new(loader: &'a DocumentLoader, splitter: &'a DocumentSplitter) -> Self {
        Self { loader, splitter }
    }

    /// Ingest one downloaded file into a collection.
    ///
    /// Every emitted document is tagged with the job's `doc_id` and the
    /// promoted object key (also used as the chunk `url`). The upsert is
    /// idempotent per source, so re-running this for already-indexed bytes
    /// inserts nothing.
    pub async fn ingest(
        &self,
        store: &VectorStore,
        embedder: &EmbeddingClient,
        file_path: &Path,
        doc_id: &str,
        processed_key: &str,
        collection: &str,
    ) -> Result<IngestOutcome> {
        let loaded = self.loader.load_documents(&[file_path.to_path_buf()]);
        tracing::info!(count = loaded.len(), "ingest: loaded documents");
        let pages_loaded = loaded.len();

        if loaded.is_empty() {
            tracing::warn!(doc_id, "no documents loaded, skipping ingestion");
            return Ok(IngestOutcome {
                doc_id: doc_id.to_string(),
                collection: collection.to_string(),
                pages_loaded: 0,
                chunks_inserted: 0,
            });
        }

        let enriched: Vec<Document> = loaded
            .into_iter()
            .map(|mut doc| {
                doc.metadata.doc_id = Some(doc_id.to_string());
                doc.metadata.processed_key = Some(processed_key.to_string());
                doc.metadata.url = Some(processed_key.to_string());
                doc
            })
            .collect();

        let normalized = normalize::normalize(enriched);
        tracing::info!(count = normalized.len(), "ingest: normalized documents");

        let chunks = self.splitter.split(normalized);
        tracing::info!(count = chunks.len(), "ingest: split into chunks");

        let prepared = prepare_chunks(embedder, chunks).await?;
        let chunks_inserted = store
            .insert_chunks(collection, &prepared, embedder.dims())
            .await?;

        Ok(IngestOutcome {
            doc_id: doc_id.to_string(),
            collection: collection.to_string(),
            pages_loaded,
            chunks_inserted,
        })
    }
}

/// Pair each non-empty chunk with its embedding, preserving order. The
/// embedder batches internally; this is the only GPU-bound step of ingest.
pub async fn prepare_chunks(
    embedder: &EmbeddingClient,
    chunks: Vec<Document>,
) -> Result<Vec<PreparedChunk>> {
    let chunks: Vec<Document> = chunks
        .into_iter()
        .filter(|c| !c.page_content.trim().is_empty())
        .collect();
    if chunks.is_empty() {
        return Ok(Vec::new());
    }

    let texts: Vec<String> = chunks
        .iter()
        .map(|c| c.page_content.trim().to_string())
        .collect();
    tracing::info!(count = texts.len(), "computing embeddings");
    let embeddings = embedder.embed(&texts).await?;

    Ok(texts
        .into_iter()
        .zip(chunks)
        .zip(embeddings)
        .map(|((text, chunk), embedding)| PreparedChunk {
            text,
            metadata: chunk.metadata,
            embedding,
        })
        .collect())
}
