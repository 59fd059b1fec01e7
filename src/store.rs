//! Vector + full-text store backed by Postgres with the pgvector extension.
//!
//! A collection is a table with an `embedding VECTOR(dim)` column under a
//! cosine ANN index (HNSW or IVF-Flat), plus English and French generated
//! tsvector columns for full-text search. The unit of write idempotency is
//! the `source` column: once any chunk of a source is present, re-upserting
//! that source is a no-op.
//!
//! Retrieval comes in three flavors:
//! - **vector** — cosine-ordered ANN search with optional source and
//!   distance-threshold filters;
//! - **fts** — bilingual websearch/plain tsquery ranking;
//! - **hybrid** — Reciprocal Rank Fusion over both result lists.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use pgvector::Vector;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::config::PostgresConfig;
use crate::embedding::EmbeddingClient;
use crate::models::{FtsChunk, HybridChunk, PreparedChunk, RetrievedChunk};

/// ANN index flavor for a collection. Exactly one index is created over
/// `embedding`, always in cosine space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Hnsw,
    IvfFlat,
}

impl std::str::FromStr for IndexKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "hnsw" => Ok(IndexKind::Hnsw),
            "ivfflat" => Ok(IndexKind::IvfFlat),
            other => bail!("index_type must be 'hnsw' or 'ivfflat', got '{}'", other),
        }
    }
}

/// Index construction parameters with the production defaults.
#[derive(Debug, Clone, Copy)]
pub struct IndexParams {
    /// HNSW: maximum connections per node.
    pub hnsw_m: u32,
    /// HNSW: candidates considered during construction.
    pub hnsw_ef_construction: u32,
    /// IVF-Flat: number of clusters.
    pub ivf_lists: u32,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            hnsw_m: 32,
            hnsw_ef_construction: 400,
            ivf_lists: 1000,
        }
    }
}

/// Validate and canonicalize a collection name for SQL interpolation.
///
/// Table names cannot be bound as parameters, so client-supplied names are
/// validated before interpolation: lowercase ASCII, leading letter,
/// `[a-z0-9_]` body, at most 63 bytes (the Postgres identifier limit).
pub fn validate_collection_name(name: &str) -> Result<String> {
    let name = name.to_lowercase();
    if name.is_empty() || name.len() > 63 {
        bail!("Collection name must be 1..=63 characters, got '{}'", name);
    }
    let mut chars = name.chars();
    let first = chars.next().expect("non-empty checked above");
    if !first.is_ascii_lowercase() {
        bail!("Collection name must start with a letter: '{}'", name);
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        bail!(
            "Collection name may only contain lowercase letters, digits and underscores: '{}'",
            name
        );
    }
    Ok(name)
}

#[derive(Clone)]
pub struct VectorStore {
    pool: PgPool,
}

impl VectorStore {
    /// Build a lazily-connecting pool sized `[min, max]`. sqlx connections
    /// run autocommit outside explicit transactions, and the pgvector sqlx
    /// integration handles the vector type on the wire.
    pub fn connect_lazy(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.pool_min)
            .max_connections(config.pool_max)
            .connect_lazy(&config.dsn)
            .context("Invalid Postgres DSN")?;
        Ok(Self { pool })
    }

    /// Close the pool. Call exactly once per process shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn ensure_extension(&self) -> Result<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await
            .context("Failed to enable the pgvector extension")?;
        Ok(())
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        let name = validate_collection_name(name)?;
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM information_schema.tables
                WHERE table_schema = 'public' AND table_name = $1
            )
            "#,
        )
        .bind(&name)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Collections are tables that carry an `embedding` column; plain tables
    /// in the same schema are not listed.
    pub async fn list_collections(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT table_name::text AS table_name
            FROM information_schema.columns
            WHERE table_schema = 'public' AND column_name = 'embedding'
            ORDER BY table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("table_name")).collect())
    }

    /// Create a collection table with its ANN index and full-text columns.
    /// Returns `false` if the collection already exists.
    pub async fn create_collection(
        &self,
        name: &str,
        dim: usize,
        index: IndexKind,
        params: IndexParams,
    ) -> Result<bool> {
        let name = validate_collection_name(name)?;
        if dim == 0 {
            bail!("Embedding dimension must be > 0");
        }

        self.ensure_extension().await?;

        if self.table_exists(&name).await? {
            tracing::debug!(collection = %name, "collection already exists");
            return Ok(false);
        }

        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {name} (
                id BIGSERIAL PRIMARY KEY,
                embedding VECTOR({dim}) NOT NULL,
                text TEXT NOT NULL,
                source VARCHAR(512) NOT NULL,
                page INT NOT NULL,
                creation_date TIMESTAMPTZ NOT NULL DEFAULT now(),
                skillsets VARCHAR(256)[],
                title VARCHAR(512),
                author VARCHAR(256),
                url TEXT,
                ts_vector_en TSVECTOR GENERATED ALWAYS AS (
                    to_tsvector('english', coalesce(text, ''))
                ) STORED,
                ts_vector_fr TSVECTOR GENERATED ALWAYS AS (
                    to_tsvector('french', coalesce(text, ''))
                ) STORED
            )
            "#
        );
        sqlx::query(&create_table)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to create collection '{}'", name))?;

        let index_sql = match index {
            IndexKind::Hnsw => format!(
                r#"
                CREATE INDEX IF NOT EXISTS {name}_vec_idx ON {name}
                USING hnsw (embedding vector_cosine_ops)
                WITH (m = {m}, ef_construction = {ef})
                "#,
                m = params.hnsw_m,
                ef = params.hnsw_ef_construction,
            ),
            IndexKind::IvfFlat => format!(
                r#"
                CREATE INDEX IF NOT EXISTS {name}_vec_idx ON {name}
                USING ivfflat (embedding vector_cosine_ops)
                WITH (lists = {lists})
                "#,
                lists = params.ivf_lists,
            ),
        };
        sqlx::query(&index_sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to create ANN index on '{}'", name))?;

        // Keeps the per-source dedup probe sub-linear.
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {name}_source_idx ON {name} (source)"
        ))
        .execute(&self.pool)
        .await?;

        tracing::info!(collection = %name, dim, ?index, "created collection");
        Ok(true)
    }

    /// Drop a collection table. Returns `false` when it did not exist.
    pub async fn drop_collection(&self, name: &str) -> Result<bool> {
        let name = validate_collection_name(name)?;
        if !self.table_exists(&name).await? {
            return Ok(false);
        }
        sqlx::query(&format!("DROP TABLE IF EXISTS {name}"))
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    /// Delete every chunk of a source. Empty sources are refused.
    pub async fn delete_by_source(&self, name: &str, source: &str) -> Result<u64> {
        if source.trim().is_empty() {
            bail!("Source must be a non-empty string");
        }
        let name = validate_collection_name(name)?;
        if !self.table_exists(&name).await? {
            bail!("Collection '{}' does not exist", name);
        }
        let result = sqlx::query(&format!("DELETE FROM {name} WHERE source = $1"))
            .bind(source)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Declared dimension of a collection's `embedding` column, read from
    /// the vector type modifier.
    async fn collection_dim(&self, name: &str) -> Result<Option<i32>> {
        let name = validate_collection_name(name)?;
        let dim: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT a.atttypmod
            FROM pg_attribute a
            JOIN pg_class c ON c.oid = a.attrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = 'public' AND c.relname = $1 AND a.attname = 'embedding'
            "#,
        )
        .bind(&name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(dim)
    }

    /// Source-level idempotent upsert.
    ///
    /// Chunks are grouped by the `file_name` metadata (`"unknown"` when
    /// absent); groups whose source already exists in the collection are
    /// skipped wholesale, which makes re-ingestion of an indexed document a
    /// no-op. Individual insert failures are counted and skipped; the batch
    /// continues. Returns the number of chunks actually inserted.
    pub async fn insert_chunks(
        &self,
        collection: &str,
        chunks: &[PreparedChunk],
        default_dim: usize,
    ) -> Result<u64> {
        if chunks.is_empty() {
            tracing::info!("no chunks to insert");
            return Ok(0);
        }
        let collection = validate_collection_name(collection)?;

        if !self.table_exists(&collection).await? {
            tracing::info!(collection = %collection, "collection missing, creating with HNSW defaults");
            self.create_collection(&collection, default_dim, IndexKind::Hnsw, IndexParams::default())
                .await?;
        }

        // Dimension mismatches are fatal, not per-chunk errors.
        if let Some(dim) = self.collection_dim(&collection).await? {
            for chunk in chunks {
                if chunk.embedding.len() as i32 != dim {
                    bail!(
                        "Embedding dimension mismatch for collection '{}': expected {}, got {}",
                        collection,
                        dim,
                        chunk.embedding.len()
                    );
                }
            }
        }

        // Group by source.
        let mut groups: Vec<(String, Vec<&PreparedChunk>)> = Vec::new();
        for chunk in chunks {
            let source = chunk
                .metadata
                .file_name
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            match groups.iter().position(|(s, _)| *s == source) {
                Some(i) => groups[i].1.push(chunk),
                None => groups.push((source, vec![chunk])),
            }
        }
        let sources: Vec<String> = groups.iter().map(|(s, _)| s.clone()).collect();
        tracing::info!(collection = %collection, groups = groups.len(), "prepared chunk groups for insertion");

        let existing = self.existing_sources(&collection, &sources).await?;

        let insert_sql = format!(
            r#"
            INSERT INTO {collection} (embedding, text, source, page, title, author, url)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#
        );

        let mut total_inserted = 0u64;
        for (source, group) in &groups {
            if existing.contains(source) {
                tracing::info!(source = %source, skipped = group.len(), "source already indexed, skipping group");
                continue;
            }
            for chunk in group {
                let result = sqlx::query(&insert_sql)
                    .bind(Vector::from(chunk.embedding.clone()))
                    .bind(&chunk.text)
                    .bind(source)
                    .bind(chunk.metadata.page.unwrap_or(0) as i32)
                    .bind(chunk.metadata.title.as_deref())
                    .bind(chunk.metadata.author.as_deref())
                    .bind(chunk.metadata.url.as_deref())
                    .execute(&self.pool)
                    .await;
                match result {
                    Ok(_) => total_inserted += 1,
                    Err(e) => {
                        tracing::warn!(source = %source, error = %e, "chunk insert failed, continuing");
                    }
                }
            }
        }

        tracing::info!(collection = %collection, inserted = total_inserted, "insertion complete");
        Ok(total_inserted)
    }

    async fn existing_sources(
        &self,
        collection: &str,
        sources: &[String],
    ) -> Result<Vec<String>> {
        if sources.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT source FROM {collection} WHERE source = ANY($1)"
        ))
        .bind(sources)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("source")).collect())
    }

    /// Cosine-ordered ANN retrieval.
    ///
    /// The query text is embedded once per call. `ef_search` tunes the HNSW
    /// runtime parameter for the session of this query; `sources` and
    /// `threshold` attach optional predicates. Results come back ascending
    /// by distance.
    pub async fn read_embeddings(
        &self,
        embedder: &EmbeddingClient,
        collection: &str,
        query_text: &str,
        k: usize,
        ef_search: Option<u32>,
        sources: Option<&[String]>,
        threshold: Option<f64>,
    ) -> Result<Vec<RetrievedChunk>> {
        let collection = validate_collection_name(collection)?;
        if !self.table_exists(&collection).await? {
            bail!("Collection '{}' does not exist", collection);
        }

        let qvec = Vector::from(embedder.embed_query(query_text).await?);

        let mut sql = format!(
            "SELECT id, text, source, page, skillsets, title, author, url, creation_date, \
             embedding <-> $1 AS distance FROM {collection}"
        );
        let mut next_param = 2;
        let mut predicates: Vec<String> = Vec::new();
        let source_filter = sources.filter(|s| !s.is_empty());
        if source_filter.is_some() {
            predicates.push(format!("source = ANY(${next_param})"));
            next_param += 1;
        }
        if threshold.is_some() {
            predicates.push(format!("embedding <-> $1 <= ${next_param}"));
            next_param += 1;
        }
        if !predicates.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicates.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY embedding <-> $1 LIMIT ${next_param}"));

        let mut query = sqlx::query(&sql).bind(qvec);
        if let Some(sources) = source_filter {
            query = query.bind(sources.to_vec());
        }
        if let Some(threshold) = threshold {
            query = query.bind(threshold);
        }
        query = query.bind(k as i64);

        // ef_search is a session setting, so it must run on the same pooled
        // connection as the search itself.
        let mut conn = self.pool.acquire().await?;
        if let Some(ef) = ef_search {
            sqlx::query(&format!("SET hnsw.ef_search = {}", ef))
                .execute(&mut *conn)
                .await?;
        }
        let rows = query.fetch_all(&mut *conn).await?;

        rows.iter()
            .map(|row| {
                Ok(RetrievedChunk {
                    id: row.try_get("id")?,
                    text: row.try_get("text")?,
                    source: row.try_get("source")?,
                    page: row.try_get("page")?,
                    skillsets: row.try_get("skillsets")?,
                    title: row.try_get("title")?,
                    author: row.try_get("author")?,
                    url: row.try_get("url")?,
                    creation_date: row.try_get("creation_date")?,
                    distance: row.try_get("distance")?,
                })
            })
            .collect()
    }

    /// Bilingual full-text retrieval.
    ///
    /// Both web-style and plain tsqueries are built per language; each row
    /// scores as the greater of the per-language
    /// `ts_rank(web, 1) * 2 + ts_rank(plain, 1)` (flag 1 = length
    /// normalization), and rows matching either language qualify.
    pub async fn read_fts(
        &self,
        collection: &str,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<FtsChunk>> {
        let collection = validate_collection_name(collection)?;
        if !self.table_exists(&collection).await? {
            bail!("Collection '{}' does not exist", collection);
        }

        let sql = format!(
            r#"
            WITH q AS (
                SELECT
                    websearch_to_tsquery('english', $1) AS q_en,
                    websearch_to_tsquery('french',  $1) AS q_fr,
                    plainto_tsquery('english', $1) AS q_plain_en,
                    plainto_tsquery('french',  $1) AS q_plain_fr
            )
            SELECT
                id, text, source, page, creation_date, title, author, url,
                GREATEST(
                    COALESCE(
                        ts_rank(ts_vector_en, q.q_en, 1) * 2.0 +
                        ts_rank(ts_vector_en, q.q_plain_en, 1),
                        0
                    ),
                    COALESCE(
                        ts_rank(ts_vector_fr, q.q_fr, 1) * 2.0 +
                        ts_rank(ts_vector_fr, q.q_plain_fr, 1),
                        0
                    )
                )::float8 AS fts_rank
            FROM {collection}, q
            WHERE (ts_vector_en @@ q.q_en OR ts_vector_en @@ q.q_plain_en)
               OR (ts_vector_fr @@ q.q_fr OR ts_vector_fr @@ q.q_plain_fr)
            ORDER BY fts_rank DESC NULLS LAST
            LIMIT $2
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(query_text)
            .bind(k as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(FtsChunk {
                    id: row.try_get("id")?,
                    text: row.try_get("text")?,
                    source: row.try_get("source")?,
                    page: row.try_get("page")?,
                    title: row.try_get("title")?,
                    author: row.try_get("author")?,
                    url: row.try_get("url")?,
                    creation_date: row.try_get("creation_date")?,
                    fts_rank: row.try_get("fts_rank")?,
                })
            })
            .collect()
    }

    /// Hybrid retrieval: top-k from each method, fused with Reciprocal Rank
    /// Fusion and truncated to `top_k` (default `k`).
    pub async fn read_hybrid(
        &self,
        embedder: &EmbeddingClient,
        collection: &str,
        query_text: &str,
        k: usize,
        ef_search: Option<u32>,
        rrf_k: u32,
        top_k: Option<usize>,
    ) -> Result<Vec<HybridChunk>> {
        let vector_results = self
            .read_embeddings(embedder, collection, query_text, k, ef_search, None, None)
            .await?;
        let fts_results = self.read_fts(collection, query_text, k).await?;
        Ok(rrf_fuse(
            &vector_results,
            &fts_results,
            rrf_k,
            top_k.unwrap_or(k),
        ))
    }
}

/// Reciprocal Rank Fusion over the vector and full-text result lists.
///
/// Each document `d` scores `Σ_m 1 / (rrf_k + rank_m(d))` across the methods
/// where it appears (ranks are 1-based). Rows are unioned by primary key,
/// sorted descending by score (ties keep insertion order: vector results
/// first), and truncated to `final_k`.
pub fn rrf_fuse(
    vector: &[RetrievedChunk],
    fts: &[FtsChunk],
    rrf_k: u32,
    final_k: usize,
) -> Vec<HybridChunk> {
    let mut order: Vec<i64> = Vec::new();
    let mut fused: HashMap<i64, HybridChunk> = HashMap::new();

    for (i, row) in vector.iter().enumerate() {
        let rank = (i + 1) as u32;
        let score = 1.0 / (rrf_k as f64 + rank as f64);
        match fused.entry(row.id) {
            Entry::Occupied(mut entry) => entry.get_mut().rrf_score += score,
            Entry::Vacant(entry) => {
                order.push(row.id);
                entry.insert(HybridChunk {
                    id: row.id,
                    text: row.text.clone(),
                    source: row.source.clone(),
                    page: row.page,
                    title: row.title.clone(),
                    author: row.author.clone(),
                    url: row.url.clone(),
                    creation_date: row.creation_date,
                    vector_rank: Some(rank),
                    fts_rank: None,
                    rrf_score: score,
                });
            }
        }
    }

    for (i, row) in fts.iter().enumerate() {
        let rank = (i + 1) as u32;
        let score = 1.0 / (rrf_k as f64 + rank as f64);
        match fused.entry(row.id) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                existing.rrf_score += score;
                existing.fts_rank = Some(rank);
            }
            Entry::Vacant(entry) => {
                order.push(row.id);
                entry.insert(HybridChunk {
                    id: row.id,
                    text: row.text.clone(),
                    source: row.source.clone(),
                    page: row.page,
                    title: row.title.clone(),
                    author: row.author.clone(),
                    url: row.url.clone(),
                    creation_date: row.creation_date,
                    vector_rank: None,
                    fts_rank: Some(rank),
                    rrf_score: score,
                });
            }
        }
    }

    let mut results: Vec<HybridChunk> = order
        .into_iter()
        .filter_map(|id| fused.remove(&id))
        .collect();
    // Stable sort: equal scores keep insertion order.
    results.sort_by(|a, b| {
        b.rrf_score
            .partial_cmp(&a.rrf_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(final_k);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn vec_row(id: i64, source: &str) -> RetrievedChunk {
        RetrievedChunk {
            id,
            text: format!("text-{id}"),
            source: source.to_string(),
            page: 1,
            skillsets: None,
            title: None,
            author: None,
            url: None,
            creation_date: Utc::now(),
            distance: 0.1,
        }
    }

    fn fts_row(id: i64, source: &str) -> FtsChunk {
        FtsChunk {
            id,
            text: format!("text-{id}"),
            source: source.to_string(),
            page: 1,
            title: None,
            author: None,
            url: None,
            creation_date: Utc::now(),
            fts_rank: 0.5,
        }
    }

    #[test]
    fn collection_names_validated() {
        assert_eq!(validate_collection_name("MyDocs").unwrap(), "mydocs");
        assert_eq!(validate_collection_name("a_1").unwrap(), "a_1");
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("1abc").is_err());
        assert!(validate_collection_name("a; DROP TABLE x").is_err());
        assert!(validate_collection_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn index_kind_parses() {
        assert_eq!("HNSW".parse::<IndexKind>().unwrap(), IndexKind::Hnsw);
        assert_eq!("ivfflat".parse::<IndexKind>().unwrap(), IndexKind::IvfFlat);
        assert!("btree".parse::<IndexKind>().is_err());
    }

    #[test]
    fn rrf_doc_in_both_lists_beats_single_list_winner() {
        // Doc 1 is rank 1 on both sides; doc 2 is rank 1 only for vectors.
        let vector = vec![vec_row(1, "a"), vec_row(2, "b")];
        let fts = vec![fts_row(1, "a")];

        let fused = rrf_fuse(&vector, &fts, 60, 10);
        assert_eq!(fused[0].id, 1);
        assert!(fused[0].rrf_score > fused[1].rrf_score);
        assert_eq!(fused[0].vector_rank, Some(1));
        assert_eq!(fused[0].fts_rank, Some(1));
        assert_eq!(fused[1].fts_rank, None);
    }

    #[test]
    fn rrf_ties_break_by_insertion_order() {
        // Equal scores: rank 1 on exactly one side each. Vector results are
        // processed first, so the vector-side doc keeps the lead.
        let vector = vec![vec_row(2, "b")];
        let fts = vec![fts_row(1, "a")];

        let fused = rrf_fuse(&vector, &fts, 60, 2);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].id, 2);
        assert_eq!(fused[1].id, 1);
        assert!((fused[0].rrf_score - fused[1].rrf_score).abs() < f64::EPSILON);
    }

    #[test]
    fn rrf_truncates_to_final_k() {
        let vector = vec![vec_row(1, "a"), vec_row(2, "b"), vec_row(3, "c")];
        let fts = vec![fts_row(4, "d")];
        let fused = rrf_fuse(&vector, &fts, 60, 2);
        assert_eq!(fused.len(), 2);
    }

    #[test]
    fn rrf_scores_sum_across_methods() {
        let vector = vec![vec_row(1, "a")];
        let fts = vec![fts_row(1, "a")];
        let fused = rrf_fuse(&vector, &fts, 60, 10);
        let expected = 2.0 / 61.0;
        assert!((fused[0].rrf_score - expected).abs() < 1e-12);
    }
}
