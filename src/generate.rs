//! Generation actors: retrieval → prompt → (streamed) generation →
//! event-stream publication → session persistence.
//!
//! The streaming actor never blocks a client connection: it pushes tokens
//! into the per-job Redis stream and the HTTP subscriber drains them, so job
//! lifetime and connection lifetime are decoupled. Every stream ends with
//! exactly one terminal event — `done` on success, `error` otherwise — and
//! successful runs persist an audit session record.

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::events;
use crate::llm::LlmClient;
use crate::models::{RetrievedChunk, SessionRecord, StreamEventType};
use crate::prompt::{PromptBuilder, PromptKind};
use crate::worker::WorkerContext;

pub const ACTOR_GENERATE_ANSWER_STREAM: &str = "generate_answer_stream";
pub const ACTOR_GENERATE_ANSWER: &str = "generate_answer";

/// Canonical answer when retrieval comes back empty.
pub const EMPTY_KNOWLEDGE_MESSAGE: &str =
    "I'm sorry, I couldn't find any relevant information to answer your question.";

const DEFAULT_EF_SEARCH: u32 = 150;

fn default_k() -> usize {
    10
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateStreamArgs {
    pub job_id: String,
    pub query: String,
    pub collection: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateArgs {
    pub query: String,
    pub collection: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub ef_search: Option<u32>,
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

/// Render retrieved chunks into the numbered context block the prompt
/// template interpolates. Chunk numbers are 1-based and the same numbers the
/// model is instructed to cite.
pub fn build_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            format!(
                "[Chunk number {} - {} (page {}) - distance: {:.3}]\n{}\n",
                i + 1,
                chunk.source,
                chunk.page,
                chunk.distance,
                chunk.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

/// Map each distinct chunk text to the 1-based positions where it appeared.
pub fn chunk_number_map(chunks: &[RetrievedChunk]) -> BTreeMap<String, Vec<usize>> {
    let mut map: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, chunk) in chunks.iter().enumerate() {
        map.entry(chunk.text.clone()).or_default().push(i + 1);
    }
    map
}

/// Unique sources in first-appearance order.
pub fn unique_sources(chunks: &[RetrievedChunk]) -> Vec<String> {
    let mut sources = Vec::new();
    for chunk in chunks {
        if !sources.contains(&chunk.source) {
            sources.push(chunk.source.clone());
        }
    }
    sources
}

fn build_messages(query: &str, context: &str) -> Vec<crate::prompt::ChatMessage> {
    PromptBuilder::new(PromptKind::RagGeneration)
        .variable("context", context)
        .variable("query", query)
        .build_messages()
}

fn save_session(
    config: &Config,
    job_id: &str,
    query: &str,
    answer: &str,
    collection: &str,
    sources: Vec<String>,
    metadata: serde_json::Value,
) {
    let record = SessionRecord {
        job_id: job_id.to_string(),
        timestamp: Utc::now(),
        query: query.to_string(),
        answer: answer.to_string(),
        collection: collection.to_string(),
        sources,
        metadata,
    };
    if let Err(e) = persist_session(config, &record) {
        tracing::error!(job_id, error = %e, "error saving session data");
    }
}

fn persist_session(config: &Config, record: &SessionRecord) -> Result<()> {
    let dir = config.sessions_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(format!("{}.json", record.job_id));
    std::fs::write(&path, serde_json::to_string_pretty(record)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "session data saved");
    Ok(())
}

/// Streaming RAG generation actor. All failures surface as one terminal
/// `error` event on the job's stream; the actor itself always completes.
pub async fn generate_answer_stream(
    ctx: &WorkerContext,
    args: GenerateStreamArgs,
) -> Result<serde_json::Value> {
    let stream_key = events::stream_key(&args.job_id);
    let query_prefix: String = args.query.chars().take(50).collect();
    tracing::info!(
        job_id = %args.job_id,
        query = %query_prefix,
        collection = %args.collection,
        "starting RAG generation stream"
    );

    let mut redis = ctx.queue.manager();
    if let Err(e) = run_stream(ctx, &args, &stream_key, &mut redis).await {
        tracing::error!(job_id = %args.job_id, error = %e, "error during streaming RAG generation");
        let _ = events::publish(
            &mut redis,
            &stream_key,
            StreamEventType::Error,
            &serde_json::json!({ "error": e.to_string() }),
        )
        .await;
    }
    Ok(serde_json::Value::Null)
}

async fn run_stream(
    ctx: &WorkerContext,
    args: &GenerateStreamArgs,
    stream_key: &str,
    redis: &mut redis::aio::ConnectionManager,
) -> Result<()> {
    let start = Instant::now();

    if !ctx.store.table_exists(&args.collection).await? {
        bail!("Collection '{}' does not exist.", args.collection);
    }

    let retrieval_start = Instant::now();
    let retrieved = ctx
        .store
        .read_embeddings(
            ctx.embedder,
            &args.collection,
            &args.query,
            args.k,
            Some(DEFAULT_EF_SEARCH),
            args.sources.as_deref(),
            None,
        )
        .await?;
    let retrieval_time_ms = elapsed_ms(retrieval_start);

    if retrieved.is_empty() {
        events::publish(
            redis,
            stream_key,
            StreamEventType::Token,
            &serde_json::json!(EMPTY_KNOWLEDGE_MESSAGE),
        )
        .await?;
        let metadata = serde_json::json!({
            "retrieved_chunks": 0,
            "retrieval_time_ms": retrieval_time_ms,
            "generation_time_ms": 0,
            "total_time_ms": elapsed_ms(start),
        });
        let mut done = metadata.clone();
        done["sources"] = serde_json::json!([]);
        events::publish(redis, stream_key, StreamEventType::Done, &done).await?;

        // Audit even the empty-retrieval answers.
        save_session(
            &ctx.config,
            &args.job_id,
            &args.query,
            EMPTY_KNOWLEDGE_MESSAGE,
            &args.collection,
            Vec::new(),
            metadata,
        );
        return Ok(());
    }

    let context_block = build_context(&retrieved);
    let messages = build_messages(&args.query, &context_block);
    let llm = LlmClient::from_config(&ctx.config.llm)?;

    let generation_start = Instant::now();
    let mut full_answer = String::new();

    if llm.supports_streaming() {
        let mut tokens = llm
            .stream_chat(&messages, args.max_tokens, args.temperature)
            .await?;
        while let Some(token) = tokens.recv().await {
            let token = token?;
            full_answer.push_str(&token);
            events::publish(
                redis,
                stream_key,
                StreamEventType::Token,
                &serde_json::json!(token),
            )
            .await?;
        }
    } else {
        // Provider without token streaming: one generation call, forwarded
        // as a single token event.
        let answer = llm
            .generate_chat(&messages, args.max_tokens, args.temperature)
            .await?;
        events::publish(
            redis,
            stream_key,
            StreamEventType::Token,
            &serde_json::json!(answer),
        )
        .await?;
        full_answer = answer;
    }

    let generation_time_ms = elapsed_ms(generation_start);
    let total_time_ms = elapsed_ms(start);
    let sources = unique_sources(&retrieved);
    let chunk_map = chunk_number_map(&retrieved);

    let metadata = serde_json::json!({
        "retrieved_chunks": retrieved.len(),
        "retrieval_time_ms": retrieval_time_ms,
        "generation_time_ms": generation_time_ms,
        "total_time_ms": total_time_ms,
        "chunk_map": chunk_map,
        "temperature": args.temperature,
        "max_tokens": args.max_tokens,
        "k": args.k,
    });
    let mut done = metadata.clone();
    done["sources"] = serde_json::json!(&sources);
    events::publish(redis, stream_key, StreamEventType::Done, &done).await?;

    save_session(
        &ctx.config,
        &args.job_id,
        &args.query,
        &full_answer,
        &args.collection,
        sources,
        metadata,
    );
    Ok(())
}

/// Non-streaming RAG generation: retrieval plus one chat completion,
/// returned as the job result. Failures come back as a structured error
/// result rather than a retryable panic.
pub async fn generate_answer(
    ctx: &WorkerContext,
    args: GenerateArgs,
) -> Result<serde_json::Value> {
    let query_prefix: String = args.query.chars().take(50).collect();
    tracing::info!(query = %query_prefix, collection = %args.collection, "starting RAG generation");

    match run_generate(ctx, &args).await {
        Ok(result) => Ok(result),
        Err(e) => {
            tracing::error!(error = %e, "error during RAG generation");
            Ok(serde_json::json!({
                "status": "error",
                "error": e.to_string(),
                "query": args.query,
            }))
        }
    }
}

async fn run_generate(ctx: &WorkerContext, args: &GenerateArgs) -> Result<serde_json::Value> {
    let start = Instant::now();

    if !ctx.store.table_exists(&args.collection).await? {
        bail!("Collection '{}' does not exist.", args.collection);
    }

    let retrieval_start = Instant::now();
    let retrieved = ctx
        .store
        .read_embeddings(
            ctx.embedder,
            &args.collection,
            &args.query,
            args.k,
            args.ef_search.or(Some(DEFAULT_EF_SEARCH)),
            args.sources.as_deref(),
            args.threshold,
        )
        .await?;
    let retrieval_time_ms = elapsed_ms(retrieval_start);
    tracing::info!(
        retrieved = retrieved.len(),
        retrieval_time_ms,
        "retrieval complete"
    );

    if retrieved.is_empty() {
        return Ok(serde_json::json!({
            "status": "success",
            "query": args.query,
            "answer": EMPTY_KNOWLEDGE_MESSAGE,
            "sources": [],
            "retrieved_chunks": 0,
            "retrieval_time_ms": retrieval_time_ms,
            "generation_time_ms": 0,
            "total_time_ms": elapsed_ms(start),
        }));
    }

    let context_block = build_context(&retrieved);
    let messages = build_messages(&args.query, &context_block);
    let llm = LlmClient::from_config(&ctx.config.llm)?;

    let generation_start = Instant::now();
    let answer = llm
        .generate_chat(&messages, args.max_tokens, args.temperature)
        .await?;
    let generation_time_ms = elapsed_ms(generation_start);

    Ok(serde_json::json!({
        "status": "success",
        "query": args.query,
        "answer": answer,
        "sources": unique_sources(&retrieved),
        "retrieved_chunks": retrieved.len(),
        "retrieval_time_ms": retrieval_time_ms,
        "generation_time_ms": generation_time_ms,
        "total_time_ms": elapsed_ms(start),
        "chunk_map": chunk_number_map(&retrieved),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chunk(text: &str, source: &str, page: i32, distance: f64) -> RetrievedChunk {
        RetrievedChunk {
            id: 1,
            text: text.to_string(),
            source: source.to_string(),
            page,
            skillsets: None,
            title: None,
            author: None,
            url: None,
            creation_date: Utc::now(),
            distance,
        }
    }

    #[test]
    fn context_block_format() {
        let chunks = vec![
            chunk("IAM basics.", "a.pdf", 3, 0.1234),
            chunk("Roles and policies.", "b.pdf", 1, 0.2),
        ];
        let context = build_context(&chunks);
        assert_eq!(
            context,
            "[Chunk number 1 - a.pdf (page 3) - distance: 0.123]\nIAM basics.\n\
             \n---\n\
             [Chunk number 2 - b.pdf (page 1) - distance: 0.200]\nRoles and policies.\n"
        );
    }

    #[test]
    fn chunk_map_groups_duplicate_texts() {
        let chunks = vec![
            chunk("same", "a.pdf", 1, 0.1),
            chunk("other", "a.pdf", 2, 0.2),
            chunk("same", "b.pdf", 1, 0.3),
        ];
        let map = chunk_number_map(&chunks);
        assert_eq!(map["same"], vec![1, 3]);
        assert_eq!(map["other"], vec![2]);
    }

    #[test]
    fn unique_sources_keep_first_appearance_order() {
        let chunks = vec![
            chunk("t1", "b.pdf", 1, 0.1),
            chunk("t2", "a.pdf", 1, 0.2),
            chunk("t3", "b.pdf", 2, 0.3),
        ];
        assert_eq!(unique_sources(&chunks), vec!["b.pdf", "a.pdf"]);
    }

    #[test]
    fn stream_args_defaults() {
        let args: GenerateStreamArgs = serde_json::from_value(serde_json::json!({
            "job_id": "stream-1-a",
            "query": "q",
            "collection": "docs",
        }))
        .unwrap();
        assert_eq!(args.k, 10);
        assert_eq!(args.max_tokens, 2048);
        assert!((args.temperature - 0.7).abs() < 1e-6);
        assert!(args.sources.is_none());
    }
}
