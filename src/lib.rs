//! # KnowHub
//!
//! **A document-ingestion and retrieval-augmented generation backend.**
//!
//! Clients upload documents through presigned URLs; a two-stage job pipeline
//! validates, promotes, and indexes them into a Postgres/pgvector hybrid
//! store; a streaming worker answers natural-language queries with inline
//! chunk citations, pushing tokens through a Redis event log to the SSE
//! endpoint.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐ presign ┌─────────────┐ enqueue ┌──────────────────┐
//! │ Client │────────▶│ Coordinator │────────▶│ validate+promote │
//! └───┬────┘         └──────┬──────┘         └────────┬─────────┘
//!     │ PUT (signed)        │ SSE ◀─ Redis stream     │ copy+remove
//!     ▼                     │                         ▼
//! ┌────────┐          ┌─────┴─────┐           ┌────────────────┐
//! │ MinIO  │          │ generate  │           │ ingest (chunk, │
//! │ bucket │          │ (stream)  │           │ embed, upsert) │
//! └────────┘          └─────┬─────┘           └───────┬────────┘
//!                           └──────▶ pgvector ◀───────┘
//! ```
//!
//! ## Dataflow
//!
//! 1. **Presign** — the coordinator signs an upload URL under
//!    `uploads/{doc_id}/{filename}` and writes a TTL'd upload record.
//! 2. **Validate & promote** — a worker downloads the upload, verifies its
//!    SHA-256, and promotes it to `processed/` (copy, then remove).
//! 3. **Ingest** — the promoted object is loaded ([`loader`]), normalized
//!    ([`normalize`]), chunked ([`splitter`]), embedded ([`embedding`]), and
//!    upserted with source-level idempotency ([`store`]).
//! 4. **Generate** — a streaming worker retrieves top-k chunks, builds a
//!    cited-context prompt ([`prompt`]), streams LLM tokens ([`llm`]) into
//!    the per-job event log ([`events`]), and persists a session record.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment configuration and the allowed-extension set |
//! | [`models`] | Core data types: documents, chunks, retrieval rows, events |
//! | [`hash`] | Streaming SHA-256 and constant-time checksum verification |
//! | [`object_store`] | S3-compatible adapter with SigV4 signing and presigning |
//! | [`store`] | Postgres/pgvector collections, idempotent upsert, hybrid search |
//! | [`embedding`] | Remote embedding client with batching and retries |
//! | [`extract`] | Raw PDF/DOCX/PPTX text extraction |
//! | [`tables`] | Table-region geometry and Markdown rendering |
//! | [`loader`] | Extension-dispatched document loading |
//! | [`normalize`] | Idempotent text normalization |
//! | [`splitter`] | Markdown-aware recursive chunking |
//! | [`pipeline`] | Ingest orchestration: load → normalize → split → embed → upsert |
//! | [`queue`] | Redis job queues and the result backend |
//! | [`events`] | Per-job event streams (XADD/XREAD) |
//! | [`ingest_jobs`] | The validate-and-promote and ingest-document actors |
//! | [`prompt`] | Prompt templates with inline-citation instructions |
//! | [`llm`] | Sum-typed LLM providers with explicit streaming capability |
//! | [`generate`] | Generation actors and session persistence |
//! | [`worker`] | Queue worker loop and the actor registry |
//! | [`server`] | Axum coordinator: presign, enqueue, status, SSE |

pub mod config;
pub mod embedding;
pub mod events;
pub mod extract;
pub mod generate;
pub mod hash;
pub mod ingest_jobs;
pub mod llm;
pub mod loader;
pub mod models;
pub mod normalize;
pub mod object_store;
pub mod pipeline;
pub mod prompt;
pub mod queue;
pub mod server;
pub mod splitter;
pub mod store;
pub mod tables;
pub mod worker;
