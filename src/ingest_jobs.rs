//! The two-stage ingest actors.
//!
//! `validate_and_promote` (queue `ingest-validate`, no retries): downloads
//! the quarantined upload, verifies its SHA-256, promotes it from
//! `uploads/` to `processed/` via copy-then-remove, and enqueues the
//! indexing stage. A checksum mismatch deletes the upload and fails the job
//! for good — integrity failures are not retryable.
//!
//! `ingest_document` (queue `ingest-process`, up to 3 retries): re-validates
//! the extension, downloads the promoted object, runs the document pipeline,
//! and upserts chunks with source-level idempotency.
//!
//! Within one source the stages are totally ordered: the second job only
//! exists once promotion has succeeded.

use anyhow::{bail, Context, Result};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::loader::file_extension;
use crate::models::UploadStatus;
use crate::pipeline::IngestPipeline;
use crate::queue::{JobQueue, QUEUE_INGEST_PROCESS};
use crate::worker::WorkerContext;

pub const ACTOR_VALIDATE_AND_PROMOTE: &str = "validate_and_promote";
pub const ACTOR_INGEST_DOCUMENT: &str = "ingest_document";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatePromoteArgs {
    pub doc_id: String,
    pub s3_key: String,
    pub filename: String,
    pub collection: String,
    #[serde(default)]
    pub checksum_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestDocumentArgs {
    pub doc_id: String,
    pub s3_key: String,
    pub filename: String,
    pub collection: String,
}

/// Best-effort status update on the upload record. The record may already
/// have expired (its TTL is the presign window plus a grace period), so a
/// missing key is not an error and an update never recreates one.
async fn mark_upload_status(queue: &JobQueue, doc_id: &str, status: UploadStatus) {
    let mut conn = queue.manager();
    let key = format!("upload:{}", doc_id);
    let exists: bool = conn.exists(&key).await.unwrap_or(false);
    if exists {
        let outcome: redis::RedisResult<()> = conn.hset(&key, "status", status.as_str()).await;
        if let Err(e) = outcome {
            tracing::warn!(doc_id, error = %e, "failed to update upload record status");
        }
    }
}

/// Validate the uploaded object and promote it out of quarantine.
pub async fn validate_and_promote(
    ctx: &WorkerContext,
    args: ValidatePromoteArgs,
) -> Result<serde_json::Value> {
    let tmpdir = tempfile::Builder::new()
        .prefix("ingest_")
        .tempdir()
        .context("Failed to create scratch directory")?;
    let local = tmpdir.path().join(&args.filename);

    let (download_path, meta) = ctx.object_store.get_file(&args.s3_key, &local).await?;

    if let Some(expected) = &args.checksum_sha256 {
        if !crate::hash::verify_sha256(&download_path, expected)? {
            tracing::error!(doc_id = %args.doc_id, "checksum mismatch, deleting upload");
            ctx.object_store.remove(&args.s3_key).await?;
            mark_upload_status(&ctx.queue, &args.doc_id, UploadStatus::Failed).await;
            bail!("Checksum mismatch for doc_id={}", args.doc_id);
        }
        tracing::info!(doc_id = %args.doc_id, "checksum verified, promoting to processed/");
    } else {
        tracing::warn!(doc_id = %args.doc_id, "no checksum supplied, promoting unverified");
    }

    // Promotion: copy into processed/, then remove the upload. A crash
    // between the two leaves at most a duplicate under processed/, never a
    // lost object.
    let processed_key = args.s3_key.replacen("uploads/", "processed/", 1);
    ctx.object_store.copy(&args.s3_key, &processed_key).await?;
    ctx.object_store.remove(&args.s3_key).await?;
    mark_upload_status(&ctx.queue, &args.doc_id, UploadStatus::Promoted).await;

    let next = ctx
        .queue
        .enqueue(
            QUEUE_INGEST_PROCESS,
            ACTOR_INGEST_DOCUMENT,
            serde_json::to_value(IngestDocumentArgs {
                doc_id: args.doc_id.clone(),
                s3_key: processed_key.clone(),
                filename: args.filename.clone(),
                collection: args.collection.clone(),
            })?,
        )
        .await?;

    Ok(serde_json::json!({
        "stage": "validated",
        "doc_id": args.doc_id,
        "processed_key": processed_key,
        "next_job_id": next.message_id,
        "meta": { "size": meta.size, "etag": meta.etag },
    }))
}

/// Download the promoted object and index it.
pub async fn ingest_document(
    ctx: &WorkerContext,
    args: IngestDocumentArgs,
) -> Result<serde_json::Value> {
    let ext = file_extension(&args.filename);
    if !ctx.config.allowed_extensions.contains(&ext) {
        bail!("File extension not allowed: {}", args.filename);
    }

    let tmpdir = tempfile::Builder::new()
        .prefix("ingest_")
        .tempdir()
        .context("Failed to create scratch directory")?;
    let local = tmpdir.path().join(&args.filename);

    let (download_path, _meta) = ctx.object_store.get_file(&args.s3_key, &local).await?;

    let pipeline = IngestPipeline::new(&ctx.loader, &ctx.splitter);
    let outcome = pipeline
        .ingest(
            &ctx.store,
            ctx.embedder,
            &download_path,
            &args.doc_id,
            &args.s3_key,
            &args.collection,
        )
        .await?;

    tracing::info!(
        doc_id = %outcome.doc_id,
        collection = %outcome.collection,
        chunks = outcome.chunks_inserted,
        "document indexed"
    );
    mark_upload_status(&ctx.queue, &args.doc_id, UploadStatus::Indexed).await;

    Ok(serde_json::json!({
        "stage": "indexed",
        "doc_id": outcome.doc_id,
        "processed_key": args.s3_key,
        "pages_loaded": outcome.pages_loaded,
        "collection": outcome.collection,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_substitutes_first_prefix_only() {
        let key = "uploads/doc1/uploads/report.pdf";
        assert_eq!(
            key.replacen("uploads/", "processed/", 1),
            "processed/doc1/uploads/report.pdf"
        );
    }

    #[test]
    fn validate_args_accept_missing_checksum() {
        let args: ValidatePromoteArgs = serde_json::from_value(serde_json::json!({
            "doc_id": "d1",
            "s3_key": "uploads/d1/a.pdf",
            "filename": "a.pdf",
            "collection": "docs",
        }))
        .unwrap();
        assert!(args.checksum_sha256.is_none());
    }
}
