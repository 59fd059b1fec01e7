//! Queue worker: pulls jobs from the configured queues and runs actors.
//!
//! One worker process serves any subset of the three queues. The actor body
//! runs to completion on a single task; parallelism comes from running more
//! worker processes. Failures are retried up to the actor's `max_retries` by
//! re-enqueueing with a bumped retry counter; exhausted jobs record an error
//! result (when the actor stores results) and are dropped.

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::config::Config;
use crate::embedding::{self, EmbeddingClient};
use crate::generate::{self, ACTOR_GENERATE_ANSWER, ACTOR_GENERATE_ANSWER_STREAM};
use crate::ingest_jobs::{self, ACTOR_INGEST_DOCUMENT, ACTOR_VALIDATE_AND_PROMOTE};
use crate::loader::DocumentLoader;
use crate::object_store::ObjectStore;
use crate::queue::{
    JobMessage, JobQueue, QUEUE_GENERATION, QUEUE_INGEST_PROCESS, QUEUE_INGEST_VALIDATE,
};
use crate::splitter::DocumentSplitter;
use crate::store::VectorStore;

/// Static description of an actor: where it listens and how it fails.
pub struct ActorSpec {
    pub name: &'static str,
    pub queue: &'static str,
    pub max_retries: u32,
    pub store_results: bool,
}

pub const ACTORS: [ActorSpec; 4] = [
    ActorSpec {
        name: ACTOR_VALIDATE_AND_PROMOTE,
        queue: QUEUE_INGEST_VALIDATE,
        max_retries: 0,
        store_results: true,
    },
    ActorSpec {
        name: ACTOR_INGEST_DOCUMENT,
        queue: QUEUE_INGEST_PROCESS,
        max_retries: 3,
        store_results: true,
    },
    ActorSpec {
        name: ACTOR_GENERATE_ANSWER_STREAM,
        queue: QUEUE_GENERATION,
        max_retries: 3,
        store_results: false,
    },
    ActorSpec {
        name: ACTOR_GENERATE_ANSWER,
        queue: QUEUE_GENERATION,
        max_retries: 3,
        store_results: true,
    },
];

pub fn actor_spec(name: &str) -> Option<&'static ActorSpec> {
    ACTORS.iter().find(|a| a.name == name)
}

/// Shared per-process resources handed to every actor invocation. The
/// Postgres pool and the embedder are process-wide; everything else is
/// request-scoped inside the actors.
pub struct WorkerContext {
    pub config: Arc<Config>,
    pub object_store: Arc<ObjectStore>,
    pub queue: JobQueue,
    pub store: VectorStore,
    pub embedder: &'static EmbeddingClient,
    pub loader: DocumentLoader,
    pub splitter: DocumentSplitter,
}

/// Run a worker over the given queues until interrupted.
pub async fn run_worker(config: Config, queues: Vec<String>) -> Result<()> {
    let queues = if queues.is_empty() {
        vec![
            QUEUE_INGEST_VALIDATE.to_string(),
            QUEUE_INGEST_PROCESS.to_string(),
            QUEUE_GENERATION.to_string(),
        ]
    } else {
        queues
    };

    let config = Arc::new(config);
    let object_store = Arc::new(ObjectStore::new(&config.object_store)?);
    let queue = JobQueue::connect(&config.redis).await?;
    let store = VectorStore::connect_lazy(&config.postgres)?;
    let embedder = embedding::global(&config.embedding)?;
    let loader = DocumentLoader::new(&config.pipeline);
    let splitter = DocumentSplitter::new(&config.pipeline);

    let ctx = WorkerContext {
        config,
        object_store,
        queue,
        store,
        embedder,
        loader,
        splitter,
    };

    tracing::info!(queues = ?queues, "worker started");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            popped = ctx.queue.pop(&queues, 1.0) => {
                match popped {
                    Ok(Some(message)) => dispatch(&ctx, message).await,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "queue pop failed, backing off");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    ctx.store.close().await;
    Ok(())
}

async fn dispatch(ctx: &WorkerContext, message: JobMessage) {
    let Some(spec) = actor_spec(&message.actor_name) else {
        tracing::error!(actor = %message.actor_name, job_id = %message.message_id, "unknown actor, dropping job");
        return;
    };

    tracing::info!(
        job_id = %message.message_id,
        actor = %message.actor_name,
        retries = message.retries,
        "job started"
    );

    match run_actor(ctx, &message).await {
        Ok(value) => {
            if spec.store_results {
                if let Err(e) = ctx.queue.store_result(&message.message_id, &value).await {
                    tracing::error!(job_id = %message.message_id, error = %e, "failed to store job result");
                }
            }
            tracing::info!(job_id = %message.message_id, actor = %message.actor_name, "job completed");
        }
        Err(e) => {
            if message.retries < spec.max_retries {
                tracing::warn!(
                    job_id = %message.message_id,
                    actor = %message.actor_name,
                    error = %e,
                    retry = message.retries + 1,
                    "job failed, re-enqueueing"
                );
                let mut retry = message.clone();
                retry.retries += 1;
                if let Err(push_err) = ctx.queue.push(&retry).await {
                    tracing::error!(job_id = %message.message_id, error = %push_err, "failed to re-enqueue job");
                }
            } else {
                tracing::error!(
                    job_id = %message.message_id,
                    actor = %message.actor_name,
                    error = %e,
                    "job failed permanently"
                );
                if spec.store_results {
                    let failure = serde_json::json!({
                        "status": "error",
                        "error": e.to_string(),
                    });
                    if let Err(store_err) =
                        ctx.queue.store_result(&message.message_id, &failure).await
                    {
                        tracing::error!(job_id = %message.message_id, error = %store_err, "failed to record job failure");
                    }
                }
            }
        }
    }
}

async fn run_actor(ctx: &WorkerContext, message: &JobMessage) -> Result<serde_json::Value> {
    match message.actor_name.as_str() {
        ACTOR_VALIDATE_AND_PROMOTE => {
            let args = serde_json::from_value(message.kwargs.clone())?;
            ingest_jobs::validate_and_promote(ctx, args).await
        }
        ACTOR_INGEST_DOCUMENT => {
            let args = serde_json::from_value(message.kwargs.clone())?;
            ingest_jobs::ingest_document(ctx, args).await
        }
        ACTOR_GENERATE_ANSWER_STREAM => {
            let args = serde_json::from_value(message.kwargs.clone())?;
            generate::generate_answer_stream(ctx, args).await
        }
        ACTOR_GENERATE_ANSWER => {
            let args = serde_json::from_value(message.kwargs.clone())?;
            generate::generate_answer(ctx, args).await
        }
        other => bail!("Unknown actor: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_table_covers_queues_and_retry_policy() {
        let validate = actor_spec(ACTOR_VALIDATE_AND_PROMOTE).unwrap();
        assert_eq!(validate.queue, QUEUE_INGEST_VALIDATE);
        assert_eq!(validate.max_retries, 0);
        assert!(validate.store_results);

        let ingest = actor_spec(ACTOR_INGEST_DOCUMENT).unwrap();
        assert_eq!(ingest.queue, QUEUE_INGEST_PROCESS);
        assert_eq!(ingest.max_retries, 3);

        let stream = actor_spec(ACTOR_GENERATE_ANSWER_STREAM).unwrap();
        assert_eq!(stream.queue, QUEUE_GENERATION);
        assert!(!stream.store_results);

        assert!(actor_spec("nope").is_none());
    }
}
