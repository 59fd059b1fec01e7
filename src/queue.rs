//! Durable Redis-backed job queues and the result backend.
//!
//! Each logical queue is a Redis list (`knowhub:queue:{name}`) with FIFO
//! delivery via LPUSH/BRPOP and at-least-once semantics: a job that fails
//! with retries remaining is pushed back with its retry counter bumped.
//! Results live under `knowhub:results:{message_id}` with a one-hour TTL; a
//! missing result during polling reads as still-processing, never as lost.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RedisConfig;

pub const QUEUE_INGEST_VALIDATE: &str = "ingest-validate";
pub const QUEUE_INGEST_PROCESS: &str = "ingest-process";
pub const QUEUE_GENERATION: &str = "generation";

const QUEUE_PREFIX: &str = "knowhub:queue";
const RESULTS_PREFIX: &str = "knowhub:results";
const RESULT_TTL_SECONDS: u64 = 3600;
const RESULT_POLL_INTERVAL_MS: u64 = 100;

/// A unit of work on a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub message_id: String,
    pub queue_name: String,
    pub actor_name: String,
    pub kwargs: serde_json::Value,
    #[serde(default)]
    pub retries: u32,
}

/// Result-polling outcome. `Pending` covers both "not started" and "still
/// running" — the backend cannot tell them apart and must not guess.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResultState {
    Done(serde_json::Value),
    Pending,
    Timeout,
}

fn queue_key(name: &str) -> String {
    format!("{}:{}", QUEUE_PREFIX, name)
}

fn result_key(message_id: &str) -> String {
    format!("{}:{}", RESULTS_PREFIX, message_id)
}

#[derive(Clone)]
pub struct JobQueue {
    conn: ConnectionManager,
}

impl JobQueue {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url()).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { conn })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// A clone of the underlying connection manager, for callers that need
    /// raw Redis access (event streams, upload records).
    pub fn manager(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Enqueue a new job; the runtime assigns the message id.
    pub async fn enqueue(
        &self,
        queue: &str,
        actor: &str,
        kwargs: serde_json::Value,
    ) -> Result<JobMessage> {
        let message = JobMessage {
            message_id: Uuid::new_v4().to_string(),
            queue_name: queue.to_string(),
            actor_name: actor.to_string(),
            kwargs,
            retries: 0,
        };
        self.push(&message).await?;
        Ok(message)
    }

    /// Push an existing message (used for retries and caller-generated ids).
    pub async fn push(&self, message: &JobMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .lpush(queue_key(&message.queue_name), payload)
            .await
            .with_context(|| format!("Failed to enqueue on '{}'", message.queue_name))?;
        tracing::debug!(
            job_id = %message.message_id,
            queue = %message.queue_name,
            actor = %message.actor_name,
            "enqueued job"
        );
        Ok(())
    }

    /// Blocking pop across queues. Returns `None` on timeout so worker loops
    /// stay responsive to shutdown.
    pub async fn pop(&self, queues: &[String], timeout_secs: f64) -> Result<Option<JobMessage>> {
        let keys: Vec<String> = queues.iter().map(|q| queue_key(q)).collect();
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn
            .brpop(keys, timeout_secs)
            .await
            .context("BRPOP failed")?;
        match popped {
            Some((_, payload)) => {
                let message: JobMessage = serde_json::from_str(&payload)
                    .context("Malformed job message on queue")?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Record a job's return value (or error report) in the result backend.
    pub async fn store_result(&self, message_id: &str, value: &serde_json::Value) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(
                result_key(message_id),
                serde_json::to_string(value)?,
                RESULT_TTL_SECONDS,
            )
            .await
            .context("Failed to store job result")?;
        Ok(())
    }

    /// Poll a job result.
    ///
    /// `wait_ms == 0` returns immediately with `Done` or `Pending`; a
    /// positive wait polls until the result appears or the window expires
    /// (`Timeout`).
    pub async fn get_result(&self, message_id: &str, wait_ms: u64) -> Result<JobResultState> {
        let key = result_key(message_id);
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(wait_ms);

        loop {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn.get(&key).await.context("Failed to read job result")?;
            if let Some(raw) = raw {
                let value = serde_json::from_str(&raw).context("Malformed job result")?;
                return Ok(JobResultState::Done(value));
            }
            if wait_ms == 0 {
                return Ok(JobResultState::Pending);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(JobResultState::Timeout);
            }
            tokio::time::sleep(std::time::Duration::from_millis(RESULT_POLL_INTERVAL_MS)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_through_json() {
        let message = JobMessage {
            message_id: "abc".into(),
            queue_name: QUEUE_INGEST_VALIDATE.into(),
            actor_name: "validate_and_promote".into(),
            kwargs: serde_json::json!({"doc_id": "d1", "s3_key": "uploads/d1/a.pdf"}),
            retries: 2,
        };
        let payload = serde_json::to_string(&message).unwrap();
        let back: JobMessage = serde_json::from_str(&payload).unwrap();
        assert_eq!(back.message_id, "abc");
        assert_eq!(back.retries, 2);
        assert_eq!(back.kwargs["doc_id"], "d1");
    }

    #[test]
    fn retries_default_to_zero() {
        let payload = r#"{"message_id":"m","queue_name":"q","actor_name":"a","kwargs":{}}"#;
        let message: JobMessage = serde_json::from_str(payload).unwrap();
        assert_eq!(message.retries, 0);
    }

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(queue_key("generation"), "knowhub:queue:generation");
        assert_eq!(result_key("id1"), "knowhub:results:id1");
    }
}
