//! Per-job event log on Redis streams.
//!
//! Each streaming generation job appends `{type, data}` entries to
//! `knowhub:stream:{job_id}` (`data` is JSON-serialized). The TTL is
//! refreshed to one hour on every append, so an abandoned stream expires on
//! its own. The log namespace is partitioned per job id — no cross-job
//! interference is possible.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use crate::models::StreamEventType;

pub const STREAM_PREFIX: &str = "knowhub:stream";
pub const STREAM_TTL_SECONDS: i64 = 3600;

/// Long-poll window and batch size for subscribers.
pub const READ_BLOCK_MS: usize = 1000;
pub const READ_COUNT: usize = 10;

pub fn stream_key(job_id: &str) -> String {
    format!("{}:{}", STREAM_PREFIX, job_id)
}

/// Append an event and refresh the stream TTL.
pub async fn publish(
    conn: &mut ConnectionManager,
    stream_key: &str,
    event_type: StreamEventType,
    data: &serde_json::Value,
) -> Result<()> {
    let payload = serde_json::to_string(data)?;
    let _: String = conn
        .xadd(
            stream_key,
            "*",
            &[("type", event_type.as_str()), ("data", payload.as_str())],
        )
        .await
        .with_context(|| format!("Failed to append to stream '{}'", stream_key))?;
    let _: bool = conn
        .expire(stream_key, STREAM_TTL_SECONDS)
        .await
        .with_context(|| format!("Failed to refresh TTL on '{}'", stream_key))?;
    Ok(())
}

/// One raw entry read back from a stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub event_type: String,
    /// JSON-serialized payload, exactly as published.
    pub data: String,
}

/// Blocking batch read after `last_id`. Returns an empty vector when the
/// block window elapses without new entries.
pub async fn read_batch(
    conn: &mut ConnectionManager,
    stream_key: &str,
    last_id: &str,
) -> Result<Vec<StreamEntry>> {
    let options = StreamReadOptions::default()
        .block(READ_BLOCK_MS)
        .count(READ_COUNT);
    let reply: StreamReadReply = conn
        .xread_options(&[stream_key], &[last_id], &options)
        .await
        .with_context(|| format!("XREAD failed on '{}'", stream_key))?;

    let mut entries = Vec::new();
    for key in reply.keys {
        for id in key.ids {
            let event_type: String = id.get("type").unwrap_or_default();
            let data: String = id.get("data").unwrap_or_default();
            entries.push(StreamEntry {
                id: id.id.clone(),
                event_type,
                data,
            });
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_keys_are_per_job() {
        assert_eq!(
            stream_key("stream-17-abcd"),
            "knowhub:stream:stream-17-abcd"
        );
    }
}
