//! Resumable poll delivery.
//!
//! The durable event log is replayable from any cursor: `-1` replays the
//! whole run, and a fresh observer needs nothing but the run id to catch
//! up. The cursor lives in memory only; resumption durability comes from
//! the log itself, not from the observer.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use spyglass_api::{ApiClient, RunEventPage, RunStatus};

use crate::error::StreamError;
use crate::event::{SequencedRunEvent, parse_sequenced};

/// Cursor value that replays the log from the beginning.
pub const INITIAL_CURSOR: i64 = -1;

/// Fixed delay between poll rounds while the run is still going.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Executor surface the delivery layer needs. `ApiClient` is the real
/// implementation; tests script one.
#[async_trait]
pub trait RunBackend: Send + Sync {
    async fn list_run_events(
        &self,
        run_id: &str,
        after: i64,
    ) -> Result<RunEventPage, StreamError>;

    async fn respond_to_pause(
        &self,
        run_id: &str,
        node_id: &str,
        response: &Value,
    ) -> Result<(), StreamError>;

    async fn stop_run(&self, run_id: &str) -> Result<(), StreamError>;
}

#[async_trait]
impl RunBackend for ApiClient {
    async fn list_run_events(
        &self,
        run_id: &str,
        after: i64,
    ) -> Result<RunEventPage, StreamError> {
        Ok(ApiClient::list_run_events(self, run_id, after).await?)
    }

    async fn respond_to_pause(
        &self,
        run_id: &str,
        node_id: &str,
        response: &Value,
    ) -> Result<(), StreamError> {
        Ok(ApiClient::respond_to_pause(self, run_id, node_id, response).await?)
    }

    async fn stop_run(&self, run_id: &str) -> Result<(), StreamError> {
        Ok(ApiClient::stop_run(self, run_id).await?)
    }
}

/// One decoded poll round: the events after the cursor, in log order,
/// plus the run status the executor reported alongside them.
#[derive(Debug)]
pub struct PolledBatch {
    pub events: Vec<SequencedRunEvent>,
    pub status: RunStatus,
}

/// Decode a poll page, advancing the cursor past every entry seen.
/// Entries whose payload is not a parseable event still advance it; they
/// are dropped with a warning so one bad log entry cannot wedge the loop.
#[must_use]
pub fn decode_page(run_id: &str, page: RunEventPage, cursor: &mut i64) -> PolledBatch {
    let mut events = Vec::with_capacity(page.events.len());
    for raw in &page.events {
        if raw.seq <= *cursor {
            // Already consumed; the log can overlap on resume.
            continue;
        }
        *cursor = raw.seq;
        match parse_sequenced(raw) {
            Some(event) => events.push(event),
            None => {
                warn!(run_id, seq = raw.seq, "dropping malformed log entry");
            }
        }
    }
    PolledBatch {
        events,
        status: page.status,
    }
}
