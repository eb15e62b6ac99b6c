//! Dispatch queue handoff
//!
//! Hands completed request identifiers to the downstream generation
//! consumer via a Redis list. Fire-and-forget: a failed handoff is
//! logged and never surfaced, since the submitter already has a
//! finalized ledger record to poll and the consumer ecosystem retries
//! on its own.

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, error};

const DISPATCH_LIST: &str = "dispatch:requests";

#[derive(Clone)]
pub struct DispatchQueue {
    conn: MultiplexedConnection,
}

impl DispatchQueue {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    pub async fn enqueue(&self, request_id: &str) {
        let mut conn = self.conn.clone();
        match conn.lpush::<_, _, ()>(DISPATCH_LIST, request_id).await {
            Ok(()) => debug!("Queued request {} for dispatch", request_id),
            Err(e) => error!("Failed to queue request {} for dispatch: {}", request_id, e),
        }
    }
}
