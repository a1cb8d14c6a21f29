//! State shared by every connection.

use broker_backends::{BackendError, BlobStore, IdempotencyCache, JobQueue, MemoryBlobStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream_store::{StoreError, StoreResult, StreamStore};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use wire_protocol_types::{EnvelopeDraft, ErrorCode, DEFAULT_MAX_FRAME_BYTES};

/// Connection-level limits and offload policy.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Longest accepted wire record.
    pub max_frame_bytes: usize,
    /// Payloads serializing to more bytes than this go to the blob store.
    pub blob_offload_bytes: Option<usize>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            blob_offload_bytes: None,
        }
    }
}

/// Stream store plus the collaborators consulted around it.
pub struct Broker {
    store: StreamStore,
    blobs: Arc<dyn BlobStore>,
    idempotency: IdempotencyCache,
    options: BrokerOptions,
    /// Job queue and queue name dead-lettered envelopes are handed to.
    dead_letters: Option<(Arc<dyn JobQueue>, String)>,
    fatal_tx: broadcast::Sender<String>,
}

impl Broker {
    /// Create a broker with an in-memory blob store and default idempotency TTL.
    pub fn new(store: StreamStore, options: BrokerOptions) -> Self {
        let (fatal_tx, _) = broadcast::channel(4);
        Self {
            store,
            blobs: Arc::new(MemoryBlobStore::new()),
            idempotency: IdempotencyCache::default(),
            options,
            dead_letters: None,
            fatal_tx,
        }
    }

    /// Use `blobs` for payload offload.
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = blobs;
        self
    }

    /// Replay idempotent enqueues for `ttl`.
    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency = IdempotencyCache::new(ttl);
        self
    }

    /// Hand dead-lettered envelopes to `queue` on `jobs` instead of discarding them.
    pub fn with_dead_letter_queue(mut self, jobs: Arc<dyn JobQueue>, queue: &str) -> Self {
        self.dead_letters = Some((jobs, queue.to_string()));
        self
    }

    pub fn store(&self) -> &StreamStore {
        &self.store
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn idempotency(&self) -> &IdempotencyCache {
        &self.idempotency
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    /// Job queue and queue name receiving dead letters, if any.
    pub fn dead_letter_queue(&self) -> Option<(&Arc<dyn JobQueue>, &str)> {
        self.dead_letters
            .as_ref()
            .map(|(jobs, queue)| (jobs, queue.as_str()))
    }

    /// Receiver notified when the store reports corruption.
    pub fn subscribe_fatal(&self) -> broadcast::Receiver<String> {
        self.fatal_tx.subscribe()
    }

    /// Log a state dump for a fatal store error and notify the server.
    pub fn report_fatal(&self, err: &StoreError) {
        let dump = serde_json::to_string(&self.store.snapshot())
            .unwrap_or_else(|e| format!("<snapshot unavailable: {}>", e));
        error!(error = %err, snapshot = %dump, "Stream store corrupted, shutting down");
        let _ = self.fatal_tx.send(err.to_string());
    }

    /// Periodic maintenance: ack timeouts, backoff, idempotency expiry and
    /// dead-letter hand-off.
    ///
    /// Returns the number of envelopes requeued after an ack timeout.
    pub async fn sweep(&self, now: Instant) -> StoreResult<usize> {
        let expired_keys = self.idempotency.sweep(now);
        if expired_keys > 0 {
            debug!(expired_keys, "Swept idempotency cache");
        }
        let requeued = self.store.tick(now)?;
        self.forward_dead_letters().await;
        Ok(requeued)
    }

    async fn forward_dead_letters(&self) {
        let drained = self.store.drain_dead_letters();
        if drained.is_empty() {
            return;
        }
        let Some((jobs, queue)) = &self.dead_letters else {
            debug!(count = drained.len(), "Discarding dead-lettered envelopes");
            return;
        };

        for (stream, env) in drained {
            let payload = serde_json::json!({ "stream": stream, "env": env });
            match jobs.send(queue, payload).await {
                Ok(job) => debug!(
                    stream = %stream,
                    envelope = %env.id,
                    job_id = %job.job_id,
                    "Handed dead letter to job queue"
                ),
                Err(e) => warn!(
                    stream = %stream,
                    envelope = %env.id,
                    error = %e,
                    "Failed to hand dead letter to job queue"
                ),
            }
        }
    }

    /// Replace an oversized payload with a blob reference.
    pub(crate) async fn offload(&self, mut draft: EnvelopeDraft) -> Result<EnvelopeDraft, BackendError> {
        let Some(limit) = self.options.blob_offload_bytes else {
            return Ok(draft);
        };
        let bytes = serde_json::to_vec(&draft.payload)?;
        if bytes.len() <= limit {
            return Ok(draft);
        }

        let size = bytes.len();
        let blob = self.blobs.store(bytes, "application/json").await?;
        debug!(blob_id = %blob.blob_id, size, "Offloaded payload");
        draft.payload = blob.to_marker()?;
        Ok(draft)
    }
}

/// Wire code for a non-fatal store error.
pub(crate) fn error_code(err: &StoreError) -> ErrorCode {
    match err {
        StoreError::StreamFull { .. } => ErrorCode::StreamFull,
        StoreError::StreamNotFound(_) => ErrorCode::NotFound,
        StoreError::DuplicateEnvelope { .. } => ErrorCode::BadFrame,
        StoreError::Corrupted(_) => ErrorCode::Internal,
    }
}
