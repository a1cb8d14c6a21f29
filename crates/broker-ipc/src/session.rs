//! Connection session.
//!
//! One task per connection reads wire records, gates them on the handshake
//! and dispatches them against the shared [`Broker`]. Replies and deliveries
//! share one outbound channel drained by a writer task, so a slow peer only
//! ever delays its own connection.

use crate::broker::error_code;
use crate::{Broker, IpcError, IpcResult};
use broker_backends::CachedResponse;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream_store::{SessionHandle, StoreError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn, Instrument};
use wire_protocol_types::{
    encode_frame, ClientFrame, CodecError, ErrorCode, Inbound, LineDecoder, ServerFrame, FEATURES,
    PROTOCOL_VERSION,
};

const READ_CHUNK: usize = 8 * 1024;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-connection protocol state.
pub(crate) struct Connection {
    broker: Arc<Broker>,
    handle: Arc<SessionHandle>,
    greeted: bool,
}

impl Connection {
    pub(crate) fn new(broker: Arc<Broker>, handle: Arc<SessionHandle>) -> Self {
        Self {
            broker,
            handle,
            greeted: false,
        }
    }

    /// Interpret one wire record. Returns the reply to send, if any.
    ///
    /// Only store corruption escapes as an error.
    pub(crate) async fn handle_record(&mut self, record: &[u8]) -> Result<Option<ServerFrame>, StoreError> {
        match Inbound::parse(record) {
            None => {
                warn!(bytes = record.len(), "Dropping malformed record");
                Ok(None)
            }
            Some(Inbound::Unsupported { frame_type, req_id }) => {
                debug!(frame_type = %frame_type, "Unsupported frame type");
                Ok(Some(ServerFrame::error(
                    req_id.as_deref(),
                    ErrorCode::Unsupported,
                    frame_type,
                )))
            }
            Some(Inbound::Invalid {
                frame_type,
                req_id,
                detail,
            }) => {
                debug!(frame_type = %frame_type, detail = %detail, "Invalid frame");
                Ok(Some(ServerFrame::error(
                    req_id.as_deref(),
                    ErrorCode::BadFrame,
                    serde_json::json!({ "type": frame_type, "reason": detail }),
                )))
            }
            Some(Inbound::Frame(frame)) => self.handle_frame(frame).await,
        }
    }

    /// Dispatch a parsed frame.
    pub(crate) async fn handle_frame(&mut self, frame: ClientFrame) -> Result<Option<ServerFrame>, StoreError> {
        let req_id = frame.req_id().map(String::from);
        let req_id = req_id.as_deref();

        if !self.greeted && !matches!(frame, ClientFrame::Hello { .. }) {
            return Ok(Some(ServerFrame::error(
                req_id,
                ErrorCode::NotReady,
                frame.frame_type(),
            )));
        }

        let store = self.broker.store();
        let now = Instant::now();

        let reply = match frame {
            ClientFrame::Hello { .. } => {
                self.greeted = true;
                Some(ServerFrame::ok(
                    req_id,
                    serde_json::json!({
                        "version": PROTOCOL_VERSION,
                        "features": FEATURES,
                        "sessionId": self.handle.id(),
                    }),
                ))
            }
            ClientFrame::Enqueue {
                to,
                env,
                idempotency_key,
                ..
            } => Some(self.enqueue(req_id, &to, env, idempotency_key.as_deref()).await?),
            ClientFrame::Subscribe { stream, .. } => {
                store.subscribe(&self.handle, &stream, now);
                Some(ServerFrame::ok(
                    req_id,
                    serde_json::json!({ "stream": stream, "credit": self.handle.credit() }),
                ))
            }
            ClientFrame::Grant { n, .. } => {
                let delivered = store.grant(&self.handle, n, now);
                debug!(n, delivered, "Granted credit");
                None
            }
            ClientFrame::Ack { id, .. } => {
                if !store.ack(&self.handle, &id).or_else(recover)? {
                    debug!(envelope = %id, "Ack for unknown envelope ignored");
                }
                None
            }
            ClientFrame::Nack { id, .. } => {
                if !store.nack(&self.handle, &id, now).or_else(recover)? {
                    debug!(envelope = %id, "Nack for unknown envelope ignored");
                }
                None
            }
            ClientFrame::Stats { stream, .. } => Some(match store.stats(&stream, now) {
                Ok(stats) => reply_with(req_id, &stats),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => ServerFrame::error(req_id, error_code(&e), e.to_string()),
            }),
            ClientFrame::Snapshot { .. } => Some(reply_with(
                req_id,
                &serde_json::json!({ "rows": store.snapshot() }),
            )),
            ClientFrame::Metrics { .. } => Some(reply_with(req_id, &store.metrics(now))),
        };

        Ok(reply)
    }

    async fn enqueue(
        &self,
        req_id: Option<&str>,
        stream: &str,
        draft: wire_protocol_types::EnvelopeDraft,
        idempotency_key: Option<&str>,
    ) -> Result<ServerFrame, StoreError> {
        let cache = self.broker.idempotency();
        if let Some(key) = idempotency_key {
            if let Some(cached) = cache.lookup(key, Instant::now()) {
                debug!(key = %key, "Replaying idempotent enqueue");
                return Ok(ServerFrame::ok(req_id, cached.body));
            }
        }

        let draft = match self.broker.offload(draft).await {
            Ok(draft) => draft,
            Err(e) => {
                warn!(error = %e, stream = %stream, "Blob offload failed");
                return Ok(ServerFrame::error(
                    req_id,
                    ErrorCode::BackendUnavailable,
                    e.to_string(),
                ));
            }
        };

        match self.broker.store().enqueue(stream, draft, Instant::now()) {
            Ok(env) => {
                let result = serde_json::json!({ "id": env.id, "stream": stream });
                if let Some(key) = idempotency_key {
                    cache.record(
                        key,
                        CachedResponse::new("ok", result.clone()).with_header("stream", stream),
                        Instant::now(),
                    );
                }
                Ok(ServerFrame::ok(req_id, result))
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!(error = %e, stream = %stream, "Enqueue rejected");
                Ok(ServerFrame::error(req_id, error_code(&e), e.to_string()))
            }
        }
    }

    /// Release the session's inflight envelopes back to their streams.
    pub(crate) fn close(&self) -> Result<usize, StoreError> {
        self.broker.store().close_session(&self.handle, Instant::now())
    }
}

/// Non-fatal store errors on flow-control frames degrade to a no-op.
fn recover(err: StoreError) -> Result<bool, StoreError> {
    if err.is_fatal() {
        Err(err)
    } else {
        Ok(false)
    }
}

fn reply_with<T: Serialize>(req_id: Option<&str>, result: &T) -> ServerFrame {
    match serde_json::to_value(result) {
        Ok(value) => ServerFrame::ok(req_id, value),
        Err(e) => ServerFrame::error(req_id, ErrorCode::Internal, e.to_string()),
    }
}

/// Serve one connection until EOF, error or shutdown.
///
/// Inflight envelopes of the session are requeued before this returns.
pub async fn serve_connection<S>(
    stream: S,
    broker: Arc<Broker>,
    mut shutdown: broadcast::Receiver<()>,
) -> IpcResult<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = Arc::new(SessionHandle::new(tx.clone()));
    let span = tracing::info_span!("connection", session_id = %handle.id());

    async move {
        debug!("Client connected");
        let writer_task = tokio::spawn(write_frames(writer, rx).in_current_span());

        let mut connection = Connection::new(broker.clone(), handle.clone());
        let mut decoder = LineDecoder::new(broker.options().max_frame_bytes);
        let mut chunk = vec![0u8; READ_CHUNK];

        let outcome: IpcResult<()> = loop {
            let read = tokio::select! {
                read = reader.read(&mut chunk) => read,
                _ = shutdown.recv() => {
                    debug!("Closing connection for shutdown");
                    break Ok(());
                }
            };

            let n = match read {
                Ok(0) => {
                    debug!("Client disconnected");
                    break Ok(());
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "Read error");
                    break Ok(());
                }
            };

            let records = match decoder.decode(&chunk[..n]) {
                Ok(records) => records,
                Err(CodecError::FrameTooLarge { limit }) => {
                    warn!(limit, "Frame too large, closing connection");
                    let _ = tx.send(ServerFrame::error(
                        None,
                        ErrorCode::BadFrame,
                        format!("frame exceeds {} bytes", limit),
                    ));
                    break Ok(());
                }
                Err(e) => break Err(e.into()),
            };

            let mut fatal = None;
            for record in records {
                match connection.handle_record(&record).await {
                    Ok(Some(reply)) => {
                        let _ = tx.send(reply);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        fatal = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = fatal {
                broker.report_fatal(&e);
                break Err(IpcError::Fatal(e.to_string()));
            }
        };

        match connection.close() {
            Ok(released) if released > 0 => {
                info!(released, "Requeued inflight envelopes on disconnect")
            }
            Ok(_) => {}
            Err(e) => broker.report_fatal(&e),
        }

        drop(connection);
        drop(handle);
        drop(tx);
        let mut writer_task = writer_task;
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
            .await
            .is_err()
        {
            writer_task.abort();
        }

        outcome
    }
    .instrument(span)
    .await
}

/// Drain outbound frames onto the socket.
async fn write_frames<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<ServerFrame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let bytes = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                continue;
            }
        };
        if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
            debug!("Writer closed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
