//! Broker client.
//!
//! Speaks the same NDJSON protocol as any other peer. Deliveries that arrive
//! while a request is waiting for its reply are buffered and handed out by
//! [`BrokerClient::next_delivery`].

use crate::{IpcError, IpcResult};
use std::collections::VecDeque;
use std::path::Path;
use stream_store::{MetricsReport, SnapshotRow, StreamStats};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, warn};
use wire_protocol_types::{encode_frame, ClientFrame, Envelope, EnvelopeDraft, ServerFrame};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Client connection to a broker.
pub struct BrokerClient {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    next_req: u64,
    deliveries: VecDeque<Envelope>,
    line: String,
}

impl BrokerClient {
    /// Connect over the broker's Unix domain socket.
    pub async fn connect_unix(path: impl AsRef<Path>) -> IpcResult<Self> {
        let stream = UnixStream::connect(path.as_ref())
            .await
            .map_err(|e| IpcError::Socket(format!("Failed to connect: {}", e)))?;
        Ok(Self::from_stream(stream))
    }

    /// Connect over TCP.
    pub async fn connect_tcp(addr: &str) -> IpcResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| IpcError::Socket(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected byte stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(Box::new(reader)),
            writer: Box::new(writer),
            next_req: 0,
            deliveries: VecDeque::new(),
            line: String::new(),
        }
    }

    /// Check whether a broker answers on `path`.
    pub async fn is_broker_running(path: impl AsRef<Path>) -> bool {
        match Self::connect_unix(path).await {
            Ok(mut client) => client.hello().await.is_ok(),
            Err(_) => false,
        }
    }

    fn next_req_id(&mut self) -> String {
        self.next_req += 1;
        format!("r{}", self.next_req)
    }

    /// Write one frame.
    pub async fn send(&mut self, frame: &ClientFrame) -> IpcResult<()> {
        let bytes = encode_frame(frame)?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read the next frame from the broker.
    pub async fn recv(&mut self) -> IpcResult<ServerFrame> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                return Err(IpcError::ConnectionClosed);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(ServerFrame::from_json(trimmed)?);
        }
    }

    /// Send a request-style frame and wait for its reply.
    pub async fn request(&mut self, frame: ClientFrame) -> IpcResult<serde_json::Value> {
        let req_id = frame
            .req_id()
            .map(String::from)
            .ok_or_else(|| IpcError::Protocol(format!("{} frame has no reqId", frame.frame_type())))?;
        self.send(&frame).await?;

        loop {
            match self.recv().await? {
                ServerFrame::Deliver { env } => self.deliveries.push_back(env),
                ServerFrame::Ok {
                    req_id: Some(id),
                    result,
                } if id == req_id => return Ok(result),
                ServerFrame::Error { req_id: id, code, detail }
                    if id.is_none() || id.as_deref() == Some(req_id.as_str()) =>
                {
                    return Err(IpcError::Broker { code, detail })
                }
                other => warn!(frame = ?other, "Ignoring uncorrelated reply"),
            }
        }
    }

    /// Open the handshake.
    pub async fn hello(&mut self) -> IpcResult<serde_json::Value> {
        let req_id = self.next_req_id();
        self.request(ClientFrame::Hello { req_id: Some(req_id) }).await
    }

    /// Enqueue `payload` on `stream`, returning the assigned envelope ID.
    pub async fn enqueue(&mut self, stream: &str, payload: serde_json::Value) -> IpcResult<String> {
        self.enqueue_draft(stream, EnvelopeDraft::new(payload), None).await
    }

    /// Enqueue under an idempotency key.
    pub async fn enqueue_idempotent(
        &mut self,
        stream: &str,
        draft: EnvelopeDraft,
        key: &str,
    ) -> IpcResult<String> {
        self.enqueue_draft(stream, draft, Some(key)).await
    }

    /// Enqueue a draft envelope.
    pub async fn enqueue_draft(
        &mut self,
        stream: &str,
        draft: EnvelopeDraft,
        idempotency_key: Option<&str>,
    ) -> IpcResult<String> {
        let req_id = self.next_req_id();
        let result = self
            .request(ClientFrame::Enqueue {
                req_id: Some(req_id),
                to: stream.to_string(),
                env: draft,
                idempotency_key: idempotency_key.map(String::from),
            })
            .await?;
        result
            .get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| IpcError::Protocol("enqueue reply without id".to_string()))
    }

    /// Bind this connection to `stream`.
    pub async fn subscribe(&mut self, stream: &str) -> IpcResult<serde_json::Value> {
        let req_id = self.next_req_id();
        self.request(ClientFrame::Subscribe {
            req_id: Some(req_id),
            stream: stream.to_string(),
        })
        .await
    }

    /// Add credit. The broker does not reply.
    pub async fn grant(&mut self, n: u64) -> IpcResult<()> {
        self.send(&ClientFrame::Grant { req_id: None, n }).await
    }

    pub async fn ack(&mut self, id: &str) -> IpcResult<()> {
        self.send(&ClientFrame::Ack {
            req_id: None,
            id: id.to_string(),
        })
        .await
    }

    pub async fn nack(&mut self, id: &str) -> IpcResult<()> {
        self.send(&ClientFrame::Nack {
            req_id: None,
            id: id.to_string(),
        })
        .await
    }

    pub async fn stats(&mut self, stream: &str) -> IpcResult<StreamStats> {
        let req_id = self.next_req_id();
        let result = self
            .request(ClientFrame::Stats {
                req_id: Some(req_id),
                stream: stream.to_string(),
            })
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn metrics(&mut self) -> IpcResult<MetricsReport> {
        let req_id = self.next_req_id();
        let result = self.request(ClientFrame::Metrics { req_id }).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn snapshot(&mut self) -> IpcResult<Vec<SnapshotRow>> {
        let req_id = self.next_req_id();
        let mut result = self.request(ClientFrame::Snapshot { req_id }).await?;
        Ok(serde_json::from_value(result["rows"].take())?)
    }

    /// Wait for the next delivered envelope.
    pub async fn next_delivery(&mut self) -> IpcResult<Envelope> {
        if let Some(env) = self.deliveries.pop_front() {
            return Ok(env);
        }
        loop {
            match self.recv().await? {
                ServerFrame::Deliver { env } => return Ok(env),
                ServerFrame::Error { code, detail, .. } => {
                    return Err(IpcError::Broker { code, detail })
                }
                other => debug!(frame = ?other, "Ignoring reply while awaiting delivery"),
            }
        }
    }

    /// Deliveries already received but not yet taken.
    pub fn buffered_deliveries(&self) -> usize {
        self.deliveries.len()
    }

    /// Close the write side; the broker requeues anything still inflight.
    pub async fn close(mut self) -> IpcResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
