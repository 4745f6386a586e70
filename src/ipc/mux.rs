//! One bidirectional connection carrying many logical services.
//!
//! Either peer may issue calls. Each call is addressed to a
//! [`ServiceHandle`] on the other side; the receiving side resolves the handle
//! through its [`Dispatcher`] and answers on the same connection. Incoming
//! calls each run on their own task, so a slow call never blocks the others.
//!
//! A reader task owns the read half, a writer task owns the write half and
//! drains a bounded outbound queue shared by all callers and responders.
//! When either task stops, the connection is marked closed and every pending
//! call fails with [`Error::ConnectionClosed`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::ipc::codec::{read_frame, write_frame, FrameKind};
use crate::types::{Error, MuxConfig, Result, ServiceHandle};

/// Resolves incoming calls against locally served handles.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, handle: ServiceHandle, method: &str, body: Bytes) -> Result<Bytes>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestFrame {
    id: u64,
    handle: ServiceHandle,
    method: String,
    body: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResponseFrame {
    id: u64,
    body: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorFrame {
    id: u64,
    code: String,
    message: String,
}

#[derive(Debug)]
struct Outbound {
    kind: FrameKind,
    payload: Vec<u8>,
    /// Close the connection once this frame is flushed.
    close_after: bool,
}

type Pending = HashMap<u64, oneshot::Sender<Result<Bytes>>>;

/// Withdraws a call's waiter when the call ends, including when the calling
/// future is dropped before a reply arrives.
struct PendingEntry {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.inner.pending.try_lock() {
            pending.remove(&self.id);
            return;
        }
        let (inner, id) = (self.inner.clone(), self.id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                inner.pending.lock().await.remove(&id);
            });
        }
    }
}

struct Inner {
    label: String,
    out_tx: mpsc::Sender<Outbound>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    served: AtomicU64,
    closed: CancellationToken,
    config: MuxConfig,
}

/// Handle to a running multiplexed connection. Cheap to clone.
#[derive(Clone)]
pub struct Mux {
    inner: Arc<Inner>,
}

impl fmt::Debug for Mux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mux")
            .field("label", &self.inner.label)
            .field("closed", &self.inner.closed.is_cancelled())
            .field("served", &self.inner.served.load(Ordering::Relaxed))
            .finish()
    }
}

/// Held back reader of a connection started with [`Mux::start_gated`].
///
/// No incoming frame is read until [`ReadGate::open`] is called. Dropping the
/// gate without opening it opens it.
#[derive(Debug)]
pub struct ReadGate {
    open: CancellationToken,
}

impl ReadGate {
    pub fn open(self) {
        self.open.cancel();
    }
}

impl Drop for ReadGate {
    fn drop(&mut self) {
        self.open.cancel();
    }
}

impl Mux {
    /// Start the reader and writer tasks over `stream`.
    pub fn start<S>(
        label: impl Into<String>,
        stream: S,
        dispatcher: Arc<dyn Dispatcher>,
        config: MuxConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mux, gate) = Self::start_gated(label, stream, dispatcher, config);
        gate.open();
        mux
    }

    /// Like [`Mux::start`], but incoming calls are not dispatched until the
    /// returned gate is opened. Outgoing calls may be issued right away.
    pub fn start_gated<S>(
        label: impl Into<String>,
        stream: S,
        dispatcher: Arc<dyn Dispatcher>,
        config: MuxConfig,
    ) -> (Self, ReadGate)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let inner = Arc::new(Inner {
            label: label.into(),
            out_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            served: AtomicU64::new(0),
            closed: CancellationToken::new(),
            config,
        });
        let open = CancellationToken::new();

        tokio::spawn(writer_loop(inner.clone(), writer, out_rx));
        tokio::spawn(reader_loop(inner.clone(), reader, dispatcher, open.clone()));

        (Self { inner }, ReadGate { open })
    }

    /// Issue a call to `handle` on the peer and wait for its reply.
    pub async fn call(
        &self,
        handle: ServiceHandle,
        method: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<Bytes> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = rmp_serde::to_vec_named(&RequestFrame {
            id,
            handle,
            method: method.to_string(),
            body,
        })?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);
        let _pending = PendingEntry {
            inner: self.inner.clone(),
            id,
        };

        let exchange = async {
            self.inner
                .out_tx
                .send(Outbound {
                    kind: FrameKind::Request,
                    payload,
                    close_after: false,
                })
                .await
                .map_err(|_| self.closed_error())?;
            rx.await.map_err(|_| self.closed_error())?
        };

        tokio::select! {
            biased;
            outcome = tokio::time::timeout(timeout, exchange) => match outcome {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(format!(
                    "{} on handle {} after {:?}",
                    method, handle, timeout
                ))),
            },
            _ = self.inner.closed.cancelled() => Err(self.closed_error()),
        }
    }

    /// Calls still waiting for a reply.
    pub async fn pending_calls(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection is gone.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Number of incoming calls answered so far.
    pub fn served_calls(&self) -> u64 {
        self.inner.served.load(Ordering::Relaxed)
    }

    /// Close the connection. Pending calls fail with `ConnectionClosed`.
    pub fn shutdown(&self) {
        self.inner.closed.cancel();
    }

    fn closed_error(&self) -> Error {
        Error::connection_closed(format!("{} connection closed", self.inner.label))
    }
}

async fn writer_loop<S: AsyncWrite>(
    inner: Arc<Inner>,
    mut writer: WriteHalf<S>,
    mut out_rx: mpsc::Receiver<Outbound>,
) {
    let write_timeout = Duration::from_secs(inner.config.write_timeout_secs);
    loop {
        let out = tokio::select! {
            _ = inner.closed.cancelled() => break,
            out = out_rx.recv() => match out {
                Some(out) => out,
                None => break,
            },
        };

        let write = write_frame(&mut writer, out.kind, &out.payload);
        match tokio::time::timeout(write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(conn = %inner.label, "write failed: {}", e);
                break;
            }
            Err(_) => {
                tracing::warn!(
                    conn = %inner.label,
                    "write timeout ({}s), dropping connection",
                    write_timeout.as_secs()
                );
                break;
            }
        }

        if out.close_after {
            tracing::info!(
                conn = %inner.label,
                served = inner.served.load(Ordering::Relaxed),
                "call limit reached, closing connection"
            );
            break;
        }
    }

    inner.closed.cancel();
    let _ = writer.shutdown().await;
}

async fn reader_loop<S: AsyncRead>(
    inner: Arc<Inner>,
    mut reader: ReadHalf<S>,
    dispatcher: Arc<dyn Dispatcher>,
    open: CancellationToken,
) {
    tokio::select! {
        _ = inner.closed.cancelled() => {}
        _ = open.cancelled() => {}
    }
    while !inner.closed.is_cancelled() {
        let frame = tokio::select! {
            _ = inner.closed.cancelled() => break,
            frame = read_frame(&mut reader, inner.config.max_frame_bytes) => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(conn = %inner.label, "peer closed connection");
                break;
            }
            Err(e) => {
                tracing::warn!(conn = %inner.label, "read failed: {}", e);
                break;
            }
        };

        let payload = &frame.payload;
        match frame.kind() {
            Ok(FrameKind::Request) => match rmp_serde::from_slice::<RequestFrame>(payload) {
                Ok(request) => {
                    tokio::spawn(serve_request(inner.clone(), dispatcher.clone(), request));
                }
                Err(e) => tracing::warn!(conn = %inner.label, "dropping malformed request: {}", e),
            },
            Ok(FrameKind::Response) => match rmp_serde::from_slice::<ResponseFrame>(payload) {
                Ok(response) => complete(&inner, response.id, Ok(response.body)).await,
                Err(e) => tracing::warn!(conn = %inner.label, "dropping malformed response: {}", e),
            },
            Ok(FrameKind::Error) => match rmp_serde::from_slice::<ErrorFrame>(payload) {
                Ok(error) => {
                    complete(&inner, error.id, Err(Error::remote(error.code, error.message))).await
                }
                Err(e) => tracing::warn!(conn = %inner.label, "dropping malformed error: {}", e),
            },
            Err(other) => {
                tracing::warn!(conn = %inner.label, "unexpected frame kind: 0x{:02X}", other);
            }
        }
    }

    inner.closed.cancel();
    let mut pending = inner.pending.lock().await;
    for (_, waiter) in pending.drain() {
        let _ = waiter.send(Err(Error::connection_closed(format!(
            "{} connection closed",
            inner.label
        ))));
    }
}

async fn complete(inner: &Inner, id: u64, result: Result<Bytes>) {
    match inner.pending.lock().await.remove(&id) {
        Some(waiter) => {
            let _ = waiter.send(result);
        }
        None => tracing::debug!(conn = %inner.label, id, "reply for unknown or abandoned call"),
    }
}

async fn serve_request(inner: Arc<Inner>, dispatcher: Arc<dyn Dispatcher>, request: RequestFrame) {
    let RequestFrame {
        id,
        handle,
        method,
        body,
    } = request;

    let result = dispatcher.dispatch(handle, &method, body).await;
    let encoded = match result {
        Ok(body) => rmp_serde::to_vec_named(&ResponseFrame { id, body })
            .map(|payload| (FrameKind::Response, payload)),
        Err(e) => {
            tracing::debug!(conn = %inner.label, %handle, method = %method, "call failed: {}", e);
            rmp_serde::to_vec_named(&ErrorFrame {
                id,
                code: e.to_ipc_error_code(),
                message: e.to_string(),
            })
            .map(|payload| (FrameKind::Error, payload))
        }
    };

    let (kind, payload) = match encoded {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(conn = %inner.label, "msgpack encoding failed: {}", e);
            return;
        }
    };

    let served = inner.served.fetch_add(1, Ordering::Relaxed) + 1;
    let close_after = inner
        .config
        .call_limit
        .is_some_and(|limit| served >= limit);

    let _ = inner
        .out_tx
        .send(Outbound {
            kind,
            payload,
            close_after,
        })
        .await;
}
