//! Bridge mux: reads frames from the transport, dispatches requests to
//! registered handlers on a fresh worker, and serializes
//! responses/notifications back under a single writer mutex.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use gcs_shared::protocol::{ErrorRecord, Identifier, MessageHeader, NotifyId, RpcId};
use gcs_shared::{GcsError, GcsResult};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::transport::framing::{read_frame_or_eof, write_frame, Frame};
use crate::transport::{BoxedReader, BoxedWriter};

type BoxedAfterWrite = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Everything a handler needs from the envelope, decoded once by the
/// dispatcher.
#[derive(Debug, Clone)]
pub struct HandlerCtx {
    pub container_id: String,
    pub activity_id: Option<Uuid>,
    pub payload: serde_json::Value,
}

/// A handler's response payload, plus an optional hook run once that
/// payload has actually been written to the wire. Handlers that must
/// not release a shared resource (e.g. a process's `writers_wg` slot)
/// until the response is flushed defer that release into `after_write`
/// instead of doing it before returning.
pub struct HandlerResult {
    pub payload: serde_json::Value,
    pub after_write: Option<BoxedAfterWrite>,
}

impl HandlerResult {
    pub fn new(payload: serde_json::Value) -> Self {
        HandlerResult { payload, after_write: None }
    }

    pub fn with_after_write(payload: serde_json::Value, after_write: impl Future<Output = ()> + Send + 'static) -> Self {
        HandlerResult { payload, after_write: Some(Box::pin(after_write)) }
    }
}

impl From<serde_json::Value> for HandlerResult {
    fn from(payload: serde_json::Value) -> Self {
        HandlerResult::new(payload)
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = GcsResult<HandlerResult>> + Send>>;
pub type Handler = Arc<dyn Fn(HandlerCtx) -> HandlerFuture + Send + Sync>;

struct Inner {
    handlers: Mutex<HashMap<RpcId, Handler>>,
    notify_tx: mpsc::UnboundedSender<Frame>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
}

/// The bridge mux. Cheap to clone (wraps an `Arc`); every clone shares
/// the same handler table and notification stream.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Bridge {
            inner: Arc::new(Inner {
                handlers: Mutex::new(HashMap::new()),
                notify_tx,
                notify_rx: Mutex::new(Some(notify_rx)),
            }),
        }
    }

    /// Register a handler for a request id. Calling twice for the same
    /// id is a programming error.
    pub async fn assign_handler(&self, id: RpcId, handler: Handler) {
        let mut handlers = self.inner.handlers.lock().await;
        if handlers.insert(id, handler).is_some() {
            panic!("handler for {id:?} registered twice");
        }
    }

    /// Enqueue a notification frame from any thread. Notifications use
    /// sequence id 0 and their own id space.
    pub fn emit(&self, notify_id: NotifyId, payload: serde_json::Value) -> GcsResult<()> {
        let identifier = Identifier::notify(notify_id);
        let bytes = serde_json::to_vec(&payload)?;
        let header = MessageHeader::new(identifier, bytes.len() as u32, 0);
        let frame = Frame::new(header, bytes);
        self.inner
            .notify_tx
            .send(frame)
            .map_err(|_| GcsError::Fatal("bridge notification channel closed".into()))
    }

    /// Run until the peer closes or a write fails. Reads frames,
    /// dispatches each request to its handler on a fresh task, and
    /// writes responses/notifications to the writer under one mutex.
    pub async fn serve(&self, mut reader: BoxedReader, writer: BoxedWriter) -> GcsResult<()> {
        let writer = Arc::new(Mutex::new(writer));

        let mut notify_rx = self
            .inner
            .notify_rx
            .lock()
            .await
            .take()
            .expect("serve() called more than once on the same Bridge");

        let notify_writer = writer.clone();
        let notify_task = tokio::spawn(async move {
            while let Some(frame) = notify_rx.recv().await {
                let mut w = notify_writer.lock().await;
                if write_frame(&mut *w, &frame).await.is_err() {
                    break;
                }
            }
        });

        let result = loop {
            match read_frame_or_eof(&mut reader).await {
                Ok(None) => break Ok(()),
                Ok(Some(frame)) => {
                    let bridge = self.clone();
                    let writer = writer.clone();
                    tokio::spawn(async move {
                        bridge.dispatch(frame, writer).await;
                    });
                }
                Err(e) if e.is_terminal() => {
                    tracing::warn!(error = %e, "frame-level error, closing connection");
                    break Err(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "transport read failed, closing connection");
                    break Err(e);
                }
            }
        };

        notify_task.abort();
        result
    }

    async fn dispatch(&self, frame: Frame, writer: Arc<Mutex<BoxedWriter>>) {
        let request_identifier = frame.header.identifier;
        let sequence_id = frame.header.sequence_id;

        let rpc_id = match request_identifier.rpc_id() {
            Some(id) => id,
            None => {
                self.respond_error(
                    writer,
                    request_identifier,
                    sequence_id,
                    GcsError::Unsupported(format!("unknown request id {}", request_identifier.id)),
                    None,
                )
                .await;
                return;
            }
        };

        let envelope: RequestEnvelope = match serde_json::from_value(frame_payload_to_value(&frame)) {
            Ok(v) => v,
            Err(e) => {
                self.respond_error(
                    writer,
                    request_identifier,
                    sequence_id,
                    GcsError::Invalid(format!("malformed envelope: {e}")),
                    None,
                )
                .await;
                return;
            }
        };

        let handler = {
            let handlers = self.inner.handlers.lock().await;
            handlers.get(&rpc_id).cloned()
        };

        let Some(handler) = handler else {
            self.respond_error(
                writer,
                request_identifier,
                sequence_id,
                GcsError::Unsupported(format!("no handler registered for {rpc_id:?}")),
                envelope.activity_id,
            )
            .await;
            return;
        };

        let ctx = HandlerCtx {
            container_id: envelope.container_id.clone(),
            activity_id: envelope.activity_id,
            payload: envelope.rest,
        };

        let result = handler(ctx).await;
        match result {
            Ok(HandlerResult { payload, after_write }) => {
                self.respond_ok(writer, request_identifier, sequence_id, payload).await;
                if let Some(after_write) = after_write {
                    after_write.await;
                }
            }
            Err(e) => {
                self.respond_error(writer, request_identifier, sequence_id, e, envelope.activity_id)
                    .await;
            }
        }
    }

    async fn respond_ok(
        &self,
        writer: Arc<Mutex<BoxedWriter>>,
        request_identifier: Identifier,
        sequence_id: u64,
        payload: serde_json::Value,
    ) {
        let bytes = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize response payload");
                return;
            }
        };
        let header = MessageHeader::new(request_identifier.as_response(), bytes.len() as u32, sequence_id);
        let frame = Frame::new(header, bytes);
        let mut w = writer.lock().await;
        if let Err(e) = write_frame(&mut *w, &frame).await {
            tracing::warn!(error = %e, "failed to write response frame");
        }
    }

    async fn respond_error(
        &self,
        writer: Arc<Mutex<BoxedWriter>>,
        request_identifier: Identifier,
        sequence_id: u64,
        error: GcsError,
        activity_id: Option<Uuid>,
    ) {
        let record = ErrorRecord {
            result: error.code(),
            message: error.to_string(),
            ..Default::default()
        };
        let base = gcs_shared::protocol::ResponseBase::error(vec![record], activity_id);
        self.respond_ok(
            writer,
            request_identifier,
            sequence_id,
            serde_json::to_value(base).unwrap_or(serde_json::Value::Null),
        )
        .await;
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal envelope every request payload shares: `ContainerId` and
/// `ActivityId`, with the rest of the object passed through untouched
/// to the handler.
#[derive(Debug, Clone, serde::Deserialize)]
struct RequestEnvelope {
    #[serde(rename = "ContainerId", default)]
    container_id: String,
    #[serde(rename = "ActivityId", default)]
    activity_id: Option<Uuid>,
    #[serde(flatten)]
    rest: serde_json::Value,
}

fn frame_payload_to_value(frame: &Frame) -> serde_json::Value {
    if frame.payload.is_empty() {
        serde_json::Value::Object(Default::default())
    } else {
        serde_json::from_slice(&frame.payload).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use gcs_shared::protocol::Identifier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::duplex;

    #[tokio::test]
    async fn response_arrives_with_same_sequence_id_and_response_type() {
        let bridge = Bridge::new();
        bridge
            .assign_handler(
                RpcId::NegotiateProtocol,
                Arc::new(|_ctx| Box::pin(async { Ok(serde_json::json!({"Version": 4}).into()) })),
            )
            .await;

        let (mut client, server_stream) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_stream);

        let serve = tokio::spawn({
            let bridge = bridge.clone();
            async move {
                let _ = bridge
                    .serve(Box::new(server_read), Box::new(server_write))
                    .await;
            }
        });

        let ident = Identifier::request(RpcId::NegotiateProtocol);
        let payload = serde_json::to_vec(&serde_json::json!({})).unwrap();
        let header = MessageHeader::new(ident, payload.len() as u32, 42);
        let frame = Frame::new(header, payload);
        write_frame(&mut client, &frame).await.unwrap();

        let response = read_frame_or_eof(&mut client).await.unwrap().unwrap();
        assert_eq!(response.header.sequence_id, 42);
        assert_eq!(
            response.header.identifier.msg_type_enum(),
            Some(gcs_shared::protocol::MessageType::Response)
        );

        drop(client);
        let _ = serve.await;
    }

    #[tokio::test]
    async fn unknown_request_id_surfaces_unsupported() {
        let bridge = Bridge::new();
        let (mut client, server_stream) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_stream);
        let serve = tokio::spawn({
            let bridge = bridge.clone();
            async move {
                let _ = bridge
                    .serve(Box::new(server_read), Box::new(server_write))
                    .await;
            }
        });

        let mut ident = Identifier::request(RpcId::Create);
        ident.id = 0xFFF;
        let header = MessageHeader::new(ident, 0, 1);
        let frame = Frame::new(header, Vec::new());
        write_frame(&mut client, &frame).await.unwrap();

        let response = read_frame_or_eof(&mut client).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&response.payload).unwrap();
        assert_ne!(value["Result"], serde_json::json!(0));

        drop(client);
        let _ = serve.await;
    }

    #[tokio::test]
    async fn duplicate_handler_registration_panics() {
        let bridge = Bridge::new();
        bridge
            .assign_handler(
                RpcId::Create,
                Arc::new(|_ctx| Box::pin(async { Ok(serde_json::Value::Null.into()) })),
            )
            .await;

        let result = std::panic::AssertUnwindSafe(bridge.assign_handler(
            RpcId::Create,
            Arc::new(|_ctx| Box::pin(async { Ok(serde_json::Value::Null.into()) })),
        ))
        .catch_unwind()
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn after_write_hook_runs_only_once_response_frame_is_on_the_wire() {
        let bridge = Bridge::new();
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let hook_order = order.clone();
        bridge
            .assign_handler(
                RpcId::NegotiateProtocol,
                Arc::new(move |_ctx| {
                    let hook_order = hook_order.clone();
                    Box::pin(async move {
                        Ok(HandlerResult::with_after_write(serde_json::json!({"Version": 4}), async move {
                            hook_order.lock().await.push("after_write");
                        }))
                    })
                }),
            )
            .await;

        let (mut client, server_stream) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_stream);
        let serve = tokio::spawn({
            let bridge = bridge.clone();
            async move {
                let _ = bridge
                    .serve(Box::new(server_read), Box::new(server_write))
                    .await;
            }
        });

        let ident = Identifier::request(RpcId::NegotiateProtocol);
        let payload = serde_json::to_vec(&serde_json::json!({})).unwrap();
        let header = MessageHeader::new(ident, payload.len() as u32, 7);
        let frame = Frame::new(header, payload);
        write_frame(&mut client, &frame).await.unwrap();

        // The response is observable on the wire before the hook fires,
        // proving respond_ok's write happens first.
        let _response = read_frame_or_eof(&mut client).await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(*order.lock().await, vec!["after_write"]);

        drop(client);
        let _ = serve.await;
    }

    #[tokio::test]
    async fn zero_byte_read_ends_serve_cleanly() {
        let bridge = Bridge::new();
        let (client, server_stream) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_stream);
        drop(client);
        let result = bridge.serve(Box::new(server_read), Box::new(server_write)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn emit_sends_notification_with_sequence_zero() {
        let bridge = Bridge::new();
        let (mut client, server_stream) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_stream);
        let counter = Arc::new(AtomicUsize::new(0));
        let serve = tokio::spawn({
            let bridge = bridge.clone();
            async move {
                let _ = bridge
                    .serve(Box::new(server_read), Box::new(server_write))
                    .await;
            }
        });

        bridge
            .emit(NotifyId::Container, serde_json::json!({"Type": "GracefulExit"}))
            .unwrap();
        let frame = read_frame_or_eof(&mut client).await.unwrap().unwrap();
        assert_eq!(frame.header.sequence_id, 0);
        assert_eq!(
            frame.header.identifier.msg_type_enum(),
            Some(gcs_shared::protocol::MessageType::Notify)
        );
        counter.fetch_add(1, Ordering::SeqCst);

        drop(client);
        let _ = serve.await;
    }
}
