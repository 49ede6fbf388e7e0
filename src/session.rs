//! Session registry: per-invocation state keyed by session id.
//!
//! The registry owns every [`SessionContext`]. Handlers never hold the map;
//! they get a [`SessionHandle`], which carries the session id plus the shared
//! outbound queue. The map lock is held only for insert, lookup and removal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::blob::{split_blob, BlobAssembler, BlobChunk, BlobError};
use crate::codec::{Envelope, EnvelopeMeta};
use crate::error::ErrorCode;
use crate::lock;
use crate::message::{InvokeMessage, SessionMessage, SessionMessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Streaming,
    Completed,
    Errored,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session limit of {0} reached")]
    Capacity(usize),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::CapacityExceeded
    }
}

/// State of one open session.
#[derive(Debug)]
pub struct SessionContext {
    id: String,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    meta: EnvelopeMeta,
    input_tx: mpsc::UnboundedSender<Value>,
    input_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
    blobs: Mutex<BlobAssembler>,
}

impl SessionContext {
    fn new(id: String, meta: EnvelopeMeta, max_blob_bytes: usize) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        Self {
            id,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState::Pending),
            meta,
            input_tx,
            input_rx: tokio::sync::Mutex::new(input_rx),
            blobs: Mutex::new(BlobAssembler::new(max_blob_bytes)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn meta(&self) -> &EnvelopeMeta {
        &self.meta
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct Inner {
    sessions: Mutex<HashMap<String, Arc<SessionContext>>>,
    outbound: mpsc::UnboundedSender<Envelope>,
    max_sessions: usize,
    blob_chunk_size: usize,
    max_blob_bytes: usize,
}

/// Registry of open sessions. Cloning shares the same registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(
        outbound: mpsc::UnboundedSender<Envelope>,
        max_sessions: usize,
        blob_chunk_size: usize,
        max_blob_bytes: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                outbound,
                max_sessions,
                blob_chunk_size: blob_chunk_size.max(1),
                max_blob_bytes,
            }),
        }
    }

    pub fn open(&self, id: &str) -> Result<Arc<SessionContext>, SessionError> {
        self.open_with(id, EnvelopeMeta::default())
    }

    /// Open `id`, or return the already-open context for it.
    pub fn open_with(&self, id: &str, meta: EnvelopeMeta) -> Result<Arc<SessionContext>, SessionError> {
        let mut sessions = lock(&self.inner.sessions);
        if let Some(existing) = sessions.get(id) {
            return Ok(existing.clone());
        }
        if sessions.len() >= self.inner.max_sessions {
            return Err(SessionError::Capacity(self.inner.max_sessions));
        }
        let ctx = Arc::new(SessionContext::new(
            id.to_string(),
            meta,
            self.inner.max_blob_bytes,
        ));
        sessions.insert(id.to_string(), ctx.clone());
        debug!(session_id = %id, "session opened");
        Ok(ctx)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionContext>> {
        lock(&self.inner.sessions).get(id).cloned()
    }

    pub fn handle(&self, id: &str) -> Option<SessionHandle> {
        self.get(id).map(|ctx| SessionHandle {
            ctx,
            registry: self.clone(),
        })
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        lock(&self.inner.sessions).keys().cloned().collect()
    }

    /// Queue a session message for `id`. Messages for unknown or finished
    /// sessions, and non-terminal messages after cancellation, are dropped.
    /// A terminal message closes the session. Returns whether it was queued.
    pub fn send(&self, id: &str, kind: SessionMessageType, data: Value) -> bool {
        self.send_message(id, SessionMessage::new(kind, data))
    }

    pub fn send_message(&self, id: &str, message: SessionMessage) -> bool {
        let Some(ctx) = self.get(id) else {
            warn!(session_id = %id, kind = ?message.kind, "dropping message for unknown session");
            return false;
        };
        let terminal = message.is_terminal();
        // Enqueue under the state lock so per-session order matches state order.
        let queued = {
            let mut state = lock(&ctx.state);
            if state.is_terminal() {
                warn!(session_id = %id, kind = ?message.kind, "dropping message for finished session");
                return false;
            }
            if ctx.is_cancelled() && !terminal {
                warn!(session_id = %id, kind = ?message.kind, "dropping late message for cancelled session");
                return false;
            }
            *state = match message.kind {
                SessionMessageType::End => SessionState::Completed,
                SessionMessageType::Error => SessionState::Errored,
                _ => SessionState::Streaming,
            };
            self.inner
                .outbound
                .send(Envelope::session(id, &message))
                .is_ok()
        };
        if !queued {
            warn!(session_id = %id, "outbound queue closed");
        }
        if terminal {
            self.remove(id);
        }
        queued
    }

    /// Mark `id` finished and release it. Safe to call more than once.
    pub fn close(&self, id: &str) {
        if let Some(ctx) = self.get(id) {
            let mut state = lock(&ctx.state);
            if !state.is_terminal() {
                *state = SessionState::Completed;
            }
        }
        self.remove(id);
    }

    /// Signal cooperative cancellation. Returns false for unknown sessions.
    pub fn cancel(&self, id: &str) -> bool {
        match self.get(id) {
            Some(ctx) => {
                ctx.cancel.cancel();
                debug!(session_id = %id, "session cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let sessions: Vec<Arc<SessionContext>> =
            lock(&self.inner.sessions).values().cloned().collect();
        for ctx in &sessions {
            ctx.cancel.cancel();
        }
        sessions.len()
    }

    /// Hand follow-up input to the session's running handler.
    pub fn forward_input(&self, id: &str, data: Value) -> bool {
        match self.get(id) {
            Some(ctx) => ctx.input_tx.send(data).is_ok(),
            None => {
                warn!(session_id = %id, "dropping input for unknown session");
                false
            }
        }
    }

    /// Buffer an inbound blob chunk for `id`; returns the blob once complete.
    pub fn push_blob_chunk(&self, id: &str, chunk: BlobChunk) -> Option<Result<Option<Vec<u8>>, BlobError>> {
        let ctx = self.get(id)?;
        let mut blobs = lock(&ctx.blobs);
        Some(blobs.push(chunk))
    }

    fn remove(&self, id: &str) {
        if lock(&self.inner.sessions).remove(id).is_some() {
            debug!(session_id = %id, "session closed");
        }
    }
}

/// Cheap handle a handler uses to talk to its own session.
#[derive(Clone)]
pub struct SessionHandle {
    ctx: Arc<SessionContext>,
    registry: SessionRegistry,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.ctx.id
    }

    pub fn meta(&self) -> &EnvelopeMeta {
        &self.ctx.meta
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled()
    }

    /// Send one `stream` message.
    pub fn emit(&self, data: Value) -> bool {
        self.registry
            .send(&self.ctx.id, SessionMessageType::Stream, data)
    }

    /// Send an invoke message, splitting large blobs into `blob_chunk`s.
    pub fn emit_message(&self, message: InvokeMessage) -> bool {
        let chunk_size = self.registry.inner.blob_chunk_size;
        match message {
            InvokeMessage::Blob(blob) if blob.blob.len() > chunk_size => {
                let blob_id = uuid::Uuid::new_v4().to_string();
                split_blob(&blob_id, &blob.blob, chunk_size)
                    .into_iter()
                    .all(|chunk| self.emit_serialized(&InvokeMessage::BlobChunk(chunk)))
            }
            other => self.emit_serialized(&other),
        }
    }

    /// Send a payload produced off-thread. Blob messages go through
    /// [`Self::emit_message`] so they are chunked like any other.
    pub fn emit_value(&self, value: Value) -> bool {
        if value.get("type").and_then(Value::as_str) == Some("blob") {
            if let Ok(message) = serde_json::from_value::<InvokeMessage>(value.clone()) {
                return self.emit_message(message);
            }
        }
        self.emit(value)
    }

    /// Send an `invoke` message back to the host (reverse invocation).
    pub fn invoke_host(&self, data: Value) -> bool {
        self.registry
            .send(&self.ctx.id, SessionMessageType::Invoke, data)
    }

    /// Next follow-up input from the host. `None` once the session is cancelled.
    pub async fn recv_input(&self) -> Option<Value> {
        let mut rx = self.ctx.input_rx.lock().await;
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => None,
            value = rx.recv() => value,
        }
    }

    fn emit_serialized(&self, message: &InvokeMessage) -> bool {
        match serde_json::to_value(message) {
            Ok(v) => self.emit(v),
            Err(e) => {
                warn!(session_id = %self.ctx.id, error = %e, "failed to encode invoke message");
                false
            }
        }
    }
}
