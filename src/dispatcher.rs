//! The runtime loop: reads envelopes, routes them to sessions and drives
//! one handler task per session.
//!
//! Everything here runs on a single tokio thread. Handlers suspend only at
//! `.await` points; CPU-bound work is handed to the worker pool. A single
//! writer task owns the output stream, so per-session message order is the
//! order in which messages were queued.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::blob::BlobChunk;
use crate::capability::{CapabilityRegistry, PluginDeclaration, PluginModule};
use crate::codec::{Envelope, Event, FrameDecoder, FrameWriter, SYSTEM_SESSION_ID};
use crate::config::RuntimeConfig;
use crate::error::{ErrorCode, InvocationError, RuntimeError};
use crate::executor::Executor;
use crate::message::{InvokeMessage, SessionMessage, SessionMessageType};
use crate::metrics::Metrics;
use crate::request::PluginRequest;
use crate::session::{SessionHandle, SessionRegistry};
use crate::worker::{panic_message, RegistryClassifier, TaskClassifier, TaskKind, WorkerPool};

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// How a session task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Failed(ErrorCode),
}

/// Plugin runtime bound to one capability registry.
pub struct PluginRuntime {
    config: RuntimeConfig,
    registry: Arc<CapabilityRegistry>,
    classifier: Option<Arc<dyn TaskClassifier>>,
}

impl PluginRuntime {
    pub fn new(config: RuntimeConfig, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            config,
            registry,
            classifier: None,
        }
    }

    /// Scan `module` and build the registry from `declaration`.
    pub fn from_module(
        config: RuntimeConfig,
        module: &PluginModule,
        declaration: &PluginDeclaration,
    ) -> Result<Self, RuntimeError> {
        let registry = CapabilityRegistry::build(module, declaration)?;
        Ok(Self::new(config, Arc::new(registry)))
    }

    /// Replace the default registry-based classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn TaskClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Serve the host over stdin/stdout.
    pub async fn run_stdio(self) -> Result<(), RuntimeError> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve until shutdown or end of input. Only a failed write is an error.
    pub async fn run<R, W>(self, mut reader: R, writer: W) -> Result<(), RuntimeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.config.validate()?;
        let config = self.config;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let mut writer_task = tokio::spawn(write_frames(FrameWriter::new(writer), outbound_rx));

        let pool = if config.disable_worker {
            info!("worker pool disabled, all tasks run inline");
            None
        } else {
            Some(Arc::new(WorkerPool::new(
                config.max_workers,
                config.worker_queue_capacity,
            )))
        };
        let classifier: Arc<dyn TaskClassifier> = match self.classifier {
            Some(classifier) => classifier,
            None => Arc::new(RegistryClassifier::new(
                self.registry.clone(),
                config.disable_worker,
            )),
        };
        let sessions = SessionRegistry::new(
            outbound.clone(),
            config.max_sessions,
            config.blob_chunk_size,
            config.max_blob_bytes,
        );

        let summary = self.registry.summary();
        info!(
            tool_providers = summary.tool_providers,
            tools = summary.tools,
            model_providers = summary.model_providers,
            endpoints = summary.endpoints,
            "plugin runtime starting"
        );
        let ready = SessionMessage::stream(json!({
            "status": "ready",
            "version": env!("CARGO_PKG_VERSION"),
            "capabilities": summary,
            "workers": pool.as_ref().map_or(0, |p| p.stats().workers),
        }));
        let _ = outbound.send(Envelope::session(SYSTEM_SESSION_ID, &ready));

        let mut dispatch = Dispatch {
            session_timeout: config.session_timeout(),
            shutdown_grace: config.shutdown_grace(),
            executor: Arc::new(Executor::new(self.registry.clone(), pool.clone())),
            classifier,
            sessions,
            outbound,
            tasks: JoinSet::new(),
            metrics: Metrics::new(),
            started: Instant::now(),
            drain_deadline: None,
            leftovers_cancelled: false,
        };

        let period = config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_BYTES];
        let mut input_open = true;

        loop {
            if dispatch.is_draining() && dispatch.tasks.is_empty() {
                break;
            }

            tokio::select! {
                written = &mut writer_task => {
                    let err = match written {
                        Ok(Err(e)) => e,
                        Ok(Ok(())) => RuntimeError::Write(std::io::ErrorKind::BrokenPipe.into()),
                        Err(e) => RuntimeError::Write(std::io::Error::other(e.to_string())),
                    };
                    error!(error = %err, "output stream failed, stopping");
                    dispatch.sessions.cancel_all();
                    return Err(err);
                }
                read = reader.read(&mut buf), if input_open => {
                    let chunk = match read {
                        Ok(0) => None,
                        Ok(n) => Some(&buf[..n]),
                        Err(e) => {
                            error!(error = %e, "failed to read input");
                            None
                        }
                    };
                    let envelopes = match chunk {
                        Some(bytes) => decoder.feed(bytes),
                        None => {
                            input_open = false;
                            decoder.finish().into_iter().collect()
                        }
                    };
                    dispatch.metrics.record_decode_errors(decoder.errors());
                    for envelope in envelopes {
                        dispatch.handle_envelope(envelope);
                    }
                    if !input_open {
                        info!("input closed");
                        dispatch.begin_shutdown();
                    }
                }
                Some(joined) = dispatch.tasks.join_next(), if !dispatch.tasks.is_empty() => {
                    dispatch.record_outcome(joined);
                }
                _ = heartbeat.tick() => {
                    dispatch.heartbeat();
                }
                _ = sleep_until(dispatch.drain_deadline.unwrap_or_else(Instant::now)),
                    if dispatch.drain_deadline.is_some() && !dispatch.leftovers_cancelled => {
                    let cancelled = dispatch.sessions.cancel_all();
                    warn!(cancelled, "shutdown grace period elapsed, cancelling sessions");
                    dispatch.leftovers_cancelled = true;
                }
            }
        }

        if let Some(pool) = pool {
            // Busy workers get whatever is left of the grace period.
            let remaining = dispatch
                .drain_deadline
                .map_or(Duration::ZERO, |d| d.saturating_duration_since(Instant::now()));
            let joined = tokio::task::spawn_blocking(move || pool.shutdown(remaining)).await;
            if let Err(e) = joined {
                warn!(error = %e, "worker pool shutdown failed");
            }
        }
        info!(
            opened = dispatch.metrics.sessions_opened,
            completed = dispatch.metrics.sessions_completed,
            failed = dispatch.metrics.sessions_failed,
            "plugin runtime stopped"
        );

        // Dropping every sender lets the writer flush what is queued and exit.
        drop(dispatch);
        match writer_task.await {
            Ok(result) => result,
            Err(e) => Err(RuntimeError::Write(std::io::Error::other(e.to_string()))),
        }
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) -> Result<(), RuntimeError> {
    while let Some(envelope) = outbound.recv().await {
        match writer.write_envelope(&envelope).await {
            Ok(()) => {}
            Err(RuntimeError::Encode(e)) => {
                warn!(session_id = %envelope.session_id, error = %e, "dropping unencodable frame");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

struct Dispatch {
    session_timeout: Duration,
    shutdown_grace: Duration,
    executor: Arc<Executor>,
    classifier: Arc<dyn TaskClassifier>,
    sessions: SessionRegistry,
    outbound: mpsc::UnboundedSender<Envelope>,
    tasks: JoinSet<SessionOutcome>,
    metrics: Metrics,
    started: Instant,
    drain_deadline: Option<Instant>,
    leftovers_cancelled: bool,
}

impl Dispatch {
    fn is_draining(&self) -> bool {
        self.drain_deadline.is_some()
    }

    fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.event {
            Event::Request => self.handle_request(envelope),
            Event::Session => self.handle_session_message(envelope),
            Event::Heartbeat => trace!("host heartbeat"),
            Event::Log => log_from_host(&envelope.data),
            Event::Shutdown => {
                info!("shutdown requested by host");
                self.begin_shutdown();
            }
            Event::Unknown => {
                warn!(session_id = %envelope.session_id, "dropping envelope with unknown event");
            }
        }
    }

    fn begin_shutdown(&mut self) {
        if self.is_draining() {
            return;
        }
        info!(
            sessions = self.sessions.len(),
            grace_secs = self.shutdown_grace.as_secs(),
            "draining sessions"
        );
        self.drain_deadline = Some(Instant::now() + self.shutdown_grace);
    }

    /// Answer a request that never got a session.
    fn reject(&mut self, session_id: &str, err: InvocationError) {
        warn!(session_id = %session_id, code = %err.code, error = %err.message, "request rejected");
        self.metrics.record_session_failed();
        let _ = self
            .outbound
            .send(Envelope::session(session_id, &SessionMessage::error(&err)));
    }

    fn handle_request(&mut self, envelope: Envelope) {
        let Envelope {
            session_id,
            data,
            meta,
            ..
        } = envelope;
        if session_id == SYSTEM_SESSION_ID {
            warn!("dropping request on the system session");
            return;
        }
        if self.sessions.get(&session_id).is_some() {
            debug!(session_id = %session_id, "request for open session forwarded as input");
            self.sessions.forward_input(&session_id, data);
            return;
        }
        if self.is_draining() {
            self.reject(
                &session_id,
                InvocationError::new(ErrorCode::ShuttingDown, "runtime is shutting down"),
            );
            return;
        }

        let request = match PluginRequest::from_value(data) {
            Ok(r) => r,
            Err(e) => return self.reject(&session_id, e.into()),
        };
        if let Err(e) = self.sessions.open_with(&session_id, meta) {
            return self.reject(&session_id, InvocationError::new(e.code(), e.to_string()));
        }
        let Some(handle) = self.sessions.handle(&session_id) else {
            return;
        };

        let kind = self.classifier.classify(&request);
        if kind == TaskKind::Cpu {
            self.metrics.record_cpu_task();
        }
        self.metrics.record_session_opened();
        info!(session_id = %session_id, request = %request.label(), kind = ?kind, "session started");

        self.tasks.spawn(run_session(
            self.executor.clone(),
            self.sessions.clone(),
            handle,
            request,
            kind,
            self.session_timeout,
        ));
    }

    fn handle_session_message(&mut self, envelope: Envelope) {
        let id = envelope.session_id;
        let message: SessionMessage = match serde_json::from_value(envelope.data) {
            Ok(m) => m,
            Err(e) => {
                warn!(session_id = %id, error = %e, "dropping malformed session message");
                return;
            }
        };

        match message.kind {
            SessionMessageType::End | SessionMessageType::Error => {
                if self.sessions.cancel(&id) {
                    info!(session_id = %id, kind = ?message.kind, "session ended by host");
                    self.sessions.close(&id);
                } else {
                    debug!(session_id = %id, "end for unknown session");
                }
            }
            SessionMessageType::Stream | SessionMessageType::Invoke => {
                if message.data.get("type").and_then(Value::as_str) == Some("blob_chunk") {
                    self.handle_blob_chunk(&id, message.data);
                } else {
                    self.sessions.forward_input(&id, message.data);
                }
            }
        }
    }

    fn handle_blob_chunk(&mut self, id: &str, data: Value) {
        let chunk: BlobChunk = match serde_json::from_value::<InvokeMessage>(data) {
            Ok(InvokeMessage::BlobChunk(chunk)) => chunk,
            Ok(_) => return,
            Err(e) => {
                warn!(session_id = %id, error = %e, "dropping malformed blob chunk");
                return;
            }
        };
        match self.sessions.push_blob_chunk(id, chunk) {
            None => warn!(session_id = %id, "dropping blob chunk for unknown session"),
            Some(Ok(None)) => {}
            Some(Ok(Some(bytes))) => match serde_json::to_value(InvokeMessage::blob(bytes)) {
                Ok(blob) => {
                    self.sessions.forward_input(id, blob);
                }
                Err(e) => warn!(session_id = %id, error = %e, "failed to encode reassembled blob"),
            },
            Some(Err(e)) => {
                let err = InvocationError::from(e);
                warn!(session_id = %id, error = %err.message, "blob reassembly failed");
                self.sessions.cancel(id);
                self.sessions.send_message(id, SessionMessage::error(&err));
            }
        }
    }

    fn record_outcome(&mut self, joined: Result<SessionOutcome, JoinError>) {
        match joined {
            Ok(SessionOutcome::Completed) => self.metrics.record_session_completed(),
            Ok(SessionOutcome::Failed(_)) => self.metrics.record_session_failed(),
            Err(e) => {
                error!(error = %e, "session supervisor failed");
                self.metrics.record_session_failed();
            }
        }
    }

    fn heartbeat(&mut self) {
        self.metrics.set_uptime(self.started.elapsed().as_secs());
        self.metrics.update_memory();
        self.metrics.active_sessions = self.sessions.len();
        if let Some(pool) = self.executor.pool() {
            let stats = pool.stats();
            self.metrics.worker_respawns = stats.respawns;
            self.metrics.queued_tasks = stats.queued;
        }
        match self.metrics.to_heartbeat() {
            Ok(data) => {
                let _ = self.outbound.send(Envelope::heartbeat(data));
            }
            Err(e) => warn!(error = %e, "failed to encode heartbeat"),
        }
    }
}

/// Supervise one session: run its handler, enforce the timeout and write the
/// terminal message.
pub(crate) async fn run_session(
    executor: Arc<Executor>,
    sessions: SessionRegistry,
    handle: SessionHandle,
    request: PluginRequest,
    kind: TaskKind,
    timeout: Duration,
) -> SessionOutcome {
    let id = handle.id().to_string();
    let cancel = handle.cancel_token();
    let started = Instant::now();

    let handler_session = handle.clone();
    let mut handler: JoinHandle<Result<(), InvocationError>> =
        tokio::spawn(async move { executor.execute(request, kind, &handler_session).await });

    let result = tokio::select! {
        biased;
        joined = &mut handler => match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(InvocationError::new(
                ErrorCode::HandlerPanic,
                panic_message(&*e.into_panic()),
            )),
            Err(e) => Err(InvocationError::new(ErrorCode::Cancelled, e.to_string())),
        },
        _ = cancel.cancelled() => {
            handler.abort();
            Err(InvocationError::new(ErrorCode::Cancelled, "session cancelled"))
        }
        _ = tokio::time::sleep(timeout) => {
            handler.abort();
            cancel.cancel();
            Err(InvocationError::new(
                ErrorCode::Timeout,
                format!("session exceeded {:?}", timeout),
            ))
        }
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let outcome = match result {
        Ok(()) => {
            sessions.send_message(&id, SessionMessage::end());
            info!(session_id = %id, elapsed_ms, "session completed");
            SessionOutcome::Completed
        }
        Err(err) => {
            warn!(session_id = %id, code = %err.code, error = %err.message, elapsed_ms, "session failed");
            sessions.send_message(&id, SessionMessage::error(&err));
            SessionOutcome::Failed(err.code)
        }
    };
    sessions.close(&id);
    outcome
}

/// Re-emit a host log line through `tracing`.
fn log_from_host(data: &Value) {
    let message = data
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| data.as_str().map(str::to_string))
        .unwrap_or_else(|| data.to_string());
    match data.get("level").and_then(Value::as_str).unwrap_or("info") {
        "error" => error!(target: "host", "{}", message),
        "warn" | "warning" => warn!(target: "host", "{}", message),
        "debug" => debug!(target: "host", "{}", message),
        "trace" => trace!(target: "host", "{}", message),
        _ => info!(target: "host", "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::fixtures::{demo_declaration, demo_module};
    use crate::worker::MockTaskClassifier;
    use serde_json::json;

    struct Fixture {
        executor: Arc<Executor>,
        sessions: SessionRegistry,
        outbound: mpsc::UnboundedReceiver<Envelope>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(CapabilityRegistry::build(&demo_module(), &demo_declaration()).unwrap());
        let (tx, outbound) = mpsc::unbounded_channel();
        Fixture {
            executor: Arc::new(Executor::new(registry, None)),
            sessions: SessionRegistry::new(tx, 8, 1024, 1024),
            outbound,
        }
    }

    fn echo(text: &str) -> PluginRequest {
        PluginRequest::from_value(json!({
            "type": "tool", "action": "invoke_tool", "provider": "demo", "tool": "echo",
            "toolParameters": {"text": text},
        }))
        .unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope.data);
        }
        out
    }

    async fn run(f: &Fixture, id: &str, request: PluginRequest, timeout: Duration) -> SessionOutcome {
        f.sessions.open(id).unwrap();
        let handle = f.sessions.handle(id).unwrap();
        run_session(
            f.executor.clone(),
            f.sessions.clone(),
            handle,
            request,
            TaskKind::Io,
            timeout,
        )
        .await
    }

    #[tokio::test]
    async fn test_session_ends_after_stream() {
        let mut f = fixture();
        let outcome = run(&f, "s1", echo("hi"), Duration::from_secs(5)).await;
        assert_eq!(outcome, SessionOutcome::Completed);
        let out = drain(&mut f.outbound);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["type"], "stream");
        assert_eq!(out[1], json!({"type": "end", "data": {}}));
        assert!(f.sessions.get("s1").is_none());
    }

    #[tokio::test]
    async fn test_handler_panic_is_reported() {
        let mut f = fixture();
        let outcome = run(&f, "s1", echo("panic"), Duration::from_secs(5)).await;
        assert_eq!(outcome, SessionOutcome::Failed(ErrorCode::HandlerPanic));
        let out = drain(&mut f.outbound);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["type"], "error");
        assert_eq!(out[0]["data"]["code"], "handler_panic");
        assert_eq!(out[0]["data"]["message"], "asked to panic");
    }

    #[tokio::test]
    async fn test_session_timeout() {
        let mut f = fixture();
        let outcome = run(&f, "s1", echo("wait"), Duration::from_millis(50)).await;
        assert_eq!(outcome, SessionOutcome::Failed(ErrorCode::Timeout));
        let out = drain(&mut f.outbound);
        assert_eq!(out[0]["data"]["code"], "timeout");
    }

    #[tokio::test]
    async fn test_forwarded_input_reaches_handler() {
        let mut f = fixture();
        f.sessions.open("s1").unwrap();
        f.sessions.forward_input("s1", json!({"answer": 42}));
        let handle = f.sessions.handle("s1").unwrap();
        let outcome = run_session(
            f.executor.clone(),
            f.sessions.clone(),
            handle,
            echo("wait"),
            TaskKind::Io,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(outcome, SessionOutcome::Completed);
        let out = drain(&mut f.outbound);
        assert_eq!(out[0]["data"], json!({"answer": 42}));
    }

    #[tokio::test]
    async fn test_cancelled_session_reports_cancelled() {
        let mut f = fixture();
        f.sessions.open("s1").unwrap();
        let handle = f.sessions.handle("s1").unwrap();
        let sessions = f.sessions.clone();
        let task = tokio::spawn(run_session(
            f.executor.clone(),
            f.sessions.clone(),
            handle,
            echo("wait"),
            TaskKind::Io,
            Duration::from_secs(5),
        ));
        tokio::task::yield_now().await;
        assert!(sessions.cancel("s1"));
        assert_eq!(task.await.unwrap(), SessionOutcome::Failed(ErrorCode::Cancelled));
        let out = drain(&mut f.outbound);
        assert_eq!(out.last().unwrap()["data"]["code"], "cancelled");
    }

    #[tokio::test]
    async fn test_custom_classifier_is_consulted() {
        let mut classifier = MockTaskClassifier::new();
        classifier.expect_classify().times(1).return_const(TaskKind::Io);
        let runtime = PluginRuntime::from_module(RuntimeConfig::default(), &demo_module(), &demo_declaration())
            .unwrap()
            .with_classifier(Arc::new(classifier));

        let input = format!(
            "{}\n",
            json!({"sessionId": "s1", "event": "request", "data": {
                "type": "tool", "action": "invoke_tool", "provider": "demo", "tool": "echo",
                "toolParameters": {"text": "x"}}})
        );
        let (output, mut host) = tokio::io::duplex(64 * 1024);
        runtime.run(input.as_bytes(), output).await.unwrap();

        let mut written = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut host, &mut written).await.unwrap();
        assert!(written.contains(r#""type":"end""#));
    }

    #[test]
    fn test_log_from_host_accepts_any_shape() {
        log_from_host(&json!({"level": "warn", "message": "disk almost full"}));
        log_from_host(&json!("plain line"));
        log_from_host(&json!({"unexpected": true}));
    }
}
