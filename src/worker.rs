//! CPU-vs-IO task placement and the worker thread pool.
//!
//! IO-bound work runs as ordinary tokio tasks on the dispatcher thread. CPU
//! bound work is shipped to a fixed set of OS threads through a bounded queue;
//! the submitting session awaits a oneshot reply and never blocks the
//! dispatcher. Results come back through a single channel and are matched to
//! their session by task id.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::capability::CapabilityRegistry;
use crate::endpoint::parse_raw_http_request;
use crate::error::ErrorCode;
use crate::lock;
use crate::request::{AgentStrategyRequest, EndpointRequest, PluginRequest, ToolRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Cpu,
    Io,
}

/// Decides where a request runs. Evaluated once per request, before dispatch.
#[cfg_attr(test, mockall::automock)]
pub trait TaskClassifier: Send + Sync {
    fn classify(&self, request: &PluginRequest) -> TaskKind;
}

/// Classifies by the `cpu_bound` flag of the matching registration.
pub struct RegistryClassifier {
    registry: Arc<CapabilityRegistry>,
    workers_disabled: bool,
}

impl RegistryClassifier {
    pub fn new(registry: Arc<CapabilityRegistry>, workers_disabled: bool) -> Self {
        Self {
            registry,
            workers_disabled,
        }
    }
}

impl TaskClassifier for RegistryClassifier {
    fn classify(&self, request: &PluginRequest) -> TaskKind {
        if self.workers_disabled {
            return TaskKind::Io;
        }
        let cpu_bound = match request {
            PluginRequest::Tool(ToolRequest::InvokeTool(r)) => {
                self.registry.tool(&r.provider, &r.tool).is_some_and(|t| t.cpu_bound)
                    || self
                        .registry
                        .tool_provider(&r.provider)
                        .is_some_and(|p| p.cpu_bound)
            }
            PluginRequest::Model(r) => {
                r.action.is_invocation()
                    && self
                        .registry
                        .model_provider(&r.provider)
                        .is_some_and(|p| p.cpu_bound)
            }
            PluginRequest::AgentStrategy(AgentStrategyRequest::InvokeAgentStrategy(r)) => self
                .registry
                .agent_strategy(&r.agent_strategy_provider, &r.agent_strategy)
                .is_some_and(|s| s.cpu_bound),
            PluginRequest::Endpoint(EndpointRequest::InvokeEndpoint(r)) => {
                let http = parse_raw_http_request(&r.raw_http_request);
                self.registry
                    .dispatch_endpoint(&http.method, &http.path)
                    .is_some_and(|m| m.target.cpu_bound)
            }
            _ => false,
        };
        if cpu_bound {
            TaskKind::Cpu
        } else {
            TaskKind::Io
        }
    }
}

const JOIN_POLL: Duration = Duration::from_millis(10);

pub type TaskId = u64;

/// Self-contained unit of CPU work. Returns the stream payloads to emit.
pub type Job = Box<dyn FnOnce() -> Result<Vec<Value>, String> + Send + 'static>;

pub type TaskResult = Result<Vec<Value>, PoolError>;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker queue is full ({0} tasks waiting)")]
    QueueFull(usize),
    #[error("worker pool is shut down")]
    ShutDown,
    #[error("task failed: {0}")]
    TaskFailed(String),
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),
}

impl PoolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::QueueFull(_) => ErrorCode::CapacityExceeded,
            Self::ShutDown => ErrorCode::ShuttingDown,
            Self::TaskFailed(_) => ErrorCode::TaskFailed,
            Self::WorkerCrashed(_) => ErrorCode::WorkerCrashed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub queued: usize,
    pub busy: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub respawns: u64,
}

struct QueuedTask {
    task_id: TaskId,
    job: Job,
}

struct TaskOutcome {
    task_id: TaskId,
    result: TaskResult,
}

struct PendingTask {
    session_id: String,
    reply: oneshot::Sender<TaskResult>,
}

#[derive(Default)]
struct Counters {
    busy: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    respawns: AtomicU64,
}

struct Shared {
    jobs: crossbeam_channel::Receiver<QueuedTask>,
    results: mpsc::UnboundedSender<TaskOutcome>,
    handles: Mutex<Vec<Option<JoinHandle<()>>>>,
    counters: Counters,
}

/// Fixed-size pool of worker threads behind a bounded FIFO queue.
pub struct WorkerPool {
    size: usize,
    capacity: usize,
    submit: Mutex<Option<crossbeam_channel::Sender<QueuedTask>>>,
    pending: Arc<Mutex<HashMap<TaskId, PendingTask>>>,
    next_id: AtomicU64,
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Start `size` workers. Must be called inside a tokio runtime, which
    /// hosts the task that routes results back to sessions.
    pub fn new(size: usize, capacity: usize) -> Self {
        let size = size.max(1);
        let (submit, jobs) = crossbeam_channel::bounded(capacity);
        let (results, results_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            jobs,
            results,
            handles: Mutex::new((0..size).map(|_| None).collect()),
            counters: Counters::default(),
        });
        for slot in 0..size {
            spawn_worker(slot, &shared);
        }

        let pending: Arc<Mutex<HashMap<TaskId, PendingTask>>> = Arc::default();
        tokio::spawn(route_results(results_rx, pending.clone()));

        info!(workers = size, queue_capacity = capacity, "worker pool started");
        Self {
            size,
            capacity,
            submit: Mutex::new(Some(submit)),
            pending,
            next_id: AtomicU64::new(1),
            shared,
        }
    }

    /// Queue `job` for `session_id`. Fails immediately when the queue is full.
    pub fn submit(&self, session_id: &str, job: Job) -> Result<oneshot::Receiver<TaskResult>, PoolError> {
        let submit = lock(&self.submit).clone().ok_or(PoolError::ShutDown)?;
        let task_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        lock(&self.pending).insert(
            task_id,
            PendingTask {
                session_id: session_id.to_string(),
                reply,
            },
        );

        match submit.try_send(QueuedTask { task_id, job }) {
            Ok(()) => {
                debug!(task_id, session_id = %session_id, "task queued");
                Ok(rx)
            }
            Err(e) => {
                lock(&self.pending).remove(&task_id);
                match e {
                    crossbeam_channel::TrySendError::Full(_) => {
                        warn!(session_id = %session_id, "worker queue full");
                        Err(PoolError::QueueFull(self.capacity))
                    }
                    crossbeam_channel::TrySendError::Disconnected(_) => Err(PoolError::ShutDown),
                }
            }
        }
    }

    /// Submit and wait for the result.
    pub async fn run(&self, session_id: &str, job: Job) -> TaskResult {
        let rx = self.submit(session_id, job)?;
        rx.await
            .unwrap_or_else(|_| Err(PoolError::WorkerCrashed("result was lost".into())))
    }

    pub fn stats(&self) -> PoolStats {
        let queued = lock(&self.submit).as_ref().map_or(0, |s| s.len());
        let c = &self.shared.counters;
        PoolStats {
            workers: self.size,
            queued,
            busy: c.busy.load(Ordering::Relaxed),
            in_flight: lock(&self.pending).len(),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            respawns: c.respawns.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work and fail every queued task with `ShutDown`.
    /// Workers still running a job get until `timeout` to finish; any still
    /// busy after that are detached. Blocks the calling thread.
    pub fn shutdown(&self, timeout: Duration) {
        if lock(&self.submit).take().is_none() {
            return;
        }
        let dropped: Vec<TaskId> = self.shared.jobs.try_iter().map(|task| task.task_id).collect();
        for task_id in &dropped {
            if let Some(task) = lock(&self.pending).remove(task_id) {
                let _ = task.reply.send(Err(PoolError::ShutDown));
            }
        }
        if !dropped.is_empty() {
            warn!(dropped = dropped.len(), "dropped queued tasks at shutdown");
        }

        let deadline = std::time::Instant::now() + timeout;
        let mut handles: Vec<JoinHandle<()>> = lock(&self.shared.handles)
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        while handles.iter().any(|h| !h.is_finished()) && std::time::Instant::now() < deadline {
            std::thread::sleep(JOIN_POLL);
        }
        let mut detached = 0;
        for handle in handles.drain(..) {
            if !handle.is_finished() {
                detached += 1;
                continue;
            }
            if handle.join().is_err() {
                error!("worker thread exited abnormally");
            }
        }
        if detached > 0 {
            warn!(detached, "workers still busy at shutdown, detaching");
        }
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        lock(&self.submit).take();
    }
}

fn spawn_worker(slot: usize, shared: &Arc<Shared>) {
    let worker_shared = shared.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("monie-worker-{}", slot))
        .spawn(move || worker_loop(slot, worker_shared));
    match spawned {
        Ok(handle) => {
            if let Some(entry) = lock(&shared.handles).get_mut(slot) {
                *entry = Some(handle);
            }
        }
        Err(e) => error!(slot, error = %e, "failed to spawn worker thread"),
    }
}

fn worker_loop(slot: usize, shared: Arc<Shared>) {
    while let Ok(QueuedTask { task_id, job }) = shared.jobs.recv() {
        let counters = &shared.counters;
        counters.busy.fetch_add(1, Ordering::Relaxed);
        let outcome = catch_unwind(AssertUnwindSafe(job));
        counters.busy.fetch_sub(1, Ordering::Relaxed);

        let (result, crashed) = match outcome {
            Ok(Ok(values)) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                (Ok(values), false)
            }
            Ok(Err(message)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                (Err(PoolError::TaskFailed(message)), false)
            }
            Err(panic) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                (Err(PoolError::WorkerCrashed(panic_message(&*panic))), true)
            }
        };
        if shared.results.send(TaskOutcome { task_id, result }).is_err() {
            warn!(task_id, "result router is gone");
        }
        if crashed {
            warn!(slot, task_id, "worker panicked, respawning");
            counters.respawns.fetch_add(1, Ordering::Relaxed);
            spawn_worker(slot, &shared);
            return;
        }
    }
    debug!(slot, "worker exiting");
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn route_results(
    mut results: mpsc::UnboundedReceiver<TaskOutcome>,
    pending: Arc<Mutex<HashMap<TaskId, PendingTask>>>,
) {
    while let Some(TaskOutcome { task_id, result }) = results.recv().await {
        let Some(task) = lock(&pending).remove(&task_id) else {
            warn!(task_id, "result for unknown task");
            continue;
        };
        debug!(task_id, session_id = %task.session_id, ok = result.is_ok(), "task finished");
        if task.reply.send(result).is_err() {
            debug!(task_id, session_id = %task.session_id, "session gone, discarding result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::fixtures::{demo_declaration, demo_module};
    use crate::request::PluginRequest;
    use serde_json::json;
    use std::sync::mpsc as std_mpsc;
    use std::time::Instant;

    fn job(f: impl FnOnce() -> Result<Vec<Value>, String> + Send + 'static) -> Job {
        Box::new(f)
    }

    fn tool_request(tool: &str) -> PluginRequest {
        PluginRequest::from_value(json!({
            "type": "tool",
            "action": "invoke_tool",
            "provider": "demo",
            "tool": tool,
        }))
        .unwrap()
    }

    #[test]
    fn test_registry_classifier() {
        let registry = Arc::new(CapabilityRegistry::build(&demo_module(), &demo_declaration()).unwrap());
        let classifier = RegistryClassifier::new(registry.clone(), false);
        assert_eq!(classifier.classify(&tool_request("sum")), TaskKind::Cpu);
        assert_eq!(classifier.classify(&tool_request("echo")), TaskKind::Io);
        assert_eq!(classifier.classify(&tool_request("missing")), TaskKind::Io);

        let disabled = RegistryClassifier::new(registry, true);
        assert_eq!(disabled.classify(&tool_request("sum")), TaskKind::Io);
    }

    #[test]
    fn test_mock_classifier() {
        let mut mock = MockTaskClassifier::new();
        mock.expect_classify().times(1).return_const(TaskKind::Cpu);
        assert_eq!(mock.classify(&tool_request("echo")), TaskKind::Cpu);
    }

    #[test]
    fn test_pool_error_codes() {
        assert_eq!(PoolError::QueueFull(1).code(), ErrorCode::CapacityExceeded);
        assert_eq!(PoolError::TaskFailed("x".into()).code(), ErrorCode::TaskFailed);
        assert_eq!(PoolError::WorkerCrashed("x".into()).code(), ErrorCode::WorkerCrashed);
    }

    #[tokio::test]
    async fn test_run_returns_values() {
        let pool = WorkerPool::new(2, 4);
        let values = pool
            .run("s1", job(|| Ok(vec![json!((1..=10).sum::<u64>())])))
            .await
            .unwrap();
        assert_eq!(values, vec![json!(55)]);
        assert_eq!(pool.stats().completed, 1);
        assert_eq!(pool.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_task_error_reported() {
        let pool = WorkerPool::new(1, 4);
        let err = pool.run("s1", job(|| Err("bad input".into()))).await.unwrap_err();
        assert_eq!(err, PoolError::TaskFailed("bad input".into()));
    }

    #[tokio::test]
    async fn test_panic_is_caught_and_worker_respawned() {
        let pool = WorkerPool::new(1, 4);
        let err = pool.run("s1", job(|| panic!("boom"))).await.unwrap_err();
        assert_eq!(err, PoolError::WorkerCrashed("boom".into()));

        // The respawned worker keeps serving.
        let values = pool.run("s2", job(|| Ok(vec![json!("alive")]))).await.unwrap();
        assert_eq!(values, vec![json!("alive")]);
        assert_eq!(pool.stats().respawns, 1);
    }

    #[tokio::test]
    async fn test_submit_beyond_capacity_fails_immediately() {
        let pool = WorkerPool::new(1, 1);
        let (started_tx, started_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();

        let first = pool
            .submit(
                "a",
                job(move || {
                    started_tx.send(()).ok();
                    release_rx.recv().ok();
                    Ok(vec![json!(1)])
                }),
            )
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let second = pool.submit("b", job(|| Ok(vec![json!(2)]))).unwrap();
        let err = pool.submit("c", job(|| Ok(vec![]))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CapacityExceeded);
        assert_eq!(pool.stats().queued, 1);

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), vec![json!(1)]);
        assert_eq!(second.await.unwrap().unwrap(), vec![json!(2)]);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let pool = WorkerPool::new(2, 4);
        pool.run("a", job(|| Ok(vec![]))).await.unwrap();
        pool.shutdown(Duration::from_secs(1));
        assert_eq!(
            pool.submit("b", job(|| Ok(vec![]))).unwrap_err(),
            PoolError::ShutDown
        );
        // Second call is a no-op.
        pool.shutdown(Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_dropped_receiver_discards_result() {
        let pool = WorkerPool::new(1, 4);
        let rx = pool.submit("gone", job(|| Ok(vec![json!(1)]))).unwrap();
        drop(rx);
        // A later task still completes normally.
        let values = pool.run("next", job(|| Ok(vec![json!(2)]))).await.unwrap();
        assert_eq!(values, vec![json!(2)]);
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_and_detaches_busy_worker() {
        let pool = WorkerPool::new(1, 4);
        let (started_tx, started_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();

        let running = pool
            .submit(
                "busy",
                job(move || {
                    started_tx.send(()).ok();
                    release_rx.recv_timeout(Duration::from_secs(10)).ok();
                    Ok(vec![json!("late")])
                }),
            )
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let queued = pool.submit("waiting", job(|| Ok(vec![json!("never")]))).unwrap();

        let started = Instant::now();
        pool.shutdown(Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(queued.await.unwrap(), Err(PoolError::ShutDown));
        assert_eq!(pool.stats().queued, 0);

        // The detached worker still delivers once it finishes.
        release_tx.send(()).unwrap();
        assert_eq!(running.await.unwrap().unwrap(), vec![json!("late")]);
    }
}
