//! Worker processes and their owning pools.
//!
//! A worker is a re-spawn of the server executable holding a frozen
//! snapshot of controller state. Exactly one owner (the pool) is
//! responsible for teardown: dropping the handle closes its pipes, the
//! worker reads EOF and exits, and the child is reaped.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::codec;
use crate::ipc::{self, DiagnosticsBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Eval,
    Options,
}

impl WorkerKind {
    fn flag(self) -> &'static str {
        match self {
            WorkerKind::Eval => "--eval-worker",
            WorkerKind::Options => "--option-worker",
        }
    }
}

/// Notifications a worker pushes to the controller.
#[derive(Debug)]
pub enum WorkerEvent {
    Diagnostics(DiagnosticsBatch),
    Finished,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

pub struct Worker {
    pub workspace_version: u64,
    child: tokio::process::Child,
    writer_tx: mpsc::UnboundedSender<Value>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl Worker {
    /// Spawn a worker of `kind` and hand it its bootstrap snapshot.
    pub async fn spawn(
        kind: WorkerKind,
        bootstrap_method: &str,
        bootstrap_params: Value,
        workspace_version: u64,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Worker> {
        let exe = std::env::current_exe().context("locating the server executable")?;
        let mut child = Command::new(exe)
            .arg(kind.flag())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .context("spawning worker process")?;

        tracing::info!("created {:?} worker process {:?}", kind, child.id());
        let stdin = child.stdin.take().context("worker has no stdin pipe")?;
        let stdout = child.stdout.take().context("worker has no stdout pipe")?;

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Value>();
        let writer_handle = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(frame) = writer_rx.recv().await {
                if let Err(e) = codec::write_frame(&mut stdin, &frame).await {
                    tracing::warn!("worker write error: {e:#}");
                    break;
                }
            }
        });

        let pending: Pending = Arc::default();
        let reader_pending = Arc::clone(&pending);
        let reader_handle = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            loop {
                match codec::read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        dispatch_worker_frame(frame, &reader_pending, &events).await;
                    }
                    Ok(None) => {
                        tracing::debug!("worker closed its pipe");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("worker read error: {e:#}");
                        break;
                    }
                }
            }
        });

        let worker = Worker {
            workspace_version,
            child,
            writer_tx,
            pending,
            next_id: Arc::new(AtomicU64::new(1)),
            reader_handle,
            writer_handle,
        };
        worker.notify(bootstrap_method, bootstrap_params);
        Ok(worker)
    }

    pub fn notify(&self, method: &str, params: Value) {
        let _ = self.writer_tx.send(ipc::notification_frame(method, params));
    }

    /// A cheap handle for multiplexed requests, safe to use after the
    /// pool lock is released.
    pub fn client(&self) -> WorkerClient {
        WorkerClient {
            workspace_version: self.workspace_version,
            writer_tx: self.writer_tx.clone(),
            pending: Arc::clone(&self.pending),
            next_id: Arc::clone(&self.next_id),
        }
    }

}

impl Drop for Worker {
    fn drop(&mut self) {
        // Closing the writer ends the worker's stdin; its reader task
        // then sees EOF and exits. kill_on_drop reaps stragglers.
        tracing::debug!("retiring worker process {:?}", self.child.id());
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

#[derive(Clone)]
pub struct WorkerClient {
    workspace_version: u64,
    writer_tx: mpsc::UnboundedSender<Value>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
}

impl WorkerClient {
    pub fn workspace_version(&self) -> u64 {
        self.workspace_version
    }

    /// Send one request; the returned channel yields the reply, or an
    /// error when the worker is gone.
    pub async fn request(&self, method: &str, params: Value) -> oneshot::Receiver<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        if self
            .writer_tx
            .send(ipc::request_frame(id, method, params))
            .is_err()
        {
            self.pending.lock().await.remove(&id);
        }
        rx
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        workspace_version: u64,
    ) -> (WorkerClient, mpsc::UnboundedReceiver<Value>, Pending) {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::default();
        let client = WorkerClient {
            workspace_version,
            writer_tx,
            pending: Arc::clone(&pending),
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (client, writer_rx, pending)
    }
}

/// Route one frame read from a worker pipe: replies complete pending
/// requests, notifications become [`WorkerEvent`]s.
pub(crate) async fn dispatch_worker_frame(
    frame: Value,
    pending: &Pending,
    events: &mpsc::UnboundedSender<WorkerEvent>,
) {
    let has_reply = frame.get("result").is_some() || frame.get("error").is_some();
    if let (Some(id), true) = (frame.get("id").and_then(Value::as_u64), has_reply) {
        let sender = pending.lock().await.remove(&id);
        if let Some(tx) = sender {
            let result = frame.get("result").cloned().unwrap_or(Value::Null);
            let _ = tx.send(result);
        }
        return;
    }

    match frame.get("method").and_then(Value::as_str) {
        Some(ipc::DIAGNOSTIC) => {
            let Some(params) = frame.get("params").cloned() else {
                return;
            };
            match serde_json::from_value::<DiagnosticsBatch>(params) {
                Ok(batch) => {
                    let _ = events.send(WorkerEvent::Diagnostics(batch));
                }
                Err(e) => tracing::debug!("malformed worker diagnostics: {e}"),
            }
        }
        Some(ipc::FINISHED) => {
            let _ = events.send(WorkerEvent::Finished);
        }
        Some(other) => {
            tracing::trace!("ignoring worker notification {other}");
        }
        None => {
            tracing::trace!("ignoring malformed worker frame");
        }
    }
}

/// Bounded FIFO pool. Pushing past capacity evicts the oldest handle,
/// unless the pool was told to retain everything (test-mode draining).
pub struct WorkerPool<T = Worker> {
    workers: VecDeque<T>,
    capacity: usize,
    retain_all: bool,
}

impl<T> WorkerPool<T> {
    pub fn new(capacity: usize, retain_all: bool) -> Self {
        WorkerPool {
            workers: VecDeque::new(),
            capacity: capacity.max(1),
            retain_all,
        }
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn push(&mut self, worker: T) {
        self.workers.push_back(worker);
        if self.workers.len() > self.capacity && !self.retain_all {
            self.workers.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.workers.iter()
    }
}

impl WorkerPool<Worker> {
    /// Snapshot of request handles for every live worker. Taken under
    /// the pool's lock; the actual sends happen after it is released.
    pub fn clients(&self) -> Vec<WorkerClient> {
        self.workers.iter().map(Worker::client).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_evicts_oldest_past_capacity() {
        let mut pool: WorkerPool<u32> = WorkerPool::new(2, false);
        pool.push(1);
        pool.push(2);
        pool.push(3);
        assert_eq!(pool.len(), 2);
        let left: Vec<u32> = pool.iter().copied().collect();
        assert_eq!(left, vec![2, 3]);
    }

    #[test]
    fn retaining_pool_never_evicts() {
        let mut pool: WorkerPool<u32> = WorkerPool::new(1, true);
        pool.push(1);
        pool.push(2);
        pool.push(3);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn capacity_has_a_floor_of_one() {
        let mut pool: WorkerPool<u32> = WorkerPool::new(0, false);
        pool.push(1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn replies_complete_pending_requests() {
        let (client, mut writer_rx, pending) = WorkerClient::for_tests(7);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let rx = client.request(ipc::HOVER, serde_json::json!({})).await;
        let sent = writer_rx.recv().await.unwrap();
        assert_eq!(sent["method"], ipc::HOVER);
        let id = sent["id"].as_u64().unwrap();

        let reply = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "contents": "hi" }
        });
        dispatch_worker_frame(reply, &pending, &events_tx).await;
        let result = rx.await.unwrap();
        assert_eq!(result["contents"], "hi");
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn diagnostics_notifications_become_events() {
        let (_, _, pending) = WorkerClient::for_tests(1);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": ipc::DIAGNOSTIC,
            "params": { "workspaceVersion": 9, "diagnostics": [] }
        });
        dispatch_worker_frame(frame, &pending, &events_tx).await;
        match events_rx.try_recv().unwrap() {
            WorkerEvent::Diagnostics(batch) => assert_eq!(batch.workspace_version, 9),
            WorkerEvent::Finished => panic!("expected diagnostics"),
        }
    }

    #[tokio::test]
    async fn finished_notification_becomes_event() {
        let (_, _, pending) = WorkerClient::for_tests(1);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": ipc::FINISHED,
            "params": {}
        });
        dispatch_worker_frame(frame, &pending, &events_tx).await;
        assert!(matches!(
            events_rx.try_recv().unwrap(),
            WorkerEvent::Finished
        ));
    }

    #[tokio::test]
    async fn unknown_frames_are_ignored() {
        let (_, _, pending) = WorkerClient::for_tests(1);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        dispatch_worker_frame(serde_json::json!({ "weird": true }), &pending, &events_tx).await;
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reply_for_unknown_id_is_ignored() {
        let (_, _, pending) = WorkerClient::for_tests(1);
        let (events_tx, _) = mpsc::unbounded_channel();
        let frame = serde_json::json!({ "jsonrpc": "2.0", "id": 404, "result": {} });
        dispatch_worker_frame(frame, &pending, &events_tx).await;
    }
}
