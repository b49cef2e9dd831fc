//! Socket relay: stream bytes from a local TCP service into the object store.
//!
//! A producer task reads chunks from `host:port` and enqueues them on a
//! durable queue; a consumer task pops items and writes each as one object.
//! The queue decouples the two, so the service keeps being drained while the
//! store is unreachable.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{CompiledPolicy, PolicyHandler, PolicyReport};
use crate::agent::QueueConfig;
use crate::storage::{DurableQueue, ObjectStore, build_queue};

const READ_BUFFER: usize = 64 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// One queued chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayItem {
    pub timestamp: DateTime<Utc>,
    /// Base64 payload
    pub data: String,
}

impl RelayItem {
    pub fn new(chunk: &[u8]) -> Self {
        Self {
            timestamp: Utc::now(),
            data: BASE64.encode(chunk),
        }
    }

    /// Suffix the key transform sees for this item
    pub fn object_name(&self) -> String {
        format!("{}.bin", self.timestamp.format("%Y%m%dT%H%M%S%.6fZ"))
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        BASE64.decode(&self.data).context("Invalid base64 in relay item")
    }
}

/// Drops a chunk identical to the one admitted just before it
#[derive(Debug, Default)]
pub struct ChunkGate {
    last: Option<Vec<u8>>,
}

impl ChunkGate {
    pub fn admit(&mut self, chunk: &[u8]) -> bool {
        if self.last.as_deref() == Some(chunk) {
            return false;
        }
        self.last = Some(chunk.to_vec());
        true
    }
}

/// Counters shared by the producer and consumer tasks
#[derive(Debug, Default)]
pub struct RelayCounters {
    pub received: AtomicU64,
    pub skipped: AtomicU64,
    pub enqueued: AtomicU64,
    pub stored: AtomicU64,
    pub ignored: AtomicU64,
    pub requeued: AtomicU64,
    pub errors: AtomicU64,
    status: Mutex<String>,
}

impl RelayCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn set_status(&self, status: impl Into<String>) {
        if let Ok(mut current) = self.status.lock() {
            *current = status.into();
        }
    }

    pub fn status(&self) -> String {
        self.status.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn report(&self) -> PolicyReport {
        PolicyReport {
            added: self.stored.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            failed: self.errors.load(Ordering::Relaxed),
            status: Some(format!(
                "{} (received {}, enqueued {}, requeued {})",
                self.status(),
                self.received.load(Ordering::Relaxed),
                self.enqueued.load(Ordering::Relaxed),
                self.requeued.load(Ordering::Relaxed),
            )),
            ..PolicyReport::default()
        }
    }
}

/// Admit a chunk through the gate and enqueue it. Returns whether it was queued.
pub async fn enqueue_chunk(
    gate: &mut ChunkGate,
    chunk: &[u8],
    queue: &dyn DurableQueue,
    queue_name: &str,
    counters: &RelayCounters,
) -> Result<bool> {
    RelayCounters::bump(&counters.received);
    if !gate.admit(chunk) {
        RelayCounters::bump(&counters.skipped);
        return Ok(false);
    }

    let item = serde_json::to_vec(&RelayItem::new(chunk))?;
    queue.push(queue_name, item).await?;
    RelayCounters::bump(&counters.enqueued);
    Ok(true)
}

struct TaskHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

pub struct RelayHandler {
    queue_config: QueueConfig,
    queue: Option<Arc<dyn DurableQueue>>,
    counters: Arc<RelayCounters>,
    store: Option<watch::Sender<Arc<dyn ObjectStore>>>,
    producer: Option<TaskHandle>,
    consumer: Option<TaskHandle>,
}

impl RelayHandler {
    pub fn new(queue_config: QueueConfig) -> Self {
        Self {
            queue_config,
            queue: None,
            counters: Arc::new(RelayCounters::default()),
            store: None,
            producer: None,
            consumer: None,
        }
    }

    /// Use an existing queue instead of connecting one from configuration
    pub fn with_queue(queue_config: QueueConfig, queue: Arc<dyn DurableQueue>) -> Self {
        let mut handler = Self::new(queue_config);
        handler.queue = Some(queue);
        handler
    }

    pub fn counters(&self) -> Arc<RelayCounters> {
        self.counters.clone()
    }

    async fn queue(&mut self) -> Result<Arc<dyn DurableQueue>> {
        if let Some(queue) = &self.queue {
            return Ok(queue.clone());
        }
        let queue = build_queue(&self.queue_config).await?;
        self.queue = Some(queue.clone());
        Ok(queue)
    }

    pub fn producer_running(&self) -> bool {
        self.producer.as_ref().is_some_and(TaskHandle::is_running)
    }

    pub fn consumer_running(&self) -> bool {
        self.consumer.as_ref().is_some_and(TaskHandle::is_running)
    }

    pub async fn start_producer(&mut self, policy: &CompiledPolicy) -> Result<()> {
        if self.producer_running() {
            return Ok(());
        }
        let queue = self.queue().await?;
        let cancel = CancellationToken::new();
        let join = tokio::spawn(run_producer(
            policy.clone(),
            queue,
            self.counters.clone(),
            cancel.clone(),
        ));
        self.producer = Some(TaskHandle { cancel, join });
        Ok(())
    }

    pub async fn start_consumer(
        &mut self,
        policy: &CompiledPolicy,
        store: Arc<dyn ObjectStore>,
    ) -> Result<()> {
        if self.consumer_running() {
            return Ok(());
        }
        let queue = self.queue().await?;
        let (sender, receiver) = watch::channel(store);
        let cancel = CancellationToken::new();
        let join = tokio::spawn(run_consumer(
            policy.clone(),
            receiver,
            queue,
            self.counters.clone(),
            cancel.clone(),
        ));
        self.store = Some(sender);
        self.consumer = Some(TaskHandle { cancel, join });
        Ok(())
    }

    pub fn stop_producer(&mut self) {
        if let Some(task) = self.producer.take() {
            task.stop();
        }
    }

    pub fn stop_consumer(&mut self) {
        if let Some(task) = self.consumer.take() {
            task.stop();
        }
        self.store = None;
    }
}

impl Drop for RelayHandler {
    fn drop(&mut self) {
        self.stop_producer();
        self.stop_consumer();
    }
}

#[async_trait]
impl PolicyHandler for RelayHandler {
    fn reset(&mut self) {
        self.stop_producer();
        self.stop_consumer();
    }

    async fn apply(
        &mut self,
        policy: &CompiledPolicy,
        store: Arc<dyn ObjectStore>,
    ) -> Result<PolicyReport> {
        // A running consumer picks up a rebuilt store client
        if let Some(sender) = &self.store
            && self.consumer_running()
        {
            sender.send_replace(store.clone());
        }

        self.start_producer(policy).await?;
        self.start_consumer(policy, store).await?;

        Ok(self.counters.report())
    }
}

async fn run_producer(
    policy: CompiledPolicy,
    queue: Arc<dyn DurableQueue>,
    counters: Arc<RelayCounters>,
    cancel: CancellationToken,
) {
    let settings = &policy.settings;
    let Some(port) = settings.port else {
        counters.set_status("no port configured");
        return;
    };
    let address = format!("{}:{}", settings.host, port);
    let mut gate = ChunkGate::default();
    let mut buffer = vec![0u8; READ_BUFFER];

    while !cancel.is_cancelled() {
        let connect = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address));
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::warn!(policy = policy.name(), "Relay connect to {} failed: {}", address, e);
                    counters.set_status(format!("connect failed: {}", e));
                    RelayCounters::bump(&counters.errors);
                    if sleep_or_cancel(RECONNECT_DELAY, &cancel).await { break; }
                    continue;
                }
                Err(_) => {
                    counters.set_status("connect timed out");
                    RelayCounters::bump(&counters.errors);
                    if sleep_or_cancel(RECONNECT_DELAY, &cancel).await { break; }
                    continue;
                }
            },
        };

        tracing::info!(policy = policy.name(), "Relay connected to {}", address);
        counters.set_status("connected");

        loop {
            let read = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buffer));
            let n = tokio::select! {
                _ = cancel.cancelled() => return,
                result = read => match result {
                    Ok(Ok(0)) => {
                        counters.set_status("disconnected");
                        break;
                    }
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        tracing::warn!(policy = policy.name(), "Relay read failed: {}", e);
                        counters.set_status(format!("read failed: {}", e));
                        RelayCounters::bump(&counters.errors);
                        break;
                    }
                    Err(_) => {
                        counters.set_status("read timed out");
                        RelayCounters::bump(&counters.errors);
                        break;
                    }
                },
            };

            if let Err(e) =
                enqueue_chunk(&mut gate, &buffer[..n], queue.as_ref(), &settings.queue, &counters).await
            {
                tracing::error!(policy = policy.name(), "Relay enqueue failed: {:#}", e);
                counters.set_status(format!("enqueue failed: {:#}", e));
                RelayCounters::bump(&counters.errors);
            }
        }

        if sleep_or_cancel(RECONNECT_DELAY, &cancel).await {
            break;
        }
    }
}

async fn run_consumer(
    policy: CompiledPolicy,
    store: watch::Receiver<Arc<dyn ObjectStore>>,
    queue: Arc<dyn DurableQueue>,
    counters: Arc<RelayCounters>,
    cancel: CancellationToken,
) {
    let settings = &policy.settings;

    // Cancellation is only checked between pops. A pop abandoned mid-flight
    // may already have removed its item from the queue.
    while !cancel.is_cancelled() {
        let popped = queue
            .blocking_pop(&settings.queue, settings.pop_timeout)
            .await;

        let raw = match popped {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(policy = policy.name(), "Relay pop failed: {:#}", e);
                RelayCounters::bump(&counters.errors);
                if sleep_or_cancel(REQUEUE_DELAY, &cancel).await {
                    break;
                }
                continue;
            }
        };

        let item: RelayItem = match serde_json::from_slice(&raw) {
            Ok(item) => item,
            Err(e) => {
                tracing::error!(policy = policy.name(), "Dropping malformed relay item: {}", e);
                RelayCounters::bump(&counters.errors);
                continue;
            }
        };

        let Some(key) = policy.key_for(&item.object_name()) else {
            RelayCounters::bump(&counters.ignored);
            continue;
        };

        let stored = match item.payload() {
            Ok(data) => {
                let client = store.borrow().clone();
                client.put_object(&settings.bucket, &key, data).await
            }
            Err(e) => Err(e),
        };

        match stored {
            Ok(()) => {
                tracing::debug!(key = %key, "Relay item stored");
                RelayCounters::bump(&counters.stored);
            }
            Err(e) => {
                tracing::warn!(policy = policy.name(), "Relay put failed, requeueing: {:#}", e);
                RelayCounters::bump(&counters.errors);
                match queue.push(&settings.queue, raw).await {
                    Ok(()) => RelayCounters::bump(&counters.requeued),
                    Err(e) => tracing::error!("Relay requeue failed, item lost: {:#}", e),
                }
                if sleep_or_cancel(REQUEUE_DELAY, &cancel).await {
                    break;
                }
            }
        }
    }
}

/// Returns true if cancelled during the sleep
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyDefaults, PolicySpec};
    use crate::storage::testing::CountingStore;
    use crate::storage::{FsObjectStore, MemoryQueue};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn policy(port: u16) -> CompiledPolicy {
        let spec: PolicySpec = serde_yaml::from_str(&format!(
            "name: serial\nhandler: relay\nbucket: site\nport: {}\nprefix: serial/\n",
            port
        ))
        .unwrap();
        let defaults = PolicyDefaults {
            pop_timeout: Duration::from_millis(20),
            ..PolicyDefaults::default()
        };
        CompiledPolicy::compile(&spec, 0, &defaults).unwrap()
    }

    #[test]
    fn gate_drops_consecutive_duplicates_only() {
        let mut gate = ChunkGate::default();
        assert!(gate.admit(b"a"));
        assert!(!gate.admit(b"a"));
        assert!(gate.admit(b"b"));
        assert!(gate.admit(b"a"));
    }

    #[tokio::test]
    async fn duplicate_chunk_is_skipped_not_enqueued() {
        let queue = MemoryQueue::new();
        let counters = RelayCounters::default();
        let mut gate = ChunkGate::default();

        assert!(enqueue_chunk(&mut gate, b"temp=21", &queue, "q", &counters).await.unwrap());
        assert!(!enqueue_chunk(&mut gate, b"temp=21", &queue, "q", &counters).await.unwrap());

        assert_eq!(queue.len("q"), 1);
        assert_eq!(counters.skipped.load(Ordering::Relaxed), 1);
        assert_eq!(counters.enqueued.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn relay_item_roundtrips_payload() {
        let item = RelayItem::new(&[0, 159, 146, 150]);
        let json = serde_json::to_string(&item).unwrap();
        let back: RelayItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload().unwrap(), vec![0, 159, 146, 150]);
        assert!(back.object_name().ends_with("Z.bin"));
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn relays_socket_data_into_store() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"reading=42").await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let remote = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(remote.path()));
        let queue: Arc<dyn DurableQueue> = Arc::new(MemoryQueue::new());
        let mut handler = RelayHandler::with_queue(QueueConfig::default(), queue);
        let policy = policy(port);

        handler.apply(&policy, store.clone()).await.unwrap();
        assert!(handler.producer_running());
        assert!(handler.consumer_running());

        let counters = handler.counters();
        wait_for(|| counters.stored.load(Ordering::Relaxed) == 1).await;

        let objects = store.list_objects("site", "serial/").await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].size, 10);

        // Already running: reports counters without restarting anything
        let report = handler.apply(&policy, store).await.unwrap();
        assert_eq!(report.added, 1);

        handler.reset();
        assert!(!handler.producer_running());
        assert!(!handler.consumer_running());
    }

    #[tokio::test]
    async fn failed_put_is_requeued() {
        let remote = tempfile::tempdir().unwrap();
        let counting = Arc::new(CountingStore::new(Arc::new(FsObjectStore::new(remote.path()))));
        counting.fail_writes.store(true, Ordering::SeqCst);
        let memory = Arc::new(MemoryQueue::new());
        let queue: Arc<dyn DurableQueue> = memory.clone();

        let policy = policy(1);
        queue
            .push(&policy.settings.queue, serde_json::to_vec(&RelayItem::new(b"x")).unwrap())
            .await
            .unwrap();

        let mut handler = RelayHandler::with_queue(QueueConfig::default(), queue);
        handler.start_consumer(&policy, counting.clone()).await.unwrap();

        let counters = handler.counters();
        wait_for(|| counters.requeued.load(Ordering::Relaxed) >= 1).await;
        handler.stop_consumer();

        assert_eq!(counters.stored.load(Ordering::Relaxed), 0);
        assert_eq!(memory.len(&policy.settings.queue), 1);
    }

    /// Queue whose pop removes the item first and replies later
    struct SlowQueue {
        item: std::sync::Mutex<Option<Vec<u8>>>,
        delay: Duration,
    }

    #[async_trait]
    impl DurableQueue for SlowQueue {
        async fn push(&self, _queue: &str, item: Vec<u8>) -> Result<()> {
            *self.item.lock().unwrap() = Some(item);
            Ok(())
        }

        async fn blocking_pop(&self, _queue: &str, _timeout: Duration) -> Result<Option<Vec<u8>>> {
            let item = self.item.lock().unwrap().take();
            tokio::time::sleep(self.delay).await;
            Ok(item)
        }
    }

    #[tokio::test]
    async fn item_popped_while_stopping_is_still_stored() {
        let remote = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(remote.path()));
        let queue = Arc::new(SlowQueue {
            item: std::sync::Mutex::new(None),
            delay: Duration::from_millis(100),
        });
        queue
            .push("ignored", serde_json::to_vec(&RelayItem::new(b"x")).unwrap())
            .await
            .unwrap();

        let policy = policy(1);
        let mut handler = RelayHandler::with_queue(QueueConfig::default(), queue.clone());
        handler.start_consumer(&policy, store.clone()).await.unwrap();
        let counters = handler.counters();

        // Stop while the pop is in flight
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.item.lock().unwrap().is_none());
        handler.reset();

        wait_for(|| counters.stored.load(Ordering::Relaxed) == 1).await;
        let objects = store.list_objects("site", "serial/").await.unwrap();
        assert_eq!(objects.len(), 1);
    }
}
