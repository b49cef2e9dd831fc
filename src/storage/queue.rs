//! Durable queue abstraction used by the socket relay

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Append an item to the tail of the queue
    async fn push(&self, queue: &str, item: Vec<u8>) -> Result<()>;

    /// Pop the head of the queue, waiting at most `timeout` for an item
    async fn blocking_pop(&self, queue: &str, timeout: Duration) -> Result<Option<Vec<u8>>>;
}

/// Redis list used as a FIFO (LPUSH / BRPOP)
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisQueue {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        tracing::info!("Connecting to Redis queue at {}", redis_url);

        let client = redis::Client::open(redis_url)
            .with_context(|| format!("Failed to create Redis client for {}", redis_url))?;

        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl DurableQueue for RedisQueue {
    async fn push(&self, queue: &str, item: Vec<u8>) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(queue)
            .arg(item)
            .query_async::<()>(&mut conn)
            .await
            .with_context(|| format!("Redis LPUSH to {} failed", queue))
    }

    async fn blocking_pop(&self, queue: &str, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, Vec<u8>)> = redis::cmd("BRPOP")
            .arg(queue)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Redis BRPOP from {} failed", queue))?;

        Ok(popped.map(|(_, item)| item))
    }
}

/// In-process queue, for single-node setups without Redis
#[derive(Debug, Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .map(|q| q.get(queue).map(VecDeque::len).unwrap_or(0))
            .unwrap_or(0)
    }

    fn try_pop(&self, queue: &str) -> Option<Vec<u8>> {
        self.queues
            .lock()
            .ok()
            .and_then(|mut q| q.get_mut(queue).and_then(VecDeque::pop_front))
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn push(&self, queue: &str, item: Vec<u8>) -> Result<()> {
        {
            let mut queues = self
                .queues
                .lock()
                .map_err(|_| anyhow::anyhow!("Memory queue lock poisoned"))?;
            queues.entry(queue.to_string()).or_default().push_back(item);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(&self, queue: &str, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop(queue) {
                return Ok(Some(item));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_pop(queue));
            }
        }
    }
}
