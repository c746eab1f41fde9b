use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use ethereum_types::H256;
use parking_lot::Mutex;
use redis::{
    Cmd, ConnectionLike, ErrorKind, FromRedisValue, RedisError, RedisResult,
    cluster::{ClusterClient, ClusterClientBuilder},
};
use tracing::{debug, error, info, warn};

use crate::{BlockPubSub, CacheError, CacheStats, TrieNodeCache, TrieNodeCacheConfig};

/// Pub-sub channel carrying block notifications.
pub const BLOCK_CHANNEL: &str = "latestBlock";

const SET_ITEM_CHANNEL_SIZE: usize = 10_000;
const SUBSCRIPTION_CHANNEL_SIZE: usize = 1_000;

const DIAL_TIMEOUT: Duration = Duration::from_millis(300);
const READ_TIMEOUT: Duration = Duration::from_millis(100);
const WRITE_TIMEOUT: Duration = Duration::from_millis(100);
const SUBSCRIBE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_RETRIES: u32 = 2;

type PooledConnection = Box<dyn ConnectionLike + Send>;

enum Client {
    Single(redis::Client),
    Cluster(ClusterClient),
}

impl Client {
    fn connect(&self) -> RedisResult<PooledConnection> {
        match self {
            Client::Single(client) => {
                let conn = client.get_connection_with_timeout(DIAL_TIMEOUT)?;
                conn.set_read_timeout(Some(READ_TIMEOUT))?;
                conn.set_write_timeout(Some(WRITE_TIMEOUT))?;
                Ok(Box::new(conn))
            }
            Client::Cluster(client) => Ok(Box::new(client.get_connection()?)),
        }
    }
}

struct Shared {
    client: Client,
    pool: Vec<Mutex<Option<PooledConnection>>>,
    next: AtomicUsize,
}

impl Shared {
    /// Runs `cmd` on a pooled connection, reconnecting on transport errors.
    fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> RedisResult<T> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len().max(1);
        let Some(slot) = self.pool.get(index) else {
            return Err(RedisError::from((ErrorKind::IoError, "empty connection pool")));
        };
        let mut guard = slot.lock();
        let mut last_err = None;
        for _ in 0..=MAX_RETRIES {
            if guard.is_none() {
                match self.client.connect() {
                    Ok(conn) => *guard = Some(conn),
                    Err(err) => {
                        last_err = Some(err);
                        continue;
                    }
                }
            }
            let Some(conn) = guard.as_mut() else {
                continue;
            };
            match cmd.query(&mut **conn) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() => {
                    *guard = None;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| RedisError::from((ErrorKind::IoError, "redis query failed"))))
    }

    fn get(&self, key: &H256) -> Option<Vec<u8>> {
        match self.query::<Option<Vec<u8>>>(redis::cmd("GET").arg(redis_key(key))) {
            Ok(value) => value,
            Err(err) => {
                debug!(key = %redis_key(key), %err, "Failed to get item from redis");
                None
            }
        }
    }

    fn set(&self, key: &H256, value: &[u8]) {
        if let Err(err) = self.query::<()>(redis::cmd("SET").arg(redis_key(key)).arg(value)) {
            error!(key = %redis_key(key), %err, "Failed to set item to redis");
        }
    }
}

struct Subscription {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Cache backed by a redis server or cluster.
///
/// Reads and synchronous writes go through a small connection pool. Writes
/// issued with [`RemoteCache::set_async`] are queued and applied by a fixed
/// set of worker threads.
pub struct RemoteCache {
    shared: Arc<Shared>,
    subscribe_client: redis::Client,
    set_items: Mutex<Option<Sender<(H256, Vec<u8>)>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl RemoteCache {
    pub fn new(config: &TrieNodeCacheConfig) -> Result<Self, CacheError> {
        let urls: Vec<String> = config
            .redis_endpoints
            .iter()
            .map(|endpoint| redis_url(endpoint))
            .collect();
        let Some(first) = urls.first() else {
            return Err(CacheError::RedisNoEndpoint);
        };
        let subscribe_client = redis::Client::open(first.as_str())?;
        let client = if config.redis_cluster_enable {
            Client::Cluster(
                ClusterClientBuilder::new(urls.clone())
                    .connection_timeout(DIAL_TIMEOUT)
                    .response_timeout(READ_TIMEOUT)
                    .retries(MAX_RETRIES)
                    .build()?,
            )
        } else {
            Client::Single(redis::Client::open(first.as_str())?)
        };

        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            / 2
            + 1;
        let shared = Arc::new(Shared {
            client,
            pool: (0..worker_count).map(|_| Mutex::new(None)).collect(),
            next: AtomicUsize::new(0),
        });

        let (sender, receiver) = bounded::<(H256, Vec<u8>)>(SET_ITEM_CHANNEL_SIZE);
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let shared = shared.clone();
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("redis-set-{i}"))
                .spawn(move || {
                    while let Ok((key, value)) = receiver.recv() {
                        shared.set(&key, &value);
                    }
                })?;
            workers.push(handle);
        }

        info!(
            endpoints = ?config.redis_endpoints,
            cluster = config.redis_cluster_enable,
            workers = worker_count,
            "Initialized redis trie node cache"
        );
        Ok(Self {
            shared,
            subscribe_client,
            set_items: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            subscription: Mutex::new(None),
        })
    }

    /// Queues a write without blocking. The item is dropped when the queue
    /// is full.
    pub fn set_async(&self, key: H256, value: Vec<u8>) {
        let guard = self.set_items.lock();
        let Some(sender) = guard.as_ref() else {
            return;
        };
        match sender.try_send((key, value)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("redis setItem channel is full"),
            Err(TrySendError::Disconnected(_)) => debug!("redis setItem channel is closed"),
        }
    }
}

impl TrieNodeCache for RemoteCache {
    fn get(&self, key: &H256) -> Option<Vec<u8>> {
        self.shared.get(key)
    }

    fn set(&self, key: H256, value: Vec<u8>) {
        self.shared.set(&key, &value);
    }

    fn has(&self, key: &H256) -> Option<Vec<u8>> {
        self.shared.get(key)
    }

    fn save_to_file(&self, _dir: &Path, _concurrency: usize) -> Result<(), CacheError> {
        Ok(())
    }

    fn update_stats(&self) -> Option<CacheStats> {
        None
    }

    fn close(&self) -> Result<(), CacheError> {
        self.unsubscribe_block()?;
        // Dropping the sender lets the workers drain the queue and exit
        self.set_items.lock().take();
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                error!("redis set worker panicked");
            }
        }
        Ok(())
    }

    fn as_pubsub(&self) -> Option<&dyn BlockPubSub> {
        Some(self)
    }
}

impl BlockPubSub for RemoteCache {
    fn publish_block(&self, msg: &str) -> Result<(), CacheError> {
        self.shared
            .query::<i64>(redis::cmd("PUBLISH").arg(BLOCK_CHANNEL).arg(msg))?;
        Ok(())
    }

    fn subscribe_block(&self) -> Result<Receiver<String>, CacheError> {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return Err(CacheError::AlreadySubscribed);
        }
        let conn = self
            .subscribe_client
            .get_connection_with_timeout(DIAL_TIMEOUT)?;
        let (sender, receiver) = bounded(SUBSCRIPTION_CHANNEL_SIZE);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("redis-subscribe".to_string())
            .spawn(move || {
                if let Err(err) = forward_block_messages(conn, &thread_stop, &sender) {
                    error!(%err, "redis block subscription terminated");
                }
            })?;
        *subscription = Some(Subscription { stop, handle });
        Ok(receiver)
    }

    fn unsubscribe_block(&self) -> Result<(), CacheError> {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.stop.store(true, Ordering::Release);
            if subscription.handle.join().is_err() {
                error!("redis subscribe thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for RemoteCache {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.lock().as_ref() {
            subscription.stop.store(true, Ordering::Release);
        }
    }
}

fn forward_block_messages(
    mut conn: redis::Connection,
    stop: &AtomicBool,
    sender: &Sender<String>,
) -> RedisResult<()> {
    let mut pubsub = conn.as_pubsub();
    pubsub.subscribe(BLOCK_CHANNEL)?;
    pubsub.set_read_timeout(Some(SUBSCRIBE_POLL_INTERVAL))?;
    while !stop.load(Ordering::Acquire) {
        let msg = match pubsub.get_message() {
            Ok(msg) => msg,
            Err(err) if err.is_timeout() => continue,
            Err(err) => return Err(err),
        };
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "Ignoring malformed block message");
                continue;
            }
        };
        match sender.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("redis block subscription channel is full"),
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
    Ok(())
}

fn redis_url(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("redis://{endpoint}")
    }
}

fn redis_key(key: &H256) -> String {
    format!("0x{}", hex::encode(key))
}
