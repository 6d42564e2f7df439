//! Shared helpers for scheduler integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use holo_balancer::{
    BalancerCommandsScheduler, ChunkRange, ChunkType, ChunkVersion, CommandLog, ForceJumbo,
    HostAndPort, LocalDistLockManager, MemoryCommandLog, MoveChunkSettings, NamespaceString,
    RemoteCommandRequest, RemoteCommandRunner, RemoteError, RemoteReply, SchedulerConfig,
    SecondaryThrottle, ShardId, StaticShardRegistry,
};
use serde_json::json;
use tokio::sync::Semaphore;

/// Upper bound for any condition a test waits on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub const SHARD_ID_0: &str = "shard0";
pub const SHARD_ID_1: &str = "shard1";

type Responder =
    Box<dyn Fn(&RemoteCommandRequest) -> Result<RemoteReply, RemoteError> + Send + Sync>;

/// Remote runner that records every request and answers from a script.
pub struct StubRunner {
    calls: Mutex<Vec<RemoteCommandRequest>>,
    responder: Responder,
    // When set, each call waits for one permit before answering.
    gate: Option<Arc<Semaphore>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl StubRunner {
    pub fn new(
        responder: impl Fn(&RemoteCommandRequest) -> Result<RemoteReply, RemoteError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            gate: None,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Replies `{ok: 1}` to everything.
    pub fn ok() -> Self {
        Self::new(|_| Ok(json!({ "ok": 1 })))
    }

    /// Every call blocks until a permit is added to the returned semaphore.
    pub fn gated(self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                gate: Some(gate.clone()),
                ..self
            },
            gate,
        )
    }

    pub fn calls(&self) -> Vec<RemoteCommandRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveCall<'a>(&'a AtomicUsize);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteCommandRunner for StubRunner {
    async fn run_command(&self, request: RemoteCommandRequest) -> Result<RemoteReply, RemoteError> {
        self.calls.lock().unwrap().push(request.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let _active = ActiveCall(&self.active);

        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        (self.responder)(&request)
    }
}

/// Scheduler wired to in-process collaborators.
pub struct Harness {
    pub log: Arc<dyn CommandLog>,
    pub locks: Arc<LocalDistLockManager>,
    pub runner: Arc<StubRunner>,
    pub shards: Arc<StaticShardRegistry>,
    pub scheduler: Arc<BalancerCommandsScheduler>,
}

impl Harness {
    pub fn new(runner: StubRunner) -> Self {
        Self::with_log(Arc::new(MemoryCommandLog::new()), runner)
    }

    pub fn with_log(log: Arc<dyn CommandLog>, runner: StubRunner) -> Self {
        let locks = Arc::new(LocalDistLockManager::new());
        let runner = Arc::new(runner);
        let shards = Arc::new(two_shard_registry());
        let scheduler = Arc::new(BalancerCommandsScheduler::new(
            log.clone(),
            locks.clone(),
            runner.clone(),
            shards.clone(),
            SchedulerConfig::default(),
        ));
        Self {
            log,
            locks,
            runner,
            shards,
            scheduler,
        }
    }

    pub fn persisted_count(&self) -> usize {
        self.log.list_all().expect("list persisted commands").len()
    }
}

pub fn two_shard_registry() -> StaticShardRegistry {
    StaticShardRegistry::new([
        (ShardId::new(SHARD_ID_0), HostAndPort::new("TestHost0", 12345)),
        (ShardId::new(SHARD_ID_1), HostAndPort::new("TestHost1", 12346)),
    ])
}

pub fn nss() -> NamespaceString {
    NamespaceString::new("testDb", "testColl")
}

pub fn shard(id: &str) -> ShardId {
    ShardId::new(id)
}

pub fn key(idx: u32) -> Vec<u8> {
    format!("x{idx}").into_bytes()
}

/// Chunk `[x{idx}, x{idx + 10})` owned by `shard_id`.
pub fn make_chunk(idx: u32, shard_id: &str) -> ChunkType {
    ChunkType {
        range: ChunkRange::new(key(idx), key(idx + 10)),
        shard: ShardId::new(shard_id),
        version: ChunkVersion::new(idx + 1, 0, 7, 10),
        jumbo: false,
    }
}

pub fn default_move_settings() -> MoveChunkSettings {
    MoveChunkSettings {
        max_chunk_size_bytes: 128,
        secondary_throttle: SecondaryThrottle::Default,
        wait_for_delete: false,
        force_jumbo: ForceJumbo::DoNotForce,
    }
}

/// Poll `cond` until it holds, panicking after [`WAIT_TIMEOUT`].
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `fut`, panicking after [`WAIT_TIMEOUT`].
pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    tokio::time::timeout(WAIT_TIMEOUT, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}
