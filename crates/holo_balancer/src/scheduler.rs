//! `BalancerCommandsScheduler`: the facade balancer policies submit commands to.
//!
//! Every request is persisted before it becomes eligible for dispatch and
//! answered exactly once through a [`DeferredResponse`]. The actual work
//! happens in the dispatch worker spawned by [`BalancerCommandsScheduler::start`].

use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::command::{
    parse_ack, parse_data_size, parse_split_keys, AutoSplitVectorCommandInfo, CommandInfo,
    DataSizeCommandInfo, DataSizeResponse, MergeChunksCommandInfo, MoveChunkCommandInfo,
    MoveChunkSettings, RemoteReply, SplitChunkCommandInfo,
};
use crate::command_log::{CommandLog, PersistedCommand};
use crate::config::SchedulerConfig;
use crate::dist_lock::DistLockManager;
use crate::error::SchedulerError;
use crate::registry::{DeferredResponse, RegistryView, RequestState};
use crate::remote::{RemoteCommandRunner, ShardRegistry};
use crate::types::{
    ChunkRange, ChunkType, ChunkVersion, Key, KeyPattern, NamespaceString, RequestId, ShardId,
};
use crate::worker::{DispatchWorker, StopMode, WorkerContext, WorkerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    Stopping,
}

struct Lifecycle {
    state: SchedulerState,
    tx: Option<mpsc::UnboundedSender<WorkerMessage>>,
    worker: Option<JoinHandle<()>>,
}

pub struct BalancerCommandsScheduler {
    ctx: WorkerContext,
    config: SchedulerConfig,
    lifecycle: Mutex<Lifecycle>,
    // Serializes stop()/interrupt() so a second caller also waits for the drain.
    shutdown: tokio::sync::Mutex<()>,
    paused: watch::Sender<bool>,
    view: RegistryView,
}

impl BalancerCommandsScheduler {
    pub fn new(
        command_log: Arc<dyn CommandLog>,
        lock_manager: Arc<dyn DistLockManager>,
        runner: Arc<dyn RemoteCommandRunner>,
        shards: Arc<dyn ShardRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            ctx: WorkerContext {
                command_log,
                lock_manager,
                runner,
                shards,
                lock_timeout: config.lock_timeout,
            },
            config,
            lifecycle: Mutex::new(Lifecycle {
                state: SchedulerState::Stopped,
                tx: None,
                worker: None,
            }),
            shutdown: tokio::sync::Mutex::new(()),
            paused,
            view: RegistryView::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn state(&self) -> SchedulerState {
        self.lifecycle.lock().unwrap().state
    }

    /// Replay persisted commands and start dispatching. No-op when running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        match lifecycle.state {
            SchedulerState::Running => return Ok(()),
            SchedulerState::Stopping => {
                anyhow::bail!("balancer commands scheduler is still stopping")
            }
            SchedulerState::Stopped => {}
        }

        let records = self
            .ctx
            .command_log
            .list_all()
            .context("load persisted balancer commands")?;
        self.view.clear();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut worker =
            DispatchWorker::new(self.ctx.clone(), self.view.clone(), self.paused.subscribe(), rx);
        let recovered = worker.recover(records);
        let handle = tokio::spawn(worker.run());

        lifecycle.state = SchedulerState::Running;
        lifecycle.tx = Some(tx);
        lifecycle.worker = Some(handle);
        tracing::info!(recovered, "balancer commands scheduler started");
        Ok(())
    }

    /// Clean stop: cancel every outstanding request and delete its record.
    ///
    /// Returns once every deferred response is resolved and every lock is
    /// released. Safe to call when not running.
    pub async fn stop(&self) {
        self.shutdown(StopMode::Clean).await;
    }

    /// Like [`stop`](Self::stop), but persisted records are kept so the next
    /// `start()` re-issues the cancelled commands.
    pub async fn interrupt(&self) {
        self.shutdown(StopMode::Interrupted).await;
    }

    async fn shutdown(&self, mode: StopMode) {
        let _serial = self.shutdown.lock().await;
        let (tx, worker) = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if lifecycle.state != SchedulerState::Running {
                return;
            }
            lifecycle.state = SchedulerState::Stopping;
            (lifecycle.tx.take(), lifecycle.worker.take())
        };

        if let Some(tx) = tx {
            let _ = tx.send(WorkerMessage::Stop { mode });
        }
        if let Some(mut worker) = worker {
            match tokio::time::timeout(self.config.stop_timeout, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!(error = ?err, "balancer dispatch worker failed"),
                Err(_) => {
                    tracing::error!(
                        timeout_ms = self.config.stop_timeout.as_millis() as u64,
                        "balancer dispatch worker did not stop in time, aborting"
                    );
                    // Dropping its state resolves every waiter as cancelled and releases locks.
                    worker.abort();
                    let _ = worker.await;
                }
            }
        }

        self.view.clear();
        self.lifecycle.lock().unwrap().state = SchedulerState::Stopped;
        tracing::info!(mode = ?mode, "balancer commands scheduler stopped");
    }

    /// Hold admitted requests in `Pending` without dispatching them.
    pub fn set_submissions_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
        tracing::info!(paused, "balancer command submissions pause toggled");
    }

    pub fn submissions_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Current state of a live request; `None` once it is terminal or unknown.
    pub fn request_state(&self, request_id: RequestId) -> Option<RequestState> {
        self.view.state(request_id)
    }

    pub fn outstanding_requests(&self) -> usize {
        self.view.len()
    }

    pub fn request_move_chunk(
        &self,
        nss: &NamespaceString,
        chunk: &ChunkType,
        recipient: &ShardId,
        settings: &MoveChunkSettings,
        issued_by_remote_user: bool,
    ) -> Result<DeferredResponse<()>, SchedulerError> {
        let command = CommandInfo::MoveChunk(MoveChunkCommandInfo {
            nss: nss.clone(),
            from_shard: chunk.shard.clone(),
            to_shard: recipient.clone(),
            min: chunk.range.min.clone(),
            max: chunk.range.max.clone(),
            max_chunk_size_bytes: settings.max_chunk_size_bytes,
            secondary_throttle: settings.secondary_throttle,
            wait_for_delete: settings.wait_for_delete,
            force_jumbo: settings.force_jumbo,
            version: chunk.version,
            issued_by_remote_user,
        });
        self.enqueue(command, parse_ack)
    }

    pub fn request_merge_chunks(
        &self,
        nss: &NamespaceString,
        shard: &ShardId,
        range: ChunkRange,
        version: ChunkVersion,
    ) -> Result<DeferredResponse<()>, SchedulerError> {
        let command = CommandInfo::MergeChunks(MergeChunksCommandInfo {
            nss: nss.clone(),
            shard: shard.clone(),
            range,
            version,
        });
        self.enqueue(command, parse_ack)
    }

    pub fn request_auto_split_vector(
        &self,
        nss: &NamespaceString,
        shard: &ShardId,
        key_pattern: KeyPattern,
        min: Key,
        max: Key,
        max_chunk_size_bytes: i64,
    ) -> Result<DeferredResponse<Vec<Key>>, SchedulerError> {
        let command = CommandInfo::AutoSplitVector(AutoSplitVectorCommandInfo {
            nss: nss.clone(),
            shard: shard.clone(),
            key_pattern,
            range: ChunkRange::new(min, max),
            max_chunk_size_bytes,
        });
        self.enqueue(command, parse_split_keys)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn request_split_chunk(
        &self,
        nss: &NamespaceString,
        shard: &ShardId,
        version: ChunkVersion,
        key_pattern: KeyPattern,
        min: Key,
        max: Key,
        split_points: Vec<Key>,
    ) -> Result<DeferredResponse<()>, SchedulerError> {
        let command = CommandInfo::SplitChunk(SplitChunkCommandInfo {
            nss: nss.clone(),
            shard: shard.clone(),
            version,
            key_pattern,
            range: ChunkRange::new(min, max),
            split_points,
        });
        self.enqueue(command, parse_ack)
    }

    pub fn request_data_size(
        &self,
        nss: &NamespaceString,
        shard: &ShardId,
        range: ChunkRange,
        version: ChunkVersion,
        key_pattern: KeyPattern,
        estimated_value: bool,
    ) -> Result<DeferredResponse<DataSizeResponse>, SchedulerError> {
        let command = CommandInfo::DataSize(DataSizeCommandInfo {
            nss: nss.clone(),
            shard: shard.clone(),
            key_pattern,
            range,
            version,
            estimated_value,
        });
        self.enqueue(command, parse_data_size)
    }

    fn enqueue<T>(
        &self,
        command: CommandInfo,
        parse: fn(RemoteReply) -> Result<T, SchedulerError>,
    ) -> Result<DeferredResponse<T>, SchedulerError> {
        let request_id = RequestId::new();
        // Held across the append so stop() cannot slip between admission and enqueue.
        let lifecycle = self.lifecycle.lock().unwrap();
        let tx = match (&lifecycle.state, &lifecycle.tx) {
            (SchedulerState::Running, Some(tx)) => tx,
            _ => return Err(SchedulerError::Stopped),
        };

        let record = PersistedCommand::from_command(request_id, &command)
            .map_err(|err| SchedulerError::persistence(&err))?;
        self.ctx
            .command_log
            .append(&record)
            .map_err(|err| SchedulerError::persistence(&err))?;

        let (completion, rx) = oneshot::channel();
        self.view.set(request_id, RequestState::Pending);
        let msg = WorkerMessage::Submit {
            request_id,
            command,
            remote_command: record.remote_command,
            completion,
        };
        if tx.send(msg).is_err() {
            // Worker task is gone; a rejected request leaves no record behind.
            self.view.set(request_id, RequestState::Cancelled);
            tracing::warn!(request_id = %request_id, "balancer dispatch worker is not running");
            if let Err(err) = self.ctx.command_log.remove(request_id) {
                tracing::warn!(
                    request_id = %request_id,
                    error = ?err,
                    "failed to delete rejected balancer command"
                );
            }
            return Err(SchedulerError::Stopped);
        }
        Ok(DeferredResponse::new(request_id, rx, parse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_log::MemoryCommandLog;
    use crate::dist_lock::LocalDistLockManager;
    use crate::remote::{RemoteCommandRequest, RemoteError, StaticShardRegistry};
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl RemoteCommandRunner for Unreachable {
        async fn run_command(
            &self,
            _request: RemoteCommandRequest,
        ) -> Result<RemoteReply, RemoteError> {
            Err(RemoteError::Transport {
                message: "unreachable".into(),
            })
        }
    }

    fn scheduler(log: Arc<MemoryCommandLog>) -> BalancerCommandsScheduler {
        BalancerCommandsScheduler::new(
            log,
            Arc::new(LocalDistLockManager::new()),
            Arc::new(Unreachable),
            Arc::new(StaticShardRegistry::default()),
            SchedulerConfig::default(),
        )
    }

    #[tokio::test]
    async fn lifecycle_transitions_are_idempotent() {
        let scheduler = scheduler(Arc::new(MemoryCommandLog::new()));
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        scheduler.stop().await;

        scheduler.start().expect("start");
        scheduler.start().expect("second start is a no-op");
        assert_eq!(scheduler.state(), SchedulerState::Running);

        scheduler.stop().await;
        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn paused_request_is_visible_as_pending() {
        let log = Arc::new(MemoryCommandLog::new());
        let scheduler = scheduler(log.clone());
        scheduler.set_submissions_paused(true);
        assert!(scheduler.submissions_paused());
        scheduler.start().expect("start");

        let response = scheduler
            .request_merge_chunks(
                &NamespaceString::new("testDb", "testColl"),
                &ShardId::new("shard0"),
                ChunkRange::new(b"a".to_vec(), b"b".to_vec()),
                ChunkVersion::new(1, 0, 1, 1),
            )
            .expect("admitted");
        assert_eq!(
            scheduler.request_state(response.request_id()),
            Some(RequestState::Pending)
        );
        assert_eq!(scheduler.outstanding_requests(), 1);
        assert_eq!(log.len(), 1);

        scheduler.stop().await;
        assert_eq!(response.await.unwrap_err(), SchedulerError::Cancelled);
        assert!(log.is_empty());
        assert_eq!(scheduler.outstanding_requests(), 0);
    }
    #[tokio::test]
    async fn request_to_dead_worker_is_rejected_without_a_record() {
        let log = Arc::new(MemoryCommandLog::new());
        let scheduler = scheduler(log.clone());
        scheduler.start().expect("start");

        let worker = scheduler.lifecycle.lock().unwrap().worker.take();
        if let Some(worker) = worker {
            worker.abort();
            let _ = worker.await;
        }

        let err = scheduler
            .request_merge_chunks(
                &NamespaceString::new("testDb", "testColl"),
                &ShardId::new("shard0"),
                ChunkRange::new(b"a".to_vec(), b"b".to_vec()),
                ChunkVersion::new(1, 0, 1, 1),
            )
            .unwrap_err();
        assert_eq!(err, SchedulerError::Stopped);
        assert!(log.is_empty());
        assert_eq!(scheduler.outstanding_requests(), 0);

        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }
}
