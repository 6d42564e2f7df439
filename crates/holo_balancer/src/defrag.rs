//! Defragmentation action stream: policies produce actions, the dispatcher
//! turns them into scheduler requests and reports each result back.
//!
//! A policy hands out at most `max_outstanding` actions that have not been
//! acknowledged yet; [`ActionStream`] implements that bound and the
//! close-wakes-everyone behavior so policies only decide *what* to do next.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::command::DataSizeResponse;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::registry::DeferredResponse;
use crate::scheduler::BalancerCommandsScheduler;
use crate::types::{ChunkRange, ChunkVersion, Key, KeyPattern, NamespaceString, ShardId};

/// Merge of contiguous chunks owned by one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeInfo {
    pub nss: NamespaceString,
    pub shard: ShardId,
    pub range: ChunkRange,
    pub version: ChunkVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSizeInfo {
    pub nss: NamespaceString,
    pub shard: ShardId,
    pub range: ChunkRange,
    pub version: ChunkVersion,
    pub key_pattern: KeyPattern,
    pub estimated_value: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoSplitVectorInfo {
    pub nss: NamespaceString,
    pub shard: ShardId,
    pub key_pattern: KeyPattern,
    pub min: Key,
    pub max: Key,
    pub max_chunk_size_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitInfoWithKeyPattern {
    pub nss: NamespaceString,
    pub shard: ShardId,
    pub version: ChunkVersion,
    pub key_pattern: KeyPattern,
    pub min: Key,
    pub max: Key,
    pub split_keys: Vec<Key>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefragmentationAction {
    Merge(MergeInfo),
    AutoSplitVector(AutoSplitVectorInfo),
    Split(SplitInfoWithKeyPattern),
    DataSize(DataSizeInfo),
}

impl DefragmentationAction {
    pub fn nss(&self) -> &NamespaceString {
        match self {
            DefragmentationAction::Merge(info) => &info.nss,
            DefragmentationAction::AutoSplitVector(info) => &info.nss,
            DefragmentationAction::Split(info) => &info.nss,
            DefragmentationAction::DataSize(info) => &info.nss,
        }
    }
}

/// Source of defragmentation work.
///
/// Every action returned by `next_streaming_action` is acknowledged exactly
/// once through the method matching its kind.
#[async_trait]
pub trait DefragmentationPolicy: Send + Sync + 'static {
    /// Start streaming actions for `nss`.
    fn begin_new_collection(&self, nss: &NamespaceString);

    /// Stop streaming actions for `nss`. Actions already handed out are
    /// still acknowledged.
    fn remove_collection(&self, nss: &NamespaceString);

    fn is_defragmenting_collection(&self, nss: &NamespaceString) -> bool;

    /// Waits while there is nothing to do or too many actions are
    /// unacknowledged. Returns `None` once the stream is closed.
    async fn next_streaming_action(&self) -> Option<DefragmentationAction>;

    /// Stop producing actions and wake every waiting caller.
    fn close_action_stream(&self);

    fn acknowledge_merge_result(&self, action: MergeInfo, result: Result<(), SchedulerError>);

    fn acknowledge_auto_split_vector_result(
        &self,
        action: AutoSplitVectorInfo,
        result: Result<Vec<Key>, SchedulerError>,
    );

    fn acknowledge_split_result(
        &self,
        action: SplitInfoWithKeyPattern,
        result: Result<(), SchedulerError>,
    );

    fn acknowledge_data_size_result(
        &self,
        action: DataSizeInfo,
        result: Result<DataSizeResponse, SchedulerError>,
    );
}

/// Bounded action queue with a cap on unacknowledged actions.
///
/// `push` waits while `max_outstanding` actions are queued or handed out and
/// not yet acknowledged. `close` makes every pending and future `push`/`next`
/// return immediately.
pub struct ActionStream {
    tx: mpsc::Sender<DefragmentationAction>,
    rx: Mutex<mpsc::Receiver<DefragmentationAction>>,
    permits: Semaphore,
    unacked: AtomicUsize,
    closed: CancellationToken,
}

impl ActionStream {
    pub fn new(max_outstanding: usize) -> Self {
        let max_outstanding = max_outstanding.max(1);
        let (tx, rx) = mpsc::channel(max_outstanding);
        Self {
            tx,
            rx: Mutex::new(rx),
            permits: Semaphore::new(max_outstanding),
            unacked: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.max_outstanding_actions)
    }

    /// Queue an action. Gives the action back if the stream is closed.
    pub async fn push(&self, action: DefragmentationAction) -> Result<(), DefragmentationAction> {
        let permit = tokio::select! {
            _ = self.closed.cancelled() => return Err(action),
            permit = self.permits.acquire() => permit,
        };
        let Ok(permit) = permit else {
            return Err(action);
        };
        permit.forget();
        self.unacked.fetch_add(1, Ordering::SeqCst);
        // Capacity is guaranteed by the permit just taken.
        self.tx.send(action).await.map_err(|err| err.0)
    }

    /// Next queued action, or `None` once closed.
    pub async fn next(&self) -> Option<DefragmentationAction> {
        tokio::select! {
            _ = self.closed.cancelled() => None,
            action = async { self.rx.lock().await.recv().await } => action,
        }
    }

    /// Release one unacknowledged slot. Extra calls are ignored.
    pub fn acknowledge(&self) {
        let released = self
            .unacked
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if released {
            self.permits.add_permits(1);
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Actions pushed and not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.unacked.load(Ordering::SeqCst)
    }
}

/// Drives a policy: every action becomes a scheduler request whose result is
/// acknowledged back to the policy.
pub struct ActionDispatcher;

impl ActionDispatcher {
    /// Runs until the policy's stream closes and every issued action is acknowledged.
    pub fn spawn(
        scheduler: Arc<BalancerCommandsScheduler>,
        policy: Arc<dyn DefragmentationPolicy>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut acks = JoinSet::new();
            let mut dispatched = 0u64;
            while let Some(action) = policy.next_streaming_action().await {
                tracing::debug!(nss = %action.nss(), ?action, "dispatching defragmentation action");
                dispatch(&scheduler, &policy, action, &mut acks);
                dispatched += 1;
                while let Some(Some(joined)) = acks.join_next().now_or_never() {
                    log_ack_join(joined);
                }
            }
            while let Some(joined) = acks.join_next().await {
                log_ack_join(joined);
            }
            tracing::info!(dispatched, "defragmentation action stream closed");
        })
    }
}

fn dispatch(
    scheduler: &BalancerCommandsScheduler,
    policy: &Arc<dyn DefragmentationPolicy>,
    action: DefragmentationAction,
    acks: &mut JoinSet<()>,
) {
    let policy = policy.clone();
    match action {
        DefragmentationAction::Merge(info) => {
            let submitted = scheduler.request_merge_chunks(
                &info.nss,
                &info.shard,
                info.range.clone(),
                info.version,
            );
            track(acks, submitted, move |result| {
                policy.acknowledge_merge_result(info, result)
            });
        }
        DefragmentationAction::AutoSplitVector(info) => {
            let submitted = scheduler.request_auto_split_vector(
                &info.nss,
                &info.shard,
                info.key_pattern.clone(),
                info.min.clone(),
                info.max.clone(),
                info.max_chunk_size_bytes,
            );
            track(acks, submitted, move |result| {
                policy.acknowledge_auto_split_vector_result(info, result)
            });
        }
        DefragmentationAction::Split(info) => {
            let submitted = scheduler.request_split_chunk(
                &info.nss,
                &info.shard,
                info.version,
                info.key_pattern.clone(),
                info.min.clone(),
                info.max.clone(),
                info.split_keys.clone(),
            );
            track(acks, submitted, move |result| {
                policy.acknowledge_split_result(info, result)
            });
        }
        DefragmentationAction::DataSize(info) => {
            let submitted = scheduler.request_data_size(
                &info.nss,
                &info.shard,
                info.range.clone(),
                info.version,
                info.key_pattern.clone(),
                info.estimated_value,
            );
            track(acks, submitted, move |result| {
                policy.acknowledge_data_size_result(info, result)
            });
        }
    }
}

/// Acknowledge synchronously on rejection, otherwise once the response resolves.
fn track<T, F>(
    acks: &mut JoinSet<()>,
    submitted: Result<DeferredResponse<T>, SchedulerError>,
    ack: F,
) where
    T: Send + 'static,
    F: FnOnce(Result<T, SchedulerError>) + Send + 'static,
{
    match submitted {
        Ok(response) => {
            acks.spawn(async move { ack(response.await) });
        }
        Err(err) => ack(Err(err)),
    }
}

fn log_ack_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        tracing::warn!(error = ?err, "defragmentation acknowledgement task failed");
    }
}
