//! Balancer command scheduler.
//!
//! Balancer policies submit chunk migrations, merges, splits and size queries to a
//! [`BalancerCommandsScheduler`]. Each request is persisted before dispatch,
//! executed on its target shard (under the collection lock for migrations)
//! and answered exactly once. Commands left unfinished by a crash or
//! interruption are re-issued on the next start.

pub mod command;
pub mod command_log;
pub mod config;
pub mod defrag;
pub mod dist_lock;
pub mod error;
pub mod registry;
pub mod remote;
pub mod scheduler;
pub mod types;

mod worker;

pub use command::{
    check_reply, CommandInfo, CommandKind, DataSizeResponse, ForceJumbo, MoveChunkSettings,
    RemoteReply, SecondaryThrottle,
};
pub use command_log::{CommandLog, FjallCommandLog, MemoryCommandLog, PersistedCommand};
pub use config::SchedulerConfig;
pub use defrag::{
    ActionDispatcher, ActionStream, AutoSplitVectorInfo, DataSizeInfo, DefragmentationAction,
    DefragmentationPolicy, MergeInfo, SplitInfoWithKeyPattern,
};
pub use dist_lock::{
    DistLockManager, LocalDistLockManager, LockError, LockToken, ScopedDistLock,
    SINGLE_LOCK_ATTEMPT_TIMEOUT,
};
pub use error::{ErrorKind, SchedulerError};
pub use registry::{DeferredResponse, RegistryView, RequestState};
pub use remote::{
    RemoteCommandRequest, RemoteCommandRunner, RemoteError, ShardRegistry, StaticShardRegistry,
};
pub use scheduler::{BalancerCommandsScheduler, SchedulerState};
pub use types::{
    ChunkRange, ChunkType, ChunkVersion, HostAndPort, Key, KeyPattern, NamespaceString, RequestId,
    ShardId,
};
