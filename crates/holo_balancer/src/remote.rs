//! Remote execution seams: shard address lookup and the command runner.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::command::RemoteReply;
use crate::error::SchedulerError;
use crate::types::{HostAndPort, ShardId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// No reply was received.
    #[error("{message}")]
    Transport { message: String },
    /// The node answered with an application error.
    #[error("{message}")]
    Command { code: Option<i32>, message: String },
}

impl From<RemoteError> for SchedulerError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Transport { message } => SchedulerError::Transport { message },
            RemoteError::Command { code, message } => SchedulerError::Remote { code, message },
        }
    }
}

/// One command addressed to a resolved shard host.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCommandRequest {
    pub shard: ShardId,
    pub host: HostAndPort,
    /// Database the command runs against (always `admin` for balancer commands).
    pub db_name: String,
    pub cmd: Value,
}

#[async_trait]
pub trait RemoteCommandRunner: Send + Sync + 'static {
    async fn run_command(&self, request: RemoteCommandRequest) -> Result<RemoteReply, RemoteError>;
}

/// Shard id to primary host lookup.
pub trait ShardRegistry: Send + Sync + 'static {
    fn host_for(&self, shard: &ShardId) -> Option<HostAndPort>;
}

/// Fixed shard table that can be edited at runtime.
#[derive(Default)]
pub struct StaticShardRegistry {
    shards: RwLock<BTreeMap<ShardId, HostAndPort>>,
}

impl StaticShardRegistry {
    pub fn new(shards: impl IntoIterator<Item = (ShardId, HostAndPort)>) -> Self {
        Self {
            shards: RwLock::new(shards.into_iter().collect()),
        }
    }

    pub fn upsert(&self, shard: ShardId, host: HostAndPort) {
        self.shards.write().unwrap().insert(shard, host);
    }

    pub fn remove(&self, shard: &ShardId) -> Option<HostAndPort> {
        self.shards.write().unwrap().remove(shard)
    }
}

impl ShardRegistry for StaticShardRegistry {
    fn host_for(&self, shard: &ShardId) -> Option<HostAndPort> {
        self.shards.read().unwrap().get(shard).cloned()
    }
}
