//! Durable log of admitted-but-unfinished balancer commands.
//!
//! A record is appended before its request becomes eligible for dispatch and
//! removed once the request reaches a terminal state. Whatever is still in
//! the log when the scheduler starts is replayed as orphaned work.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::CommandInfo;
use crate::types::{NamespaceString, RequestId, ShardId};

/// Partition holding one entry per outstanding command.
const COMMANDS_PARTITION: &str = "balancer_commands";

/// Durable projection of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedCommand {
    pub request_id: RequestId,
    pub nss: NamespaceString,
    pub target: ShardId,
    pub requires_distributed_lock: bool,
    /// Document sent to the target shard, as produced by `CommandInfo::to_document`.
    pub remote_command: Value,
}

impl PersistedCommand {
    pub fn from_command(request_id: RequestId, command: &CommandInfo) -> anyhow::Result<Self> {
        Ok(Self {
            request_id,
            nss: command.nss().clone(),
            target: command.target().clone(),
            requires_distributed_lock: command.requires_distributed_lock(),
            remote_command: command
                .to_document()
                .context("encode balancer command document")?,
        })
    }

    pub fn decode_command(&self) -> anyhow::Result<CommandInfo> {
        CommandInfo::from_document(self.remote_command.clone())
            .with_context(|| format!("decode persisted command {}", self.request_id))
    }
}

/// Storage seam for persisted commands.
pub trait CommandLog: Send + Sync + 'static {
    fn append(&self, record: &PersistedCommand) -> anyhow::Result<()>;
    /// Removing an absent record is not an error.
    fn remove(&self, request_id: RequestId) -> anyhow::Result<()>;
    /// All records in admission order. Only used during recovery.
    fn list_all(&self) -> anyhow::Result<Vec<PersistedCommand>>;
}

/// Command log backed by a fjall partition; every mutation is synced.
pub struct FjallCommandLog {
    keyspace: Arc<Keyspace>,
    commands: fjall::PartitionHandle,
}

impl FjallCommandLog {
    pub fn open(keyspace: Arc<Keyspace>) -> anyhow::Result<Self> {
        let commands = keyspace
            .open_partition(COMMANDS_PARTITION, PartitionCreateOptions::default())
            .context("open balancer command partition")?;
        Ok(Self { keyspace, commands })
    }

    pub fn open_dir(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path).context("create command log dir")?;
        let keyspace = fjall::Config::new(path)
            .open()
            .context("open command log keyspace")?;
        Self::open(Arc::new(keyspace))
    }

    /// Delete every entry, readable or not. Returns how many were removed.
    pub fn purge(&self) -> anyhow::Result<usize> {
        let mut keys = Vec::new();
        for item in self.commands.iter() {
            let (key, _) = item.context("scan balancer command partition")?;
            keys.push(key);
        }
        for key in &keys {
            self.commands
                .remove(key.to_vec())
                .context("delete persisted command")?;
        }
        self.sync()?;
        Ok(keys.len())
    }

    fn sync(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("sync command log")
    }
}

impl CommandLog for FjallCommandLog {
    fn append(&self, record: &PersistedCommand) -> anyhow::Result<()> {
        let value = serde_json::to_vec(record).context("serialize persisted command")?;
        self.commands
            .insert(record.request_id.to_bytes().to_vec(), value)
            .context("write persisted command")?;
        self.sync()
    }

    fn remove(&self, request_id: RequestId) -> anyhow::Result<()> {
        self.commands
            .remove(request_id.to_bytes().to_vec())
            .context("delete persisted command")?;
        self.sync()
    }

    fn list_all(&self) -> anyhow::Result<Vec<PersistedCommand>> {
        let mut records = Vec::new();
        for item in self.commands.iter() {
            let (key, value) = item.context("scan balancer command partition")?;
            match serde_json::from_slice::<PersistedCommand>(&value) {
                Ok(record) => records.push(record),
                // An unreadable envelope must not hide the remaining records.
                Err(err) => tracing::warn!(
                    key = ?RequestId::from_slice(&key).ok(),
                    error = ?err,
                    "skipping unreadable persisted balancer command"
                ),
            }
        }
        Ok(records)
    }
}

/// In-process command log. Contents do not survive the process.
#[derive(Default)]
pub struct MemoryCommandLog {
    records: RwLock<BTreeMap<RequestId, PersistedCommand>>,
}

impl MemoryCommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CommandLog for MemoryCommandLog {
    fn append(&self, record: &PersistedCommand) -> anyhow::Result<()> {
        self.records
            .write()
            .unwrap()
            .insert(record.request_id, record.clone());
        Ok(())
    }

    fn remove(&self, request_id: RequestId) -> anyhow::Result<()> {
        self.records.write().unwrap().remove(&request_id);
        Ok(())
    }

    fn list_all(&self) -> anyhow::Result<Vec<PersistedCommand>> {
        Ok(self.records.read().unwrap().values().cloned().collect())
    }
}
