//! Balancer command payloads and remote reply interpretation.
//!
//! Every command kind the scheduler can issue is a variant of [`CommandInfo`].
//! Persistence, recovery and dispatch all match on it exhaustively.
//!
//! Commands travel to shards (and into the command log) as JSON documents
//! produced by [`CommandInfo::to_document`]. Replies are documents carrying an
//! `ok` flag plus kind-specific fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SchedulerError;
use crate::types::{ChunkRange, ChunkVersion, Key, KeyPattern, NamespaceString, ShardId};

/// Raw reply document returned by a shard.
pub type RemoteReply = Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    MoveChunk,
    MergeChunks,
    SplitChunk,
    DataSize,
    AutoSplitVector,
}

impl CommandKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            CommandKind::MoveChunk => "moveChunk",
            CommandKind::MergeChunks => "mergeChunks",
            CommandKind::SplitChunk => "splitChunk",
            CommandKind::DataSize => "dataSize",
            CommandKind::AutoSplitVector => "autoSplitVector",
        }
    }
}

/// How a migration waits on secondaries while cloning documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecondaryThrottle {
    Default,
    On,
    Off,
}

/// Whether a migration may move a chunk flagged as jumbo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ForceJumbo {
    DoNotForce,
    ForceManual,
    ForceBalancer,
}

/// Balancer-wide knobs applied to every migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveChunkSettings {
    pub max_chunk_size_bytes: i64,
    pub secondary_throttle: SecondaryThrottle,
    pub wait_for_delete: bool,
    pub force_jumbo: ForceJumbo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveChunkCommandInfo {
    pub nss: NamespaceString,
    pub from_shard: ShardId,
    pub to_shard: ShardId,
    pub min: Key,
    pub max: Key,
    pub max_chunk_size_bytes: i64,
    pub secondary_throttle: SecondaryThrottle,
    pub wait_for_delete: bool,
    pub force_jumbo: ForceJumbo,
    pub version: ChunkVersion,
    pub issued_by_remote_user: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeChunksCommandInfo {
    pub nss: NamespaceString,
    pub shard: ShardId,
    pub range: ChunkRange,
    pub version: ChunkVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitChunkCommandInfo {
    pub nss: NamespaceString,
    pub shard: ShardId,
    pub version: ChunkVersion,
    pub key_pattern: KeyPattern,
    pub range: ChunkRange,
    pub split_points: Vec<Key>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSizeCommandInfo {
    pub nss: NamespaceString,
    pub shard: ShardId,
    pub key_pattern: KeyPattern,
    pub range: ChunkRange,
    pub version: ChunkVersion,
    pub estimated_value: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSplitVectorCommandInfo {
    pub nss: NamespaceString,
    pub shard: ShardId,
    pub key_pattern: KeyPattern,
    pub range: ChunkRange,
    pub max_chunk_size_bytes: i64,
}

/// One remote balancer command, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum CommandInfo {
    MoveChunk(MoveChunkCommandInfo),
    MergeChunks(MergeChunksCommandInfo),
    SplitChunk(SplitChunkCommandInfo),
    DataSize(DataSizeCommandInfo),
    AutoSplitVector(AutoSplitVectorCommandInfo),
}

impl CommandInfo {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandInfo::MoveChunk(_) => CommandKind::MoveChunk,
            CommandInfo::MergeChunks(_) => CommandKind::MergeChunks,
            CommandInfo::SplitChunk(_) => CommandKind::SplitChunk,
            CommandInfo::DataSize(_) => CommandKind::DataSize,
            CommandInfo::AutoSplitVector(_) => CommandKind::AutoSplitVector,
        }
    }

    pub fn nss(&self) -> &NamespaceString {
        match self {
            CommandInfo::MoveChunk(info) => &info.nss,
            CommandInfo::MergeChunks(info) => &info.nss,
            CommandInfo::SplitChunk(info) => &info.nss,
            CommandInfo::DataSize(info) => &info.nss,
            CommandInfo::AutoSplitVector(info) => &info.nss,
        }
    }

    /// Shard the command executes on. Migrations run on the donor.
    pub fn target(&self) -> &ShardId {
        match self {
            CommandInfo::MoveChunk(info) => &info.from_shard,
            CommandInfo::MergeChunks(info) => &info.shard,
            CommandInfo::SplitChunk(info) => &info.shard,
            CommandInfo::DataSize(info) => &info.shard,
            CommandInfo::AutoSplitVector(info) => &info.shard,
        }
    }

    /// Only migrations hold the collection lock while in flight.
    pub fn requires_distributed_lock(&self) -> bool {
        match self {
            CommandInfo::MoveChunk(_) => true,
            CommandInfo::MergeChunks(_)
            | CommandInfo::SplitChunk(_)
            | CommandInfo::DataSize(_)
            | CommandInfo::AutoSplitVector(_) => false,
        }
    }

    /// Reason string recorded with the lock holder.
    pub fn lock_reason(&self) -> String {
        format!(
            "balancer {} on collection {}",
            self.kind().as_str(),
            self.nss()
        )
    }

    pub fn to_document(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_document(doc: Value) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(doc)?)
    }
}

/// Result of a data-size query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSizeResponse {
    pub size_bytes: i64,
    pub num_objects: i64,
}

/// Interpret the `ok` flag of a reply; a failed reply becomes a remote error.
///
/// `ok` may be a bool, a number, or a numeric string (`"1"`).
pub fn check_reply(reply: &RemoteReply) -> Result<(), SchedulerError> {
    let Some(ok) = reply.get("ok") else {
        return Err(SchedulerError::invalid_response("reply has no ok field"));
    };
    let ok = match ok {
        Value::Bool(flag) => *flag,
        Value::Number(num) => num.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Value::String(s) => match s.as_str() {
            "true" => true,
            "false" => false,
            other => other.parse::<f64>().map(|v| v != 0.0).map_err(|_| {
                SchedulerError::invalid_response(format!("unreadable ok field {other:?}"))
            })?,
        },
        other => {
            return Err(SchedulerError::invalid_response(format!(
                "unreadable ok field {other}"
            )))
        }
    };
    if ok {
        return Ok(());
    }
    let code = reply
        .get("code")
        .and_then(Value::as_i64)
        .and_then(|code| i32::try_from(code).ok());
    let message = reply
        .get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or("command failed without errmsg")
        .to_string();
    Err(SchedulerError::Remote { code, message })
}

pub(crate) fn parse_ack(reply: RemoteReply) -> Result<(), SchedulerError> {
    check_reply(&reply)
}

pub(crate) fn parse_data_size(reply: RemoteReply) -> Result<DataSizeResponse, SchedulerError> {
    check_reply(&reply)?;
    let field = |name: &str| {
        reply
            .get(name)
            .and_then(integral)
            .ok_or_else(|| SchedulerError::invalid_response(format!("dataSize reply lacks {name}")))
    };
    Ok(DataSizeResponse {
        size_bytes: field("size")?,
        num_objects: field("numObjects")?,
    })
}

/// Counts may arrive as doubles; only whole values are accepted.
fn integral(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|v| v.fract() == 0.0 && v.abs() < i64::MAX as f64)
            .map(|v| v as i64)
    })
}

pub(crate) fn parse_split_keys(reply: RemoteReply) -> Result<Vec<Key>, SchedulerError> {
    check_reply(&reply)?;
    let Some(keys) = reply.get("splitKeys") else {
        return Err(SchedulerError::invalid_response(
            "autoSplitVector reply lacks splitKeys",
        ));
    };
    serde_json::from_value(keys.clone()).map_err(|err| {
        SchedulerError::invalid_response(format!("malformed splitKeys: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn move_chunk() -> CommandInfo {
        CommandInfo::MoveChunk(MoveChunkCommandInfo {
            nss: NamespaceString::new("testDb", "testColl"),
            from_shard: ShardId::new("shard0"),
            to_shard: ShardId::new("shard1"),
            min: b"x0".to_vec(),
            max: b"x10".to_vec(),
            max_chunk_size_bytes: 128,
            secondary_throttle: SecondaryThrottle::Default,
            wait_for_delete: false,
            force_jumbo: ForceJumbo::DoNotForce,
            version: ChunkVersion::new(1, 1, 42, 10),
            issued_by_remote_user: false,
        })
    }

    #[test]
    fn move_chunk_targets_donor_and_requires_lock() {
        let cmd = move_chunk();
        assert_eq!(cmd.kind(), CommandKind::MoveChunk);
        assert_eq!(cmd.target(), &ShardId::new("shard0"));
        assert!(cmd.requires_distributed_lock());
        assert_eq!(
            cmd.lock_reason(),
            "balancer moveChunk on collection testDb.testColl"
        );
    }

    #[test]
    fn queries_and_range_ops_run_without_lock() {
        let nss = NamespaceString::new("db", "c");
        let range = ChunkRange::new(b"a".to_vec(), b"b".to_vec());
        let merge = CommandInfo::MergeChunks(MergeChunksCommandInfo {
            nss: nss.clone(),
            shard: ShardId::new("shard0"),
            range: range.clone(),
            version: ChunkVersion::new(1, 0, 1, 1),
        });
        let query = CommandInfo::AutoSplitVector(AutoSplitVectorCommandInfo {
            nss,
            shard: ShardId::new("shard1"),
            key_pattern: KeyPattern::single("x"),
            range,
            max_chunk_size_bytes: 4,
        });
        assert!(!merge.requires_distributed_lock());
        assert!(!query.requires_distributed_lock());
        assert_eq!(query.target(), &ShardId::new("shard1"));
    }

    #[test]
    fn document_carries_kind_tag() {
        let doc = move_chunk().to_document().expect("encode");
        assert_eq!(doc["command"], json!("moveChunk"));
        assert_eq!(doc["fromShard"], json!("shard0"));
        assert_eq!(doc["nss"], json!("testDb.testColl"));
        let decoded = CommandInfo::from_document(doc).expect("decode");
        assert_eq!(decoded, move_chunk());
    }

    #[test]
    fn unknown_kind_fails_to_decode() {
        let doc = json!({ "command": "dropCollection", "nss": "db.c" });
        assert!(CommandInfo::from_document(doc).is_err());
    }

    #[test]
    fn ok_flag_accepts_bool_number_and_string() {
        assert!(check_reply(&json!({ "ok": true })).is_ok());
        assert!(check_reply(&json!({ "ok": 1 })).is_ok());
        assert!(check_reply(&json!({ "ok": "1" })).is_ok());
        assert!(check_reply(&json!({ "ok": 1.0 })).is_ok());
        assert_eq!(
            check_reply(&json!({})).unwrap_err().kind(),
            crate::ErrorKind::InvalidResponse
        );
    }

    #[test]
    fn failed_reply_surfaces_code_and_errmsg() {
        let err = check_reply(&json!({ "ok": 0, "code": 11600, "errmsg": "interrupted" }))
            .unwrap_err();
        assert_eq!(
            err,
            SchedulerError::Remote {
                code: Some(11600),
                message: "interrupted".into()
            }
        );
    }

    #[test]
    fn data_size_reply_is_parsed() {
        let resp = parse_data_size(json!({ "ok": "1", "size": 156, "numObjects": 25 }))
            .expect("parse data size");
        assert_eq!(
            resp,
            DataSizeResponse {
                size_bytes: 156,
                num_objects: 25
            }
        );
        assert!(parse_data_size(json!({ "ok": 1, "size": 3 })).is_err());
    }

    #[test]
    fn data_size_accepts_whole_doubles() {
        let resp = parse_data_size(json!({ "ok": 1.0, "size": 156.0, "numObjects": 25.0 }))
            .expect("parse data size");
        assert_eq!(
            resp,
            DataSizeResponse {
                size_bytes: 156,
                num_objects: 25
            }
        );
        let err = parse_data_size(json!({ "ok": 1, "size": 1.5, "numObjects": 2 })).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    }

    #[test]
    fn split_keys_reply_is_parsed() {
        let keys = parse_split_keys(json!({
            "ok": "1",
            "splitKeys": [b"x7".to_vec(), b"x9".to_vec()]
        }))
        .expect("parse split keys");
        assert_eq!(keys, vec![b"x7".to_vec(), b"x9".to_vec()]);
        assert!(parse_split_keys(json!({ "ok": 1 })).is_err());
    }
}
