//! Identifiers and key-range primitives shared by the scheduler.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shard key value. Ranges are lexicographic and end-exclusive.
pub type Key = Vec<u8>;

/// Fully qualified collection name (`db.collection`), used as the lock key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceString(String);

impl NamespaceString {
    pub fn new(db: &str, collection: &str) -> Self {
        Self(format!("{db}.{collection}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn db(&self) -> &str {
        self.0.split_once('.').map(|(db, _)| db).unwrap_or(&self.0)
    }

    pub fn collection(&self) -> &str {
        self.0.split_once('.').map(|(_, coll)| coll).unwrap_or("")
    }
}

impl From<&str> for NamespaceString {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for NamespaceString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a shard (target node group) in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ShardId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network address a shard's commands are sent to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAndPort {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("expected host:port, got {s:?}"))?;
        if host.is_empty() {
            anyhow::bail!("empty host in {s:?}");
        }
        let port = port
            .parse::<u16>()
            .map_err(|err| anyhow::anyhow!("invalid port in {s:?}: {err}"))?;
        Ok(Self::new(host, port))
    }
}

/// Key range `[min, max)` covered by one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub min: Key,
    pub max: Key,
}

impl ChunkRange {
    pub fn new(min: Key, max: Key) -> Self {
        Self { min, max }
    }

    /// An empty `max` is treated as unbounded.
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.min.as_slice() && (self.max.is_empty() || key < self.max.as_slice())
    }
}

/// Placement version of a chunk; bumped by every move, split and merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub major: u32,
    pub minor: u32,
    pub epoch: u64,
    pub timestamp: u64,
}

impl ChunkVersion {
    pub const fn new(major: u32, minor: u32, epoch: u64, timestamp: u64) -> Self {
        Self {
            major,
            minor,
            epoch,
            timestamp,
        }
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}||{}||{}",
            self.major, self.minor, self.epoch, self.timestamp
        )
    }
}

/// Ordered list of shard key fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPattern(Vec<String>);

impl KeyPattern {
    pub fn new(fields: Vec<String>) -> Self {
        Self(fields)
    }

    pub fn single(field: &str) -> Self {
        Self(vec![field.to_string()])
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }
}

/// Chunk descriptor as read from the routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkType {
    pub range: ChunkRange,
    pub shard: ShardId,
    pub version: ChunkVersion,
    pub jumbo: bool,
}

/// Identity of one scheduler request.
///
/// UUID v7 keeps identities time ordered, so the persisted command log
/// iterates in admission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(Self(Uuid::from_slice(bytes)?))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_splits_db_and_collection() {
        let nss = NamespaceString::new("testDb", "testColl");
        assert_eq!(nss.as_str(), "testDb.testColl");
        assert_eq!(nss.db(), "testDb");
        assert_eq!(nss.collection(), "testColl");
    }

    #[test]
    fn host_and_port_parses_and_rejects_garbage() {
        let host: HostAndPort = "TestHost0:12345".parse().expect("parse host");
        assert_eq!(host, HostAndPort::new("TestHost0", 12345));
        assert_eq!(host.to_string(), "TestHost0:12345");
        assert!("no-port".parse::<HostAndPort>().is_err());
        assert!(":1".parse::<HostAndPort>().is_err());
        assert!("h:99999".parse::<HostAndPort>().is_err());
    }

    #[test]
    fn chunk_range_end_is_exclusive_and_empty_max_is_unbounded() {
        let range = ChunkRange::new(b"a".to_vec(), b"m".to_vec());
        assert!(range.contains(b"a"));
        assert!(range.contains(b"lzz"));
        assert!(!range.contains(b"m"));

        let tail = ChunkRange::new(b"m".to_vec(), Vec::new());
        assert!(tail.contains(b"zzzz"));
        assert!(!tail.contains(b"a"));
    }

    #[test]
    fn request_ids_are_time_ordered_and_byte_stable() {
        let first = RequestId::new();
        let second = RequestId::new();
        assert!(first < second);
        assert!(first.to_bytes() < second.to_bytes());
        let restored = RequestId::from_slice(&first.to_bytes()).expect("decode id");
        assert_eq!(restored, first);
        let parsed: RequestId = first.to_string().parse().expect("parse id");
        assert_eq!(parsed, first);
    }
}
