//! Cluster-wide access built from topology plus per-node batches.

use std::collections::HashSet;

use redis_protocol::resp2::types::BytesFrame;
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::error::{Result, RowSlotError};
use crate::pipeline::{run_batch, NodeConnection};
use crate::resp::{frame_string, Command};
use crate::topology::{fetch_topology, group_keys_by_node, ClusterNode, ClusterTopology};

/// Connection settings plus the slot map they were resolved against.
#[derive(Debug, Clone)]
pub struct ClusterClient {
    connection: ConnectionConfig,
    topology: ClusterTopology,
    max_pipeline: usize,
    scan_count: usize,
}

impl ClusterClient {
    /// Discovers topology from the configured seed node.
    pub async fn connect(
        connection: ConnectionConfig,
        max_pipeline: usize,
        scan_count: usize,
    ) -> Result<Self> {
        let topology = fetch_topology(&connection).await?;
        Ok(Self::with_topology(connection, topology, max_pipeline, scan_count))
    }

    /// Uses a caller-supplied topology instead of asking the seed.
    pub fn with_topology(
        connection: ConnectionConfig,
        topology: ClusterTopology,
        max_pipeline: usize,
        scan_count: usize,
    ) -> Self {
        Self {
            connection,
            topology,
            max_pipeline: max_pipeline.max(1),
            scan_count: scan_count.max(1),
        }
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    /// Node owning `key`.
    pub fn route(&self, key: &str) -> Result<&ClusterNode> {
        self.topology.node_for_key(key)
    }

    /// Runs `commands` as one batch on the node at `addr`.
    pub async fn run_batch(&self, addr: &str, commands: Vec<Command>) -> Result<Vec<BytesFrame>> {
        run_batch(addr, &self.connection, commands, self.max_pipeline).await
    }

    /// Runs a single command on the node owning `key`.
    pub async fn run_for_key(&self, key: &str, command: Command) -> Result<BytesFrame> {
        let addr = self.route(key)?.addr();
        let replies = self.run_batch(&addr, vec![command]).await?;
        replies
            .into_iter()
            .next()
            .ok_or_else(|| RowSlotError::protocol(&addr, "missing reply"))
    }

    /// Every key matching `pattern`, node by node in slot order.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for addr in self.topology.addrs() {
            keys.extend(self.scan_node_keys(&addr, pattern).await?);
        }
        Ok(keys)
    }

    /// Keys matching `pattern` on one node, following the SCAN cursor to the end.
    pub async fn scan_node_keys(&self, addr: &str, pattern: &str) -> Result<Vec<String>> {
        let mut conn = NodeConnection::open(addr, &self.connection).await?;
        let result = self.scan_with(&mut conn, pattern).await;
        conn.close().await;
        let keys = result?;
        debug!(node = %addr, pattern, keys = keys.len(), "scanned node keys");
        Ok(keys)
    }

    async fn scan_with(&self, conn: &mut NodeConnection, pattern: &str) -> Result<Vec<String>> {
        let mut keys = ScannedKeys::default();
        let mut cursor = "0".to_string();
        loop {
            let command = Command::new("SCAN")
                .arg(&cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg_int(self.scan_count);
            let reply = conn
                .pipeline(vec![command])
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| RowSlotError::protocol(conn.addr(), "missing SCAN reply"))?;
            let (next, page) = parse_scan_reply(conn.addr(), &reply)?;
            keys.extend(page);
            if next == "0" {
                return Ok(keys.into_keys());
            }
            cursor = next;
        }
    }

    /// Deletes every key matching `pattern`; returns how many were removed.
    ///
    /// Each node is truncated independently; a failure on one node leaves
    /// deletions already applied on others in place.
    pub async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let keys = self.scan_keys(pattern).await?;
        let mut deleted = 0u64;
        for (addr, group) in group_keys_by_node(&self.topology, keys)? {
            let commands = group
                .iter()
                .map(|key| Command::new("DEL").arg(key))
                .collect::<Vec<_>>();
            let replies = self.run_batch(&addr, commands).await?;
            deleted += replies
                .iter()
                .filter_map(crate::resp::frame_integer)
                .map(|n| n.max(0) as u64)
                .sum::<u64>();
        }
        Ok(deleted)
    }
}

/// Keys collected across SCAN pages of one node.
///
/// SCAN may return a key more than once (for example while the node
/// rehashes); only its first occurrence is kept.
#[derive(Debug, Default)]
struct ScannedKeys {
    seen: HashSet<String>,
    keys: Vec<String>,
}

impl ScannedKeys {
    fn extend(&mut self, page: Vec<String>) {
        for key in page {
            if self.seen.insert(key.clone()) {
                self.keys.push(key);
            }
        }
    }

    fn into_keys(self) -> Vec<String> {
        self.keys
    }
}

/// Splits a SCAN reply into the next cursor and the page of keys.
fn parse_scan_reply(addr: &str, reply: &BytesFrame) -> Result<(String, Vec<String>)> {
    let BytesFrame::Array(parts) = reply else {
        return Err(RowSlotError::protocol(addr, "SCAN reply is not an array"));
    };
    let [cursor, page] = parts.as_slice() else {
        return Err(RowSlotError::protocol(addr, "SCAN reply must have two items"));
    };
    let cursor =
        frame_string(cursor).ok_or_else(|| RowSlotError::protocol(addr, "SCAN cursor is not a string"))?;
    let BytesFrame::Array(items) = page else {
        return Err(RowSlotError::protocol(addr, "SCAN page is not an array"));
    };
    let keys = items
        .iter()
        .map(|item| {
            frame_string(item).ok_or_else(|| RowSlotError::protocol(addr, "SCAN key is not a string"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((cursor, keys))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn scan_reply(cursor: &str, keys: &[&str]) -> BytesFrame {
        let bulk = |text: &str| BytesFrame::BulkString(Bytes::copy_from_slice(text.as_bytes()));
        BytesFrame::Array(vec![
            bulk(cursor),
            BytesFrame::Array(keys.iter().map(|key| bulk(*key)).collect()),
        ])
    }

    #[test]
    fn repeated_keys_across_pages_are_kept_once() {
        let mut keys = ScannedKeys::default();
        let (next, page) = parse_scan_reply("n1", &scan_reply("17", &["t:1", "t:2", "t:1"]))
            .expect("first page");
        assert_eq!(next, "17");
        keys.extend(page);
        let (next, page) =
            parse_scan_reply("n1", &scan_reply("0", &["t:2", "t:3"])).expect("last page");
        assert_eq!(next, "0");
        keys.extend(page);
        assert_eq!(keys.into_keys(), vec!["t:1", "t:2", "t:3"]);
    }

    #[test]
    fn malformed_scan_replies_are_protocol_errors() {
        let err = parse_scan_reply("n1", &BytesFrame::Array(Vec::new())).expect_err("no items");
        assert!(matches!(err, RowSlotError::Protocol { .. }), "{err}");
    }
}
