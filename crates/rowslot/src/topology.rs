//! Cluster topology and hash-slot routing.
//!
//! The store partitions its keyspace into [`SLOT_COUNT`] hash slots, each
//! owned by exactly one master node. Topology is read once from the seed
//! node with `CLUSTER SLOTS` and treated as stable for one operation; a key
//! whose slot no node owns is a routing error rather than a retry.

use std::collections::BTreeMap;
use std::fmt;

use redis_protocol::resp2::types::BytesFrame;
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::error::{Result, RowSlotError};
use crate::pipeline::NodeConnection;
use crate::resp::{error_message, frame_integer, frame_string, Command};

/// Number of hash slots in the keyspace.
pub const SLOT_COUNT: u16 = 16384;

/// One master node and the slot range it owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterNode {
    pub host: String,
    pub port: u16,
    /// Inclusive first slot.
    pub start_slot: u16,
    /// Inclusive last slot.
    pub end_slot: u16,
}

impl ClusterNode {
    pub fn new(host: impl Into<String>, port: u16, start_slot: u16, end_slot: u16) -> Self {
        Self {
            host: host.into(),
            port,
            start_slot,
            end_slot,
        }
    }

    /// Node owning the whole keyspace, used for non-clustered stores.
    pub fn standalone(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, 0, SLOT_COUNT - 1)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn owns(&self, slot: u16) -> bool {
        slot >= self.start_slot && slot <= self.end_slot
    }
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}[{}-{}]",
            self.host, self.port, self.start_slot, self.end_slot
        )
    }
}

/// Master nodes sorted by first owned slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTopology {
    nodes: Vec<ClusterNode>,
}

impl ClusterTopology {
    pub fn new(mut nodes: Vec<ClusterNode>) -> Self {
        nodes.sort_by_key(|node| node.start_slot);
        Self { nodes }
    }

    pub fn standalone(host: impl Into<String>, port: u16) -> Self {
        Self::new(vec![ClusterNode::standalone(host, port)])
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    /// Distinct node addresses, in slot order.
    pub fn addrs(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let addr = node.addr();
            if !out.contains(&addr) {
                out.push(addr);
            }
        }
        out
    }

    /// Node owning `key`'s hash slot.
    pub fn node_for_key(&self, key: &str) -> Result<&ClusterNode> {
        let slot = hash_slot(key.as_bytes());
        self.nodes
            .iter()
            .find(|node| node.owns(slot))
            .ok_or_else(|| RowSlotError::Routing {
                key: key.to_string(),
                slot,
            })
    }
}

/// Groups `items` by the node address owning each item's key.
///
/// Relative order within a group follows input order. Every item lands in
/// exactly one group, or the whole call fails with a routing error.
pub fn group_by_node<T, F>(
    topology: &ClusterTopology,
    items: Vec<T>,
    key_of: F,
) -> Result<BTreeMap<String, Vec<T>>>
where
    F: Fn(&T) -> &str,
{
    let mut groups: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for item in items {
        let addr = topology.node_for_key(key_of(&item))?.addr();
        groups.entry(addr).or_default().push(item);
    }
    Ok(groups)
}

/// Routes plain keys; see [`group_by_node`].
pub fn group_keys_by_node(
    topology: &ClusterTopology,
    keys: Vec<String>,
) -> Result<BTreeMap<String, Vec<String>>> {
    group_by_node(topology, keys, |key| key.as_str())
}

/// Hash slot of `key`, honoring `{hashtag}` sections.
pub fn hash_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}

/// Hashed portion of a key: the first non-empty `{...}` section, else the whole key.
fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

/// CRC16/XMODEM (poly 0x1021, init 0), the checksum cluster slots are defined by.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Reads the slot map from the seed node.
///
/// A seed with cluster support disabled yields a single standalone node.
pub async fn fetch_topology(connection: &ConnectionConfig) -> Result<ClusterTopology> {
    let seed = connection.seed_addr();
    let mut conn = NodeConnection::open(&seed, connection).await?;
    let replies = conn
        .send_raw(vec![Command::new("CLUSTER").arg("SLOTS")])
        .await;
    conn.close().await;
    let reply = replies?
        .into_iter()
        .next()
        .ok_or_else(|| RowSlotError::protocol(&seed, "missing CLUSTER SLOTS reply"))?;

    if let Some(message) = error_message(&reply) {
        // Decision: only the "cluster disabled" reply means standalone; any
        // other error is surfaced so a broken cluster is not silently
        // treated as one node.
        if message.to_ascii_lowercase().contains("cluster support disabled") {
            debug!(seed = %seed, "seed is not clustered, using standalone topology");
            return Ok(ClusterTopology::standalone(&connection.host, connection.port));
        }
        return Err(RowSlotError::protocol(&seed, message));
    }

    let topology = parse_cluster_slots(&seed, &connection.host, &reply)?;
    debug!(seed = %seed, nodes = topology.nodes().len(), "fetched cluster topology");
    Ok(topology)
}

/// Parses a `CLUSTER SLOTS` reply, keeping masters only.
fn parse_cluster_slots(seed: &str, seed_host: &str, reply: &BytesFrame) -> Result<ClusterTopology> {
    let BytesFrame::Array(ranges) = reply else {
        return Err(RowSlotError::protocol(seed, "CLUSTER SLOTS reply is not an array"));
    };

    let mut nodes = Vec::with_capacity(ranges.len());
    for range in ranges {
        let BytesFrame::Array(parts) = range else {
            return Err(RowSlotError::protocol(seed, "slot range entry is not an array"));
        };
        if parts.len() < 3 {
            return Err(RowSlotError::protocol(seed, "slot range entry is too short"));
        }
        let start = slot_bound(seed, &parts[0])?;
        let end = slot_bound(seed, &parts[1])?;
        let BytesFrame::Array(master) = &parts[2] else {
            return Err(RowSlotError::protocol(seed, "slot master entry is not an array"));
        };
        let host = master
            .first()
            .and_then(frame_string)
            .ok_or_else(|| RowSlotError::protocol(seed, "slot master has no host"))?;
        let port = master
            .get(1)
            .and_then(frame_integer)
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| RowSlotError::protocol(seed, "slot master has no valid port"))?;
        // An empty host means "the node you are talking to".
        let host = if host.is_empty() {
            seed_host.to_string()
        } else {
            host
        };
        nodes.push(ClusterNode::new(host, port, start, end));
    }
    Ok(ClusterTopology::new(nodes))
}

fn slot_bound(seed: &str, frame: &BytesFrame) -> Result<u16> {
    frame_integer(frame)
        .and_then(|slot| u16::try_from(slot).ok())
        .filter(|slot| *slot < SLOT_COUNT)
        .ok_or_else(|| RowSlotError::protocol(seed, "invalid slot bound"))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn three_nodes() -> ClusterTopology {
        ClusterTopology::new(vec![
            ClusterNode::new("10.0.0.3", 7002, 10923, 16383),
            ClusterNode::new("10.0.0.1", 7000, 0, 5460),
            ClusterNode::new("10.0.0.2", 7001, 5461, 10922),
        ])
    }

    #[test]
    fn crc16_matches_xmodem_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn hash_slot_matches_known_cluster_slots() {
        assert_eq!(hash_slot(b"foo"), 12182);
        assert_eq!(hash_slot(b"123456789"), 0x31C3 % SLOT_COUNT);
    }

    #[test]
    fn hash_tags_pin_keys_to_one_slot() {
        assert_eq!(
            hash_slot(b"{user1000}.following"),
            hash_slot(b"{user1000}.followers")
        );
        assert_eq!(hash_slot(b"{user1000}.following"), hash_slot(b"user1000"));
        // Empty tags hash the whole key.
        assert_eq!(hash_slot(b"{}abc"), crc16(b"{}abc") % SLOT_COUNT);
        // Unclosed braces hash the whole key.
        assert_eq!(hash_slot(b"{abc"), crc16(b"{abc") % SLOT_COUNT);
    }

    #[test]
    fn nodes_are_sorted_by_slot() {
        let topology = three_nodes();
        let ports = topology.nodes().iter().map(|n| n.port).collect::<Vec<_>>();
        assert_eq!(ports, vec![7000, 7001, 7002]);
    }

    #[test]
    fn grouping_is_complete_and_order_preserving() {
        let topology = three_nodes();
        let keys = (0..200).map(|i| format!("t:{i}")).collect::<Vec<_>>();
        let groups = group_keys_by_node(&topology, keys.clone()).expect("route all keys");

        let mut total = 0;
        for (addr, group) in &groups {
            total += group.len();
            // Within a group keys keep their input order.
            let positions = group
                .iter()
                .map(|key| keys.iter().position(|k| k == key).expect("key exists"))
                .collect::<Vec<_>>();
            assert!(positions.windows(2).all(|w| w[0] < w[1]), "order for {addr}");
            for key in group {
                let node = topology.node_for_key(key).expect("route");
                assert_eq!(&node.addr(), addr);
            }
        }
        assert_eq!(total, keys.len());
    }

    #[test]
    fn uncovered_slot_is_a_routing_error() {
        let topology = ClusterTopology::new(vec![ClusterNode::new("10.0.0.1", 7000, 0, 100)]);
        let err = group_keys_by_node(&topology, vec!["foo".to_string()])
            .expect_err("slot 12182 is not covered");
        match err {
            RowSlotError::Routing { key, slot } => {
                assert_eq!(key, "foo");
                assert_eq!(slot, 12182);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn standalone_owns_every_slot() {
        let topology = ClusterTopology::standalone("localhost", 6379);
        assert!(topology.node_for_key("anything").is_ok());
        assert_eq!(topology.addrs(), vec!["localhost:6379"]);
    }

    #[test]
    fn cluster_slots_reply_parses_masters_and_empty_hosts() {
        let bulk = |s: &str| BytesFrame::BulkString(Bytes::copy_from_slice(s.as_bytes()));
        let reply = BytesFrame::Array(vec![
            BytesFrame::Array(vec![
                BytesFrame::Integer(0),
                BytesFrame::Integer(8191),
                BytesFrame::Array(vec![bulk(""), BytesFrame::Integer(7000), bulk("id-a")]),
                BytesFrame::Array(vec![bulk("10.0.0.9"), BytesFrame::Integer(7100)]),
            ]),
            BytesFrame::Array(vec![
                BytesFrame::Integer(8192),
                BytesFrame::Integer(16383),
                BytesFrame::Array(vec![bulk("10.0.0.2"), BytesFrame::Integer(7001)]),
            ]),
        ]);
        let topology = parse_cluster_slots("seed:7000", "seed", &reply).expect("parse");
        assert_eq!(
            topology.nodes(),
            &[
                ClusterNode::new("seed", 7000, 0, 8191),
                ClusterNode::new("10.0.0.2", 7001, 8192, 16383),
            ]
        );
    }
}
