//! Topology discovery, slot routing, and per-node batches.

mod common;

use std::collections::BTreeSet;

use rowslot::mem_node::{MemCluster, MemClusterConfig};
use rowslot::pipeline::{run_batch, NodeConnection};
use rowslot::resp::{error_message, frame_string, Command};
use rowslot::topology::{fetch_topology, SLOT_COUNT};
use rowslot::{hash_slot, ClusterClient, ConnectionConfig, RowSlotError};

use common::*;

#[tokio::test]
async fn topology_covers_every_slot_once() -> anyhow::Result<()> {
    let cluster = MemCluster::start(3).await?;
    let topology = fetch_topology(&cluster.connection()).await?;

    let nodes = topology.nodes();
    assert_eq!(nodes.len(), 3);
    assert_eq!(nodes[0].start_slot, 0);
    assert_eq!(nodes[2].end_slot, SLOT_COUNT - 1);
    for pair in nodes.windows(2) {
        assert_eq!(pair[0].end_slot + 1, pair[1].start_slot);
    }
    let expected = cluster
        .addrs()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    assert_eq!(topology.addrs(), expected);
    Ok(())
}

#[tokio::test]
async fn rows_are_stored_on_the_node_owning_their_slot() -> anyhow::Result<()> {
    let cluster = MemCluster::start(3).await?;
    let engine = engine(table_options(&cluster, "t").with_key_column("id")).await?;
    let ids = (0..60).map(|n| n.to_string()).collect::<Vec<_>>();
    let rows = ids.iter().map(|id| (id.as_str(), "v")).collect::<Vec<_>>();
    engine.insert(&people(&rows)?, false).await?;

    let topology = engine.client().topology();
    let mut seen = BTreeSet::new();
    for (idx, node) in topology.nodes().iter().enumerate() {
        let stored = cluster.node_keys(idx, 0);
        for key in stored.iter().filter(|key| key.starts_with("t:")) {
            assert!(node.owns(hash_slot(key.as_bytes())), "{key} on {node}");
            assert!(seen.insert(key.clone()), "{key} stored twice");
        }
    }
    assert_eq!(seen.len(), 60);
    // 60 spread keys should touch every node.
    for idx in 0..3 {
        assert!(cluster.node_keys(idx, 0).iter().any(|k| k.starts_with("t:")));
    }
    Ok(())
}

#[tokio::test]
async fn misrouted_batches_fail_for_that_node() -> anyhow::Result<()> {
    let cluster = MemCluster::start(2).await?;
    let topology = fetch_topology(&cluster.connection()).await?;
    let key = "misrouted:1";
    let owner = topology.node_for_key(key)?.addr();
    let other = topology
        .addrs()
        .into_iter()
        .find(|addr| addr != &owner)
        .expect("two nodes");

    let err = run_batch(
        &other,
        &cluster.connection(),
        vec![Command::new("SET").arg(key).arg("v")],
        10,
    )
    .await
    .expect_err("wrong node must refuse the key");
    match err {
        RowSlotError::Protocol { node, message } => {
            assert_eq!(node, other);
            assert!(message.starts_with("MOVED"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn hash_tags_keep_related_keys_together() -> anyhow::Result<()> {
    let cluster = MemCluster::start(3).await?;
    let client = client(&cluster).await?;
    let first = client.route("{user42}:profile")?.addr();
    let second = client.route("{user42}:settings")?.addr();
    assert_eq!(first, second);

    let commands = ["{user42}:profile", "{user42}:settings"]
        .iter()
        .map(|key| Command::new("SET").arg(key).arg("x"))
        .collect();
    let replies = client.run_batch(&first, commands).await?;
    assert_eq!(replies.len(), 2);
    Ok(())
}

#[tokio::test]
async fn pipeline_replies_keep_queue_order() -> anyhow::Result<()> {
    let cluster = MemCluster::start_standalone().await?;
    let conn_config = cluster.connection();
    let mut conn = NodeConnection::open(&conn_config.seed_addr(), &conn_config).await?;

    let mut commands = Vec::new();
    for n in 0..25 {
        commands.push(Command::new("SET").arg(format!("k{n}")).arg(format!("v{n}")));
    }
    for n in 0..25 {
        commands.push(Command::new("GET").arg(format!("k{n}")));
    }
    let replies = conn.pipeline_chunked(commands, 7).await?;
    conn.close().await;

    assert_eq!(replies.len(), 50);
    for n in 0..25 {
        assert_eq!(frame_string(&replies[25 + n]), Some(format!("v{n}")));
    }
    Ok(())
}

#[tokio::test]
async fn send_raw_returns_error_replies_in_place() -> anyhow::Result<()> {
    let cluster = MemCluster::start_standalone().await?;
    let conn_config = cluster.connection();
    let mut conn = NodeConnection::open(&conn_config.seed_addr(), &conn_config).await?;
    let replies = conn
        .send_raw(vec![
            Command::new("PING"),
            Command::new("NOSUCHCOMMAND").arg("x"),
            Command::new("PING"),
        ])
        .await?;
    conn.close().await;

    assert_eq!(replies.len(), 3);
    assert!(error_message(&replies[0]).is_none());
    assert!(error_message(&replies[1]).is_some());
    assert_eq!(frame_string(&replies[2]).as_deref(), Some("PONG"));
    Ok(())
}

#[tokio::test]
async fn auth_and_database_selection_apply_to_every_connection() -> anyhow::Result<()> {
    let cluster = MemCluster::start_with(MemClusterConfig {
        nodes: 2,
        auth: Some("s3cret".to_string()),
        ..MemClusterConfig::default()
    })
    .await?;

    let mut connection = cluster.connection();
    connection.db_num = 3;
    let engine = engine(
        table_options(&cluster, "t")
            .with_key_column("id")
            .with_connection(connection.clone()),
    )
    .await?;
    engine
        .insert(&people(&[("1", "a"), ("2", "b")])?, false)
        .await?;

    let in_db3 = cluster.node_keys(0, 3).len() + cluster.node_keys(1, 3).len();
    let in_db0 = cluster.node_keys(0, 0).len() + cluster.node_keys(1, 0).len();
    assert_eq!(in_db3, 3, "two rows plus the schema record");
    assert_eq!(in_db0, 0);

    let wrong = ConnectionConfig {
        auth: Some("nope".to_string()),
        ..connection
    };
    let err = ClusterClient::connect(wrong, 10, 10)
        .await
        .expect_err("bad password");
    assert!(matches!(err, RowSlotError::Protocol { .. }), "{err}");
    Ok(())
}

#[tokio::test]
async fn unreachable_seed_is_an_io_error() -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);

    let connection = ConnectionConfig {
        port,
        timeout: std::time::Duration::from_millis(500),
        ..ConnectionConfig::default()
    };
    let err = fetch_topology(&connection)
        .await
        .expect_err("nothing listens there");
    assert!(matches!(err, RowSlotError::Io(_)), "{err}");
    Ok(())
}
