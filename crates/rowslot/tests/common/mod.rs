#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use redis_protocol::resp2::types::BytesFrame;
use rowslot::mem_node::MemCluster;
use rowslot::resp::{frame_integer, frame_string, Command};
use rowslot::{
    ClusterClient, DataType, Field, RelationEngine, Row, RowSet, Schema, SchemaRef, TableOptions,
    Value,
};

/// Options for table `name` pointed at `cluster`.
pub fn table_options(cluster: &MemCluster, name: &str) -> TableOptions {
    TableOptions::for_table(name).with_connection(cluster.connection())
}

pub async fn engine(options: TableOptions) -> anyhow::Result<RelationEngine> {
    RelationEngine::connect(options)
        .await
        .context("connect relation engine")
}

pub async fn client(cluster: &MemCluster) -> anyhow::Result<ClusterClient> {
    ClusterClient::connect(cluster.connection(), 100, 100)
        .await
        .context("connect cluster client")
}

/// `id` and `name` text columns.
pub fn people_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8),
        Field::new("name", DataType::Utf8),
    ]))
}

pub fn people(rows: &[(&str, &str)]) -> anyhow::Result<RowSet> {
    let rows = rows
        .iter()
        .map(|(id, name)| {
            Row::new(vec![
                Value::Utf8((*id).to_string()),
                Value::Utf8((*name).to_string()),
            ])
        })
        .collect();
    Ok(RowSet::try_new(people_schema(), rows)?)
}

/// One column of every supported type plus a text key column.
pub fn typed_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8),
        Field::new("small", DataType::Int32),
        Field::new("big", DataType::Int64),
        Field::new("ratio", DataType::Float32),
        Field::new("score", DataType::Float64),
        Field::new("active", DataType::Boolean),
    ]))
}

pub fn typed_row(id: &str, n: i32) -> Row {
    Row::new(vec![
        Value::Utf8(id.to_string()),
        Value::Int32(n),
        Value::Int64(i64::from(n) * 1_000_000_000),
        Value::Float32(n as f32 + 0.5),
        Value::Float64(n as f64 / 4.0),
        Value::Boolean(n % 2 == 0),
    ])
}

/// Runs one command on whichever node owns `key`.
pub async fn raw(client: &ClusterClient, key: &str, command: Command) -> anyhow::Result<BytesFrame> {
    client
        .run_for_key(key, command)
        .await
        .with_context(|| format!("raw command for {key}"))
}

pub async fn hgetall(client: &ClusterClient, key: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let reply = raw(client, key, Command::new("HGETALL").arg(key)).await?;
    let BytesFrame::Array(items) = reply else {
        anyhow::bail!("HGETALL {key} returned {reply:?}");
    };
    let mut out = BTreeMap::new();
    for pair in items.chunks(2) {
        let name = frame_string(&pair[0]).context("field name")?;
        let value = frame_string(&pair[1]).context("field value")?;
        out.insert(name, value);
    }
    Ok(out)
}

pub async fn ttl(client: &ClusterClient, key: &str) -> anyhow::Result<i64> {
    let reply = raw(client, key, Command::new("TTL").arg(key)).await?;
    frame_integer(&reply).with_context(|| format!("TTL {key} returned {reply:?}"))
}

/// Sorted keys matching `pattern` across the whole cluster.
pub async fn keys(client: &ClusterClient, pattern: &str) -> anyhow::Result<Vec<String>> {
    let mut keys = client.scan_keys(pattern).await?;
    keys.sort();
    Ok(keys)
}

/// Rows sorted by their display form, for order-insensitive comparisons.
pub fn sorted(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort_by_key(|row| {
        row.values()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
    });
    rows
}

pub fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| (*name).to_string()).collect()
}
