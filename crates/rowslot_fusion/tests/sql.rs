//! SQL round trips through the DataFusion provider.
//!
//! Test flow:
//! 1) Start an in-memory cluster and register a rowslot table.
//! 2) Insert rows with SQL, then query them back.
//!
//! Verification:
//! - Filters and projections evaluate over scanned rows.
//! - `INSERT OVERWRITE` truncates before writing.

use std::sync::Arc;

use anyhow::Context;
use datafusion::arrow::array::{Array, AsArray, RecordBatch};
use datafusion::arrow::datatypes::Int64Type;
use datafusion::prelude::SessionContext;
use rowslot::mem_node::MemCluster;
use rowslot::{DataType, Field, RelationEngine, Schema, TableOptions};
use rowslot_fusion::register_table;

fn people_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8),
        Field::new("name", DataType::Utf8),
        Field::new("age", DataType::Int64),
    ]))
}

async fn people_table(cluster: &MemCluster, ctx: &SessionContext) -> anyhow::Result<()> {
    let engine = RelationEngine::connect(
        TableOptions::for_table("people")
            .with_connection(cluster.connection())
            .with_key_column("id")
            .with_schema(people_schema()),
    )
    .await?;
    register_table(ctx, "people", engine).await?;
    Ok(())
}

async fn query(ctx: &SessionContext, sql: &str) -> anyhow::Result<Vec<RecordBatch>> {
    ctx.sql(sql)
        .await
        .with_context(|| format!("plan {sql}"))?
        .collect()
        .await
        .with_context(|| format!("run {sql}"))
}

async fn count(ctx: &SessionContext, sql: &str) -> anyhow::Result<i64> {
    let batches = query(ctx, sql).await?;
    let batch = batches.first().context("count returned no batch")?;
    Ok(batch.column(0).as_primitive::<Int64Type>().value(0))
}

fn strings(batches: &[RecordBatch]) -> Vec<String> {
    let mut out = batches
        .iter()
        .flat_map(|batch| {
            let column = batch.column(0).as_string::<i32>();
            (0..column.len())
                .map(|idx| column.value(idx).to_string())
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    out.sort();
    out
}

#[tokio::test]
async fn insert_then_filter_and_project() -> anyhow::Result<()> {
    let cluster = MemCluster::start(3).await?;
    let ctx = SessionContext::new();
    people_table(&cluster, &ctx).await?;

    query(
        &ctx,
        "INSERT INTO people VALUES ('1', 'ada', 36), ('2', 'bob', 41), ('3', 'cy', 52)",
    )
    .await?;

    let names = query(&ctx, "SELECT name FROM people WHERE age > 40").await?;
    assert_eq!(strings(&names), vec!["bob", "cy"]);
    assert_eq!(count(&ctx, "SELECT count(*) FROM people").await?, 3);
    assert_eq!(count(&ctx, "SELECT sum(age) FROM people").await?, 129);
    Ok(())
}

#[tokio::test]
async fn insert_overwrite_replaces_rows() -> anyhow::Result<()> {
    let cluster = MemCluster::start(2).await?;
    let ctx = SessionContext::new();
    people_table(&cluster, &ctx).await?;

    query(&ctx, "INSERT INTO people VALUES ('1', 'ada', 36), ('2', 'bob', 41)").await?;
    query(&ctx, "INSERT OVERWRITE TABLE people VALUES ('9', 'zed', 20)").await?;

    let names = query(&ctx, "SELECT name FROM people").await?;
    assert_eq!(strings(&names), vec!["zed"]);
    Ok(())
}

#[tokio::test]
async fn rows_written_outside_sql_are_visible() -> anyhow::Result<()> {
    let cluster = MemCluster::start(1).await?;
    let writer = RelationEngine::connect(
        TableOptions::for_table("people")
            .with_connection(cluster.connection())
            .with_key_column("id"),
    )
    .await?;
    let rows = rowslot::RowSet::try_new(
        people_schema(),
        vec![rowslot::Row::new(vec![
            rowslot::Value::Utf8("5".into()),
            rowslot::Value::Utf8("eve".into()),
            rowslot::Value::Int64(29),
        ])],
    )?;
    writer.insert(&rows, false).await?;

    // No declared schema: the provider loads the one the writer stored.
    let ctx = SessionContext::new();
    let reader = RelationEngine::connect(
        TableOptions::for_table("people").with_connection(cluster.connection()),
    )
    .await?;
    register_table(&ctx, "people", reader).await?;
    let names = query(&ctx, "SELECT name FROM people WHERE id = '5'").await?;
    assert_eq!(strings(&names), vec!["eve"]);
    Ok(())
}

#[tokio::test]
async fn registering_an_unknown_table_fails() -> anyhow::Result<()> {
    let cluster = MemCluster::start(1).await?;
    let ctx = SessionContext::new();
    let engine = RelationEngine::connect(
        TableOptions::for_table("nowhere").with_connection(cluster.connection()),
    )
    .await?;
    let err = register_table(&ctx, "nowhere", engine)
        .await
        .expect_err("no schema stored for the table");
    assert!(format!("{err:#}").contains("nowhere"), "{err:#}");
    Ok(())
}
