//! Command-line access to rowslot tables.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rowslot::config::{self, env_options};
use rowslot::mem_node::{MemCluster, MemClusterConfig};
use rowslot::{DataType, Field, RelationEngine, Row, RowSet, Schema, TableOptions, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rowslot")]
#[command(about = "Row-oriented tables over a hash-slot key-value cluster", long_about = None)]
struct Cli {
    #[command(flatten)]
    table: TableArgs,
    #[command(subcommand)]
    command: Command,
}

/// Table options; anything left unset falls back to `ROWSLOT_*` variables.
#[derive(Args)]
struct TableArgs {
    /// Table name; keys are `<table>:<id>`.
    #[arg(long, global = true)]
    table: Option<String>,
    /// Key glob for reading arbitrary existing keys.
    #[arg(long, global = true)]
    keys_pattern: Option<String>,
    /// Column whose value becomes the key id.
    #[arg(long, global = true)]
    key_column: Option<String>,
    #[arg(long, global = true)]
    partitions: Option<usize>,
    /// Infer the schema from a sample row instead of loading it.
    #[arg(long, global = true)]
    infer_schema: bool,
    /// `hash` or `binary`.
    #[arg(long, global = true)]
    model: Option<String>,
    /// Expiry in seconds for written keys.
    #[arg(long, global = true)]
    ttl: Option<u64>,
    #[arg(long, global = true)]
    host: Option<String>,
    #[arg(long, global = true)]
    port: Option<u16>,
    #[arg(long, global = true)]
    auth: Option<String>,
    #[arg(long, global = true)]
    db_num: Option<u32>,
    /// Connect and round-trip timeout in milliseconds.
    #[arg(long, global = true)]
    timeout: Option<u64>,
    #[arg(long, global = true)]
    scan_count: Option<usize>,
    #[arg(long, global = true)]
    max_pipeline_size: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective schema as JSON.
    Schema,
    /// Print rows as JSON lines.
    Scan {
        /// Comma-separated columns to read; all columns when omitted.
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,
    },
    /// Print the number of keys in the table.
    Count,
    /// Insert JSON objects read line by line from stdin.
    Load {
        /// Delete every existing row of the table first.
        #[arg(long, default_value_t = false)]
        overwrite: bool,
        /// JSON schema file; inferred from the first object when omitted.
        #[arg(long)]
        schema: Option<PathBuf>,
    },
    /// Run an in-memory cluster until Ctrl-C.
    MemCluster {
        #[arg(long, default_value_t = 3)]
        nodes: usize,
        #[arg(long, default_value_t = 7000)]
        base_port: u16,
        /// Password clients must AUTH with.
        #[arg(long)]
        password: Option<String>,
        /// Run a single node with cluster support disabled.
        #[arg(long, default_value_t = false)]
        standalone: bool,
    },
}

impl TableArgs {
    fn into_options(self) -> anyhow::Result<TableOptions> {
        let mut options = env_options();
        let mut put = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                options.insert(name.to_string(), value);
            }
        };
        put(config::OPT_TABLE, self.table);
        put(config::OPT_KEYS_PATTERN, self.keys_pattern);
        put(config::OPT_KEY_COLUMN, self.key_column);
        put(config::OPT_PARTITIONS, self.partitions.map(|v| v.to_string()));
        put(
            config::OPT_INFER_SCHEMA,
            self.infer_schema.then(|| "true".to_string()),
        );
        put(config::OPT_MODEL, self.model);
        put(config::OPT_TTL, self.ttl.map(|v| v.to_string()));
        put(config::OPT_HOST, self.host);
        put(config::OPT_PORT, self.port.map(|v| v.to_string()));
        put(config::OPT_AUTH, self.auth);
        put(config::OPT_DB_NUM, self.db_num.map(|v| v.to_string()));
        put(config::OPT_TIMEOUT, self.timeout.map(|v| v.to_string()));
        put(config::OPT_SCAN_COUNT, self.scan_count.map(|v| v.to_string()));
        put(
            config::OPT_MAX_PIPELINE,
            self.max_pipeline_size.map(|v| v.to_string()),
        );
        Ok(TableOptions::from_options(&options)?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rowslot=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::MemCluster {
            nodes,
            base_port,
            password,
            standalone,
        } => run_mem_cluster(nodes, base_port, password, standalone).await,
        command => {
            let options = cli.table.into_options()?;
            run_table_command(options, command).await
        }
    }
}

async fn run_table_command(mut options: TableOptions, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Schema => {
            let engine = RelationEngine::connect(options).await?;
            let schema = engine.schema().await?;
            println!("{}", serde_json::to_string_pretty(schema.as_ref())?);
        }
        Command::Scan { columns } => {
            let engine = RelationEngine::connect(options).await?;
            let schema = engine.schema().await?;
            let columns = if columns.is_empty() {
                schema
                    .field_names()
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            } else {
                columns
            };
            let rows = engine.build_scan::<()>(&columns, &[]).await?;
            for row in rows {
                println!("{}", row_to_json(&columns, &row));
            }
        }
        Command::Count => {
            let engine = RelationEngine::connect(options).await?;
            println!("{}", engine.count().await?);
        }
        Command::Load { overwrite, schema } => {
            let objects = read_stdin_objects().await?;
            let schema = match schema {
                Some(path) => {
                    let raw = tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("read schema file {}", path.display()))?;
                    let schema: Schema = serde_json::from_slice(&raw)
                        .with_context(|| format!("parse schema file {}", path.display()))?;
                    let schema = Arc::new(schema);
                    options = options.with_schema(schema.clone());
                    schema
                }
                None => {
                    let first = objects
                        .first()
                        .context("no input rows and no --schema to write")?;
                    Arc::new(schema_from_json(first))
                }
            };
            let rows = objects
                .iter()
                .map(|object| json_to_row(&schema, object))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let rows = RowSet::try_new(schema, rows)?;
            let engine = RelationEngine::connect(options).await?;
            let written = engine.insert(&rows, overwrite).await?;
            println!("{written}");
        }
        Command::MemCluster { .. } => anyhow::bail!("mem-cluster takes no table options"),
    }
    Ok(())
}

async fn run_mem_cluster(
    nodes: usize,
    base_port: u16,
    password: Option<String>,
    standalone: bool,
) -> anyhow::Result<()> {
    let cluster = MemCluster::start_with(MemClusterConfig {
        nodes: if standalone { 1 } else { nodes },
        cluster_mode: !standalone,
        auth: password,
        base_port,
    })
    .await?;
    for addr in cluster.addrs() {
        tracing::info!(%addr, "mem node listening");
    }
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down mem cluster");
    drop(cluster);
    Ok(())
}

type JsonObject = serde_json::Map<String, serde_json::Value>;

async fn read_stdin_objects() -> anyhow::Result<Vec<JsonObject>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut objects = Vec::new();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value =
            serde_json::from_str(&line).with_context(|| format!("line {line_no}: invalid JSON"))?;
        let serde_json::Value::Object(object) = value else {
            anyhow::bail!("line {line_no}: expected a JSON object");
        };
        objects.push(object);
    }
    Ok(objects)
}

/// Column types from the JSON kinds of one object; nulls become text.
fn schema_from_json(object: &JsonObject) -> Schema {
    Schema::new(
        object
            .iter()
            .map(|(name, value)| {
                let data_type = match value {
                    serde_json::Value::Bool(_) => DataType::Boolean,
                    serde_json::Value::Number(n) if n.is_i64() => DataType::Int64,
                    serde_json::Value::Number(_) => DataType::Float64,
                    _ => DataType::Utf8,
                };
                Field::new(name.clone(), data_type)
            })
            .collect(),
    )
}

fn json_to_row(schema: &Schema, object: &JsonObject) -> anyhow::Result<Row> {
    let mut values = Vec::with_capacity(schema.len());
    for field in schema.fields() {
        let value = match object.get(&field.name) {
            None | Some(serde_json::Value::Null) => Value::Null,
            Some(serde_json::Value::String(text)) => Value::parse_as(text, field.data_type)
                .with_context(|| format!("'{text}' is not a valid {}", field.data_type))?,
            Some(other) => Value::parse_as(&other.to_string(), field.data_type).with_context(
                || format!("{other} is not a valid {} for '{}'", field.data_type, field.name),
            )?,
        };
        values.push(value);
    }
    Ok(Row::new(values))
}

fn row_to_json(columns: &[String], row: &Row) -> serde_json::Value {
    let object = columns
        .iter()
        .zip(row.values())
        .map(|(name, value)| {
            let json = match value {
                Value::Null => serde_json::Value::Null,
                Value::Int32(v) => (*v).into(),
                Value::Int64(v) => (*v).into(),
                Value::Float32(v) => serde_json::Value::from(f64::from(*v)),
                Value::Float64(v) => serde_json::Value::from(*v),
                Value::Boolean(v) => (*v).into(),
                Value::Utf8(v) => v.clone().into(),
            };
            (name.clone(), json)
        })
        .collect::<JsonObject>();
    serde_json::Value::Object(object)
}
