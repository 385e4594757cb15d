//! Relation engine: the table-level insert and scan operations.
//!
//! One engine serves one logical table session. Its schema moves one way,
//! from unresolved to resolved, and stays cached for the engine's lifetime:
//!
//! ```text
//! Unresolved ─┬─ user schema given ────────────────► Resolved(UserSupplied)
//!             ├─ infer.schema=true ─► sample a row ─► Resolved(Inferred)
//!             ├─ otherwise ─────────► load record ──► Resolved(Loaded)
//!             └─ first insert ──────────────────────► Resolved(Written)
//! ```
//!
//! The engine spawns nothing; every network round-trip is awaited by the
//! caller, one node batch at a time.

use tokio::sync::OnceCell;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::client::ClusterClient;
use crate::codec::{codec_for, ReadSpec, RowCodec};
use crate::config::TableOptions;
use crate::error::{Result, RowSlotError};
use crate::keys::derive_key;
use crate::schema::{Row, RowSet, Schema, SchemaRef};
use crate::schema_store::{infer_schema, load_schema, save_schema};
use crate::topology::{group_by_node, group_keys_by_node};

/// Where the cached schema came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaSource {
    UserSupplied,
    Inferred,
    Loaded,
    /// Taken from this engine's first insert.
    Written,
}

/// Terminal schema state of an engine.
#[derive(Debug, Clone)]
pub struct ResolvedSchema {
    pub schema: SchemaRef,
    pub source: SchemaSource,
}

/// A contiguous share of the table's keys, scanned as one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPartition {
    pub index: usize,
    pub keys: Vec<String>,
}

/// Maps one table onto the cluster.
#[derive(Debug)]
pub struct RelationEngine {
    options: TableOptions,
    client: ClusterClient,
    resolved: OnceCell<ResolvedSchema>,
}

impl RelationEngine {
    /// Validates `options` and discovers topology from the seed node.
    pub async fn connect(options: TableOptions) -> Result<Self> {
        options.validate()?;
        let client = ClusterClient::connect(
            options.connection.clone(),
            options.max_pipeline,
            options.scan_count,
        )
        .await?;
        Self::new(options, client)
    }

    /// Builds an engine over an already-resolved client.
    pub fn new(options: TableOptions, client: ClusterClient) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            client,
            resolved: OnceCell::new(),
        })
    }

    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    pub fn client(&self) -> &ClusterClient {
        &self.client
    }

    /// Effective schema, resolved on first use and cached afterwards.
    pub async fn schema(&self) -> Result<SchemaRef> {
        Ok(self.resolved_schema().await?.schema.clone())
    }

    /// Effective schema together with its source.
    pub async fn resolved_schema(&self) -> Result<&ResolvedSchema> {
        self.resolved.get_or_try_init(|| self.resolve()).await
    }

    async fn resolve(&self) -> Result<ResolvedSchema> {
        if let Some(schema) = &self.options.user_schema {
            return Ok(ResolvedSchema {
                schema: schema.clone(),
                source: SchemaSource::UserSupplied,
            });
        }
        if self.options.infer_schema {
            let pattern = self.options.keys_pattern()?;
            let schema = infer_schema(&self.client, &pattern, self.options.model).await?;
            return Ok(ResolvedSchema {
                schema: schema.into(),
                source: SchemaSource::Inferred,
            });
        }
        let table = self.options.table_name()?;
        let schema = load_schema(&self.client, table).await?;
        Ok(ResolvedSchema {
            schema: schema.into(),
            source: SchemaSource::Loaded,
        })
    }

    /// Writes `rows`, optionally truncating the table first.
    ///
    /// The schema record is refreshed on every call with the schema these
    /// rows were written under, replacing whatever was stored before.
    /// Returns the number of rows stored; under the hash model a row whose
    /// values are all null stores nothing and is not counted.
    pub async fn insert(&self, rows: &RowSet, overwrite: bool) -> Result<u64> {
        let span = info_span!("rowslot_insert", table = %self.label(), rows = rows.len(), overwrite);
        self.insert_inner(rows, overwrite).instrument(span).await
    }

    async fn insert_inner(&self, rows: &RowSet, overwrite: bool) -> Result<u64> {
        let table = self.options.table_name()?;
        let schema = self
            .options
            .user_schema
            .clone()
            .unwrap_or_else(|| rows.schema.clone());
        if schema.len() != rows.schema.len() {
            return Err(RowSlotError::config(format!(
                "rows have {} columns but the declared schema has {}",
                rows.schema.len(),
                schema.len()
            )));
        }

        // Keys and routes are settled before anything is written so a bad
        // row cannot leave a half-truncated table behind.
        let mut keyed = Vec::with_capacity(rows.len());
        for row in &rows.rows {
            let key = derive_key(row, &schema, self.options.key_column.as_deref(), table)?;
            keyed.push((key, row));
        }
        let groups = group_by_node(self.client.topology(), keyed, |(key, _)| key.as_str())?;

        // Rows are encoded up front as well. A hash cannot be empty, so an
        // all-null row yields no commands and is not counted as written.
        let codec = self.codec();
        let mut batches = Vec::with_capacity(groups.len());
        for (addr, group) in groups {
            let mut commands = Vec::with_capacity(group.len() * 2);
            let mut stored = 0u64;
            for (key, row) in &group {
                let row_commands = codec.write_commands(key, row, &schema, self.options.ttl)?;
                if row_commands.is_empty() {
                    warn!(key = %key, "skipping row with no non-null values");
                    continue;
                }
                stored += 1;
                commands.extend(row_commands);
            }
            batches.push((addr, commands, stored));
        }

        let schema = save_schema(&self.client, table, schema).await?;
        let source = if self.options.user_schema.is_some() {
            SchemaSource::UserSupplied
        } else {
            SchemaSource::Written
        };
        // Decision: an engine that already resolved its schema keeps it.
        let _ = self.resolved.set(ResolvedSchema { schema, source });

        if overwrite {
            let pattern = self.options.keys_pattern()?;
            let deleted = self.client.delete_matching(&pattern).await?;
            debug!(pattern = %pattern, deleted, "truncated table before overwrite");
        }

        let mut written = 0u64;
        for (addr, commands, stored) in batches {
            if commands.is_empty() {
                continue;
            }
            self.client.run_batch(&addr, commands).await?;
            debug!(node = %addr, rows = stored, "wrote node batch");
            written += stored;
        }

        info!(written, model = %self.options.model, ttl = self.options.ttl, "insert completed");
        Ok(written)
    }

    /// Enumerates the table's keys and splits them into at most
    /// `partitions.number` contiguous partitions (always at least one).
    pub async fn key_partitions(&self) -> Result<Vec<KeyPartition>> {
        let pattern = self.options.keys_pattern()?;
        let keys = self.client.scan_keys(&pattern).await?;
        Ok(split_partitions(keys, self.options.partitions))
    }

    /// Reads one partition, returning rows restricted to `required_columns`.
    ///
    /// With no required columns every key yields one zero-column row, which
    /// is enough to count rows without touching their values.
    pub async fn scan_partition(
        &self,
        partition: &KeyPartition,
        required_columns: &[String],
    ) -> Result<Vec<Row>> {
        if required_columns.is_empty() {
            return Ok(vec![Row::empty(); partition.keys.len()]);
        }

        let schema = self.schema().await?;
        let full = schema
            .field_names()
            .iter()
            .copied()
            .eq(required_columns.iter().map(String::as_str));
        let read_schema: Schema = if full {
            schema.as_ref().clone()
        } else {
            schema.project(required_columns)?
        };
        let spec = if full {
            ReadSpec::full(&read_schema, self.options.infer_schema)
        } else {
            ReadSpec::columns(&read_schema, self.options.infer_schema)
        };

        let codec = self.codec();
        let mut rows = Vec::with_capacity(partition.keys.len());
        for (addr, keys) in group_keys_by_node(self.client.topology(), partition.keys.clone())? {
            let commands = keys
                .iter()
                .map(|key| codec.read_command(key, &spec))
                .collect::<Vec<_>>();
            let replies = self.client.run_batch(&addr, commands).await?;
            for reply in &replies {
                if let Some(decoded) = codec.decode_reply(&addr, reply, &spec)? {
                    rows.push(decoded.row);
                }
            }
            debug!(node = %addr, keys = keys.len(), partition = partition.index, "read node batch");
        }
        Ok(rows)
    }

    /// Reads the whole table.
    ///
    /// Filters are accepted for interface compatibility but never applied;
    /// see [`RelationEngine::unhandled_filters`]. Row order across nodes is
    /// unspecified.
    pub async fn build_scan<F>(&self, required_columns: &[String], _filters: &[F]) -> Result<Vec<Row>> {
        let span = info_span!("rowslot_scan", table = %self.label(), columns = required_columns.len());
        self.scan_all(required_columns).instrument(span).await
    }

    async fn scan_all(&self, required_columns: &[String]) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for partition in self.key_partitions().await? {
            rows.extend(self.scan_partition(&partition, required_columns).await?);
        }
        info!(rows = rows.len(), "scan completed");
        Ok(rows)
    }

    /// Every filter still needs to be applied by the caller.
    pub fn unhandled_filters<F: Clone>(&self, filters: &[F]) -> Vec<F> {
        filters.to_vec()
    }

    /// Number of keys currently matching the table.
    pub async fn count(&self) -> Result<usize> {
        let pattern = self.options.keys_pattern()?;
        Ok(self.client.scan_keys(&pattern).await?.len())
    }

    fn codec(&self) -> &'static dyn RowCodec {
        codec_for(self.options.model)
    }

    fn label(&self) -> String {
        self.options
            .table_name()
            .map(str::to_string)
            .or_else(|_| self.options.keys_pattern())
            .unwrap_or_default()
    }
}

/// Splits `keys` into `partitions` near-equal contiguous chunks.
pub fn split_partitions(keys: Vec<String>, partitions: usize) -> Vec<KeyPartition> {
    let count = partitions.max(1).min(keys.len().max(1));
    let chunk = keys.len().div_ceil(count).max(1);
    let mut out = Vec::with_capacity(count);
    let mut pending = keys.into_iter().peekable();
    while pending.peek().is_some() {
        out.push(KeyPartition {
            index: out.len(),
            keys: pending.by_ref().take(chunk).collect(),
        });
    }
    if out.is_empty() {
        out.push(KeyPartition {
            index: 0,
            keys: Vec::new(),
        });
    }
    out
}
