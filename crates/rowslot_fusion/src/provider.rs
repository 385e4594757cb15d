//! DataFusion table provider backed by a rowslot relation engine.
//!
//! Scans materialize the requested columns into one in-memory batch and hand
//! it to [`MemTable`]; no filter is pushed into the store, so DataFusion
//! applies every predicate after the scan. Inserts stream through a
//! [`DataSink`] that converts batches back into rows.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::catalog::memory::MemTable;
use datafusion::catalog::{Session, TableProvider};
use datafusion::common::{not_impl_err, DataFusionError, Result as DFResult, SchemaExt};
use datafusion::datasource::sink::{DataSink, DataSinkExec};
use datafusion::execution::TaskContext;
use datafusion::logical_expr::dml::InsertOp;
use datafusion::logical_expr::{Expr, TableProviderFilterPushDown, TableType};
use datafusion::physical_plan::display::{DisplayAs, DisplayFormatType};
use datafusion::physical_plan::{ExecutionPlan, SendableRecordBatchStream};
use futures_util::StreamExt;
use rowslot::{RelationEngine, RowSet, SchemaRef as RowSlotSchemaRef};
use tracing::debug;

use crate::convert::{arrow_schema, batch_to_rows, rows_to_batch};

/// Exposes one rowslot table to DataFusion.
#[derive(Debug, Clone)]
pub struct RowSlotTableProvider {
    engine: Arc<RelationEngine>,
    table_schema: RowSlotSchemaRef,
    schema: SchemaRef,
}

impl RowSlotTableProvider {
    /// Resolves the engine's schema once and keeps its Arrow rendering.
    pub async fn try_new(engine: RelationEngine) -> anyhow::Result<Self> {
        let table_schema = engine.schema().await.context("resolve table schema")?;
        Ok(Self {
            schema: arrow_schema(&table_schema),
            table_schema,
            engine: Arc::new(engine),
        })
    }

    pub fn engine(&self) -> &RelationEngine {
        &self.engine
    }

    fn label(&self) -> String {
        self.engine
            .options()
            .table_name()
            .map(str::to_string)
            .or_else(|_| self.engine.options().keys_pattern())
            .unwrap_or_default()
    }

    async fn write_batches(&self, batches: &[RecordBatch], overwrite: bool) -> anyhow::Result<u64> {
        let mut rows = Vec::new();
        for batch in batches {
            rows.extend(batch_to_rows(batch, &self.table_schema)?);
        }
        let rows = RowSet::try_new(self.table_schema.clone(), rows)?;
        Ok(self.engine.insert(&rows, overwrite).await?)
    }
}

#[async_trait]
impl TableProvider for RowSlotTableProvider {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    async fn scan(
        &self,
        state: &dyn Session,
        projection: Option<&Vec<usize>>,
        filters: &[Expr],
        limit: Option<usize>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        let projected = match projection {
            Some(indices) => Arc::new(self.schema.project(indices)?),
            None => self.schema(),
        };
        let required = projected
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect::<Vec<_>>();
        debug!(
            table = %self.label(),
            columns = required.len(),
            filters = filters.len(),
            limit = ?limit,
            "starting rowslot table scan"
        );

        let rows = self
            .engine
            .build_scan(&required, filters)
            .await
            .map_err(|err| df_external(err.into()))?;
        let batch = rows_to_batch(projected.clone(), &rows).map_err(df_external)?;
        let mem = MemTable::try_new(projected, vec![vec![batch]])?;
        mem.scan(state, None, &[], limit).await
    }

    async fn insert_into(
        &self,
        _state: &dyn Session,
        input: Arc<dyn ExecutionPlan>,
        insert_op: InsertOp,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        self.schema()
            .logically_equivalent_names_and_types(&input.schema())?;
        let overwrite = match insert_op {
            InsertOp::Append => false,
            InsertOp::Overwrite => true,
            other => return not_impl_err!("{other} is not implemented for RowSlotTableProvider"),
        };

        let sink = RowSlotInsertSink::new(Arc::new(self.clone()), overwrite);
        Ok(Arc::new(DataSinkExec::new(input, Arc::new(sink), None)))
    }

    fn supports_filters_pushdown(
        &self,
        filters: &[&Expr],
    ) -> DFResult<Vec<TableProviderFilterPushDown>> {
        Ok(self
            .engine
            .unhandled_filters(filters)
            .iter()
            .map(|_| TableProviderFilterPushDown::Unsupported)
            .collect())
    }
}

#[derive(Debug)]
struct RowSlotInsertSink {
    provider: Arc<RowSlotTableProvider>,
    schema: SchemaRef,
    overwrite: bool,
}

impl RowSlotInsertSink {
    fn new(provider: Arc<RowSlotTableProvider>, overwrite: bool) -> Self {
        Self {
            schema: provider.schema(),
            provider,
            overwrite,
        }
    }
}

impl DisplayAs for RowSlotInsertSink {
    fn fmt_as(&self, t: DisplayFormatType, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match t {
            DisplayFormatType::Default | DisplayFormatType::Verbose => write!(
                f,
                "RowSlotInsertSink(table={}, overwrite={})",
                self.provider.label(),
                self.overwrite
            ),
            DisplayFormatType::TreeRender => write!(f, ""),
        }
    }
}

#[async_trait]
impl DataSink for RowSlotInsertSink {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    async fn write_all(
        &self,
        mut data: SendableRecordBatchStream,
        _context: &Arc<TaskContext>,
    ) -> DFResult<u64> {
        let mut batches = Vec::new();
        while let Some(batch) = data.next().await.transpose()? {
            self.schema
                .logically_equivalent_names_and_types(&batch.schema())?;
            batches.push(batch);
        }

        // Overwrite truncates even when the input is empty.
        self.provider
            .write_batches(&batches, self.overwrite)
            .await
            .map_err(df_external)
    }
}

fn df_external(err: anyhow::Error) -> DataFusionError {
    DataFusionError::Execution(err.to_string())
}
