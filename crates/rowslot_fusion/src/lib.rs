//! SQL access to rowslot tables through DataFusion.

pub mod convert;
pub mod provider;

use std::sync::Arc;

use anyhow::Context;
use datafusion::catalog::TableProvider;
use datafusion::prelude::SessionContext;
use rowslot::RelationEngine;
use tracing::info;

pub use provider::RowSlotTableProvider;

/// Registers `engine`'s table under `name` and returns the provider.
pub async fn register_table(
    ctx: &SessionContext,
    name: &str,
    engine: RelationEngine,
) -> anyhow::Result<Arc<RowSlotTableProvider>> {
    let provider = Arc::new(RowSlotTableProvider::try_new(engine).await?);
    ctx.register_table(name, provider.clone())
        .with_context(|| format!("register table '{name}'"))?;
    info!(table = name, fields = provider.schema().fields().len(), "registered rowslot table");
    Ok(provider)
}
