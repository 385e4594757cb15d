//! Row-oriented tables on top of a hash-slot partitioned key-value cluster.
//!
//! Each row of a table is stored under its own key (`<table>:<id>`), either
//! as a field map (hash model) or as one serialized blob (binary model).
//! The table's schema is persisted next to the data so later sessions can
//! read it back without declaring it again.
//!
//! The entry point is [`RelationEngine`]; everything below it is usable on
//! its own for tools that only need slot routing or pipelined batches.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod keys;
pub mod mem_node;
pub mod pipeline;
pub mod relation;
pub mod resp;
pub mod schema;
pub mod schema_store;
pub mod topology;

pub use client::ClusterClient;
pub use config::{ConnectionConfig, EncodingModel, TableOptions};
pub use error::{Result, RowSlotError};
pub use relation::{KeyPartition, RelationEngine, ResolvedSchema, SchemaSource};
pub use schema::{DataType, Field, Row, RowSet, Schema, SchemaRef, Value};
pub use topology::{hash_slot, ClusterNode, ClusterTopology};
