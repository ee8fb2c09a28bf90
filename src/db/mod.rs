pub mod pool;
pub mod schema;

pub use pool::{DbHandle, PoolManager};
pub use schema::{Column, ForeignKey, SchemaCache, TableIndex, TableSchema};
