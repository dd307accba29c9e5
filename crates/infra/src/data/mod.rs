//! Data Snapshot Reader implementations.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryDataSource;
pub use postgres::PostgresDataSource;
