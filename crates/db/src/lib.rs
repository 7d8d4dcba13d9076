pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;
pub mod warehouse;

pub use connection::{
    connect, connect_read_only, connect_warehouse_writer, connect_with_settings, DbPool,
};
pub use fixtures::{DemoWarehouseDataset, SeedResult, TableSeedInfo, VerificationResult};
pub use repositories::{
    InMemoryArtifactStore, InMemorySessionStore, RepositoryError, SqlArtifactStore,
    SqlSessionStore,
};
pub use warehouse::SqliteWarehouse;
