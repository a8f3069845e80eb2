// Storage layer: ProcessStore trait with in-memory and Postgres backends

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::InMemoryProcessStore;
pub use models::*;
pub use postgres::PostgresProcessStore;
pub use store::{ProcessStore, SettingsUpdate, StoreError};
