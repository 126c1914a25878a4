//! SQLite implementations of storage interfaces.

mod replica_store;

pub use replica_store::SqliteReplicaStore;
