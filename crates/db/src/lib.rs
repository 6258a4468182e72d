//! `db` crate — pure persistence layer.
//!
//! Provides a connection pool, typed row structs, repository functions for
//! every table in the dagflow schema, and the [`Store`] trait with its
//! Postgres and in-memory implementations. No business logic lives here.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use pool::{DbPool, PoolConfig};
pub use postgres::PgStore;
pub use store::{Lease, Store};
