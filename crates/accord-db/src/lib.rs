//! Storage layer for Accord
//!
//! In-memory stores back tests and single-process development; the
//! PostgreSQL repositories are the production stores. Connector credentials
//! are sealed with [`CredentialCipher`] before they are written.

pub mod crypto;
pub mod memory;
pub mod pool;
pub mod repositories;
pub mod schema;


pub use crypto::CredentialCipher;
pub use memory::{InMemoryConfigStore, InMemoryTaskStore};
pub use pool::{create_pool, DatabaseConfig};
pub use repositories::*;
pub use schema::apply_schema;
