//! Repository implementations for PostgreSQL

pub mod connector;
pub mod task;

pub use connector::*;
pub use task::*;

use accord_core::AccordError;

pub(crate) fn db_error(e: sqlx::Error) -> AccordError {
    AccordError::database_error(e.to_string())
}
