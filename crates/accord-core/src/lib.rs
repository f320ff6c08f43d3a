//! Accord Core - Domain types and contracts for identity provisioning

pub mod clock;
pub mod connector;
pub mod error;
pub mod ids;
pub mod models;
pub mod provisioning;
pub mod traits;

pub use clock::*;
pub use connector::*;
pub use error::*;
pub use ids::*;
pub use models::*;
pub use provisioning::*;
pub use traits::*;
