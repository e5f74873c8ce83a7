//! Configuration schema and storage

mod schema;
mod store;

pub use schema::*;
pub use store::ConfigStore;
