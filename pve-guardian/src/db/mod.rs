pub mod connection;
pub mod migrate;

pub use connection::{create_pool, DbPool};
