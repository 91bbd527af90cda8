//! `PostgreSQL` checkpoint store for lambda stages.
//!
//! This crate provides [`PostgresCheckpointStore`], the production
//! implementation of the `CheckpointStore` trait from `lambdas-core`. It uses
//! sqlx with a connection pool and supports:
//!
//! - Monotonic saves (a lower offset never overwrites a higher one)
//! - Idempotent replays (an equal offset overwrites)
//! - Embedded migrations
//!
//! # Example
//!
//! ```ignore
//! use lambdas_postgres::PostgresCheckpointStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresCheckpointStore::connect("postgres://localhost/lambdas", 10).await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint_store;

pub use checkpoint_store::PostgresCheckpointStore;
