//! Storage backends.
//!
//! - [`traits`]: the three store contracts ([`RelationalSource`](traits::RelationalSource),
//!   [`DocumentStore`](traits::DocumentStore), [`CacheStore`](traits::CacheStore))
//! - [`memory`]: DashMap-backed implementations of all three
//! - [`postgres`]: Postgres relational source
//! - [`sql`]: SQL-backed document store (SQLite / MySQL / Postgres via sqlx `Any`)
//! - [`redis`]: Redis cache store

pub mod traits;
pub mod memory;
pub mod postgres;
pub mod sql;
pub mod redis;
