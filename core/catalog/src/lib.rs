//! Record persistence for SkyShard.
//!
//! The [`Catalog`] trait is the only persistence surface the other crates
//! see. Writes are idempotent upserts keyed by id; reads return owned
//! records. Two implementations ship: [`MemoryCatalog`] for tests and dry
//! runs, and [`SqliteCatalog`] for the CLI.

pub mod catalog;
pub mod memory;
pub mod model;
pub mod sqlite;

pub use catalog::Catalog;
pub use memory::MemoryCatalog;
pub use model::{Account, FileQuery};
pub use sqlite::SqliteCatalog;

#[cfg(test)]
pub(crate) mod conformance;
