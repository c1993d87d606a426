//! In-process table store for ydborm.
//!
//! `ydborm-memory` implements [`ydborm_core::Driver`] over tables held in
//! memory. It executes the exact statement text `ydborm-query` compiles
//! (the `DECLARE` header, parameterized `SELECT`, `COUNT`, `INSERT`,
//! `UPSERT` and `DELETE`) and models a single transaction per connection
//! whose rollback undoes only that connection's own writes.
//!
//! It is used by the test suites and is handy for examples that should run
//! without a YDB endpoint.
//!
//! # Example
//!
//! ```ignore
//! let driver = MemoryDriver::new();
//! driver.create_table_for::<Hero>();
//!
//! let mut session = Session::new(driver.clone());
//! session.add(&cx, Hero::new(1, "Deadpond")).await?;
//! assert_eq!(driver.table_rows("heroes").len(), 1);
//! ```

pub mod connection;
mod statement;

pub use connection::{Database, MemoryDriver};
