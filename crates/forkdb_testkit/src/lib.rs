//! # forkdb Testkit
//!
//! Test utilities for forkdb.
//!
//! This crate provides:
//! - Document builders and application-style writes (`write_local`)
//! - Paired in-memory storages for master/fork setups
//! - `CountingStorage`, a wrapper counting bulk writes and injecting failures
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use forkdb_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_storages() {
//!     let (master, fork) = paired_storages();
//!     write_local(fork.as_ref(), "a", json!({"n": 1})).await.unwrap();
//!     // ... replicate and assert
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
