//! Common test infrastructure
//!
//! Every test gets its own SQLite datastore in a temporary directory.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestDatastore, PROMOTION_1_ID};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let db = TestDatastore::new();
//!     db.add_promotion(PROMOTION_1_ID, "UFC");
//! }
//! ```

mod constants;
mod fixtures;

// Public API - this is what tests import
pub use constants::*;
pub use fixtures::{days_ago, job_definitions, TestDatastore};
