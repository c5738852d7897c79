//! ODR Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the ODR publishing pipeline.
//!
//! # Overview
//!
//! - **Error Handling**: [`OdrError`] and the crate [`Result`] alias
//! - **Logging**: `tracing` subscriber setup shared by every worker binary
//! - **Record tree**: typed view of the nested dataset records returned by the
//!   producer API, with a generic depth-first search
//!
//! # Example
//!
//! ```no_run
//! use odr_common::record::{find_value, RecordNode};
//!
//! fn mineral_name(raw: &serde_json::Value) -> odr_common::Result<Option<String>> {
//!     let record = RecordNode::from_value(raw)?;
//!     Ok(find_value("a1b2c3d", &record))
//! }
//! ```

pub mod error;
pub mod logging;
pub mod record;

// Re-export commonly used types
pub use error::{OdrError, Result};
