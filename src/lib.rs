#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

/// Time and size bounded grouping of work items
pub mod batcher;
/// Configuration for this library
pub mod config;
/// Error types returned by this library.
pub mod error;
/// Worker pools for delayed tasks and outbound attempts
pub mod executor;
/// Outbound operations with classified-error retry
pub mod request;
