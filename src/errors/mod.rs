//! Centralized error handling for the EPG linker
//!
//! Every layer of the ingestion pipeline reports failures through the types
//! in [`types`]. The split mirrors where a failure originates:
//!
//! - **Source Errors**: talking to a provider, validating and parsing what it sent
//! - **Storage Errors**: SQLite operations, migrations, aborted batch writes
//!
//! # Usage
//!
//! ```rust
//! use epg_linker::errors::{AppError, AppResult};
//!
//! fn example_function() -> AppResult<String> {
//!     Ok("success".to_string())
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for Source Results
pub type SourceResult<T> = Result<T, SourceError>;

/// Convenience type alias for Storage Results
pub type StorageResult<T> = Result<T, StorageError>;
