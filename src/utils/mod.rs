//! Small helpers shared by the fetcher and the storage layer

pub mod decompression;
pub mod sqlite;
pub mod url;

pub use decompression::{CompressionFormat, DecompressionService};
pub use sqlite::SqliteRowExt;
pub use url::UrlUtils;
