pub mod error;
pub mod path;

pub use error::{SourceError, SourceResult};
pub use path::{normalize_path, normalize_query_path};
