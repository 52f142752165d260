//! Directory-service boundary: temporary account and group management.

mod config;
mod http;
mod traits;

pub use config::DirectoryConfig;
pub use http::HttpDirectoryClient;
pub use traits::{DirectoryClient, DirectoryError};
