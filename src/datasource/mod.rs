//! External data sources.

pub mod http;
pub mod template;

pub use http::{HttpAuth, HttpSourceConfig, HttpTableSource};
