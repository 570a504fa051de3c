pub mod document;
pub mod error;

pub use document::{Document, DocumentExt, compare_values, into_document, values_equal};
pub use error::{Result, RunnerError};
