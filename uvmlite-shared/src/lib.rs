//! Types shared between the uvmlite library and its tools.

pub mod constants;
pub mod errors;

pub use errors::{UvmError, UvmResult};
