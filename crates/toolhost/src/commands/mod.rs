//! Command handlers for the toolhost CLI.

pub mod logging;
pub mod serve;
pub mod tools;

pub use logging::*;
pub use serve::*;
pub use tools::*;
