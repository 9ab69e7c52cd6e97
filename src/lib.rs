pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod k8s;
pub mod sink;

pub use error::{Phase, Result, SniffError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
