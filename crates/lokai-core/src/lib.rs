//! Lokai Core Library
//!
//! Shared functionality for the Lokai bridge:
//! - Newline-delimited JSON-RPC framing for the worker's stdio protocol
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod jsonrpc;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
