//! JSON-RPC 2.0 over newline-delimited stdio.
//!
//! This module frames the worker's stdout into records and classifies each
//! record by what it means for call correlation: token, completion, plain
//! response, or a request originating from the worker.

mod classify;
mod framer;
mod types;

pub use classify::classify;
pub use framer::{DEFAULT_MAX_LINE_BYTES, DELIMITER, Frame, Frames, LineFramer};
pub use types::*;
