//! Call correlation with the worker process.
//!
//! Assigns identifiers to outgoing calls, tracks outstanding calls and routes
//! the worker's records back to whoever is waiting, including token streams.

mod correlator;
mod pending;
mod stream;
mod types;

pub use correlator::Correlator;
pub use stream::StreamingCall;
pub use types::{RpcError, StreamEvent, WorkerRequest};
