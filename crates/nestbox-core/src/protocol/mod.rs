//! Host/agent execution protocol.
//!
//! The host writes one [`ExecutionInput`] document to the agent's stdin and
//! closes it. The agent answers on stdout with zero or more delimited blocks,
//! extracted incrementally by [`OutputParser`]. Follow-up turns travel through
//! the continuation directory as [`ContinuationMessage`] files.

mod parser;
mod types;

pub use parser::OutputParser;
pub use types::*;
