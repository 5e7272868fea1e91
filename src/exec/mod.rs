//! Command Pipeline
//!
//! Executes one command against a leased connection with a deadline,
//! streaming output as it arrives. The synchronous surface collects the
//! stream; interactive sessions forward it chunk by chunk.

mod pipeline;

pub use pipeline::{
    CommandExecution, CommandOutcome, CommandPipeline, ExecOptions, OutputChunk, OutputStream,
    TIMEOUT_EXIT_CODE,
};
