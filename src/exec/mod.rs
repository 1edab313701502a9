//! Command execution inside containers

mod manager;
mod output;

pub use manager::{ExecManager, ExecSubmission};
pub use output::{Chunk, OutputStreamer, StreamKind, StreamStats};
