//! OS-process plumbing: the live-process registry and output streaming

mod registry;
mod stream;

pub use registry::{ProcessHandle, ProcessRegistry};
pub use stream::{drain_stderr, OutputStreamer, TAIL_LINES};
