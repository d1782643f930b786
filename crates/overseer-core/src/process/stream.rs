//! Line-oriented consumption of a subprocess's output
//!
//! The agent writes one self-contained JSON record per stdout line. The
//! streamer assembles complete lines without buffering the whole stream,
//! parses each one, and hands the records to the caller in arrival order.
//! A line that fails to parse is recorded as a warning and skipped; it
//! never aborts the stream or the run.

use crate::types::StreamMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

/// How many raw lines are kept for diagnostic inclusion in failure messages
pub const TAIL_LINES: usize = 50;

fn push_tail(tail: &Mutex<VecDeque<String>>, line: &str) {
    let mut tail = tail.lock();
    if tail.len() == TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line.to_string());
}

/// Incremental reader of one run's stdout
#[derive(Default)]
pub struct OutputStreamer {
    tail: Mutex<VecDeque<String>>,
    messages: AtomicU64,
    warnings: AtomicU64,
}

impl OutputStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the reader to EOF, invoking `on_message` for every line that
    /// parses as a structured record. FIFO with the subprocess's own write
    /// order; no reordering or buffering beyond line assembly.
    pub async fn consume<R, F>(&self, reader: R, mut on_message: F)
    where
        R: AsyncRead + Unpin,
        F: FnMut(StreamMessage),
    {
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("Agent stdout closed");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    push_tail(&self.tail, trimmed);
                    match StreamMessage::parse(trimmed) {
                        Ok(msg) => {
                            self.messages.fetch_add(1, Ordering::Relaxed);
                            on_message(msg);
                        }
                        Err(e) => {
                            self.warnings.fetch_add(1, Ordering::Relaxed);
                            warn!("Skipping malformed output line: {}", e);
                        }
                    }
                }
                Err(e) => {
                    warn!("Error reading agent stdout: {}", e);
                    break;
                }
            }
        }
    }

    /// Last-N raw lines seen so far
    pub fn tail(&self) -> Vec<String> {
        self.tail.lock().iter().cloned().collect()
    }

    pub fn message_count(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn warning_count(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }
}

/// Drain a stderr pipe, keeping the last lines for failure messages.
/// Agents often log here, so nothing on this pipe is treated as fatal.
pub async fn drain_stderr<R>(reader: R, tail: Arc<Mutex<VecDeque<String>>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    push_tail(&tail, trimmed);
                }
            }
            Err(e) => {
                warn!("Error reading agent stderr: {}", e);
                break;
            }
        }
    }
}
