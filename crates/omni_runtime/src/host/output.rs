use std::io::Write as _;
use std::sync::{Arc, RwLock};

/// Line-oriented sink behind `print`, `console_log_*` and the `console` module.
#[derive(Clone, Default)]
pub struct OutputSink {
    /// Capture lines into this buffer instead of writing to stdout.
    capture: Option<Arc<RwLock<Vec<u8>>>>,
}

impl OutputSink {
    pub fn stdout() -> Self {
        Self { capture: None }
    }

    pub fn captured(buffer: Arc<RwLock<Vec<u8>>>) -> Self {
        Self {
            capture: Some(buffer),
        }
    }

    pub fn write_line(&self, line: &str) {
        match &self.capture {
            Some(buffer) => {
                let mut buffer = buffer.write().unwrap_or_else(|p| p.into_inner());
                buffer.extend_from_slice(line.as_bytes());
                buffer.push(b'\n');
            }
            None => {
                let mut out = std::io::stdout().lock();
                if let Err(e) = writeln!(out, "{line}") {
                    tracing::debug!("failed to write guest output: {e}");
                }
            }
        }
    }
}
