//! Child-process output capture
//!
//! Stderr of every stdio upstream is drained into a bounded ring buffer
//! (served by `upstream logs`) and echoed into the daemon log: lines that
//! look like failures at WARN, everything else at DEBUG.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lines kept per server for `upstream logs`
const RING_CAPACITY: usize = 500;

/// Substrings that elevate a captured line to WARN
const FAILURE_MARKERS: &[&str] = &["error", "failed", "panic"];

/// Whether a captured output line should be logged at WARN
pub fn is_failure_line(line: &str) -> bool {
    let lowered = line.to_lowercase();
    FAILURE_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Bounded ring of recent child output
#[derive(Clone, Default)]
pub struct OutputRing {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().expect("ring poisoned");
        if lines.len() >= RING_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Most recent `limit` lines, oldest first
    pub fn tail(&self, limit: usize) -> Vec<String> {
        let lines = self.lines.lock().expect("ring poisoned");
        let skip = lines.len().saturating_sub(limit);
        lines.iter().skip(skip).cloned().collect()
    }
}

/// Spawn the capture task for a child's stderr. The pipe exists from the
/// moment of spawn, so output written before this task starts is buffered
/// by the OS and not lost.
pub fn capture_stderr(server: &str, stderr: ChildStderr, ring: OutputRing) -> JoinHandle<()> {
    let server = server.to_string();
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if is_failure_line(&line) {
                warn!(server = %server, "child: {}", line);
            } else {
                debug!(server = %server, "child: {}", line);
            }
            ring.push(line);
        }
        debug!(server = %server, "child stderr closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_line_detection() {
        assert!(is_failure_line("ERROR: something broke"));
        assert!(is_failure_line("request failed with 500"));
        assert!(is_failure_line("thread 'main' panicked at src/lib.rs"));
        assert!(!is_failure_line("listening on :9090"));
        assert!(!is_failure_line("ready"));
    }

    #[test]
    fn test_ring_bounds() {
        let ring = OutputRing::new();
        for i in 0..(RING_CAPACITY + 50) {
            ring.push(format!("line {}", i));
        }
        let tail = ring.tail(10_000);
        assert_eq!(tail.len(), RING_CAPACITY);
        assert_eq!(tail.first().unwrap(), "line 50");
        assert_eq!(tail.last().unwrap(), &format!("line {}", RING_CAPACITY + 49));
    }

    #[test]
    fn test_tail_limit() {
        let ring = OutputRing::new();
        for i in 0..10 {
            ring.push(format!("line {}", i));
        }
        assert_eq!(ring.tail(3), vec!["line 7", "line 8", "line 9"]);
    }

    #[tokio::test]
    async fn test_capture_from_real_child() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "echo ok; echo 'error: boom' 1>&2"])
            .stderr(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .spawn()
            .unwrap();

        let ring = OutputRing::new();
        let handle = capture_stderr("test", child.stderr.take().unwrap(), ring.clone());
        handle.await.unwrap();

        assert_eq!(ring.tail(10), vec!["error: boom"]);
        let _ = child.wait().await;
    }
}
