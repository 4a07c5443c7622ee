//! Bounded in-memory ring of a session's output lines, kept for the final
//! result file and log tails.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use gm_core::events::TeamStream;

const DEFAULT_MAX_LINES: usize = 2_000;
const DEFAULT_MAX_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    pub max_lines: usize,
    pub max_bytes: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            max_lines: DEFAULT_MAX_LINES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingLine {
    pub at: DateTime<Utc>,
    pub stream: TeamStream,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct OutputRing {
    config: RingConfig,
    lines: VecDeque<RingLine>,
    total_bytes: usize,
    truncated: bool,
}

impl OutputRing {
    pub fn new(config: RingConfig) -> Self {
        Self {
            config,
            lines: VecDeque::new(),
            total_bytes: 0,
            truncated: false,
        }
    }

    pub fn push(&mut self, stream: TeamStream, text: impl Into<String>) {
        let text = text.into();
        self.total_bytes += text.len();
        self.lines.push_back(RingLine {
            at: Utc::now(),
            stream,
            text,
        });

        while self.lines.len() > self.config.max_lines
            || (self.total_bytes > self.config.max_bytes && self.lines.len() > 1)
        {
            if let Some(evicted) = self.lines.pop_front() {
                self.total_bytes = self.total_bytes.saturating_sub(evicted.text.len());
                self.truncated = true;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// The stdout lines joined with newlines, for the session result file.
    pub fn stdout_text(&self) -> String {
        self.lines
            .iter()
            .filter(|line| line.stream == TeamStream::Stdout)
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Every retained line, both streams interleaved in arrival order.
    pub fn combined_text(&self) -> String {
        self.lines
            .iter()
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The newest `count` lines across both streams.
    pub fn tail(&self, count: usize) -> Vec<&RingLine> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).collect()
    }
}

impl Default for OutputRing {
    fn default() -> Self {
        Self::new(RingConfig::default())
    }
}
