//! Captured console streams
//!
//! Output is split into lines on `\n` with `\r` dropped. Both output
//! streams share one line ceiling; lines past it are only counted. Input
//! lines handed to the task are captured with the same shape.
//!
//! Memory stays bounded with no byte cap configured: a line past the
//! ceiling is counted without being buffered, and neither a pending line
//! nor a redirect capture grows beyond [`MAX_PENDING_BYTES`].

use serde::Serialize;
use std::collections::VecDeque;
use thiserror::Error;

/// Largest unterminated line or redirect capture held in memory
pub const MAX_PENDING_BYTES: usize = 1 << 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("output capture is already active")]
    RedirectNested,

    #[error("no output capture is active")]
    NoRedirect,

    #[error("an output limit is already active")]
    LimitNested,

    #[error("output limit of {limit} bytes exceeded")]
    ByteLimitExceeded { limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn index(self) -> usize {
        match self {
            Stream::Stdout => 0,
            Stream::Stderr => 1,
        }
    }
}

/// One captured output line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

#[derive(Debug)]
struct ByteLimit {
    limit: usize,
    used: usize,
}

#[derive(Debug)]
pub struct Console {
    max_lines: usize,
    max_io_bytes: Option<usize>,
    lines: Vec<OutputLine>,
    truncated: usize,
    partial: [Vec<u8>; 2],
    pending: [bool; 2],
    io_bytes: usize,
    dropped_bytes: usize,
    redirect: Option<Vec<u8>>,
    byte_limit: Option<ByteLimit>,
    input: VecDeque<String>,
    input_lines: Vec<String>,
    input_truncated: usize,
}

impl Console {
    pub fn new(max_lines: usize, max_io_bytes: Option<usize>) -> Self {
        Self {
            max_lines,
            max_io_bytes,
            lines: Vec::new(),
            truncated: 0,
            partial: [Vec::new(), Vec::new()],
            pending: [false, false],
            io_bytes: 0,
            dropped_bytes: 0,
            redirect: None,
            byte_limit: None,
            input: VecDeque::new(),
            input_lines: Vec::new(),
            input_truncated: 0,
        }
    }

    /// Queue the task's standard input
    pub fn with_input(mut self, input: &str) -> Self {
        if input.is_empty() {
            return self;
        }
        // "a\n" holds one line, not two
        let body = input.strip_suffix('\n').unwrap_or(input);
        self.input = body
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
            .collect();
        self
    }

    pub fn write(&mut self, stream: Stream, bytes: &[u8]) -> Result<(), ConsoleError> {
        if let Some(limit) = &mut self.byte_limit {
            if limit.used + bytes.len() > limit.limit {
                return Err(ConsoleError::ByteLimitExceeded { limit: limit.limit });
            }
            limit.used += bytes.len();
        }

        let accepted = match self.max_io_bytes {
            Some(cap) => {
                let room = cap.saturating_sub(self.io_bytes);
                let take = room.min(bytes.len());
                self.dropped_bytes += bytes.len() - take;
                take
            }
            None => bytes.len(),
        };
        self.io_bytes += accepted;
        let bytes = &bytes[..accepted];

        if stream == Stream::Stdout {
            if let Some(captured) = &mut self.redirect {
                let take = MAX_PENDING_BYTES.saturating_sub(captured.len()).min(bytes.len());
                captured.extend_from_slice(&bytes[..take]);
                self.dropped_bytes += bytes.len() - take;
                return Ok(());
            }
        }

        let index = stream.index();
        for &byte in bytes {
            match byte {
                b'\n' => {
                    let line = std::mem::take(&mut self.partial[index]);
                    self.pending[index] = false;
                    self.push_line(stream, &line);
                }
                b'\r' => {}
                other => {
                    self.pending[index] = true;
                    if self.lines.len() >= self.max_lines {
                        // Counted as truncated once the line ends
                        continue;
                    }
                    if self.partial[index].len() >= MAX_PENDING_BYTES {
                        self.dropped_bytes += 1;
                        continue;
                    }
                    self.partial[index].push(other);
                }
            }
        }
        Ok(())
    }

    fn push_line(&mut self, stream: Stream, bytes: &[u8]) {
        if self.lines.len() >= self.max_lines {
            self.truncated += 1;
            return;
        }
        self.lines.push(OutputLine {
            stream,
            text: String::from_utf8_lossy(bytes).into_owned(),
        });
    }

    /// Emit trailing partial lines
    pub fn flush(&mut self) {
        for stream in [Stream::Stdout, Stream::Stderr] {
            let index = stream.index();
            let rest = std::mem::take(&mut self.partial[index]);
            if std::mem::take(&mut self.pending[index]) {
                self.push_line(stream, &rest);
            }
        }
    }

    /// Next input line, captured as consumed
    pub fn read_line(&mut self) -> Option<String> {
        let line = self.input.pop_front()?;
        if self.input_lines.len() >= self.max_lines {
            self.input_truncated += 1;
        } else {
            self.input_lines.push(line.clone());
        }
        Some(line)
    }

    pub fn begin_redirect(&mut self) -> Result<(), ConsoleError> {
        if self.redirect.is_some() {
            return Err(ConsoleError::RedirectNested);
        }
        self.redirect = Some(Vec::new());
        Ok(())
    }

    /// End capture and return what was captured
    pub fn end_redirect(&mut self) -> Result<String, ConsoleError> {
        let captured = self.redirect.take().ok_or(ConsoleError::NoRedirect)?;
        Ok(String::from_utf8_lossy(&captured).into_owned())
    }

    pub fn begin_limit(&mut self, limit: usize) -> Result<(), ConsoleError> {
        if self.byte_limit.is_some() {
            return Err(ConsoleError::LimitNested);
        }
        self.byte_limit = Some(ByteLimit { limit, used: 0 });
        Ok(())
    }

    pub fn end_limit(&mut self) {
        self.byte_limit = None;
    }

    pub fn lines(&self) -> &[OutputLine] {
        &self.lines
    }

    pub fn truncated(&self) -> usize {
        self.truncated
    }

    pub fn dropped_bytes(&self) -> usize {
        self.dropped_bytes
    }

    pub fn input_lines(&self) -> &[String] {
        &self.input_lines
    }

    pub fn input_truncated(&self) -> usize {
        self.input_truncated
    }

    /// Move the captured output and input out of the console
    pub fn take(&mut self) -> (Vec<OutputLine>, Vec<String>) {
        (
            std::mem::take(&mut self.lines),
            std::mem::take(&mut self.input_lines),
        )
    }
}
