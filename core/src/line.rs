//! Line-by-line processing of streamed command output

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{error, warn};

use crate::ProcessingError;

/// Consumer of streamed output, invoked once per line
///
/// `lines_processed` is read once the stream ends: zero means the command
/// printed nothing on stdout and stderr is inspected instead.
pub trait LineProcessor: Send {
    /// Handle one line. `line_number` starts at 1.
    fn process(&mut self, line: &str, line_number: usize) -> Result<(), ProcessingError>;

    /// Number of lines seen so far, including lines whose processing failed
    fn lines_processed(&self) -> usize;
}

/// Adapts a closure into a [`LineProcessor`] that counts lines
pub struct FnProcessor<F> {
    handler: F,
    lines: usize,
}

impl<F> FnProcessor<F>
where
    F: FnMut(&str, usize) -> Result<(), ProcessingError> + Send,
{
    pub fn new(handler: F) -> Self {
        Self { handler, lines: 0 }
    }
}

impl<F> LineProcessor for FnProcessor<F>
where
    F: FnMut(&str, usize) -> Result<(), ProcessingError> + Send,
{
    fn process(&mut self, line: &str, line_number: usize) -> Result<(), ProcessingError> {
        self.lines = line_number;
        (self.handler)(line, line_number)
    }

    fn lines_processed(&self) -> usize {
        self.lines
    }
}

/// Build a [`LineProcessor`] from a closure
pub fn from_fn<F>(handler: F) -> FnProcessor<F>
where
    F: FnMut(&str, usize) -> Result<(), ProcessingError> + Send,
{
    FnProcessor::new(handler)
}

/// Default processor: joins every line with `\n` into one buffer
#[derive(Debug, Default)]
pub struct BufferingProcessor {
    buffer: String,
    lines: usize,
}

impl BufferingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    pub fn into_output(self) -> String {
        self.buffer
    }
}

impl LineProcessor for BufferingProcessor {
    fn process(&mut self, line: &str, line_number: usize) -> Result<(), ProcessingError> {
        if line_number > 1 {
            self.buffer.push('\n');
        }
        self.buffer.push_str(line);
        self.lines = line_number;
        Ok(())
    }

    fn lines_processed(&self) -> usize {
        self.lines
    }
}

/// Longest line handed to a processor; longer lines arrive in pieces
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Feed every line of `reader` to `processor`
///
/// A failing line is logged and skipped; a read error ends the stream.
/// Returns the number of lines read.
pub async fn stream_lines<R>(reader: R, processor: &mut dyn LineProcessor) -> usize
where
    R: AsyncRead + Unpin,
{
    stream_lines_limited(reader, processor, MAX_LINE_BYTES).await
}

async fn stream_lines_limited<R>(
    reader: R,
    processor: &mut dyn LineProcessor,
    max_line: usize,
) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    let mut line_number = 0;

    loop {
        raw.clear();
        let mut limited = (&mut reader).take(max_line as u64);
        match limited.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                line_number += 1;
                let line = String::from_utf8_lossy(trim_line_ending(&raw));
                if let Err(e) = processor.process(&line, line_number) {
                    error!(line_number, line = %line, error = %e, "Failed to process output line");
                }
            }
            Err(e) => {
                warn!(error = %e, "Output stream read failed");
                break;
            }
        }
    }

    line_number
}

fn trim_line_ending(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffering_joins_lines() {
        let mut processor = BufferingProcessor::new();
        let read = stream_lines(&b"first\nsecond\r\nthird"[..], &mut processor).await;

        assert_eq!(read, 3);
        assert_eq!(processor.lines_processed(), 3);
        assert_eq!(processor.as_str(), "first\nsecond\nthird");
    }

    #[tokio::test]
    async fn test_empty_stream_processes_nothing() {
        let mut processor = BufferingProcessor::new();
        stream_lines(&b""[..], &mut processor).await;

        assert_eq!(processor.lines_processed(), 0);
        assert!(processor.is_empty());
    }

    #[tokio::test]
    async fn test_failing_line_does_not_stop_stream() {
        let mut seen = Vec::new();
        let mut processor = from_fn(|line: &str, number| {
            if line == "bad" {
                return Err(ProcessingError::new("malformed"));
            }
            seen.push((number, line.to_string()));
            Ok(())
        });

        stream_lines(&b"one\nbad\nthree\n"[..], &mut processor).await;

        assert_eq!(processor.lines_processed(), 3);
        drop(processor);
        assert_eq!(seen, vec![(1, "one".to_string()), (3, "three".to_string())]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_decoded_lossily() {
        let mut processor = BufferingProcessor::new();
        stream_lines(&b"ok\xff\n"[..], &mut processor).await;

        assert_eq!(processor.as_str(), "ok\u{fffd}");
    }

    #[tokio::test]
    async fn test_long_line_is_split_at_limit() {
        let mut processor = BufferingProcessor::new();
        let read = stream_lines_limited(&b"abcdefghij\nk\n"[..], &mut processor, 4).await;

        assert_eq!(read, 4);
        assert_eq!(processor.as_str(), "abcd\nefgh\nij\nk");
    }

    #[test]
    fn test_blank_lines_count() {
        let mut processor = BufferingProcessor::new();
        processor.process("", 1).unwrap();

        assert_eq!(processor.lines_processed(), 1);
        assert!(processor.is_empty());
    }
}
