//! Buffered framing for worker IPC.
//!
//! Frames are newline-terminated byte strings. Reading works on raw bytes so a
//! frame cut off in the middle of a UTF-8 sequence is still surfaced as a
//! frame rather than an I/O error.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// One frame read from the stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Newline-terminated frame, newline stripped.
    Complete(&'a [u8]),
    /// Bytes at EOF with no terminating newline (writer died mid-frame).
    Truncated(&'a [u8]),
}

/// Buffered frame reader.
pub struct LineReader<R> {
    reader: BufReader<R>,
    buffer: Vec<u8>,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, inner),
            buffer: Vec::with_capacity(4096),
        }
    }

    /// Read the next frame. Returns `None` on a clean EOF.
    pub fn read_frame(&mut self) -> io::Result<Option<Frame<'_>>> {
        self.buffer.clear();
        if self.reader.read_until(b'\n', &mut self.buffer)? == 0 {
            return Ok(None);
        }
        if self.buffer.last() == Some(&b'\n') {
            self.buffer.pop();
            if self.buffer.last() == Some(&b'\r') {
                self.buffer.pop();
            }
            Ok(Some(Frame::Complete(&self.buffer)))
        } else {
            Ok(Some(Frame::Truncated(&self.buffer)))
        }
    }
}

/// Buffered frame writer; every frame is flushed immediately.
pub struct LineWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, inner),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }

    #[cfg(test)]
    fn into_inner(self) -> io::Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error())
    }
}
