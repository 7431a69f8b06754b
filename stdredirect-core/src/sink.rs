use std::borrow::Cow;
use std::ffi::CStr;
use std::fmt;
use std::io::Write;
use std::sync::{Mutex, PoisonError};

/// One unit of captured output.
///
/// Borrowed straight from the reader's delivery buffer: at most
/// `capacity - 1` bytes followed by a NUL terminator. Chunks do not respect
/// line or write boundaries, and a multi-byte UTF-8 sequence may be split
/// across two of them.
#[derive(Clone, Copy)]
pub struct Chunk<'a> {
    // data plus the terminator
    buf: &'a [u8],
}

impl<'a> Chunk<'a> {
    /// Wrap a buffer whose last byte is the terminator.
    pub fn from_terminated(buf: &'a [u8]) -> Option<Self> {
        match buf.last() {
            Some(0) => Some(Self { buf }),
            _ => None,
        }
    }

    /// The captured bytes, without the terminator.
    pub fn bytes(&self) -> &'a [u8] {
        &self.buf[..self.buf.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.buf.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The null-terminated view. Stops early if the output itself contained a NUL.
    pub fn as_c_str(&self) -> &'a CStr {
        CStr::from_bytes_until_nul(self.buf).unwrap_or_default()
    }

    pub fn to_string_lossy(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(self.bytes())
    }
}

impl fmt::Debug for Chunk<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("len", &self.len())
            .field("text", &self.to_string_lossy())
            .finish()
    }
}

/// Receives captured chunks. Called from the reader thread, one chunk at a
/// time, never concurrently with itself for the same record.
///
/// Implementations must not write to the stream they are capturing.
pub trait ChunkSink: Send + Sync {
    fn deliver(&self, chunk: &Chunk<'_>);
}

impl<F> ChunkSink for F
where
    F: Fn(&Chunk<'_>) + Send + Sync,
{
    fn deliver(&self, chunk: &Chunk<'_>) {
        self(chunk)
    }
}

/// Forwards chunks to the attached debugger, which for this engine is the
/// `stdredirect::debugger` tracing target.
///
/// Whatever subscriber handles that target must write somewhere other than
/// the captured stream (the demo binary uses [`ConsoleWriter`](crate::console::ConsoleWriter)),
/// otherwise every chunk feeds back into the pipe.
#[derive(Debug, Clone)]
pub struct DebuggerSink {
    label: String,
}

impl DebuggerSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Default for DebuggerSink {
    fn default() -> Self {
        Self::new("debugger")
    }
}

impl ChunkSink for DebuggerSink {
    fn deliver(&self, chunk: &Chunk<'_>) {
        tracing::debug!(
            target: "stdredirect::debugger",
            source = %self.label,
            "{}",
            chunk.to_string_lossy()
        );
    }
}

/// Mirrors chunks into any writer, e.g. a log file.
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> ChunkSink for WriterSink<W> {
    fn deliver(&self, chunk: &Chunk<'_>) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        // A broken mirror must not take the capture down with it.
        let _ = writer.write_all(chunk.bytes()).and_then(|_| writer.flush());
    }
}
