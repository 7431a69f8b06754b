//! Direct console access.
//!
//! The descriptors behind stdout and stderr are duplicated the first time
//! the engine is touched, before any redirection exists. Writes made here
//! land on the real console no matter what fd 1 and fd 2 point at later,
//! which is what diagnostics and the log writer need.

use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::target::{StdStream, StreamTarget};

struct Originals {
    stdout: Option<Arc<File>>,
    stderr: Option<Arc<File>>,
}

static ORIGINALS: Lazy<Originals> = Lazy::new(|| Originals {
    stdout: capture(StdStream::Output),
    stderr: capture(StdStream::Error),
});

fn capture(stream: StdStream) -> Option<Arc<File>> {
    stream
        .get_handle()
        .map(|fd| Arc::new(File::from(fd)))
        .ok()
}

fn original(stream: StdStream) -> Option<Arc<File>> {
    match stream {
        StdStream::Output => ORIGINALS.stdout.clone(),
        StdStream::Error => ORIGINALS.stderr.clone(),
    }
}

/// Capture the console descriptors now. Must happen before the first redirect
/// for [`write`] to reach the real console; creating a record does it implicitly.
pub fn init() {
    Lazy::force(&ORIGINALS);
}

/// Write straight to the console, bypassing any active redirection.
pub fn write(stream: StdStream, bytes: &[u8]) -> io::Result<()> {
    let file = original(stream).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotConnected,
            format!("no console attached to {}", stream),
        )
    })?;
    let mut out = &*file;
    out.write_all(bytes)?;
    out.flush()
}

/// Last-resort notification: one line on the console's stderr.
pub fn diagnostic(message: &str) {
    let line = format!("[stdredirect] {}\n", message);
    let _ = write(StdStream::Error, line.as_bytes());
}

/// `io::Write` handle on the original console. Cheap to clone.
///
/// Writes are silently dropped when the process had no console to capture.
#[derive(Debug, Clone)]
pub struct ConsoleWriter {
    file: Option<Arc<File>>,
}

impl ConsoleWriter {
    pub fn new(stream: StdStream) -> Self {
        Self {
            file: original(stream),
        }
    }

    pub fn stdout() -> Self {
        Self::new(StdStream::Output)
    }

    pub fn stderr() -> Self {
        Self::new(StdStream::Error)
    }
}

impl Write for ConsoleWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.file {
            Some(file) => (&**file).write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &self.file {
            Some(file) => (&**file).flush(),
            None => Ok(()),
        }
    }
}
