use std::fs::File;
use std::io::{self, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::record::Mode;
use crate::sink::{Chunk, ChunkSink};

/// Routes each chunk according to the record's mode.
pub(crate) struct Dispatcher {
    /// The stream's original destination; only kept in duplicate mode.
    console: Option<File>,
    /// Set after the first failed console echo; later failures stay quiet.
    console_failed: bool,
    sink: Arc<dyn ChunkSink>,
}

impl Dispatcher {
    pub fn new(mode: Mode, console: Option<File>, sink: Arc<dyn ChunkSink>) -> Self {
        let console = match mode {
            Mode::Duplicate => console,
            Mode::Redirect => None,
        };
        Self {
            console,
            console_failed: false,
            sink,
        }
    }

    /// Console first, then the sink. The console echo is best-effort; a
    /// panicking sink is reported as an error so the reader can shut down.
    pub fn dispatch(&mut self, chunk: &Chunk<'_>) -> io::Result<()> {
        if let Some(console) = &mut self.console {
            if let Err(e) = console.write_all(chunk.bytes()) {
                if !self.console_failed {
                    self.console_failed = true;
                    tracing::warn!("Console echo failed, chunks still reach the sink: {}", e);
                }
            }
        }

        let sink = &self.sink;
        catch_unwind(AssertUnwindSafe(|| sink.deliver(chunk)))
            .map_err(|_| io::Error::other("chunk sink panicked"))
    }
}
