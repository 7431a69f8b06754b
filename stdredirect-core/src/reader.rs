//! Pipe reader: drains the read end of a redirection pipe and hands
//! fixed-size chunks to the dispatcher until told to stop.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::dispatch::Dispatcher;
use crate::signal::CancelSignal;
use crate::sink::Chunk;
use crate::target::flush_c_stdio;

/// How the reader thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReaderExit {
    /// Every write end was closed and the pipe is empty.
    Completed,
    /// The cancellation signal was observed.
    Cancelled,
    /// An OS call failed; the stream has already been handed back.
    Failed,
}

pub(crate) struct PipeReader {
    read_end: File,
    cancel: Arc<CancelSignal>,
    dispatcher: Dispatcher,
    capacity: usize,
    #[cfg(test)]
    fail_next_read: Arc<AtomicBool>,
}

impl PipeReader {
    pub fn new(
        read_end: File,
        cancel: Arc<CancelSignal>,
        dispatcher: Dispatcher,
        capacity: usize,
    ) -> Self {
        Self {
            read_end,
            cancel,
            dispatcher,
            capacity,
            #[cfg(test)]
            fail_next_read: Arc::new(AtomicBool::new(false)),
        }
    }

    #[cfg(test)]
    pub fn with_fault_hook(mut self, hook: Arc<AtomicBool>) -> Self {
        self.fail_next_read = hook;
        self
    }

    /// The reader loop. The delivery buffer lives exactly as long as this call.
    pub fn run(&mut self) -> io::Result<ReaderExit> {
        let mut buffer = vec![0u8; self.capacity];

        loop {
            if self.cancel.is_set() {
                self.drain(&mut buffer)?;
                return Ok(ReaderExit::Cancelled);
            }

            // Anything sitting in C stdio buffers should reach the pipe now.
            flush_c_stdio()?;

            if self.wait(PollTimeout::NONE)? {
                let n = self.read_chunk(&mut buffer)?;
                if n == 0 {
                    return Ok(ReaderExit::Completed);
                }
                self.deliver(&mut buffer, n)?;
            }
        }
    }

    /// Deliver whatever is already queued without blocking.
    fn drain(&mut self, buffer: &mut [u8]) -> io::Result<()> {
        loop {
            if !self.wait(PollTimeout::ZERO)? {
                return Ok(());
            }
            let n = self.read_chunk(buffer)?;
            if n == 0 {
                return Ok(());
            }
            self.deliver(buffer, n)?;
        }
    }

    /// Block until the pipe or the wake pipe is ready. Returns whether the
    /// pipe itself has something for `read`.
    fn wait(&self, timeout: PollTimeout) -> io::Result<bool> {
        let mut fds = [
            PollFd::new(self.read_end.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.cancel.wake_fd(), PollFlags::POLLIN),
        ];

        loop {
            match poll(&mut fds, timeout) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        // HUP means EOF and ERR/NVAL will surface from read(); both go through read.
        let wake =
            PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;
        Ok(fds[0].revents().is_some_and(|r| r.intersects(wake)))
    }

    /// Read at most `capacity - 1` bytes; returns as soon as anything is there.
    fn read_chunk(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        #[cfg(test)]
        if self.fail_next_read.swap(false, Ordering::SeqCst) {
            return Err(io::Error::other("injected read failure"));
        }

        let limit = buffer.len() - 1;
        loop {
            match self.read_end.read(&mut buffer[..limit]) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn deliver(&mut self, buffer: &mut [u8], n: usize) -> io::Result<()> {
        buffer[n] = 0;
        let result = match Chunk::from_terminated(&buffer[..=n]) {
            Some(chunk) => self.dispatcher.dispatch(&chunk),
            None => Ok(()),
        };
        buffer[..=n].fill(0);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Mode;
    use crate::sink::ChunkSink;
    use crate::target;
    use std::io::Write;
    use std::sync::Mutex;

    type Chunks = Arc<Mutex<Vec<Vec<u8>>>>;

    fn collecting_reader(capacity: usize) -> (PipeReader, File, Chunks, Arc<CancelSignal>) {
        let (read, write) = target::pipe().unwrap();
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink_chunks = chunks.clone();
        let sink: Arc<dyn ChunkSink> = Arc::new(move |chunk: &Chunk<'_>| {
            sink_chunks.lock().unwrap().push(chunk.bytes().to_vec());
        });
        let cancel = Arc::new(CancelSignal::new().unwrap());
        let reader = PipeReader::new(
            File::from(read),
            cancel.clone(),
            Dispatcher::new(Mode::Redirect, None, sink),
            capacity,
        );
        (reader, File::from(write), chunks, cancel)
    }

    #[test]
    fn test_reader_completes_on_eof() {
        let (mut reader, mut write, chunks, _cancel) = collecting_reader(81);
        write.write_all(b"hello").unwrap();
        drop(write);

        assert_eq!(reader.run().unwrap(), ReaderExit::Completed);
        assert_eq!(chunks.lock().unwrap().concat(), b"hello");
    }

    #[test]
    fn test_reader_splits_long_writes() {
        let (mut reader, mut write, chunks, _cancel) = collecting_reader(11);
        let payload: Vec<u8> = (0..95u8).map(|i| b'a' + i % 26).collect();
        write.write_all(&payload).unwrap();
        drop(write);

        reader.run().unwrap();
        let chunks = chunks.lock().unwrap();
        assert!(chunks.len() >= 10);
        assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= 10));
        assert_eq!(chunks.concat(), payload);
    }

    #[test]
    fn test_reader_drains_before_honouring_cancel() {
        let (mut reader, mut write, chunks, cancel) = collecting_reader(81);
        write.write_all(b"late words").unwrap();
        cancel.set().unwrap();

        // The write end is still open, so only the signal can end the loop.
        assert_eq!(reader.run().unwrap(), ReaderExit::Cancelled);
        assert_eq!(chunks.lock().unwrap().concat(), b"late words");
        drop(write);
    }

    #[test]
    fn test_reader_wakes_from_blocking_wait() {
        let (mut reader, write, _chunks, cancel) = collecting_reader(81);
        let handle = std::thread::spawn(move || reader.run());

        std::thread::sleep(std::time::Duration::from_millis(20));
        cancel.set().unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), ReaderExit::Cancelled);
        drop(write);
    }

    #[test]
    fn test_injected_read_failure_surfaces() {
        let (reader, mut write, _chunks, _cancel) = collecting_reader(81);
        let hook = Arc::new(AtomicBool::new(true));
        let mut reader = reader.with_fault_hook(hook.clone());
        write.write_all(b"x").unwrap();

        assert!(reader.run().is_err());
        assert!(!hook.load(Ordering::SeqCst));
    }
}
