use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::target;

/// Manual-reset cancellation signal.
///
/// The flag is what the reader checks; the self-pipe is what wakes it when it
/// is parked in `poll`. Once set it stays set.
#[derive(Debug)]
pub(crate) struct CancelSignal {
    flag: AtomicBool,
    wake_read: File,
    wake_write: File,
}

impl CancelSignal {
    pub fn new() -> io::Result<Self> {
        let (read, write) = target::pipe()?;
        Ok(Self {
            flag: AtomicBool::new(false),
            wake_read: File::from(read),
            wake_write: File::from(write),
        })
    }

    pub fn set(&self) -> io::Result<()> {
        if self.flag.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        (&self.wake_write).write_all(&[1])
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Becomes readable once the signal is set.
    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        self.wake_read.as_fd()
    }
}
