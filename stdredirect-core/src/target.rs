//! Stream capability.
//!
//! Every operation the engine performs on a stream goes through
//! [`StreamTarget`]: read the current binding, swap it, flush pending
//! output. The standard streams and arbitrary descriptors both implement it,
//! so the lifecycle code never branches on "which stream".

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;
#[cfg(target_vendor = "apple")]
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
#[cfg(not(target_vendor = "apple"))]
use nix::fcntl::OFlag;
use nix::unistd;

pub trait StreamTarget: fmt::Debug + Send + Sync + 'static {
    /// Human-readable name used in errors and diagnostics.
    fn name(&self) -> &str;

    /// The descriptor whose binding gets swapped. At most one record may
    /// hold it redirected at a time.
    fn descriptor(&self) -> RawFd;

    /// Duplicate the current binding (close-on-exec) so it can be restored later.
    fn get_handle(&self) -> io::Result<OwnedFd>;

    /// Push anything buffered in user space into the descriptor.
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Point the descriptor at `handle`.
    fn set_handle(&self, handle: BorrowedFd<'_>) -> io::Result<()> {
        rebind(handle, self.descriptor())
    }
}

/// The process's standard output and error streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdStream {
    Output,
    Error,
}

impl StdStream {
    pub const ALL: [StdStream; 2] = [StdStream::Output, StdStream::Error];

    pub fn fileno(self) -> RawFd {
        match self {
            StdStream::Output => libc::STDOUT_FILENO,
            StdStream::Error => libc::STDERR_FILENO,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StdStream::Output => "stdout",
            StdStream::Error => "stderr",
        }
    }
}

impl fmt::Display for StdStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StreamTarget for StdStream {
    fn name(&self) -> &str {
        self.as_str()
    }

    fn descriptor(&self) -> RawFd {
        self.fileno()
    }

    fn get_handle(&self) -> io::Result<OwnedFd> {
        match self {
            StdStream::Output => io::stdout().as_fd().try_clone_to_owned(),
            StdStream::Error => io::stderr().as_fd().try_clone_to_owned(),
        }
    }

    fn flush(&self) -> io::Result<()> {
        match self {
            StdStream::Output => io::stdout().flush()?,
            StdStream::Error => io::stderr().flush()?,
        }
        flush_c_stdio()
    }
}

/// Any descriptor the host wants captured: a log file, a socket, a test fixture.
///
/// The stream owns its descriptor. Writes made through [`FdStream::write_all`]
/// follow whatever the descriptor is bound to at that moment, exactly like
/// writes to fd 1 follow a redirected stdout.
pub struct FdStream {
    name: String,
    fd: OwnedFd,
}

impl FdStream {
    pub fn new(name: impl Into<String>, fd: impl Into<OwnedFd>) -> Self {
        Self {
            name: name.into(),
            fd: fd.into(),
        }
    }

    pub fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = File::from(self.fd.try_clone()?);
        file.write_all(bytes)
    }
}

impl fmt::Debug for FdStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdStream")
            .field("name", &self.name)
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

impl StreamTarget for FdStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn get_handle(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}

// ════════════════════════════════════════════════════════════════════
// Raw descriptor helpers
// ════════════════════════════════════════════════════════════════════

pub(crate) fn rebind(source: BorrowedFd<'_>, fd: RawFd) -> io::Result<()> {
    loop {
        match unistd::dup2(source.as_raw_fd(), fd) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Anonymous pipe, both ends close-on-exec from birth. Returns `(read, write)`.
#[cfg(not(target_vendor = "apple"))]
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    Ok(unistd::pipe2(OFlag::O_CLOEXEC)?)
}

/// Anonymous pipe, both ends close-on-exec. Returns `(read, write)`.
#[cfg(target_vendor = "apple")]
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    // No pipe2 here; a fork racing this window can inherit the pipe.
    let (read, write) = unistd::pipe()?;
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}

/// `fflush(NULL)`: every C stdio stream in the process.
pub(crate) fn flush_c_stdio() -> io::Result<()> {
    // SAFETY: fflush(NULL) touches no caller memory.
    if unsafe { libc::fflush(std::ptr::null_mut()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
