//! Host-owned registry of standard-stream redirections.
//!
//! Holds at most one record per standard stream and offers the one-call
//! helpers most hosts want ("send stdout to the debugger", "put it back").
//! The host owns the registry and decides its lifetime; nothing here is
//! process-global.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::RedirectConfig;
use crate::error::{ErrorKind, RedirectError, Result};
use crate::lifecycle::Redirector;
use crate::record::{LifecycleState, Mode};
use crate::sink::{ChunkSink, DebuggerSink};
use crate::target::StdStream;

#[derive(Default)]
pub struct Registry {
    config: RedirectConfig,
    stdout: Mutex<Option<Redirector>>,
    stderr: Mutex<Option<Redirector>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("stdout", &self.state(StdStream::Output))
            .field("stderr", &self.state(StdStream::Error))
            .finish()
    }
}

impl Registry {
    pub fn new(config: RedirectConfig) -> Self {
        Self {
            config,
            stdout: Mutex::new(None),
            stderr: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RedirectConfig {
        &self.config
    }

    fn slot(&self, stream: StdStream) -> MutexGuard<'_, Option<Redirector>> {
        let slot = match stream {
            StdStream::Output => &self.stdout,
            StdStream::Error => &self.stderr,
        };
        slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create and activate a record for `stream`, replacing any existing one.
    pub fn redirect(&self, stream: StdStream, sink: Arc<dyn ChunkSink>, mode: Mode) -> Result<()> {
        let mut slot = self.slot(stream);

        // The old record must let go of the stream before the new one grabs it.
        if let Some(previous) = slot.take() {
            previous.destroy()?;
        }

        let redirector =
            Redirector::create_with_config(Arc::new(stream), sink, mode, self.config)?;
        // Kept even if activation fails, so `last_error` stays observable.
        let result = redirector.activate();
        *slot = Some(redirector);
        result
    }

    pub fn redirect_to_debugger(&self, stream: StdStream, mode: Mode) -> Result<()> {
        self.redirect(stream, Arc::new(DebuggerSink::new(stream.as_str())), mode)
    }

    pub fn redirect_stdout_to_debugger(&self) -> Result<()> {
        self.redirect_to_debugger(StdStream::Output, Mode::Redirect)
    }

    pub fn redirect_stderr_to_debugger(&self) -> Result<()> {
        self.redirect_to_debugger(StdStream::Error, Mode::Redirect)
    }

    /// Both streams; stops at the first failure.
    pub fn redirect_all_to_debugger(&self) -> Result<()> {
        self.redirect_stdout_to_debugger()?;
        self.redirect_stderr_to_debugger()
    }

    pub fn duplicate_stdout_to_debugger(&self) -> Result<()> {
        self.redirect_to_debugger(StdStream::Output, Mode::Duplicate)
    }

    pub fn duplicate_stderr_to_debugger(&self) -> Result<()> {
        self.redirect_to_debugger(StdStream::Error, Mode::Duplicate)
    }

    pub fn duplicate_all_to_debugger(&self) -> Result<()> {
        self.duplicate_stdout_to_debugger()?;
        self.duplicate_stderr_to_debugger()
    }

    /// Deactivate the record for `stream` but keep it around for reuse.
    pub fn unredirect(&self, stream: StdStream) -> Result<()> {
        match self.slot(stream).as_ref() {
            Some(redirector) => redirector.deactivate(),
            None => Err(RedirectError::NullPtr {
                stream: stream.to_string(),
            }),
        }
    }

    pub fn unredirect_stdout(&self) -> Result<()> {
        self.unredirect(StdStream::Output)
    }

    pub fn unredirect_stderr(&self) -> Result<()> {
        self.unredirect(StdStream::Error)
    }

    /// Deactivate both streams. Both are attempted; the first error is returned.
    pub fn unredirect_all(&self) -> Result<()> {
        let results = StdStream::ALL.map(|stream| match self.unredirect(stream) {
            Err(e) if e.kind() == ErrorKind::NullPtr => Ok(()),
            other => other,
        });
        results.into_iter().collect()
    }

    /// Reactivate an existing record with its original sink and mode.
    pub fn reactivate(&self, stream: StdStream) -> Result<()> {
        match self.slot(stream).as_ref() {
            Some(redirector) => redirector.activate(),
            None => Err(RedirectError::NullPtr {
                stream: stream.to_string(),
            }),
        }
    }

    /// Destroy and forget the record for `stream`.
    pub fn destroy(&self, stream: StdStream) -> Result<()> {
        match self.slot(stream).take() {
            Some(redirector) => redirector.destroy(),
            None => Err(RedirectError::NullPtr {
                stream: stream.to_string(),
            }),
        }
    }

    pub fn destroy_all(&self) -> Result<()> {
        let results = StdStream::ALL.map(|stream| match self.destroy(stream) {
            Err(e) if e.kind() == ErrorKind::NullPtr => Ok(()),
            other => other,
        });
        results.into_iter().collect()
    }

    pub fn state(&self, stream: StdStream) -> Option<LifecycleState> {
        self.slot(stream).as_ref().map(Redirector::state)
    }

    pub fn last_error(&self, stream: StdStream) -> ErrorKind {
        self.slot(stream)
            .as_ref()
            .map_or(ErrorKind::NullPtr, Redirector::last_error)
    }

    pub fn is_redirected(&self, stream: StdStream) -> bool {
        self.state(stream) == Some(LifecycleState::Active)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_all() {
            tracing::error!("Registry teardown: {}", e);
        }
    }
}
