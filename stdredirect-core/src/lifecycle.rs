//! Lifecycle manager: creation, activation, deactivation and destruction of a
//! redirection record. The only code that rebinds stream descriptors.
//!
//! Two execution contexts touch a record: the control thread (whoever calls
//! `activate`/`deactivate`) and the reader thread when it fails. The control
//! path holds the transition lock for the whole of a transition. A failing
//! reader posts its generation in `reader_failed` and then either takes the
//! transition lock itself or sees that the current lock holder picked the
//! failure up. Whoever takes the live resources out of the record owns their
//! teardown, so a redirection is never torn down twice.

use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[cfg(test)]
use std::sync::atomic::AtomicBool;

use crate::config::RedirectConfig;
use crate::console;
use crate::dispatch::Dispatcher;
use crate::error::{ErrorKind, RedirectError, Result};
use crate::reader::{PipeReader, ReaderExit};
use crate::record::{
    self, ActiveRedirect, LifecycleState, Mode, Record, StreamBinding, StreamClaim,
};
use crate::signal::CancelSignal;
use crate::sink::ChunkSink;
use crate::target::{self, StreamTarget};

/// How often the teardown path checks whether the reader has exited, and how
/// often a failed reader retries the transition lock.
const JOIN_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Handle to one redirection record.
///
/// Dropping a `Redirector` deactivates it if it is still active;
/// [`destroy`](Self::destroy) does the same but reports the outcome.
pub struct Redirector {
    shared: Arc<Shared>,
}

struct Shared {
    id: u64,
    target: Arc<dyn StreamTarget>,
    sink: Arc<dyn ChunkSink>,
    mode: Mode,
    config: RedirectConfig,
    transition: Mutex<()>,
    record: Mutex<Record>,
    #[cfg(test)]
    fail_next_read: Arc<AtomicBool>,
}

/// What a teardown left behind.
enum Teardown {
    /// The stream is back and the reader exited normally.
    Clean,
    /// The stream is back but the reader reported a failure.
    ReaderFailed,
    /// At least one step failed; the stream may still point at the pipe.
    Broken(String),
}

impl fmt::Debug for Redirector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.shared.record();
        f.debug_struct("Redirector")
            .field("stream", &self.shared.target.name())
            .field("mode", &self.shared.mode)
            .field("state", &record.state)
            .field("last_error", &record.last_error)
            .finish()
    }
}

impl Redirector {
    /// Create a record with the default configuration. No OS resources are touched.
    pub fn create<T, S>(target: T, sink: S, mode: Mode) -> Result<Self>
    where
        T: StreamTarget,
        S: ChunkSink + 'static,
    {
        Self::create_with_config(
            Arc::new(target),
            Arc::new(sink),
            mode,
            RedirectConfig::default(),
        )
    }

    pub fn create_with_config(
        target: Arc<dyn StreamTarget>,
        sink: Arc<dyn ChunkSink>,
        mode: Mode,
        config: RedirectConfig,
    ) -> Result<Self> {
        config.validate().map_err(|reason| RedirectError::Create {
            stream: target.name().to_string(),
            reason,
        })?;

        // The console has to be captured before anything gets redirected.
        console::init();

        Ok(Self {
            shared: Arc::new(Shared {
                id: record::next_owner(),
                target,
                sink,
                mode,
                config,
                transition: Mutex::new(()),
                record: Mutex::new(Record::new()),
                #[cfg(test)]
                fail_next_read: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    pub fn stream_name(&self) -> &str {
        self.shared.target.name()
    }

    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    pub fn config(&self) -> &RedirectConfig {
        &self.shared.config
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.record().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    pub fn last_error(&self) -> ErrorKind {
        self.shared.record().last_error
    }

    /// Swap the stream for a pipe and start the reader.
    ///
    /// Activating an already active record deactivates it first. Fails with
    /// `ERROR_REDIRECT` while another record has the same descriptor
    /// redirected. On failure every step taken so far is undone and the
    /// record is left inactive.
    pub fn activate(&self) -> Result<()> {
        let _transition = self.shared.lock_transition();
        let name = self.stream_name();

        let state = self.shared.record().state;
        match state {
            LifecycleState::Invalid => {
                return Err(RedirectError::redirect(
                    name,
                    "check state",
                    io::Error::other("record is invalid; only destroy is allowed"),
                ));
            }
            LifecycleState::Active => match self.shared.deactivate_locked() {
                // The stream is back in place; a dead reader does not block a fresh start.
                Err(e) if e.kind() != ErrorKind::Thread => return Err(e),
                _ => {}
            },
            LifecycleState::Created | LifecycleState::Inactive => {}
        }

        let generation = self.shared.begin_activation();
        match self.shared.start(generation) {
            Ok(active) => self.shared.finish_activation(active),
            Err(err) => {
                {
                    let mut record = self.shared.record();
                    record.activating = None;
                    record.state = LifecycleState::Inactive;
                    record.last_error = ErrorKind::Redirect;
                }
                tracing::warn!("Redirect of {} rolled back: {}", name, err);
                Err(err)
            }
        }
    }

    /// Stop the reader and give the stream its original destination back.
    ///
    /// A no-op on a record that is not active. If any teardown step fails the
    /// record becomes invalid and a diagnostic is written to the console. If
    /// the stream was restored but the reader had failed, the record is left
    /// inactive and the call reports `ERROR_THREAD`.
    pub fn deactivate(&self) -> Result<()> {
        let _transition = self.shared.lock_transition();
        self.shared.deactivate_locked()
    }

    /// Deactivate, then release the record whatever the outcome.
    ///
    /// An invalid record is not given a second cleanup attempt; it is released
    /// as is and the call reports `ERROR_UNREDIRECT`.
    pub fn destroy(self) -> Result<()> {
        let result = self.deactivate();
        drop(self);
        result
    }

    /// Make the reader's next read fail.
    #[cfg(test)]
    pub(crate) fn inject_read_failure(&self) {
        self.shared
            .fail_next_read
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Drop for Redirector {
    fn drop(&mut self) {
        if self.state() != LifecycleState::Active {
            return;
        }
        if let Err(e) = self.deactivate() {
            tracing::error!("Dropping {} redirection: {}", self.stream_name(), e);
        }
    }
}

impl Shared {
    fn record(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new generation. Caller holds the transition lock.
    fn begin_activation(&self) -> u64 {
        let mut record = self.record();
        record.generation += 1;
        record.activating = Some(record.generation);
        record.reader_failed = None;
        record.generation
    }

    /// The activation sequence. Every resource is owned by a local until the
    /// final `ActiveRedirect` is built, so an early return unwinds the lot.
    fn start(self: &Arc<Self>, generation: u64) -> Result<ActiveRedirect> {
        let name = self.target.name();
        let fd = self.target.descriptor();

        let claim = StreamClaim::acquire(fd, self.id).ok_or_else(|| {
            RedirectError::redirect(
                name,
                "claim stream",
                io::Error::new(
                    io::ErrorKind::ResourceBusy,
                    format!("descriptor {} is already redirected by another record", fd),
                ),
            )
        })?;

        let (read_end, write_end) =
            target::pipe().map_err(|e| RedirectError::redirect(name, "create pipe", e))?;

        // Output buffered before the switch still belongs to the console.
        self.target
            .flush()
            .map_err(|e| RedirectError::redirect(name, "flush stream", e))?;

        let saved = self
            .target
            .get_handle()
            .map_err(|e| RedirectError::redirect(name, "save handle", e))?;

        let binding = StreamBinding::bind(self.target.clone(), saved, write_end.as_fd())
            .map_err(|e| RedirectError::redirect(name, "rebind stream", e))?;

        let cancel = Arc::new(
            CancelSignal::new().map_err(|e| RedirectError::redirect(name, "create signal", e))?,
        );

        let console = match self.mode {
            Mode::Duplicate => Some(File::from(
                binding
                    .saved()
                    .try_clone_to_owned()
                    .map_err(|e| RedirectError::redirect(name, "open console", e))?,
            )),
            Mode::Redirect => None,
        };

        let reader = PipeReader::new(
            File::from(read_end),
            cancel.clone(),
            Dispatcher::new(self.mode, console, self.sink.clone()),
            self.config.buffer_capacity,
        );
        #[cfg(test)]
        let reader = reader.with_fault_hook(self.fail_next_read.clone());

        let shared = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("stdredirect-{}", name))
            .spawn(move || shared.reader_main(reader, generation))
            .map_err(|e| RedirectError::redirect(name, "spawn reader", e))?;

        Ok(ActiveRedirect {
            generation,
            binding,
            write_end,
            cancel,
            reader: Some(handle),
            claim,
        })
    }

    /// Publish a started redirection. Caller holds the transition lock.
    ///
    /// A reader that failed before this point is torn down here instead.
    fn finish_activation(&self, active: ActiveRedirect) -> Result<()> {
        let name = self.target.name();
        let generation = active.generation;

        {
            let mut record = self.record();
            record.activating = None;
            if record
                .reader_failed
                .take_if(|failed| *failed == generation)
                .is_none()
            {
                record.active = Some(active);
                record.state = LifecycleState::Active;
                record.last_error = ErrorKind::NoError;
                drop(record);
                tracing::debug!(
                    "Redirected {} ({:?}, {} byte chunks)",
                    name,
                    self.mode,
                    self.config.chunk_limit()
                );
                return Ok(());
            }
        }

        // Nothing drains the pipe any more, so no flush.
        let teardown = self.teardown(active, false);
        tracing::warn!("Reader thread for {} failed during activation", name);
        self.settle(teardown, true)
    }

    fn deactivate_locked(&self) -> Result<()> {
        let name = self.target.name();

        let (active, reader_fault) = {
            let mut record = self.record();
            match record.state {
                LifecycleState::Invalid => {
                    return Err(RedirectError::unredirect(
                        name,
                        "record is invalid; only destroy is allowed",
                    ));
                }
                LifecycleState::Created | LifecycleState::Inactive => return Ok(()),
                LifecycleState::Active => {}
            }
            let active = record.active.take();
            let reader_fault = match &active {
                Some(active) => record
                    .reader_failed
                    .take_if(|failed| *failed == active.generation)
                    .is_some(),
                None => false,
            };
            (active, reader_fault)
        };

        let Some(active) = active else {
            self.record().state = LifecycleState::Inactive;
            return Ok(());
        };

        let teardown = self.teardown(active, !reader_fault);
        self.settle(teardown, reader_fault)
    }

    /// The deactivation sequence. Runs every step even after a failure so the
    /// process ends up as close to normal as possible.
    ///
    /// `flush` is false once the reader is known to be dead: nothing drains
    /// the pipe, so pushing buffered output into it could block forever.
    fn teardown(&self, active: ActiveRedirect, flush: bool) -> Teardown {
        let ActiveRedirect {
            binding,
            write_end,
            cancel,
            reader,
            ..
        } = active;
        let mut failures = Vec::new();
        let mut reader_failed = false;

        if flush {
            if let Err(e) = self.target.flush() {
                failures.push(format!("flush: {}", e));
            }
        }

        if let Err(e) = binding.restore() {
            failures.push(format!("restore handle: {}", e));
        }

        // Last write end gone: the reader sees EOF once the pipe is empty.
        drop(write_end);

        if let Err(e) = cancel.set() {
            failures.push(format!("signal reader: {}", e));
        }

        if let Some(handle) = reader {
            let timeout = self.config.teardown_timeout;
            match wait_for_exit(handle, timeout) {
                Some(Ok(ReaderExit::Failed)) => reader_failed = true,
                Some(Ok(_)) => {}
                Some(Err(_)) => failures.push("reader thread panicked".to_string()),
                None => {
                    failures.push(format!("reader thread still running after {:?}", timeout))
                }
            }
        }

        if flush {
            if let Err(e) = self.target.flush() {
                failures.push(format!("reattach console: {}", e));
            }
        }

        if !failures.is_empty() {
            Teardown::Broken(failures.join("; "))
        } else if reader_failed {
            Teardown::ReaderFailed
        } else {
            Teardown::Clean
        }
    }

    /// Record the outcome of a teardown. `reader_fault` is set when the
    /// reader was already known to have failed before the teardown began.
    fn settle(&self, teardown: Teardown, reader_fault: bool) -> Result<()> {
        let name = self.target.name();

        match teardown {
            Teardown::Clean if !reader_fault => {
                self.record().state = LifecycleState::Inactive;
                tracing::debug!("Restored {}", name);
                Ok(())
            }
            Teardown::Clean | Teardown::ReaderFailed => {
                {
                    let mut record = self.record();
                    record.state = LifecycleState::Inactive;
                    record.last_error = ErrorKind::Thread;
                }
                tracing::debug!("Restored {} after its reader failed", name);
                Err(RedirectError::thread(
                    name,
                    io::Error::other("reader thread reported failure"),
                ))
            }
            Teardown::Broken(reason) => {
                {
                    let mut record = self.record();
                    record.state = LifecycleState::Invalid;
                    record.last_error = ErrorKind::Unredirect;
                }
                tracing::error!("Failed to restore {}: {}", name, reason);
                console::diagnostic(&format!("failed to restore {}: {}", name, reason));
                Err(RedirectError::unredirect(name, reason))
            }
        }
    }

    fn reader_main(self: Arc<Self>, mut reader: PipeReader, generation: u64) -> ReaderExit {
        match reader.run() {
            Ok(exit) => exit,
            Err(err) => {
                // `reader` still holds the read end here, so writers never see
                // a closed pipe before the stream is handed back.
                self.reader_failed(generation, err);
                ReaderExit::Failed
            }
        }
    }

    fn reader_failed(&self, generation: u64, err: io::Error) {
        let name = self.target.name();

        {
            let mut record = self.record();
            record.reader_failed = Some(generation);
            record.last_error = ErrorKind::Thread;
        }

        // Either this thread gets the transition lock, or whoever holds it
        // takes the failure over (activation and deactivation both check).
        let _transition = loop {
            match self.transition.try_lock() {
                Ok(guard) => break guard,
                Err(TryLockError::Poisoned(poisoned)) => break poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    let pending = {
                        let record = self.record();
                        record.reader_failed == Some(generation) && record.owns(generation)
                    };
                    if !pending {
                        tracing::error!("Reader thread for {} failed: {}", name, err);
                        return;
                    }
                    thread::sleep(JOIN_POLL_INTERVAL);
                }
            }
        };

        let active = {
            let mut record = self.record();
            let still_pending = record
                .reader_failed
                .take_if(|failed| *failed == generation)
                .is_some();
            if still_pending {
                record
                    .active
                    .take_if(|active| active.generation == generation)
            } else {
                None
            }
        };

        let Some(mut active) = active else {
            tracing::error!("Stale reader thread for {} failed: {}", name, err);
            return;
        };

        // That handle is this thread; dropping it detaches instead of joining.
        active.reader.take();
        let teardown = self.teardown(active, false);

        // Logged only now: the stream is no longer pointing at a pipe nobody drains.
        tracing::error!("Reader thread for {} failed, tearing down: {}", name, err);
        let _ = self.settle(teardown, true);
    }
}

/// Wait up to `timeout` for the reader to finish. `None` means it is still
/// running; the handle is dropped and the thread left detached.
fn wait_for_exit(
    handle: JoinHandle<ReaderExit>,
    timeout: Duration,
) -> Option<thread::Result<ReaderExit>> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }
    Some(handle.join())
}
