//! Redirection record: the state describing one redirection and the OS
//! resources it owns while active.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use once_cell::sync::Lazy;

use crate::console;
use crate::error::ErrorKind;
use crate::reader::ReaderExit;
use crate::signal::CancelSignal;
use crate::target::StreamTarget;

/// Where captured output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// The console is detached; only the sink sees output.
    #[default]
    Redirect,
    /// The console keeps receiving output; the sink gets a copy.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    Active,
    Inactive,
    /// A teardown failed. Only destruction is allowed from here.
    Invalid,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::Active => "active",
            LifecycleState::Inactive => "inactive",
            LifecycleState::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub(crate) struct Record {
    pub state: LifecycleState,
    pub last_error: ErrorKind,
    /// Present exactly while `state == Active`.
    pub active: Option<ActiveRedirect>,
    /// Bumped on every activation so a late reader cannot tear down its successor.
    pub generation: u64,
    /// Generation whose activation is still being built under the transition lock.
    pub activating: Option<u64>,
    /// Generation whose reader failed and is waiting for someone to tear it down.
    pub reader_failed: Option<u64>,
}

impl Record {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Created,
            last_error: ErrorKind::NoError,
            active: None,
            generation: 0,
            activating: None,
            reader_failed: None,
        }
    }

    /// Whether the redirection started as `generation` is still live or being built.
    pub fn owns(&self, generation: u64) -> bool {
        self.activating == Some(generation)
            || self
                .active
                .as_ref()
                .is_some_and(|active| active.generation == generation)
    }
}

/// Everything a live redirection owns. Dropping it releases every descriptor
/// and puts the stream back, so a half-built activation unwinds on its own.
pub(crate) struct ActiveRedirect {
    pub generation: u64,
    pub binding: StreamBinding,
    pub write_end: OwnedFd,
    pub cancel: Arc<CancelSignal>,
    pub reader: Option<JoinHandle<ReaderExit>>,
    /// Dropped last, once the stream is back on its original descriptor.
    pub claim: StreamClaim,
}

impl fmt::Debug for ActiveRedirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveRedirect")
            .field("generation", &self.generation)
            .field("binding", &self.binding)
            .field("write_end", &self.write_end.as_raw_fd())
            .field("reader", &self.reader.is_some())
            .field("claim", &self.claim)
            .finish()
    }
}

/// Descriptor -> owner of the redirection currently bound to it.
static CLAIMS: Lazy<Mutex<HashMap<RawFd, u64>>> = Lazy::new(|| Mutex::new(HashMap::new()));

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// A fresh owner id for a record.
pub(crate) fn next_owner() -> u64 {
    NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
}

/// Exclusive hold on a descriptor for the length of one activation.
///
/// Two records redirecting the same descriptor would each save the other's
/// pipe as "the original" and leave the stream on a dead pipe. Released on drop.
#[derive(Debug)]
pub(crate) struct StreamClaim {
    fd: RawFd,
    owner: u64,
}

impl StreamClaim {
    /// `None` when another record already has `fd` redirected.
    pub fn acquire(fd: RawFd, owner: u64) -> Option<Self> {
        let mut claims = CLAIMS.lock().unwrap_or_else(PoisonError::into_inner);
        match claims.entry(fd) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(owner);
                Some(Self { fd, owner })
            }
        }
    }
}

impl Drop for StreamClaim {
    fn drop(&mut self) {
        let mut claims = CLAIMS.lock().unwrap_or_else(PoisonError::into_inner);
        if claims.get(&self.fd) == Some(&self.owner) {
            claims.remove(&self.fd);
        }
    }
}

/// A stream rebound to a new descriptor, remembering the original.
/// Restores the original on drop unless [`restore`](Self::restore) already did.
pub(crate) struct StreamBinding {
    target: Arc<dyn StreamTarget>,
    saved: OwnedFd,
    bound: bool,
}

impl StreamBinding {
    pub fn bind(
        target: Arc<dyn StreamTarget>,
        saved: OwnedFd,
        to: BorrowedFd<'_>,
    ) -> std::io::Result<Self> {
        target.set_handle(to)?;
        Ok(Self {
            target,
            saved,
            bound: true,
        })
    }

    /// The stream's original destination.
    pub fn saved(&self) -> BorrowedFd<'_> {
        self.saved.as_fd()
    }

    pub fn restore(mut self) -> std::io::Result<()> {
        self.bound = false;
        self.target.set_handle(self.saved.as_fd())
    }
}

impl fmt::Debug for StreamBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBinding")
            .field("target", &self.target.name())
            .field("saved", &self.saved.as_raw_fd())
            .field("bound", &self.bound)
            .finish()
    }
}

impl Drop for StreamBinding {
    fn drop(&mut self) {
        if !self.bound {
            return;
        }
        if let Err(e) = self.target.set_handle(self.saved.as_fd()) {
            tracing::error!("Rollback of {} failed: {}", self.target.name(), e);
            console::diagnostic(&format!(
                "rollback failed, {} may still be redirected: {}",
                self.target.name(),
                e
            ));
        }
    }
}
