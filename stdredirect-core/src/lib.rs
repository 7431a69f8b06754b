//! # stdredirect-core
//!
//! Captures everything a process writes to stdout or stderr at the
//! descriptor level and delivers it, in bounded chunks, to a callback.
//! The stream's original destination is remembered and can be restored at
//! any time. Code that already prints does not need to change.
//!
//! ```no_run
//! use stdredirect_core::{Chunk, Mode, Redirector, StdStream};
//!
//! let redirector = Redirector::create(
//!     StdStream::Output,
//!     |chunk: &Chunk<'_>| eprint!("{}", chunk.to_string_lossy()),
//!     Mode::Redirect,
//! )?;
//! redirector.activate()?;
//! println!("this goes to the callback");
//! redirector.deactivate()?;
//! println!("this goes to the console again");
//! # Ok::<(), stdredirect_core::RedirectError>(())
//! ```
//!
//! Unix only: the engine works on file descriptors with `pipe`, `dup2` and `poll`.

#![cfg(unix)]

pub mod config;
pub mod console;
pub mod error;
pub mod lifecycle;
pub mod record;
pub mod registry;
pub mod sink;
pub mod target;

mod dispatch;
mod reader;
mod signal;

pub use config::RedirectConfig;
pub use console::ConsoleWriter;
pub use error::{ErrorKind, RedirectError, Result};
pub use lifecycle::Redirector;
pub use record::{LifecycleState, Mode};
pub use registry::Registry;
pub use sink::{Chunk, ChunkSink, DebuggerSink, WriterSink};
pub use target::{FdStream, StdStream, StreamTarget};
