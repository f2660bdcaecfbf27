//! The multi-session shell.
//!
//! - **session**: one interpreter context and its state machine
//! - **registry**: process-wide list of live sessions and focus lookup
//! - **runtime**: services shared by every session (console, registry, pool)
//! - **batch**: runs a list of scripts through forked sessions
//! - **prompt**: prompt escape expansion
//! - **preload**: `preload.conf` aliases and preload scripts
//! - **link**: archives linked into the library path
//!
//! # Architecture
//!
//! ```text
//! Runtime
//! ├── SessionRegistry (live sessions, focus lookup)
//! ├── Console (out/err FIFO + input LIFO stream services)
//! ├── LanguageRegistry / Preload
//! └── CompilePool
//!
//! Session (one thread each)
//! ├── task queue (drained before every main-task iteration)
//! ├── main task: Interactive | Script | Compile | Batch
//! └── focus lock (fair, one permit)
//! ```

pub mod batch;
pub mod exit;
pub mod focus;
pub mod link;
pub mod preload;
pub mod prompt;
pub mod registry;
pub mod runtime;
pub mod session;

use std::io;
use std::thread::ThreadId;

use thiserror::Error;

pub use runtime::Runtime;
pub use session::{MainTask, Session};

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("necromancer alert: session '{0}' has already exited")]
    Necromancer(String),

    #[error("session '{0}' is already initialized for '{1}'")]
    AlreadyStarted(String, String),

    #[error("session '{0}' has not started")]
    NotStarted(String),

    #[error("session index {index} is out of range (0..{len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("session '{name}' runs on {owner:?}, not {caller:?}")]
    WrongThread {
        name: String,
        owner: ThreadId,
        caller: ThreadId,
    },

    #[error("session '{0}' cannot wait for its own exit")]
    SelfWait(String),

    #[error("refusing to block the UI thread waiting for session '{0}'")]
    UiThreadBlocked(String),

    #[error("session '{0}' already has an exit callback")]
    CallbackAlreadySet(String),

    #[error("no script engine for language '{0}'")]
    UnknownLanguage(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ShellError {
    /// Programmer errors: the call was made in a state that forbids it
    pub fn is_illegal_state(&self) -> bool {
        matches!(
            self,
            ShellError::Necromancer(_)
                | ShellError::AlreadyStarted(..)
                | ShellError::NotStarted(_)
                | ShellError::WrongThread { .. }
                | ShellError::SelfWait(_)
                | ShellError::UiThreadBlocked(_)
                | ShellError::CallbackAlreadySet(_)
        )
    }

    /// The caller passed a value outside the accepted range
    pub fn is_illegal_argument(&self) -> bool {
        matches!(
            self,
            ShellError::IndexOutOfRange { .. } | ShellError::UnknownLanguage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ShellError>;
