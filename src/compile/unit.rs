//! Compile jobs driving a session.
//!
//! A [`CompileUnit`] runs its job on the session's own thread and turns the
//! outcome into the session's exit code.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossterm::queue;
use crossterm::terminal::SetTitle;
use parking_lot::Mutex;
use tracing::debug;

use super::job::{CancelToken, CompileListener, Job, Outcome, Progress};
use crate::shell::exit::ReservedExitCode;
use crate::shell::Session;

/// Receives every progress batch, e.g. for a progress bar
pub trait ProgressMonitor: Send + Sync {
    fn progress(&self, batch: &[Progress]);
}

impl From<Outcome> for ReservedExitCode {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => ReservedExitCode::Success,
            Outcome::Failed => ReservedExitCode::CompileFail,
            Outcome::Aborted => ReservedExitCode::CompileAbort,
        }
    }
}

/// Shows the newest progress report in the terminal's title bar
pub struct TitleMonitor {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl TitleMonitor {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Monitor on standard error, when it is a terminal
    pub fn stderr() -> Option<Self> {
        io::stderr()
            .is_terminal()
            .then(|| Self::new(Box::new(io::stderr())))
    }
}

fn title_text(progress: &Progress) -> String {
    match (progress.value, progress.max) {
        (Some(value), Some(max)) if max > 0 && !progress.terminal => {
            format!("[{}] {}%", progress.title, value.min(max) * 100 / max)
        }
        _ => format!("[{}] {}", progress.title, progress.message),
    }
}

impl ProgressMonitor for TitleMonitor {
    fn progress(&self, batch: &[Progress]) {
        let Some(latest) = batch.last() else { return };
        let mut writer = self.writer.lock();
        let written = queue!(writer, SetTitle(title_text(latest))).and_then(|_| writer.flush());
        if let Err(e) = written {
            debug!("Cannot update terminal title: {}", e);
        }
    }
}

/// Reports a job's progress and outcome through a session
pub struct SessionListener {
    session: Weak<Session>,
    monitor: Option<Arc<dyn ProgressMonitor>>,
    /// Print determinate progress too
    chatty: bool,
    /// Exit the session when the job ends
    exit_on_done: bool,
    failed: AtomicBool,
}

impl SessionListener {
    /// Listener that exits `session` with the job's outcome
    pub fn attached(session: &Session, monitor: Option<Arc<dyn ProgressMonitor>>) -> Self {
        Self {
            session: session.weak(),
            monitor,
            chatty: session.runtime().settings.compile.chatty,
            exit_on_done: true,
            failed: AtomicBool::new(false),
        }
    }

    /// Listener that only echoes progress and errors
    pub fn echo(session: &Session) -> Self {
        Self {
            exit_on_done: false,
            ..Self::attached(session, None)
        }
    }

    fn live_session(&self) -> Option<Arc<Session>> {
        self.session.upgrade().filter(|s| s.is_live())
    }

    fn exit(&self, code: ReservedExitCode) {
        if !self.exit_on_done {
            return;
        }
        if let Some(session) = self.session.upgrade() {
            if let Err(e) = session.exit_reserved(code) {
                debug!("Compile exit for '{}' ignored: {}", session.name(), e);
            }
        }
    }
}

impl CompileListener for SessionListener {
    fn fail(&self, error: &anyhow::Error) {
        self.failed.store(true, Ordering::SeqCst);
        if let Some(session) = self.live_session() {
            session.report_error(error);
        }
    }

    fn abort(&self, error: &anyhow::Error) {
        match self.live_session() {
            Some(session) => session.report_error(error),
            None => debug!("Compile job aborted after its session exited: {:#}", error),
        }
        self.exit(ReservedExitCode::CompileAbort);
    }

    fn succeed(&self) {
        self.exit(ReservedExitCode::Success);
    }

    fn status(&self, batch: &[Progress]) {
        if let Some(monitor) = &self.monitor {
            monitor.progress(batch);
        }
        if let Some(session) = self.live_session() {
            for progress in batch {
                if self.chatty || !progress.is_determinate() {
                    let _ = session.out_line(&progress.to_string());
                }
            }
        }
        if self.failed.load(Ordering::SeqCst) && batch.iter().any(|p| p.terminal) {
            self.exit(ReservedExitCode::CompileFail);
        }
    }
}

/// A job bound to the session that runs it
pub struct CompileUnit {
    job: Box<dyn Job>,
    monitor: Option<Arc<dyn ProgressMonitor>>,
}

impl CompileUnit {
    pub fn new(job: impl Job + 'static) -> Self {
        Self {
            job: Box::new(job),
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn ProgressMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.job.cancel_token()
    }

    /// Route the job's notifications to `session`
    pub fn attach(&mut self, session: &Session) {
        let listener = SessionListener::attached(session, self.monitor.clone());
        self.job.set_listener(Arc::new(listener));
    }

    /// Run to completion on the calling (session) thread
    pub fn run(&mut self, session: &Session) -> Outcome {
        self.attach(session);
        self.job.run()
    }
}
