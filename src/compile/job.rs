//! Long-running builds with throttled progress and one terminal notification.
//!
//! A [`CompileJob`] wraps a [`Compile`] implementation. The job moves
//! `Created -> Running -> Succeeded | Failed | Aborted` and notifies its
//! [`CompileListener`] exactly once when it reaches a terminal state.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Minimum time between two progress flushes
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(340);

#[derive(Error, Debug)]
pub enum JobError {
    #[error("job was cancelled")]
    Cancelled,
}

/// One progress report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub title: String,
    pub message: String,
    pub value: Option<u64>,
    pub max: Option<u64>,
    /// Last report of the job
    pub terminal: bool,
}

impl Progress {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            value: None,
            max: None,
            terminal: false,
        }
    }

    pub fn is_determinate(&self) -> bool {
        self.value.is_some() && self.max.is_some()
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.title, self.message)?;
        if let (Some(value), Some(max)) = (self.value, self.max) {
            write!(f, " ({}/{})", value, max)?;
        }
        Ok(())
    }
}

/// Receives a job's progress and its single terminal outcome
pub trait CompileListener: Send + Sync {
    /// The build itself failed
    fn fail(&self, _error: &anyhow::Error) {}
    /// The job ended with an error that `fail` did not already report
    fn abort(&self, _error: &anyhow::Error) {}
    fn succeed(&self) {}
    fn status(&self, _batch: &[Progress]) {}
}

pub struct NoopListener;

impl CompileListener for NoopListener {}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    Aborted,
}

/// Buffers progress until the flush interval has passed
pub struct Throttle {
    interval: Duration,
    last_flush: Option<Instant>,
    pending: Vec<Progress>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_flush: None,
            pending: Vec::new(),
        }
    }

    /// Queue `progress`; returns the batch to deliver if a flush is due
    pub fn offer(&mut self, progress: Progress) -> Option<Vec<Progress>> {
        self.pending.push(progress);
        let due = self
            .last_flush
            .map_or(true, |last| last.elapsed() >= self.interval);
        if due {
            Some(self.drain())
        } else {
            None
        }
    }

    /// Everything buffered, regardless of the interval
    pub fn drain(&mut self) -> Vec<Progress> {
        self.last_flush = Some(Instant::now());
        std::mem::take(&mut self.pending)
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Handed to [`Compile::build`] for reporting and cancellation checks
pub struct JobContext<'a> {
    title: &'a str,
    throttle: &'a Mutex<Throttle>,
    listener: &'a dyn CompileListener,
    cancel: &'a CancelToken,
}

impl JobContext<'_> {
    /// Report progress; `determinate` is `(value, max)`
    pub fn post_update(&self, message: impl Into<String>, determinate: Option<(u64, u64)>) {
        let mut progress = Progress::new(self.title, message);
        if let Some((value, max)) = determinate {
            progress.value = Some(value);
            progress.max = Some(max);
        }
        let batch = self.throttle.lock().offer(progress);
        if let Some(batch) = batch {
            self.listener.status(&batch);
        }
    }

    /// Fail with [`JobError::Cancelled`] once the job has been cancelled
    pub fn checkpoint(&self) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled.into());
        }
        Ok(())
    }
}

/// The work a [`CompileJob`] performs
pub trait Compile: Send {
    type Output: Send;

    fn title(&self) -> String;

    fn build(&mut self, ctx: &JobContext<'_>) -> anyhow::Result<Self::Output>;

    /// Status shown when the build succeeds
    fn done_message(&self, output: &Self::Output) -> String;

    /// Status shown when the job ends with an error
    fn abort_message(&self, error: &anyhow::Error) -> String {
        format!("aborted: {}", error)
    }
}

/// Runs a [`Compile`] once and reports its outcome exactly once
pub struct CompileJob<C: Compile> {
    compile: C,
    title: String,
    listener: Arc<dyn CompileListener>,
    throttle: Mutex<Throttle>,
    cancel: CancelToken,
    started: bool,
    /// The error was already reported through `fail`
    failed_in_build: bool,
    error: Option<anyhow::Error>,
    output: Option<C::Output>,
    outcome: Option<Outcome>,
}

impl<C: Compile> CompileJob<C> {
    pub fn new(compile: C) -> Self {
        let title = compile.title();
        Self {
            compile,
            title,
            listener: Arc::new(NoopListener),
            throttle: Mutex::new(Throttle::new(DEFAULT_INTERVAL)),
            cancel: CancelToken::default(),
            started: false,
            failed_in_build: false,
            error: None,
            output: None,
            outcome: None,
        }
    }

    pub fn set_listener(&mut self, listener: Arc<dyn CompileListener>) {
        self.listener = listener;
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the build on the calling thread. A second call returns the
    /// first call's outcome without building again.
    pub fn run(&mut self) -> Outcome {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        if self.started {
            return self.done();
        }
        self.started = true;
        debug!("Compile job '{}' running", self.title);

        let result = if self.cancel.is_cancelled() {
            Err(JobError::Cancelled.into())
        } else {
            let ctx = JobContext {
                title: &self.title,
                throttle: &self.throttle,
                listener: self.listener.as_ref(),
                cancel: &self.cancel,
            };
            let compile = &mut self.compile;
            panic::catch_unwind(AssertUnwindSafe(|| compile.build(&ctx)))
                .unwrap_or_else(|_| Err(anyhow!("build panicked")))
        };

        match result {
            Ok(output) => self.output = Some(output),
            Err(error) => {
                let cancelled = self.cancel.is_cancelled() || error.is::<JobError>();
                if !cancelled {
                    self.listener.fail(&error);
                    self.failed_in_build = true;
                }
                self.error = Some(error);
            }
        }
        self.done()
    }

    fn done(&mut self) -> Outcome {
        if let Some(outcome) = self.outcome {
            return outcome;
        }

        let (outcome, message) = match (&self.error, &self.output) {
            (Some(error), _) if self.failed_in_build => (Outcome::Failed, self.compile.abort_message(error)),
            (Some(error), _) => (Outcome::Aborted, self.compile.abort_message(error)),
            (None, Some(output)) => (Outcome::Succeeded, self.compile.done_message(output)),
            (None, None) => (Outcome::Aborted, "aborted".to_string()),
        };
        self.outcome = Some(outcome);

        let mut batch = self.throttle.lock().drain();
        batch.push(Progress {
            terminal: true,
            ..Progress::new(self.title.as_str(), message)
        });
        self.listener.status(&batch);

        match outcome {
            Outcome::Succeeded => {
                info!("Compile job '{}' succeeded", self.title);
                self.listener.succeed();
            }
            Outcome::Failed => warn!("Compile job '{}' failed", self.title),
            Outcome::Aborted => {
                warn!("Compile job '{}' aborted", self.title);
                let error = self
                    .error
                    .take()
                    .unwrap_or_else(|| anyhow!("job ended without output"));
                self.listener.abort(&error);
                self.error = Some(error);
            }
        }
        outcome
    }
}

/// Inspection for tests; callers otherwise learn the result from the listener
#[cfg(test)]
impl<C: Compile> CompileJob<C> {
    pub fn with_interval(self, interval: Duration) -> Self {
        *self.throttle.lock() = Throttle::new(interval);
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        self.error.as_ref()
    }

    pub fn output(&self) -> Option<&C::Output> {
        self.output.as_ref()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }
}

/// Object-safe view of a job, used by the pool and by compile units
pub trait Job: Send {
    fn title(&self) -> String;
    fn set_listener(&mut self, listener: Arc<dyn CompileListener>);
    fn cancel_token(&self) -> CancelToken;
    fn run(&mut self) -> Outcome;
}

impl<C: Compile> Job for CompileJob<C> {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn set_listener(&mut self, listener: Arc<dyn CompileListener>) {
        CompileJob::set_listener(self, listener);
    }

    fn cancel_token(&self) -> CancelToken {
        CompileJob::cancel_token(self)
    }

    fn run(&mut self) -> Outcome {
        CompileJob::run(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        fails: Mutex<usize>,
        aborts: Mutex<usize>,
        succeeds: Mutex<usize>,
        batches: Mutex<Vec<Vec<Progress>>>,
        errors: Mutex<Vec<String>>,
    }

    impl CompileListener for Recorder {
        fn fail(&self, error: &anyhow::Error) {
            *self.fails.lock() += 1;
            self.errors.lock().push(format!("{:#}", error));
        }
        fn abort(&self, _error: &anyhow::Error) {
            *self.aborts.lock() += 1;
        }
        fn succeed(&self) {
            *self.succeeds.lock() += 1;
        }
        fn status(&self, batch: &[Progress]) {
            self.batches.lock().push(batch.to_vec());
        }
    }

    impl Recorder {
        fn counts(&self) -> (usize, usize, usize) {
            (*self.fails.lock(), *self.aborts.lock(), *self.succeeds.lock())
        }
    }

    type Step = Box<dyn FnMut(&JobContext<'_>) -> anyhow::Result<u32> + Send>;

    struct Scripted(Step);

    impl Compile for Scripted {
        type Output = u32;

        fn title(&self) -> String {
            "test".to_string()
        }

        fn build(&mut self, ctx: &JobContext<'_>) -> anyhow::Result<u32> {
            (self.0)(ctx)
        }

        fn done_message(&self, output: &u32) -> String {
            format!("built {}", output)
        }
    }

    fn job(step: Step) -> (CompileJob<Scripted>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut job = CompileJob::new(Scripted(step));
        job.set_listener(recorder.clone());
        (job, recorder)
    }

    #[test]
    fn test_success_notifies_once() {
        let (mut job, rec) = job(Box::new(|_: &JobContext<'_>| Ok(7)));
        assert_eq!(job.run(), Outcome::Succeeded);
        assert_eq!(job.run(), Outcome::Succeeded);
        assert_eq!(rec.counts(), (0, 0, 1));

        let batches = rec.batches.lock();
        assert_eq!(batches.len(), 1);
        let last = batches[0].last().unwrap();
        assert!(last.terminal);
        assert_eq!(last.message, "built 7");
        assert_eq!(job.output(), Some(&7));
    }

    #[test]
    fn test_build_failure_is_not_also_aborted() {
        let (mut job, rec) = job(Box::new(|_: &JobContext<'_>| anyhow::bail!("syntax error")));
        assert_eq!(job.run(), Outcome::Failed);
        assert_eq!(rec.counts(), (1, 0, 0));
        assert!(job.error().unwrap().to_string().contains("syntax error"));
        let batches = rec.batches.lock();
        assert!(batches.last().unwrap().last().unwrap().terminal);
    }

    #[test]
    fn test_io_failure_keeps_cause_chain() {
        let (mut job, rec) = job(Box::new(|_: &JobContext<'_>| {
            let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
            Err(anyhow::Error::new(io).context("writing glyph table"))
        }));
        assert_eq!(job.run(), Outcome::Failed);
        assert_eq!(rec.counts(), (1, 0, 0));
        assert_eq!(*rec.errors.lock(), vec!["writing glyph table: disk full"]);

        let terminal = rec.batches.lock().iter().flatten().filter(|p| p.terminal).count();
        assert_eq!(terminal, 1);
        assert!(job.error().unwrap().root_cause().is::<std::io::Error>());
    }

    #[test]
    fn test_cancel_aborts() {
        let (mut job, rec) = job(Box::new(|ctx: &JobContext<'_>| {
            ctx.checkpoint()?;
            Ok(1)
        }));
        job.cancel_token().cancel();
        assert_eq!(job.run(), Outcome::Aborted);
        assert_eq!(rec.counts(), (0, 1, 0));
        assert!(job.error().unwrap().is::<JobError>());
    }

    #[test]
    fn test_cancel_during_build() {
        let token = Arc::new(Mutex::new(None::<CancelToken>));
        let seen = token.clone();
        let (mut job, rec) = job(Box::new(move |ctx: &JobContext<'_>| {
            if let Some(token) = seen.lock().as_ref() {
                token.cancel();
            }
            ctx.checkpoint()?;
            Ok(1)
        }));
        *token.lock() = Some(job.cancel_token());
        assert_eq!(job.run(), Outcome::Aborted);
        assert_eq!(rec.counts(), (0, 1, 0));
    }

    #[test]
    fn test_panicking_build_fails() {
        let (mut job, rec) = job(Box::new(|_: &JobContext<'_>| panic!("boom")));
        assert_eq!(job.run(), Outcome::Failed);
        assert_eq!(rec.counts(), (1, 0, 0));
    }

    #[test]
    fn test_rapid_updates_are_batched() {
        let (job, rec) = job(Box::new(|ctx: &JobContext<'_>| {
            for i in 0..100 {
                ctx.post_update(format!("step {}", i), Some((i, 100)));
            }
            Ok(100)
        }));
        let mut job = job.with_interval(Duration::from_secs(60));
        job.run();

        let batches = rec.batches.lock();
        // One immediate flush during the burst, then the terminal flush
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        let delivered: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(delivered, 101);
        assert_eq!(batches[1][98].message, "step 99");
    }

    #[test]
    fn test_throttle_flushes_after_interval() {
        let mut throttle = Throttle::new(Duration::from_millis(40));
        assert_eq!(throttle.offer(Progress::new("t", "0")).map(|b| b.len()), Some(1));
        for i in 1..=10 {
            assert!(throttle.offer(Progress::new("t", i.to_string())).is_none());
        }
        assert_eq!(throttle.pending(), 10);
        thread::sleep(Duration::from_millis(60));
        let batch = throttle.offer(Progress::new("t", "11")).unwrap();
        assert_eq!(batch.len(), 11);
        assert_eq!(throttle.pending(), 0);
    }

    #[test]
    fn test_progress_display() {
        let mut p = Progress::new("raw a.txt", "copying");
        assert_eq!(p.to_string(), "[raw a.txt] copying");
        p.value = Some(3);
        p.max = Some(10);
        assert!(p.is_determinate());
        assert_eq!(p.to_string(), "[raw a.txt] copying (3/10)");
    }
}
