//! A session: one interpreter context driven by its own thread.
//!
//! The loop alternates between draining queued tasks and running one
//! iteration of the main task until the session is disposed. Only the
//! session's own thread touches its interpreter; other threads talk to it by
//! scheduling tasks.
//!
//! Focus is the right to read from the shared input. Each session owns a
//! one-permit [`FairSemaphore`]; a focused session's semaphore holds its
//! permit, every other live session's semaphore is drained. Handing focus
//! over means taking your own permit and releasing the target's.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Weak};
use std::thread;

use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::batch::BatchRunner;
use super::exit::{describe, ReservedExitCode};
use super::focus::FairSemaphore;
use super::link::LinkError;
use super::prompt::{PromptContext, PromptFormatter};
use super::registry::Removal;
use super::runtime::Runtime;
use super::{Result, ShellError};
use crate::compile::job::{CancelToken, CompileJob, Outcome};
use crate::compile::pool::JobHandle;
use crate::compile::target::{find_target, FileCompile, Options};
use crate::compile::unit::{CompileUnit, SessionListener};
use crate::console::markup::{Markup, Style};
use crate::console::ReadOutcome;
use crate::lang::{Interpreter, InterpreterFactory, ScriptError, ShellHost};

/// Called once with the session's exit code
pub type ExitCallback = Box<dyn FnOnce(i32) + Send>;

/// Work queued onto a session's thread; `Some` results are printed
pub type Task = Box<dyn FnOnce(&Session) -> anyhow::Result<Option<String>> + Send>;

/// What a script-driven session does once the script finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterScript {
    /// Keep going interactively
    Interactive,
    /// Exit with success
    Exit,
}

/// The strategy run between task drains
pub enum MainTask {
    Interactive,
    Script {
        reader: Box<dyn BufRead + Send>,
        source_name: String,
        then: AfterScript,
    },
    Compile(CompileUnit),
    Batch(BatchRunner),
}

/// Creates sessions; forked children are made by their parent's factory
pub trait SessionFactory: Send + Sync {
    fn create(&self, runtime: Arc<Runtime>, name: &str, script: Option<PathBuf>) -> Arc<Session>;
}

/// Sessions reading and writing through the runtime's console
pub struct ConsoleSessions;

impl SessionFactory for ConsoleSessions {
    fn create(&self, runtime: Arc<Runtime>, name: &str, script: Option<PathBuf>) -> Arc<Session> {
        Session::with_factory(runtime, name, script, Arc::new(ConsoleSessions))
    }
}

/// Options for [`Session::fork`]
#[derive(Default)]
pub struct ForkOptions {
    pub script: Option<PathBuf>,
    pub language: Option<String>,
    pub callback: Option<ExitCallback>,
    /// Run the callback as a task on the parent instead of on the child
    pub callback_in_parent: bool,
    pub after_script: Option<AfterScript>,
}

impl ForkOptions {
    pub fn script(path: impl Into<PathBuf>) -> Self {
        Self {
            script: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn language(language: impl Into<String>) -> Self {
        Self {
            language: Some(language.into()),
            ..Self::default()
        }
    }

    pub fn on_exit(mut self, callback: ExitCallback, in_parent: bool) -> Self {
        self.callback = Some(callback);
        self.callback_in_parent = in_parent;
        self
    }

    pub fn then(mut self, after: AfterScript) -> Self {
        self.after_script = Some(after);
        self
    }
}

struct State {
    /// Language the session was started with; set once
    mime: Option<String>,
    language: Option<Arc<dyn InterpreterFactory>>,
    owner: Option<thread::ThreadId>,
    disposed: bool,
    exit_code: Option<i32>,
    interpreter: Option<Box<dyn Interpreter>>,
    main: Option<MainTask>,
    exit_callback: Option<ExitCallback>,
    /// Cancels the compile unit while it runs as the main task
    compile_cancel: Option<CancelToken>,
    prompt: PromptFormatter,
}

pub struct Session {
    me: Weak<Session>,
    name: String,
    script: Option<PathBuf>,
    runtime: Arc<Runtime>,
    factory: Arc<dyn SessionFactory>,
    current: AtomicBool,
    focus: FairSemaphore,
    tasks: Mutex<VecDeque<Task>>,
    /// Reply channel for prompt requests; held while waiting for a line
    replies: Mutex<(SyncSender<ReadOutcome>, Receiver<ReadOutcome>)>,
    /// Background compile jobs started from this session, by index
    jobs: Mutex<Vec<JobHandle>>,
    state: Mutex<State>,
}

impl Session {
    pub fn new(runtime: Arc<Runtime>, name: &str) -> Arc<Session> {
        Self::with_factory(runtime, name, None, Arc::new(ConsoleSessions))
    }

    pub fn with_factory(
        runtime: Arc<Runtime>,
        name: &str,
        script: Option<PathBuf>,
        factory: Arc<dyn SessionFactory>,
    ) -> Arc<Session> {
        let prompt = PromptFormatter::new(runtime.settings.escape_mode);
        Arc::new_cyclic(|me| Session {
            me: me.clone(),
            name: name.to_string(),
            script,
            runtime,
            factory,
            current: AtomicBool::new(false),
            focus: FairSemaphore::new(1),
            tasks: Mutex::new(VecDeque::new()),
            replies: Mutex::new(mpsc::sync_channel(1)),
            jobs: Mutex::new(Vec::new()),
            state: Mutex::new(State {
                mime: None,
                language: None,
                owner: None,
                disposed: false,
                exit_code: None,
                interpreter: None,
                main: None,
                exit_callback: None,
                compile_cancel: None,
                prompt,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn script(&self) -> Option<&Path> {
        self.script.as_deref()
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn is_live(&self) -> bool {
        !self.state.lock().disposed
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.lock().exit_code
    }

    /// Language the session was started with
    pub fn mime(&self) -> Option<String> {
        self.state.lock().mime.clone()
    }

    pub fn index(&self) -> Option<usize> {
        self.runtime.registry.index_of(self)
    }

    pub(crate) fn weak(&self) -> Weak<Session> {
        self.me.clone()
    }

    fn arc(&self) -> Result<Arc<Session>> {
        self.me
            .upgrade()
            .ok_or_else(|| ShellError::Necromancer(self.name.clone()))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(ShellError::Necromancer(self.name.clone()))
        }
    }

    /// Replace the main task; takes effect on the next loop iteration
    pub fn set_main(&self, main: MainTask) -> Result<()> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(ShellError::Necromancer(self.name.clone()));
        }
        state.main = Some(main);
        Ok(())
    }

    pub fn set_exit_callback(&self, callback: ExitCallback) -> Result<()> {
        let mut state = self.state.lock();
        if state.disposed || state.exit_code.is_some() {
            return Err(ShellError::Necromancer(self.name.clone()));
        }
        if state.exit_callback.is_some() {
            return Err(ShellError::CallbackAlreadySet(self.name.clone()));
        }
        state.exit_callback = Some(callback);
        Ok(())
    }

    // ---- lifecycle ----

    /// Start in `language`, taking focus from the focused session
    pub fn start(&self, language: &str) -> Result<()> {
        self.start_with(language, true)
    }

    fn start_with(&self, language: &str, acquire: bool) -> Result<()> {
        self.ensure_live()?;
        let me = self.arc()?;
        let runtime = &self.runtime;

        let factory = runtime
            .languages
            .find(&runtime.preload.resolve_alias(language))
            .ok_or_else(|| ShellError::UnknownLanguage(language.to_string()))?;
        {
            let mut state = self.state.lock();
            if let Some(mime) = &state.mime {
                return Err(ShellError::AlreadyStarted(self.name.clone(), mime.clone()));
            }
            state.mime = Some(factory.language_name().to_string());
            state.language = Some(factory.clone());
        }

        // Ahead of anything queued before start
        self.tasks.lock().push_front(Box::new(move |session: &Session| {
            session.initialize(factory);
            Ok(None)
        }));

        runtime.registry.add(me.clone());
        if acquire {
            if let Some(previous) = runtime.registry.current() {
                if !Arc::ptr_eq(&previous, &me) {
                    previous.focus.acquire();
                    previous.current.store(false, Ordering::SeqCst);
                }
            }
            self.current.store(true, Ordering::SeqCst);
        } else {
            self.focus.drain();
        }

        runtime.console.start();
        let spawned = thread::Builder::new()
            .name(format!("session-{}", self.name))
            .spawn(move || me.thread_task());
        if let Err(e) = spawned {
            runtime.registry.remove(self);
            self.dispose();
            return Err(e.into());
        }
        info!(
            "Session '{}' started ({}, focus: {})",
            self.name,
            language,
            self.is_current()
        );
        Ok(())
    }

    /// Create the interpreter and run the preload script of the language
    /// actually loaded, however the session asked for it
    fn initialize(&self, factory: Arc<dyn InterpreterFactory>) {
        let mut interpreter = factory.create();
        interpreter.bind(&self.name, Arc::new(SessionHost(self.me.clone())));

        if let Some(path) = self.runtime.preload.script_for(factory.language_name()) {
            info!("Session '{}' preloading {}", self.name, path.display());
            let source_name = path.display().to_string();
            let result = fs::read_to_string(&path)
                .with_context(|| format!("cannot read preload script {}", source_name))
                .and_then(|source| interpreter.eval(&source, Some(&source_name)));
            if let Err(e) = result {
                self.report_error(&e);
            }
        }

        let interactive = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.interpreter = Some(interpreter);
            matches!(state.main, None | Some(MainTask::Interactive))
        };
        if interactive && !self.runtime.console.eof_is_final() {
            let quit = factory.method_call_syntax(&self.name, "exit", &[]);
            let _ = self.out_line(&format!(
                "{} {} ({}). Type {} to leave.",
                factory.language_name(),
                factory.language_version(),
                factory.engine_name(),
                quit
            ));
        }
    }

    fn thread_task(self: Arc<Self>) {
        self.state.lock().owner = Some(thread::current().id());
        debug!("Session '{}' loop running", self.name);
        while self.is_live() {
            self.drain_tasks();
            if !self.is_live() {
                break;
            }
            self.run_main_once();
        }
        debug!("Session '{}' loop finished", self.name);
    }

    fn check_owner(&self) -> Result<()> {
        let owner = self.state.lock().owner;
        let caller = thread::current().id();
        match owner {
            None => Err(ShellError::NotStarted(self.name.clone())),
            Some(owner) if owner == caller => Ok(()),
            Some(owner) => Err(ShellError::WrongThread {
                name: self.name.clone(),
                owner,
                caller,
            }),
        }
    }

    // ---- tasks ----

    /// Queue a task for the session's thread
    pub fn schedule(&self, task: Task) -> Result<()> {
        self.ensure_live()?;
        self.tasks.lock().push_back(task);
        Ok(())
    }

    fn drain_tasks(&self) {
        loop {
            let task = self.tasks.lock().pop_front();
            let Some(task) = task else { break };
            if let Some(Some(result)) = self.run_risk(|| task(self)) {
                let _ = self.out_line(&result);
            }
            if !self.is_live() {
                break;
            }
        }
    }

    /// Run `f`, reporting any error or panic on the error stream
    fn run_risk<T>(&self, f: impl FnOnce() -> anyhow::Result<T>) -> Option<T> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                if self.is_live() {
                    self.report_error(&e);
                } else {
                    debug!("Session '{}' error after exit: {:#}", self.name, e);
                }
                None
            }
            Err(_) => {
                error!("Session '{}' task panicked", self.name);
                if self.is_live() {
                    self.report_error(&anyhow!("internal error: task panicked"));
                }
                None
            }
        }
    }

    // ---- main task ----

    fn run_main_once(&self) {
        let main = self.state.lock().main.take().unwrap_or(MainTask::Interactive);
        match main {
            MainTask::Interactive => self.interact_once(),
            MainTask::Script {
                reader,
                source_name,
                then,
            } => {
                self.interpret(reader, &source_name);
                if self.is_live() && self.exit_code().is_none() {
                    self.after_script(then);
                }
            }
            MainTask::Compile(mut unit) => {
                self.state.lock().compile_cancel = Some(unit.cancel_token());
                let outcome = unit.run(self);
                self.state.lock().compile_cancel = None;
                debug!("Session '{}' compile unit finished: {:?}", self.name, outcome);
            }
            MainTask::Batch(runner) => {
                let code = runner.run(self);
                if self.is_live() {
                    if let Err(e) = self.do_exit(code, true) {
                        debug!("Session '{}' batch exit: {}", self.name, e);
                    }
                }
            }
        }

        let mut state = self.state.lock();
        if !state.disposed && state.main.is_none() {
            state.main = Some(MainTask::Interactive);
        }
    }

    fn interact_once(&self) {
        match self.read_statement() {
            Ok(ReadOutcome::Line(line)) => {
                if line.trim().is_empty() {
                    return;
                }
                if let Some(Some(result)) = self.run_risk(|| self.evaluate(&line)) {
                    let _ = self.out_line(&result);
                }
            }
            Ok(ReadOutcome::EndOfInput) => self.on_end_of_input(),
            Err(e) => {
                if self.is_live() {
                    self.report_error(&e.into());
                }
            }
        }
    }

    /// Read one statement, following continuation lines
    fn read_statement(&self) -> Result<ReadOutcome> {
        let continue_char = self.runtime.settings.prompt.continue_char;
        let primary = self.render_prompt(false);
        let mut statement = match self.prompt(&primary)? {
            ReadOutcome::Line(line) => line,
            ReadOutcome::EndOfInput => return Ok(ReadOutcome::EndOfInput),
        };
        while statement.ends_with(continue_char) {
            statement.pop();
            let secondary = self.render_prompt(true);
            match self.prompt(&secondary)? {
                ReadOutcome::Line(line) => {
                    statement.push('\n');
                    statement.push_str(&line);
                }
                ReadOutcome::EndOfInput => break,
            }
        }
        Ok(ReadOutcome::Line(statement))
    }

    /// Hand focus on if anyone else could use it, otherwise give up
    fn on_end_of_input(&self) {
        let len = self.runtime.registry.len();
        if len > 1 && !self.runtime.console.eof_is_final() {
            if let Some(index) = self.index() {
                match self.jump_to((index + 1) % len) {
                    Ok(()) => return,
                    Err(e) => debug!("Session '{}' auto-jump failed: {}", self.name, e),
                }
            }
        }
        if let Err(e) = self.exit_reserved(ReservedExitCode::NoInput) {
            debug!("Session '{}' no-input exit: {}", self.name, e);
        }
    }

    fn after_script(&self, then: AfterScript) {
        match then {
            AfterScript::Exit => {
                if let Err(e) = self.exit_success() {
                    debug!("Session '{}' exit after script: {}", self.name, e);
                }
            }
            AfterScript::Interactive => {
                let len = self.runtime.registry.len();
                if len > 1 && self.is_current() {
                    if let Some(index) = self.index() {
                        if let Err(e) = self.jump_to((index + 1) % len) {
                            debug!("Session '{}' jump after script: {}", self.name, e);
                        }
                    }
                }
            }
        }
    }

    /// Evaluate a whole script
    fn interpret(&self, mut reader: Box<dyn BufRead + Send>, source_name: &str) {
        let result = self.run_risk(|| {
            let mut source = String::new();
            reader
                .read_to_string(&mut source)
                .with_context(|| format!("cannot read {}", source_name))?;
            self.eval_source(&source, Some(source_name))
        });
        if let Some(Some(value)) = result {
            let _ = self.out_line(&value);
        }
    }

    /// Evaluate source on the session's own thread
    pub fn evaluate(&self, source: &str) -> anyhow::Result<Option<String>> {
        self.eval_source(source, None)
    }

    fn eval_source(&self, source: &str, source_name: Option<&str>) -> anyhow::Result<Option<String>> {
        self.check_owner()?;
        let interpreter = self.state.lock().interpreter.take();
        let Some(mut interpreter) = interpreter else {
            self.ensure_live()?;
            return Err(ShellError::NotStarted(self.name.clone()).into());
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| interpreter.eval(source, source_name)));

        let mut state = self.state.lock();
        if !state.disposed && state.interpreter.is_none() {
            state.interpreter = Some(interpreter);
        }
        drop(state);
        result.unwrap_or_else(|_| Err(anyhow!("interpreter panicked")))
    }

    // ---- input and output ----

    /// Read one line once this session has focus
    pub fn prompt(&self, text: &str) -> Result<ReadOutcome> {
        self.ensure_live()?;
        self.focus.acquire();
        let outcome = self.prompt_focused(text);
        self.focus.release();
        outcome
    }

    fn prompt_focused(&self, text: &str) -> Result<ReadOutcome> {
        // Disposal releases the focus lock to wake us; do not read for a ghost
        self.ensure_live()?;
        let replies = self.replies.lock();
        while replies.1.try_recv().is_ok() {}
        self.runtime
            .console
            .request_line(text.to_string(), replies.0.clone());
        Ok(replies.1.recv().unwrap_or(ReadOutcome::EndOfInput))
    }

    fn render_prompt(&self, secondary: bool) -> String {
        let ctx = self.prompt_context();
        let config = &self.runtime.settings.prompt;
        let mut state = self.state.lock();
        if secondary {
            state.prompt.secondary(&config.secondary, &ctx)
        } else {
            state.prompt.primary(&config.primary, &ctx)
        }
    }

    pub fn prompt_context(&self) -> PromptContext {
        let factory = self.state.lock().language.clone();
        let (language, version, engine) = match factory.as_deref() {
            Some(f) => (
                f.language_name().to_string(),
                f.language_version().to_string(),
                f.engine_name().to_string(),
            ),
            None => Default::default(),
        };
        PromptContext {
            name: self.name.clone(),
            index: self.index(),
            language,
            version,
            engine,
            script: self.script.as_ref().map(|p| p.display().to_string()),
        }
    }

    pub fn out(&self, text: &str) -> Result<()> {
        self.ensure_live()?;
        self.runtime.console.print(text);
        Ok(())
    }

    pub fn out_line(&self, text: &str) -> Result<()> {
        self.out(&format!("{}\n", text))
    }

    pub fn err(&self, text: &str) -> Result<()> {
        self.ensure_live()?;
        self.runtime.console.eprint(text);
        Ok(())
    }

    /// Print an error, with its causes when stack traces are on
    pub fn report_error(&self, err: &anyhow::Error) {
        match err.chain().find_map(|cause| cause.downcast_ref::<ShellError>()) {
            Some(shell) if shell.is_illegal_state() => {
                error!("Session '{}' illegal state: {:#}", self.name, err)
            }
            Some(shell) if shell.is_illegal_argument() => {
                warn!("Session '{}' illegal argument: {:#}", self.name, err)
            }
            _ => warn!("Session '{}': {:#}", self.name, err),
        }
        let settings = &self.runtime.settings;
        let markup = Markup::new(settings.escape_mode);

        let mut text = markup.paint(&format!("error: {}", err), &Style::error());
        text.push('\n');
        if settings.stack_trace || settings.debug {
            for cause in err.chain().skip(1) {
                text.push_str(&markup.text(&format!("  caused by: {}\n", cause)));
            }
            let location = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<ScriptError>())
                .and_then(ScriptError::location);
            if let Some(location) = location {
                text.push_str(&markup.text(&format!("  at {}\n", location)));
            }
        }
        self.runtime.console.eprint(text);
    }

    pub fn warning(&self, message: &str) {
        let markup = Markup::new(self.runtime.settings.escape_mode);
        let text = markup.paint(&format!("warning: {}", message), &Style::warning());
        self.runtime.console.eprint(format!("{}\n", text));
    }

    // ---- focus ----

    /// Give focus to the session at `index`. Blocks until this session has
    /// focus itself; on failure focus stays here.
    pub fn jump_to(&self, index: usize) -> Result<()> {
        self.ensure_live()?;
        self.focus.acquire();
        let registry = &self.runtime.registry;

        let target = match registry.get(index) {
            Some(target) if target.is_live() => target,
            Some(target) => {
                self.current.store(true, Ordering::SeqCst);
                self.focus.release();
                return Err(ShellError::Necromancer(target.name.clone()));
            }
            None => {
                self.current.store(true, Ordering::SeqCst);
                self.focus.release();
                return Err(ShellError::IndexOutOfRange {
                    index,
                    len: registry.len(),
                });
            }
        };

        if std::ptr::eq(Arc::as_ptr(&target), self) {
            self.current.store(true, Ordering::SeqCst);
            self.focus.release();
            return Ok(());
        }

        self.current.store(false, Ordering::SeqCst);
        target.current.store(true, Ordering::SeqCst);
        target.focus.release();
        info!("Focus moved from '{}' to '{}' [{}]", self.name, target.name, index);
        Ok(())
    }

    // ---- children ----

    /// Start a child session without giving it focus. Returns `None` when
    /// the script does not exist; the callback then receives
    /// [`ReservedExitCode::NoFile`].
    pub fn fork(&self, options: ForkOptions) -> Result<Option<Arc<Session>>> {
        self.ensure_live()?;
        let ForkOptions {
            script,
            language,
            callback,
            callback_in_parent,
            after_script,
        } = options;

        let main = match &script {
            Some(path) => match File::open(path) {
                Ok(file) if path.is_file() => MainTask::Script {
                    reader: Box::new(BufReader::new(file)),
                    source_name: path.display().to_string(),
                    then: after_script.unwrap_or(AfterScript::Interactive),
                },
                _ => {
                    let message = format!("cannot interpret invalid script '{}'", path.display());
                    self.report_error(&ScriptError::new(message).into());
                    if let Some(callback) = callback {
                        callback(ReservedExitCode::NoFile.code());
                    }
                    return Ok(None);
                }
            },
            None => MainTask::Interactive,
        };

        let language = language
            .or_else(|| {
                script
                    .as_deref()
                    .and_then(|p| self.runtime.languages.find_for_script(p))
                    .map(|f| f.language_name().to_string())
            })
            .or_else(|| self.mime())
            .unwrap_or_else(|| self.runtime.settings.language.clone());

        let child = self.factory.create(self.runtime.clone(), &self.name, script);
        child.set_main(main)?;
        if let Some(callback) = callback {
            let callback = if callback_in_parent {
                self.in_parent(callback)
            } else {
                callback
            };
            child.set_exit_callback(callback)?;
        }

        if let Err(e) = child.start_with(&language, false) {
            child.dispose();
            return Err(e);
        }
        debug!("Session '{}' forked '{}' ({})", self.name, child.name, language);
        Ok(Some(child))
    }

    /// Wrap `callback` so it runs as a task on this session when possible
    fn in_parent(&self, callback: ExitCallback) -> ExitCallback {
        let parent = self.me.clone();
        Box::new(move |code| {
            let slot = Arc::new(Mutex::new(Some(callback)));
            let queued = slot.clone();
            let scheduled = parent.upgrade().map(|parent| {
                parent.schedule(Box::new(move |_: &Session| {
                    if let Some(callback) = queued.lock().take() {
                        callback(code);
                    }
                    Ok(None)
                }))
            });
            if !matches!(scheduled, Some(Ok(()))) {
                // Parent is gone: run it here rather than lose it
                if let Some(callback) = slot.lock().take() {
                    callback(code);
                }
            }
        })
    }

    // ---- exit ----

    /// Exit with a user-supplied code; reserved codes are remapped
    pub fn exit(&self, code: i32) -> Result<()> {
        self.ensure_live()?;
        let (accepted, remapped) = ReservedExitCode::sanitize(code);
        if remapped {
            warn!(
                "Session '{}' exit code {:#04x} is reserved, using {:#04x}",
                self.name, code, accepted
            );
            self.warning(&format!(
                "exit code {:#04x} is reserved; exiting with {}",
                code,
                describe(accepted)
            ));
        }
        self.do_exit(accepted, true)
    }

    pub fn exit_success(&self) -> Result<()> {
        self.exit_reserved(ReservedExitCode::Success)
    }

    pub(crate) fn exit_reserved(&self, code: ReservedExitCode) -> Result<()> {
        self.do_exit(code.code(), true)
    }

    /// Record `code`, leave the registry when `remove` is set, and dispose.
    /// The last session to leave terminates the process.
    pub fn do_exit(&self, code: i32, remove: bool) -> Result<()> {
        self.finish(code, remove, true)
    }

    fn finish(&self, code: i32, remove: bool, hand_off: bool) -> Result<()> {
        let callback = {
            let mut state = self.state.lock();
            if state.disposed || state.exit_code.is_some() {
                return Err(ShellError::Necromancer(self.name.clone()));
            }
            state.exit_code = Some(code);
            state.exit_callback.take()
        };
        info!("Session '{}' exiting with {}", self.name, describe(code));

        if remove {
            if let Some(callback) = callback {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(code))).is_err() {
                    error!("Session '{}' exit callback panicked", self.name);
                }
            }

            let was_current = self.current.swap(false, Ordering::SeqCst);
            match self.runtime.registry.remove(self) {
                Removal::Last => {
                    self.dispose();
                    self.runtime.terminate(code);
                    return Ok(());
                }
                Removal::Removed { index, remaining } => {
                    if hand_off && was_current {
                        let next = (index + 1) % remaining;
                        if let Some(target) = self.runtime.registry.get(next) {
                            target.current.store(true, Ordering::SeqCst);
                            target.focus.release();
                            info!("Focus passed from exiting '{}' to '{}'", self.name, target.name);
                        }
                    }
                }
                Removal::Absent => {}
            }
        }

        self.dispose();
        Ok(())
    }

    /// Drop everything the session owns and wake anyone blocked on it
    fn dispose(&self) {
        let released = {
            let mut state = self.state.lock();
            state.disposed = true;
            if let Some(cancel) = state.compile_cancel.take() {
                cancel.cancel();
            }
            (
                state.interpreter.take(),
                state.main.take(),
                state.exit_callback.take(),
            )
        };
        drop(released);
        for job in self.jobs.lock().drain(..) {
            if !job.is_finished() {
                debug!("Session '{}' cancelling compile job '{}'", self.name, job.title());
                job.cancel();
            }
        }
        self.tasks.lock().clear();
        self.current.store(false, Ordering::SeqCst);
        self.focus.release();
        debug!("Session '{}' disposed", self.name);
    }

    /// Block until `target` exits and return its code
    pub fn block_until_exit(&self, target: &Arc<Session>, extra: Option<ExitCallback>) -> Result<i32> {
        if target.state.lock().owner == Some(thread::current().id()) {
            return Err(ShellError::SelfWait(target.name.clone()));
        }
        if self.runtime.is_ui_thread() {
            return Err(ShellError::UiThreadBlocked(target.name.clone()));
        }

        let gate = Arc::new(FairSemaphore::new(0));
        let seen = Arc::new(Mutex::new(None));
        let wake = Wake(gate.clone());
        let slot = seen.clone();
        let latch: ExitCallback = Box::new(move |code| {
            let _wake = wake;
            *slot.lock() = Some(code);
            if let Some(extra) = extra {
                extra(code);
            }
        });

        match target.set_exit_callback(latch) {
            Ok(()) => gate.acquire(),
            Err(ShellError::Necromancer(_)) => {}
            Err(e) => return Err(e),
        }
        let code = *seen.lock();
        Ok(code
            .or_else(|| target.exit_code())
            .unwrap_or(ReservedExitCode::Killed.code()))
    }

    /// Exit every other session, newest first, then this one
    pub fn kill_all(&self, code: Option<i32>) -> Result<()> {
        self.ensure_live()?;
        let code = code.unwrap_or(ReservedExitCode::Killed.code());
        let others: Vec<_> = self
            .runtime
            .registry
            .snapshot()
            .into_iter()
            .rev()
            .filter(|s| !std::ptr::eq(Arc::as_ptr(s), self))
            .collect();
        for other in others {
            if let Err(e) = other.finish(code, true, false) {
                debug!("Session '{}' kill skipped '{}': {}", self.name, other.name, e);
            }
        }
        self.finish(code, true, true)
    }

    // ---- services ----

    /// Add an archive to the library path
    pub fn link(&self, path: &Path) -> bool {
        if let Err(e) = self.ensure_live() {
            debug!("Session '{}' cannot link {}", self.name, path.display());
            self.report_error(&e.into());
            return false;
        }
        match self.runtime.libraries.link(path) {
            Ok(linked) => {
                info!("Session '{}' linked {}", self.name, linked.display());
                true
            }
            Err(e @ LinkError::AlreadyLinked(_)) => {
                self.warning(&e.to_string());
                false
            }
            Err(e) => {
                self.report_error(&e.into());
                false
            }
        }
    }

    /// One line per live session; `*` marks focus
    pub fn list(&self) -> String {
        self.runtime
            .registry
            .snapshot()
            .iter()
            .enumerate()
            .map(|(index, session)| {
                let marker = if session.is_current() { '*' } else { ' ' };
                let language = session.mime().unwrap_or_else(|| "-".to_string());
                let mut line = format!("[{}] {} {} ({})", index, marker, session.name, language);
                if let Some(script) = &session.script {
                    line.push(' ');
                    line.push_str(&script.display().to_string());
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Compile `source` to `output` in the background, echoing progress
    /// here. Returns the job's index for [`Session::job`].
    pub fn compile(&self, source: &Path, output: &Path, target: &str, options: Options) -> anyhow::Result<usize> {
        self.ensure_live()?;
        let target = find_target(target).ok_or_else(|| anyhow!("unknown compile target '{}'", target))?;
        let mut job = CompileJob::new(FileCompile::new(target, source, output).with_options(options));
        job.set_listener(Arc::new(SessionListener::echo(self)));
        let handle = self.runtime.compiler.submit(Box::new(job));

        let mut jobs = self.jobs.lock();
        jobs.push(handle);
        Ok(jobs.len() - 1)
    }

    /// A compile job started by [`Session::compile`]
    pub fn job(&self, index: usize) -> Result<JobHandle> {
        self.ensure_live()?;
        let jobs = self.jobs.lock();
        jobs.get(index).cloned().ok_or(ShellError::IndexOutOfRange {
            index,
            len: jobs.len(),
        })
    }

    /// Wait for a compile job and return the exit code its outcome maps to
    pub fn join_job(&self, index: usize) -> Result<i32> {
        let job = self.job(index)?;
        if self.runtime.is_ui_thread() && !job.is_finished() {
            return Err(ShellError::UiThreadBlocked(self.name.clone()));
        }
        let outcome: Outcome = job.wait();
        Ok(ReservedExitCode::from(outcome).code())
    }

    /// One line per compile job: index, title and whether it is done
    pub fn jobs(&self) -> String {
        self.jobs
            .lock()
            .iter()
            .enumerate()
            .map(|(index, job)| {
                let state = if job.is_finished() { "finished" } else { "running" };
                format!("[{}] {} {}", index, job.title(), state)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Releases its semaphore when dropped, whether or not the callback ran
struct Wake(Arc<FairSemaphore>);

impl Drop for Wake {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// The session as scripts see it
struct SessionHost(Weak<Session>);

impl SessionHost {
    fn session(&self) -> anyhow::Result<Arc<Session>> {
        self.0
            .upgrade()
            .ok_or_else(|| anyhow!("the session has exited"))
    }
}

impl ShellHost for SessionHost {
    fn name(&self) -> String {
        self.0
            .upgrade()
            .map(|s| s.name.clone())
            .unwrap_or_default()
    }

    fn out(&self, text: &str) -> anyhow::Result<()> {
        Ok(self.session()?.out(text)?)
    }

    fn exit(&self, code: i32) -> anyhow::Result<()> {
        Ok(self.session()?.exit(code)?)
    }

    fn jump(&self, index: usize) -> anyhow::Result<()> {
        Ok(self.session()?.jump_to(index)?)
    }

    fn fork(&self, script: &str) -> anyhow::Result<Option<usize>> {
        let child = self.session()?.fork(ForkOptions::script(script))?;
        Ok(child.and_then(|c| c.index()))
    }

    fn link(&self, path: &str) -> anyhow::Result<bool> {
        Ok(self.session()?.link(Path::new(path)))
    }

    fn kill(&self, code: Option<i32>) -> anyhow::Result<()> {
        Ok(self.session()?.kill_all(code)?)
    }

    fn list(&self) -> anyhow::Result<String> {
        Ok(self.session()?.list())
    }

    fn wait(&self, index: usize) -> anyhow::Result<i32> {
        let session = self.session()?;
        let registry = &session.runtime.registry;
        let target = registry.get(index).ok_or(ShellError::IndexOutOfRange {
            index,
            len: registry.len(),
        })?;
        Ok(session.block_until_exit(&target, None)?)
    }

    fn compile(&self, source: &str, output: &str) -> anyhow::Result<usize> {
        let session = self.session()?;
        session.compile(Path::new(source), Path::new(output), "raw", Options::new())
    }

    fn cancel(&self, job: usize) -> anyhow::Result<()> {
        self.session()?.job(job)?.cancel();
        Ok(())
    }

    fn join(&self, job: usize) -> anyhow::Result<i32> {
        Ok(self.session()?.join_job(job)?)
    }

    fn jobs(&self) -> anyhow::Result<String> {
        Ok(self.session()?.jobs())
    }
}
