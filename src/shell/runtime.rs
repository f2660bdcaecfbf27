//! Services shared by every session.

use std::process;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::info;

use super::exit::describe;
use super::link::LibraryPath;
use super::preload::Preload;
use super::registry::SessionRegistry;
use crate::compile::pool::CompilePool;
use crate::config::Settings;
use crate::console::Console;
use crate::lang::LanguageRegistry;

/// Ends the process once the last session exits
pub trait Terminator: Send + Sync {
    fn terminate(&self, code: i32, console: &Console);
}

/// Flushes the console and exits the process
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, code: i32, console: &Console) {
        console.sync();
        info!("Last session exited, terminating with {}", describe(code));
        process::exit(code);
    }
}

pub struct Runtime {
    pub settings: Settings,
    pub registry: SessionRegistry,
    pub console: Console,
    pub languages: LanguageRegistry,
    pub preload: Preload,
    pub libraries: LibraryPath,
    pub compiler: CompilePool,
    terminator: Arc<dyn Terminator>,
    ui_thread: Mutex<Option<ThreadId>>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn terminate(&self, code: i32) {
        self.terminator.terminate(code, &self.console);
    }

    /// Mark the calling thread as the one that must never block on a session
    pub fn mark_ui_thread(&self) {
        *self.ui_thread.lock() = Some(thread::current().id());
    }

    pub fn is_ui_thread(&self) -> bool {
        *self.ui_thread.lock() == Some(thread::current().id())
    }
}

#[derive(Default)]
pub struct RuntimeBuilder {
    settings: Option<Settings>,
    console: Option<Console>,
    languages: Option<LanguageRegistry>,
    preload: Option<Preload>,
    terminator: Option<Arc<dyn Terminator>>,
}

impl RuntimeBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn console(mut self, console: Console) -> Self {
        self.console = Some(console);
        self
    }

    pub fn languages(mut self, languages: LanguageRegistry) -> Self {
        self.languages = Some(languages);
        self
    }

    pub fn preload(mut self, preload: Preload) -> Self {
        self.preload = Some(preload);
        self
    }

    pub fn terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    /// Fill anything unset from the process environment
    pub fn build(self) -> Arc<Runtime> {
        let settings = self.settings.unwrap_or_default();
        let preload = self
            .preload
            .unwrap_or_else(|| Preload::load(&settings.preload_dir()));
        Arc::new(Runtime {
            registry: SessionRegistry::new(),
            console: self.console.unwrap_or_else(Console::stdio),
            languages: self.languages.unwrap_or_else(LanguageRegistry::with_builtins),
            preload,
            libraries: LibraryPath::new(),
            compiler: CompilePool::new(settings.compile.threads),
            terminator: self.terminator.unwrap_or_else(|| Arc::new(ProcessTerminator)),
            ui_thread: Mutex::new(None),
            settings,
        })
    }
}
