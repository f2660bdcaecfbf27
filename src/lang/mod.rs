//! Embedded interpreter contracts.
//!
//! A session owns one [`Interpreter`] created by an [`InterpreterFactory`]
//! looked up in the [`LanguageRegistry`]. The session binds itself into the
//! interpreter as a [`ShellHost`] so scripts can drive the shell.

pub mod calc;

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

/// Shell operations reachable from scripts through the bound session name
pub trait ShellHost: Send + Sync {
    /// Bound name of the session
    fn name(&self) -> String;
    /// Print to the session's output
    fn out(&self, text: &str) -> anyhow::Result<()>;
    fn exit(&self, code: i32) -> anyhow::Result<()>;
    fn jump(&self, index: usize) -> anyhow::Result<()>;
    /// Fork a child running `script`; returns its registry index when started
    fn fork(&self, script: &str) -> anyhow::Result<Option<usize>>;
    fn link(&self, path: &str) -> anyhow::Result<bool>;
    /// Kill every other session, then this one
    fn kill(&self, code: Option<i32>) -> anyhow::Result<()>;
    fn list(&self) -> anyhow::Result<String>;
    /// Block until the session at `index` exits; returns its exit code
    fn wait(&self, index: usize) -> anyhow::Result<i32>;
    /// Compile `source` into `output` on the compile pool; returns the job's index
    fn compile(&self, source: &str, output: &str) -> anyhow::Result<usize>;
    /// Cancel one of this session's compile jobs
    fn cancel(&self, job: usize) -> anyhow::Result<()>;
    /// Block until a compile job ends; returns its exit code
    fn join(&self, job: usize) -> anyhow::Result<i32>;
    /// One line per compile job this session started
    fn jobs(&self) -> anyhow::Result<String>;
}

/// Script failure with an optional location
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
    pub source_name: Option<String>,
    pub line: Option<usize>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source_name: None,
            line: None,
        }
    }

    pub fn at(message: impl Into<String>, source_name: Option<&str>, line: usize) -> Self {
        Self {
            message: message.into(),
            source_name: source_name.map(str::to_string),
            line: Some(line),
        }
    }

    /// `source:line` when known
    pub fn location(&self) -> Option<String> {
        let line = self.line?;
        Some(format!(
            "{}:{}",
            self.source_name.as_deref().unwrap_or("<input>"),
            line
        ))
    }
}

/// One interpreter instance. Only ever touched by its session's thread.
pub trait Interpreter: Send {
    /// Evaluate source text; `Some` results are printed by the session
    fn eval(&mut self, source: &str, source_name: Option<&str>) -> anyhow::Result<Option<String>>;

    /// Make `host` visible to scripts under `name`
    fn bind(&mut self, name: &str, host: Arc<dyn ShellHost>);

    /// Call a named function with string arguments
    fn invoke(&mut self, method: &str, _args: &[String]) -> anyhow::Result<Option<String>> {
        Err(ScriptError::new(format!("invoke of '{}' is not supported", method)).into())
    }
}

/// Describes a language and creates interpreters for it
pub trait InterpreterFactory: Send + Sync {
    fn language_name(&self) -> &str;
    fn language_version(&self) -> &str;
    fn engine_name(&self) -> &str;
    fn extensions(&self) -> &[&'static str];
    fn mime_types(&self) -> &[&'static str];
    fn aliases(&self) -> &[&'static str] {
        &[]
    }
    /// Source text calling `method` on `object`
    fn method_call_syntax(&self, object: &str, method: &str, args: &[&str]) -> String;
    fn create(&self) -> Box<dyn Interpreter>;

    /// Whether `query` names this language
    fn matches(&self, query: &str) -> bool {
        let query = query.trim();
        let ext = query.trim_start_matches('.');
        self.language_name().eq_ignore_ascii_case(query)
            || self.aliases().iter().any(|a| a.eq_ignore_ascii_case(query))
            || self.extensions().iter().any(|e| e.eq_ignore_ascii_case(ext))
            || self.mime_types().iter().any(|m| m.eq_ignore_ascii_case(query))
    }
}

/// Known languages, searched in registration order
#[derive(Default)]
pub struct LanguageRegistry {
    factories: Vec<Arc<dyn InterpreterFactory>>,
}

impl LanguageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in languages
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(calc::CalcFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn InterpreterFactory>) {
        self.factories.push(factory);
    }

    /// Find by name, alias, extension or MIME type
    pub fn find(&self, query: &str) -> Option<Arc<dyn InterpreterFactory>> {
        self.factories.iter().find(|f| f.matches(query)).cloned()
    }

    /// Find by a script's file extension
    pub fn find_for_script(&self, path: &Path) -> Option<Arc<dyn InterpreterFactory>> {
        let ext = path.extension()?.to_str()?;
        self.factories
            .iter()
            .find(|f| f.extensions().iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.iter().map(|f| f.language_name()).collect()
    }
}
