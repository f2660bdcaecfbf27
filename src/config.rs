//! Settings management for cuf.
//!
//! This module provides:
//! - TOML settings file loading from `~/.cuf/config.toml`
//! - Environment overrides (`CUF_*`), applied after the file
//! - The escape mode used for prompts and error markup
//!
//! # Settings File
//!
//! ```toml
//! # Default scripting language (name, alias, extension or MIME type)
//! language = "calc"
//! shell_name = "sh"
//! escape_mode = "ansi"   # none, ansi, html
//! stack_trace = false
//!
//! [prompt]
//! primary = '%f2%n%r[%i]> '
//! secondary = '> '
//! continue_char = '\'
//!
//! [compile]
//! threads = 4
//! chatty = false
//!
//! [batch]
//! messages = true
//! last_code = false
//! sequential = true
//! ```

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// How prompt and error markup is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscapeMode {
    /// Plain text, markup stripped
    None,
    /// ANSI SGR sequences
    Ansi,
    /// HTML spans
    Html,
}

impl Default for EscapeMode {
    fn default() -> Self {
        EscapeMode::Ansi
    }
}

impl FromStr for EscapeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "plain" => Ok(EscapeMode::None),
            "ansi" => Ok(EscapeMode::Ansi),
            "html" => Ok(EscapeMode::Html),
            other => Err(format!("unknown escape mode '{}'", other)),
        }
    }
}

/// Main settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Default language query for new sessions
    pub language: String,
    /// Name the session is bound to inside its interpreter
    pub shell_name: String,
    /// Verbose logging
    pub debug: bool,
    /// Print cause chains and script locations with errors
    pub stack_trace: bool,
    /// Write the log file at all
    pub log: bool,
    /// Markup rendering
    pub escape_mode: EscapeMode,
    /// Directory holding `preload.conf` and preload scripts
    pub preload_dir: Option<PathBuf>,
    /// Prompt settings
    pub prompt: PromptConfig,
    /// Compile settings
    pub compile: CompileConfig,
    /// Batch runner settings
    pub batch: BatchConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            language: "calc".to_string(),
            shell_name: "sh".to_string(),
            debug: false,
            stack_trace: false,
            log: true,
            escape_mode: EscapeMode::default(),
            preload_dir: None,
            prompt: PromptConfig::default(),
            compile: CompileConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

/// Prompt configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub primary: String,
    pub secondary: String,
    /// A line ending with this character continues on the next line
    pub continue_char: char,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            primary: "%n[%i]> ".to_string(),
            secondary: "> ".to_string(),
            continue_char: '\\',
        }
    }
}

/// Compile configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Worker threads in the compile pool
    pub threads: usize,
    /// Echo determinate progress to the session output too
    pub chatty: bool,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            threads: default_compile_threads(),
            chatty: false,
        }
    }
}

/// Batch runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Print a status line per finished script
    pub messages: bool,
    /// Aggregate with the most recent code even when it is a success
    pub last_code: bool,
    /// Wait for each script before forking the next
    pub sequential: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            messages: true,
            last_code: false,
            sequential: true,
        }
    }
}

fn default_compile_threads() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    1 + cores / 2
}

impl Settings {
    /// Load settings from file, then apply environment overrides
    pub fn load() -> Self {
        let mut settings = Self::load_file();
        settings.apply_env(|key| std::env::var(key).ok());
        settings
    }

    fn load_file() -> Self {
        if let Some(path) = Self::get_config_path() {
            if path.exists() {
                match fs::read_to_string(&path) {
                    Ok(content) => match toml::from_str(&content) {
                        Ok(settings) => return settings,
                        Err(e) => warn!("Ignoring malformed {}: {}", path.display(), e),
                    },
                    Err(e) => warn!("Cannot read {}: {}", path.display(), e),
                }
            }
        }
        Self::default()
    }

    /// Apply `CUF_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CUF_LANGUAGE") {
            self.language = v;
        }
        if let Some(v) = lookup("CUF_SHELL_NAME") {
            self.shell_name = v;
        }
        if let Some(v) = lookup("CUF_PRELOAD_DIR") {
            self.preload_dir = Some(PathBuf::from(v));
        }
        override_parsed(&lookup, "CUF_DEBUG", &mut self.debug);
        override_parsed(&lookup, "CUF_STACK_TRACE", &mut self.stack_trace);
        override_parsed(&lookup, "CUF_ESCAPE_MODE", &mut self.escape_mode);
        override_parsed(&lookup, "CUF_COMPILE_THREADS", &mut self.compile.threads);
        override_parsed(&lookup, "CUF_CHATTY", &mut self.compile.chatty);
        override_parsed(&lookup, "CUF_BATCH_MESSAGES", &mut self.batch.messages);
        override_parsed(&lookup, "CUF_BATCH_LAST_CODE", &mut self.batch.last_code);
        if self.compile.threads == 0 {
            self.compile.threads = 1;
        }
    }

    /// Directory for `preload.conf`, logs and preload scripts
    pub fn preload_dir(&self) -> PathBuf {
        self.preload_dir
            .clone()
            .or_else(|| home_dir().map(|h| h.join(".cuf")))
            .unwrap_or_else(|| PathBuf::from(".cuf"))
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".cuf").join("config.toml"))
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!("Ignoring {}={:?}: not a valid value", key, raw),
        }
    }
}

// Get home directory
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
