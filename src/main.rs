//! cuf - a multi-session scripting shell
//!
//! cuf runs one or more interpreter sessions over a single terminal. Sessions
//! share stdin/stdout/stderr, hand input focus to each other, fork children
//! from scripts, and can drive background compile jobs.
//!
//! # Quick Start
//!
//! ```text
//! cuf                          # Interactive session in the default language
//! cuf a.calc b.calc            # Run scripts as a batch; exit with the worst code
//! cuf -c glyphs.txt out.bin    # Compile one file and exit
//! ```
//!
//! # Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0x00 | Success |
//! | 0x1F | Script file not found |
//! | 0x2F / 0x3F | A script asked for a reserved code |
//! | 0x4F | Input ended with no session to hand focus to |
//! | 0x5F | Compile failed |
//! | 0x6F | Compile aborted |
//! | 0x7F | Killed |

mod compile;
mod config;
mod console;
mod lang;
mod shell;
#[cfg(test)]
mod testing;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::compile::job::CompileJob;
use crate::compile::target::{find_target, FileCompile, Options};
use crate::compile::unit::{CompileUnit, TitleMonitor};
use crate::config::{EscapeMode, Settings};
use crate::console::Console;
use crate::lang::LanguageRegistry;
use crate::shell::batch::BatchRunner;
use crate::shell::preload::Preload;
use crate::shell::runtime::ProcessTerminator;
use crate::shell::{MainTask, Runtime, Session};

/// Command line options layered over [`Settings`]
#[derive(Default)]
struct Args {
    language: Option<String>,
    name: Option<String>,
    compile: Option<(PathBuf, PathBuf)>,
    target: Option<String>,
    options: Options,
    quiet: bool,
    last_code: bool,
    parallel: bool,
    escape: Option<EscapeMode>,
    debug: bool,
    stack_trace: bool,
    /// Scripts or language names to run as a batch
    targets: Vec<String>,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(language) = &self.language {
            settings.language = language.clone();
        }
        if let Some(name) = &self.name {
            settings.shell_name = name.clone();
        }
        if let Some(mode) = self.escape {
            settings.escape_mode = mode;
        }
        if self.quiet {
            settings.batch.messages = false;
        }
        if self.last_code {
            settings.batch.last_code = true;
        }
        if self.parallel {
            settings.batch.sequential = false;
        }
        settings.debug |= self.debug;
        settings.stack_trace |= self.stack_trace;
    }
}

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    eprintln!("cuf {}", VERSION);
}

fn print_help() {
    eprintln!("cuf {} - A multi-session scripting shell", VERSION);
    eprintln!();
    eprintln!("Usage: cuf [OPTIONS] [SCRIPT|LANGUAGE]...");
    eprintln!();
    eprintln!("Session options:");
    eprintln!("  (no arguments)          One interactive session");
    eprintln!("  -l, --language <LANG>   Default language (name, extension or MIME type)");
    eprintln!("  -n, --name <NAME>       Session name shown in prompts and bound in scripts");
    eprintln!("  -e, --escape <MODE>     Markup rendering: none, ansi, html");
    eprintln!();
    eprintln!("Batch options:");
    eprintln!("  -q, --quiet             No status line per finished script");
    eprintln!("  --last-code             Exit with the last code, even a success");
    eprintln!("  --parallel              Start every script at once");
    eprintln!();
    eprintln!("Compile options:");
    eprintln!("  -c, --compile <SRC> <OUT>");
    eprintln!("                          Compile SRC into OUT and exit");
    eprintln!("  -t, --target <NAME>     Compile target (default: raw)");
    eprintln!("  -o, --option <K=V>      Target option, may repeat");
    eprintln!();
    eprintln!("Other options:");
    eprintln!("  -d, --debug             Verbose logging and error details");
    eprintln!("  --stack-trace           Print error causes and script locations");
    eprintln!("  -v, --version           Show version");
    eprintln!("  -h, --help              Show this help");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  cuf                     Interactive calc session");
    eprintln!("  cuf -n box a.calc       Run a.calc; it sees its session as 'box'");
    eprintln!("  cuf calc calc           Two interactive sessions; ^D moves between them");
    eprintln!("  cuf -c in.txt out.bin -o chunk_size=4096");
    eprintln!();
    eprintln!("Configuration: ~/.cuf/config.toml");
    eprintln!("Preload scripts: ~/.cuf/preload.conf");
    eprintln!("Log file: ~/.cuf/cuf.log (filter with CUF_LOG)");
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().collect();
    let mut parsed = Args::default();
    let mut i = 1;

    let value = |i: usize, flag: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("Missing argument for {}", flag))
    };

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            flag @ ("-l" | "--language") => {
                i += 1;
                parsed.language = Some(value(i, flag)?);
            }
            flag @ ("-n" | "--name") => {
                i += 1;
                parsed.name = Some(value(i, flag)?);
            }
            flag @ ("-e" | "--escape") => {
                i += 1;
                parsed.escape = Some(value(i, flag)?.parse()?);
            }
            flag @ ("-c" | "--compile") => {
                let source = value(i + 1, flag)?;
                let output = value(i + 2, flag)?;
                parsed.compile = Some((PathBuf::from(source), PathBuf::from(output)));
                i += 2;
            }
            flag @ ("-t" | "--target") => {
                i += 1;
                parsed.target = Some(value(i, flag)?);
            }
            flag @ ("-o" | "--option") => {
                i += 1;
                let pair = value(i, flag)?;
                let (key, val) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("Option '{}' is not KEY=VALUE", pair))?;
                parsed.options.insert(key.trim().to_string(), val.trim().to_string());
            }
            "-q" | "--quiet" => parsed.quiet = true,
            "--last-code" => parsed.last_code = true,
            "--parallel" => parsed.parallel = true,
            "-d" | "--debug" => parsed.debug = true,
            "--stack-trace" => parsed.stack_trace = true,
            arg if arg.starts_with('-') && arg.len() > 1 => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
            target => parsed.targets.push(target.to_string()),
        }
        i += 1;
    }

    if parsed.compile.is_some() && !parsed.targets.is_empty() {
        return Err("--compile cannot be combined with scripts".to_string());
    }
    Ok(parsed)
}

/// Log to `~/.cuf/cuf.log`; `CUF_LOG` overrides the level
fn init_logging(settings: &Settings) {
    if !settings.log {
        return;
    }
    let log_path = settings.preload_dir().join("cuf.log");

    // Create log directory if needed
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let level = if settings.debug { "debug" } else { "info" };
        let filter = EnvFilter::try_from_env("CUF_LOG").unwrap_or_else(|_| EnvFilter::new(level));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .with_thread_names(true)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main_task(args: Args, settings: &Settings) -> anyhow::Result<MainTask> {
    if let Some((source, output)) = args.compile {
        let name = args.target.as_deref().unwrap_or("raw");
        let target = find_target(name).ok_or_else(|| anyhow!("unknown compile target '{}'", name))?;
        let job = CompileJob::new(FileCompile::new(target, source, output).with_options(args.options));
        let mut unit = CompileUnit::new(job);
        if let Some(monitor) = TitleMonitor::stderr() {
            unit = unit.with_monitor(Arc::new(monitor));
        }
        return Ok(MainTask::Compile(unit));
    }
    if !args.targets.is_empty() {
        return Ok(MainTask::Batch(BatchRunner::new(args.targets, &settings.batch)));
    }
    Ok(MainTask::Interactive)
}

fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let mut settings = Settings::load();
    args.apply(&mut settings);
    init_logging(&settings);
    info!("cuf {} starting...", VERSION);

    let language = settings.language.clone();
    let name = settings.shell_name.clone();
    let task = main_task(args, &settings)?;

    let preload = Preload::load(&settings.preload_dir());
    let runtime: Arc<Runtime> = Runtime::builder()
        .console(Console::stdio())
        .languages(LanguageRegistry::with_builtins())
        .preload(preload)
        .terminator(Arc::new(ProcessTerminator))
        .settings(settings)
        .build();
    runtime.mark_ui_thread();
    if runtime.languages.find(&language).is_none() {
        return Err(anyhow!(
            "unknown language '{}' (available: {})",
            language,
            runtime.languages.names().join(", ")
        ));
    }

    let session = Session::new(runtime, &name);
    session.set_main(task)?;
    session
        .start(&language)
        .with_context(|| format!("cannot start session '{}'", name))?;

    // The last session to exit ends the process
    loop {
        thread::park();
    }
}
