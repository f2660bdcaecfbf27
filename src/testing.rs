//! Test doubles shared by the unit tests.

use std::io::{self, BufRead, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::{EscapeMode, Settings};
use crate::console::Console;
use crate::lang::LanguageRegistry;
use crate::shell::preload::Preload;
use crate::shell::runtime::{Runtime, Terminator};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory writer whose contents stay readable after it is boxed
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Feeds lines to a [`ChannelInput`]; dropping it ends the input for good
#[derive(Clone)]
pub struct LineFeeder(Sender<Option<String>>);

impl LineFeeder {
    pub fn line(&self, line: &str) {
        let _ = self.0.send(Some(format!("{}\n", line)));
    }

    /// One end-of-input, like ^D on a terminal; later lines still arrive
    pub fn eof(&self) {
        let _ = self.0.send(None);
    }
}

/// Blocking reader fed line by line from the test
pub struct ChannelInput {
    rx: Receiver<Option<String>>,
    buf: Vec<u8>,
    pos: usize,
}

pub fn channel_input() -> (LineFeeder, ChannelInput) {
    let (tx, rx) = mpsc::channel();
    (
        LineFeeder(tx),
        ChannelInput {
            rx,
            buf: Vec::new(),
            pos: 0,
        },
    )
}

impl Read for ChannelInput {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for ChannelInput {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.pos >= self.buf.len() {
            self.pos = 0;
            self.buf = match self.rx.recv() {
                Ok(Some(line)) => line.into_bytes(),
                Ok(None) | Err(_) => Vec::new(),
            };
        }
        Ok(&self.buf[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        self.pos += amt;
    }
}

/// Records process termination instead of exiting
#[derive(Default)]
pub struct RecordingTerminator {
    codes: Mutex<Vec<i32>>,
    changed: Condvar,
}

impl RecordingTerminator {
    pub fn codes(&self) -> Vec<i32> {
        self.codes.lock().clone()
    }

    /// Wait for the first termination
    pub fn wait(&self) -> Option<i32> {
        let mut codes = self.codes.lock();
        let deadline = Instant::now() + TIMEOUT;
        while codes.is_empty() {
            if self.changed.wait_until(&mut codes, deadline).timed_out() {
                break;
            }
        }
        codes.first().copied()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, code: i32, console: &Console) {
        console.sync();
        self.codes.lock().push(code);
        self.changed.notify_all();
    }
}

/// Poll `condition` until it holds or [`TIMEOUT`] passes
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// A runtime wired to in-memory streams
pub struct Rig {
    pub runtime: Arc<Runtime>,
    pub out: SharedBuffer,
    pub err: SharedBuffer,
    pub input: LineFeeder,
    pub terminator: Arc<RecordingTerminator>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with(Settings::default(), true)
    }

    pub fn with(settings: Settings, eof_is_final: bool) -> Self {
        Self::build(settings, eof_is_final, Preload::empty(std::env::temp_dir()))
    }

    /// Rig whose sessions read preload scripts from `preload`
    pub fn with_preload(preload: Preload) -> Self {
        Self::build(Settings::default(), true, preload)
    }

    fn build(mut settings: Settings, eof_is_final: bool, preload: Preload) -> Self {
        settings.escape_mode = EscapeMode::None;
        let out = SharedBuffer::new();
        let err = SharedBuffer::new();
        let (input, reader) = channel_input();
        let terminator = Arc::new(RecordingTerminator::default());
        let console = Console::new(
            Box::new(out.clone()),
            Box::new(err.clone()),
            Box::new(reader),
            eof_is_final,
        );
        let runtime = Runtime::builder()
            .settings(settings)
            .console(console)
            .languages(LanguageRegistry::with_builtins())
            .preload(preload)
            .terminator(terminator.clone())
            .build();
        Self {
            runtime,
            out,
            err,
            input,
            terminator,
        }
    }

    /// Standard output after flushing pending writes
    pub fn out(&self) -> String {
        self.runtime.console.sync();
        self.out.contents()
    }

    pub fn err(&self) -> String {
        self.runtime.console.sync();
        self.err.contents()
    }
}
