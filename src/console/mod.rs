//! Process-wide console: one worker per physical stream.
//!
//! Output and error are FIFO services so each session's writes keep program
//! order. Input is a LIFO service: the newest prompt request is served first,
//! and it syncs both output streams before showing the prompt.

pub mod markup;
pub mod stream;

use std::io::{self, BufRead, BufReader, IsTerminal, Write};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use self::stream::{Discipline, StreamService};

pub type Writer = Box<dyn Write + Send>;
pub type Reader = Box<dyn BufRead + Send>;

/// Result of a prompt request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(String),
    EndOfInput,
}

pub struct Console {
    out: StreamService,
    err: StreamService,
    input: StreamService,
    out_writer: Arc<Mutex<Writer>>,
    err_writer: Arc<Mutex<Writer>>,
    reader: Arc<Mutex<Reader>>,
    /// End of input cannot be followed by more input (pipe, file, buffer)
    eof_is_final: bool,
}

impl Console {
    pub fn new(out: Writer, err: Writer, input: Reader, eof_is_final: bool) -> Self {
        Self {
            out: StreamService::new("out", Discipline::Fifo),
            err: StreamService::new("err", Discipline::Fifo),
            input: StreamService::new("in", Discipline::Lifo),
            out_writer: Arc::new(Mutex::new(out)),
            err_writer: Arc::new(Mutex::new(err)),
            reader: Arc::new(Mutex::new(input)),
            eof_is_final,
        }
    }

    /// Console over the process's standard streams
    pub fn stdio() -> Self {
        let stdin = io::stdin();
        let eof_is_final = !stdin.is_terminal();
        Self::new(
            Box::new(io::stdout()),
            Box::new(io::stderr()),
            Box::new(BufReader::new(stdin)),
            eof_is_final,
        )
    }

    /// Start all three workers. Idempotent.
    pub fn start(&self) {
        self.out.start();
        self.err.start();
        self.input.start();
    }

    pub fn eof_is_final(&self) -> bool {
        self.eof_is_final
    }

    /// Queue text for standard output
    pub fn print(&self, text: impl Into<String>) {
        submit_write(&self.out, &self.out_writer, text.into());
    }

    /// Queue text for standard error
    pub fn eprint(&self, text: impl Into<String>) {
        submit_write(&self.err, &self.err_writer, text.into());
    }

    /// Ask for one line of input. The reply is always sent, as
    /// [`ReadOutcome::EndOfInput`] if reading failed.
    pub fn request_line(&self, prompt: String, reply: SyncSender<ReadOutcome>) {
        let out = self.out.clone();
        let err = self.err.clone();
        let writer = self.out_writer.clone();
        let reader = self.reader.clone();

        self.input.submit(Box::new(move || -> anyhow::Result<()> {
            out.sync();
            err.sync();
            let outcome = read_prompted(&writer, &reader, &prompt);
            if reply.try_send(outcome).is_err() {
                debug!("Dropping input reply: requester is gone");
            }
            Ok(())
        }));
    }

    /// Wait until everything printed so far has been written
    pub fn sync(&self) {
        self.out.sync();
        self.err.sync();
    }
}

fn submit_write(service: &StreamService, writer: &Arc<Mutex<Writer>>, text: String) {
    let writer = writer.clone();
    service.submit(Box::new(move || -> anyhow::Result<()> {
        let mut writer = writer.lock();
        writer.write_all(text.as_bytes())?;
        writer.flush()?;
        Ok(())
    }));
}

fn read_prompted(writer: &Mutex<Writer>, reader: &Mutex<Reader>, prompt: &str) -> ReadOutcome {
    {
        let mut writer = writer.lock();
        if let Err(e) = writer.write_all(prompt.as_bytes()).and_then(|_| writer.flush()) {
            warn!("Failed to write prompt: {}", e);
        }
    }

    let mut line = String::new();
    match reader.lock().read_line(&mut line) {
        Ok(0) => ReadOutcome::EndOfInput,
        Ok(_) => {
            let trimmed = line.trim_end_matches(['\n', '\r']).len();
            line.truncate(trimmed);
            ReadOutcome::Line(line)
        }
        Err(e) => {
            warn!("Failed to read input: {}", e);
            ReadOutcome::EndOfInput
        }
    }
}
