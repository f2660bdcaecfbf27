//! Fixed-size worker pool for compile jobs.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use super::job::{CancelToken, Job, Outcome};

type Work = Box<dyn FnOnce() + Send>;

struct Slot {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

impl Slot {
    fn finish(&self, outcome: Outcome) {
        *self.outcome.lock() = Some(outcome);
        self.ready.notify_all();
    }
}

/// Handle to a submitted job
#[derive(Clone)]
pub struct JobHandle {
    title: String,
    cancel: CancelToken,
    slot: Arc<Slot>,
}

impl JobHandle {
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.slot.outcome.lock().is_some()
    }

    pub fn wait(&self) -> Outcome {
        let mut outcome = self.slot.outcome.lock();
        loop {
            if let Some(outcome) = *outcome {
                return outcome;
            }
            self.slot.ready.wait(&mut outcome);
        }
    }
}

/// Workers are spawned on first submit
pub struct CompilePool {
    size: usize,
    sender: Mutex<Option<Sender<Work>>>,
}

impl CompilePool {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            sender: Mutex::new(None),
        }
    }

    pub fn submit(&self, mut job: Box<dyn Job>) -> JobHandle {
        let handle = JobHandle {
            title: job.title(),
            cancel: job.cancel_token(),
            slot: Arc::new(Slot {
                outcome: Mutex::new(None),
                ready: Condvar::new(),
            }),
        };

        let slot = handle.slot.clone();
        let work: Work = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.run())).unwrap_or_else(|_| {
                error!("Compile job panicked outside its build");
                Outcome::Failed
            });
            slot.finish(outcome);
        });

        if let Err(rejected) = self.sender().send(work) {
            error!("Compile pool is gone; running job inline");
            (rejected.0)();
        }
        handle
    }

    fn sender(&self) -> Sender<Work> {
        let mut sender = self.sender.lock();
        if let Some(sender) = sender.as_ref() {
            return sender.clone();
        }

        let (tx, rx) = mpsc::channel::<Work>();
        let rx = Arc::new(Mutex::new(rx));
        for id in 0..self.size {
            let rx = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("compile-{}", id))
                .spawn(move || worker(id, rx));
            if let Err(e) = spawned {
                error!("Failed to spawn compile worker {}: {}", id, e);
            }
        }
        debug!("Compile pool started with {} workers", self.size);
        *sender = Some(tx.clone());
        tx
    }
}

fn worker(id: usize, rx: Arc<Mutex<Receiver<Work>>>) {
    loop {
        let work = rx.lock().recv();
        match work {
            Ok(work) => work(),
            Err(_) => break,
        }
    }
    debug!("Compile worker {} stopped", id);
}
