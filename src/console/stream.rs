//! Ordered request worker for one physical stream.
//!
//! Many session threads submit requests; a single dedicated worker thread
//! runs them one at a time. Output services are strict FIFO. Input services
//! push new requests at the head so the most recent prompt is served first.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

/// A unit of work run on the stream's worker thread
pub type Request = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Queue discipline for newly submitted requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Append at the tail (output streams)
    Fifo,
    /// Insert at the head (prompt requests)
    Lifo,
}

struct Queue {
    requests: Mutex<VecDeque<Request>>,
    ready: Condvar,
}

/// Serializes access to one stream across any number of submitters.
///
/// Clones share the same queue and worker.
#[derive(Clone)]
pub struct StreamService {
    name: String,
    discipline: Discipline,
    queue: Arc<Queue>,
    started: Arc<AtomicBool>,
}

impl StreamService {
    pub fn new(name: impl Into<String>, discipline: Discipline) -> Self {
        Self {
            name: name.into(),
            discipline,
            queue: Arc::new(Queue {
                requests: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
            }),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the worker thread. Calling this again is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let queue = self.queue.clone();
        let name = self.name.clone();
        let spawned = thread::Builder::new()
            .name(format!("stream-{}", self.name))
            .spawn(move || worker(name, queue));

        if let Err(e) = spawned {
            error!("Failed to spawn {} stream worker: {}", self.name, e);
            self.started.store(false, Ordering::SeqCst);
        }
    }

    /// Queue a request. Never waits for it to run.
    pub fn submit(&self, request: Request) {
        let mut requests = self.queue.requests.lock();
        match self.discipline {
            Discipline::Fifo => requests.push_back(request),
            Discipline::Lifo => requests.push_front(request),
        }
        drop(requests);
        self.queue.ready.notify_one();
    }

    /// Block until every request submitted before this call has run.
    ///
    /// Only meaningful for FIFO services.
    pub fn sync(&self) {
        self.start();
        let (tx, rx) = mpsc::channel();
        self.submit(Box::new(move || -> anyhow::Result<()> {
            let _ = tx.send(());
            Ok(())
        }));
        let _ = rx.recv();
    }

    /// Number of requests waiting to run
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.queue.requests.lock().len()
    }
}

fn worker(name: String, queue: Arc<Queue>) {
    debug!("{} stream worker running", name);
    loop {
        let request = {
            let mut requests = queue.requests.lock();
            loop {
                if let Some(request) = requests.pop_front() {
                    break request;
                }
                queue.ready.wait(&mut requests);
            }
        };

        match panic::catch_unwind(AssertUnwindSafe(request)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} stream request failed: {:#}", name, e),
            Err(_) => error!("{} stream request panicked", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(String) -> Request) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |item: String| -> Request {
            let sink = sink.clone();
            Box::new(move || -> anyhow::Result<()> {
                sink.lock().push(item);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn test_fifo_single_writer_order() {
        let service = StreamService::new("out", Discipline::Fifo);
        service.start();
        let (log, make) = recorder();

        for c in 'A'..='Z' {
            service.submit(make(c.to_string()));
        }
        service.sync();

        let expected: Vec<String> = ('A'..='Z').map(|c| c.to_string()).collect();
        assert_eq!(*log.lock(), expected);
    }

    #[test]
    fn test_fifo_concurrent_writers_keep_program_order() {
        let service = Arc::new(StreamService::new("out", Discipline::Fifo));
        service.start();
        let (log, make) = recorder();
        let make = Arc::new(make);

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let service = service.clone();
                let make = make.clone();
                thread::spawn(move || {
                    for c in 'A'..='Z' {
                        service.submit((*make)(format!("{}{}", w, c)));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        service.sync();

        let log = log.lock();
        assert_eq!(log.len(), 4 * 26);
        for w in 0..4 {
            let seen: Vec<char> = log
                .iter()
                .filter(|item| item.starts_with(&w.to_string()))
                .map(|item| item.chars().nth(1).unwrap())
                .collect();
            assert_eq!(seen, ('A'..='Z').collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_lifo_serves_newest_first() {
        let service = StreamService::new("in", Discipline::Lifo);
        let (log, make) = recorder();

        // Queue before the worker exists so ordering is deterministic
        service.submit(make("old".to_string()));
        service.submit(make("newer".to_string()));
        service.submit(make("newest".to_string()));
        assert_eq!(service.pending(), 3);
        service.start();

        for _ in 0..100 {
            if log.lock().len() == 3 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*log.lock(), vec!["newest", "newer", "old"]);
    }

    #[test]
    fn test_failed_requests_do_not_kill_worker() {
        let service = StreamService::new("out", Discipline::Fifo);
        service.start();
        let (log, make) = recorder();

        service.submit(Box::new(|| -> anyhow::Result<()> { anyhow::bail!("write failed") }));
        service.submit(Box::new(|| -> anyhow::Result<()> { panic!("boom") }));
        service.submit(make("after".to_string()));
        service.sync();

        assert_eq!(*log.lock(), vec!["after"]);
    }

    #[test]
    fn test_start_is_idempotent() {
        let service = StreamService::new("out", Discipline::Fifo);
        service.start();
        service.start();
        let (log, make) = recorder();
        service.submit(make("x".to_string()));
        service.sync();
        assert_eq!(log.lock().len(), 1);
    }
}
