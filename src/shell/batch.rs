//! Running a list of scripts as one job.
//!
//! The runner lives on a host session. Every target is forked as a child of
//! that host; each child's exit code comes back through its exit callback
//! and is folded into one aggregate code for the host to exit with.

use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::exit::{describe, ReservedExitCode};
use super::session::{AfterScript, ForkOptions, Session};
use crate::config::BatchConfig;

const POLL: Duration = Duration::from_millis(100);

/// How the aggregate exit code follows the children's codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePolicy {
    /// The most recent code, success included
    AlwaysUseLastCode,
    /// The most recent non-zero code
    LastErrorCode,
}

impl CodePolicy {
    fn fold(self, aggregate: i32, code: i32) -> i32 {
        match self {
            CodePolicy::AlwaysUseLastCode => code,
            CodePolicy::LastErrorCode if code != 0 => code,
            CodePolicy::LastErrorCode => aggregate,
        }
    }
}

pub struct BatchRunner {
    targets: Vec<String>,
    policy: CodePolicy,
    messages: bool,
    sequential: bool,
}

struct Child {
    session: Arc<Session>,
    /// Reads from the console, so it needs focus to make progress
    interactive: bool,
}

/// Bookkeeping for one run
struct Tally {
    rx: Receiver<(String, i32)>,
    pending: usize,
    code: i32,
    children: Vec<Child>,
}

impl BatchRunner {
    pub fn new(targets: Vec<String>, config: &BatchConfig) -> Self {
        Self {
            targets,
            policy: if config.last_code {
                CodePolicy::AlwaysUseLastCode
            } else {
                CodePolicy::LastErrorCode
            },
            messages: config.messages,
            sequential: config.sequential,
        }
    }

    /// Fork every target from `host` and wait for all of them.
    /// Returns the aggregate exit code.
    pub fn run(&self, host: &Session) -> i32 {
        let (tx, rx) = mpsc::channel();
        let mut tally = Tally {
            rx,
            pending: 0,
            code: 0,
            children: Vec::new(),
        };
        info!("Batch on '{}' running {} target(s)", host.name(), self.targets.len());

        for target in &self.targets {
            if !host.is_live() {
                break;
            }
            let label = target.clone();
            let sender = tx.clone();
            let callback = Box::new(move |code: i32| {
                let _ = sender.send((label, code));
            });

            let is_script = Path::new(target).exists() || host.runtime().languages.find(target).is_none();
            let options = if is_script {
                ForkOptions::script(target).then(AfterScript::Exit)
            } else {
                ForkOptions::language(target.as_str())
            };

            tally.pending += 1;
            match host.fork(options.on_exit(callback, false)) {
                Ok(Some(session)) => {
                    if !is_script {
                        self.give_focus(host, &session);
                    }
                    tally.children.push(Child {
                        session,
                        interactive: !is_script,
                    });
                }
                // The callback has already reported the missing script
                Ok(None) => {}
                Err(e) => {
                    warn!("Batch target '{}' failed to start: {}", target, e);
                    host.report_error(&anyhow::Error::new(e).context(format!("cannot run '{}'", target)));
                    tally.pending -= 1;
                    self.record(host, &mut tally, target, ReservedExitCode::Killed.code());
                }
            }

            if self.sequential {
                self.drain(host, &mut tally);
            }
        }
        drop(tx);

        self.drain(host, &mut tally);
        // A child still leaving the registry must not be taken for the last session
        while host.is_live() && tally.children.iter().any(|c| c.session.is_live()) {
            thread::sleep(Duration::from_millis(5));
        }
        info!("Batch on '{}' finished with {}", host.name(), describe(tally.code));
        tally.code
    }

    fn give_focus(&self, host: &Session, child: &Session) {
        if !host.is_current() {
            return;
        }
        if let Some(index) = child.index() {
            if let Err(e) = host.jump_to(index) {
                debug!("Batch could not focus '{}' [{}]: {}", child.name(), index, e);
            }
        }
    }

    /// Collect exit codes until nothing is pending or every child is gone
    fn drain(&self, host: &Session, tally: &mut Tally) {
        while tally.pending > 0 {
            match tally.rx.recv_timeout(POLL) {
                Ok((name, code)) => {
                    tally.pending -= 1;
                    self.record(host, tally, &name, code);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !host.is_live() || tally.children.iter().all(|c| !c.session.is_live()) {
                        // Exit callbacks fire before a child is disposed
                        while let Ok((name, code)) = tally.rx.try_recv() {
                            tally.pending = tally.pending.saturating_sub(1);
                            self.record(host, tally, &name, code);
                        }
                        if tally.pending > 0 {
                            debug!("Batch gave up on {} child(ren) that left no code", tally.pending);
                        }
                        tally.pending = 0;
                        return;
                    }
                    self.refocus(host, tally);
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Focus came back to the host: pass it to an interactive child
    fn refocus(&self, host: &Session, tally: &Tally) {
        if !host.is_current() {
            return;
        }
        if let Some(child) = tally
            .children
            .iter()
            .find(|c| c.interactive && c.session.is_live())
        {
            self.give_focus(host, &child.session);
        }
    }

    fn record(&self, host: &Session, tally: &mut Tally, name: &str, code: i32) {
        if self.messages {
            let _ = host.out_line(&format!("{}: {}", name, describe(code)));
        }
        tally.code = self.policy.fold(tally.code, code);
        debug!("Batch '{}' ended with {}, aggregate {}", name, describe(code), tally.code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::shell::MainTask;
    use crate::testing::{wait_until, Rig};
    use std::fs;

    fn batch(rig: &Rig, targets: Vec<String>) -> Arc<Session> {
        let runner = BatchRunner::new(targets, &rig.runtime.settings.batch);
        let host = Session::new(rig.runtime.clone(), "sh");
        host.set_main(MainTask::Batch(runner)).unwrap();
        host.start("calc").unwrap();
        host
    }

    fn scripts(dir: &tempfile::TempDir, files: &[(&str, &str)]) -> Vec<String> {
        files
            .iter()
            .map(|(name, body)| {
                let path = dir.path().join(name);
                fs::write(&path, body).unwrap();
                path.display().to_string()
            })
            .collect()
    }

    #[test]
    fn test_policy_fold() {
        assert_eq!(CodePolicy::LastErrorCode.fold(3, 0), 3);
        assert_eq!(CodePolicy::LastErrorCode.fold(3, 4), 4);
        assert_eq!(CodePolicy::AlwaysUseLastCode.fold(3, 0), 0);
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = BatchConfig::default();
        assert_eq!(BatchRunner::new(vec![], &config).policy, CodePolicy::LastErrorCode);
        config.last_code = true;
        assert_eq!(BatchRunner::new(vec![], &config).policy, CodePolicy::AlwaysUseLastCode);
    }

    #[test]
    fn test_error_code_survives_later_success() {
        let rig = Rig::new();
        let dir = tempfile::tempdir().unwrap();
        let targets = scripts(
            &dir,
            &[("a.calc", "1+1"), ("b.calc", "sh.exit(3)"), ("c.calc", "2*2")],
        );
        let host = batch(&rig, targets.clone());

        assert_eq!(rig.terminator.wait(), Some(3));
        assert_eq!(host.exit_code(), Some(3));
        let out = rig.out();
        assert!(out.contains(&format!("{}: 0x00 (success)", targets[0])));
        assert!(out.contains(&format!("{}: 3", targets[1])));
        assert!(out.contains(&format!("{}: 0x00 (success)", targets[2])));
        assert!(out.contains("2\n"));
        assert!(out.contains("4\n"));
    }

    #[test]
    fn test_last_code_policy() {
        let mut settings = Settings::default();
        settings.batch.last_code = true;
        let rig = Rig::with(settings, true);
        let dir = tempfile::tempdir().unwrap();
        let targets = scripts(&dir, &[("a.calc", "sh.exit(3)"), ("b.calc", "1")]);
        batch(&rig, targets);

        assert_eq!(rig.terminator.wait(), Some(0));
    }

    #[test]
    fn test_missing_script_reports_no_file() {
        let rig = Rig::new();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.calc").display().to_string();
        batch(&rig, vec![missing.clone()]);

        assert_eq!(rig.terminator.wait(), Some(ReservedExitCode::NoFile.code()));
        assert!(rig.err().contains("cannot interpret invalid script"));
        assert!(rig.out().contains(&format!("{}: 0x1f (no such file)", missing)));
    }

    #[test]
    fn test_quiet_batch_prints_no_status() {
        let mut settings = Settings::default();
        settings.batch.messages = false;
        let rig = Rig::with(settings, true);
        let dir = tempfile::tempdir().unwrap();
        let targets = scripts(&dir, &[("a.calc", "40+2")]);
        batch(&rig, targets.clone());

        assert_eq!(rig.terminator.wait(), Some(0));
        let out = rig.out();
        assert!(out.contains("42\n"));
        assert!(!out.contains(&targets[0]));
    }

    #[test]
    fn test_language_target_takes_focus() {
        let rig = Rig::new();
        let host = batch(&rig, vec!["calc".to_string()]);

        assert!(wait_until(|| rig.out().contains("sh[1]> ")));
        assert!(!host.is_current());
        rig.input.line("6*7");
        assert!(wait_until(|| rig.out().contains("42\n")));
        rig.input.line("sh.exit(5)");

        assert_eq!(rig.terminator.wait(), Some(5));
        assert!(rig.out().contains("calc: 5"));
    }
}
