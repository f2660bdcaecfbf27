//! Process-wide, ordered list of live sessions.
//!
//! Every operation takes one lock and releases it fairly, so a thread
//! looping over index lookups cannot starve one that is adding or removing.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::session::Session;

/// Result of removing a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// It was the only session left
    Last,
    /// Removed from `index`; `remaining` sessions are still registered
    Removed { index: usize, remaining: usize },
    /// It was not registered
    Absent,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<Vec<Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked<R>(&self, f: impl FnOnce(&mut Vec<Arc<Session>>) -> R) -> R {
        let mut sessions = self.sessions.lock();
        let result = f(&mut sessions);
        MutexGuard::unlock_fair(sessions);
        result
    }

    /// Append a session; returns its index
    pub fn add(&self, session: Arc<Session>) -> usize {
        self.locked(|sessions| {
            sessions.push(session);
            sessions.len() - 1
        })
    }

    /// Remove `session`, reporting whether it was the last one
    pub fn remove(&self, session: &Session) -> Removal {
        self.locked(|sessions| match position(sessions, session) {
            None => Removal::Absent,
            Some(index) => {
                sessions.remove(index);
                if sessions.is_empty() {
                    Removal::Last
                } else {
                    Removal::Removed {
                        index,
                        remaining: sessions.len(),
                    }
                }
            }
        })
    }

    pub fn index_of(&self, session: &Session) -> Option<usize> {
        self.locked(|sessions| position(sessions, session))
    }

    pub fn get(&self, index: usize) -> Option<Arc<Session>> {
        self.locked(|sessions| sessions.get(index).cloned())
    }

    pub fn len(&self) -> usize {
        self.locked(|sessions| sessions.len())
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.locked(|sessions| sessions.clone())
    }

    /// The session holding focus, if any
    pub fn current(&self) -> Option<Arc<Session>> {
        self.locked(|sessions| sessions.iter().find(|s| s.is_current()).cloned())
    }
}

fn position(sessions: &[Arc<Session>], session: &Session) -> Option<usize> {
    sessions
        .iter()
        .position(|s| std::ptr::eq(Arc::as_ptr(s), session))
}
