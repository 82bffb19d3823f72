//! Nickname → session map shared by every connection task.
//!
//! The map lives behind a single `std::sync::Mutex`. Its guard cannot be held
//! across an `.await`, so every method here finishes its map work and drops
//! the lock before returning; callers do their network I/O on the returned
//! copies, never on the map itself.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::session::{Session, SessionState};

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Every mutation is a single insert or remove, so a panic elsewhere
    // cannot leave the map half-updated.
    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `nickname` for `session` and marks the session active.
    ///
    /// Returns `false` without touching the map when any session still holds
    /// the nickname, or when `session` is not negotiating. A closing holder
    /// keeps the name until its own teardown unregisters it. The check and
    /// the insert happen under one lock acquisition, so of two sessions
    /// racing for the same name exactly one wins.
    pub fn register(&self, session: &Arc<Session>, nickname: &str) -> bool {
        let mut entries = self.entries();

        if entries.contains_key(nickname) || !session.activate(nickname) {
            return false;
        }

        entries.insert(nickname.to_string(), Arc::clone(session));
        true
    }

    /// Removes `session` and returns the nickname it held.
    ///
    /// Safe to call any number of times; only the first call for a registered
    /// session returns `Some`.
    pub fn unregister(&self, session: &Session) -> Option<String> {
        let nickname = session.nickname()?;
        let mut entries = self.entries();

        match entries.get(nickname) {
            Some(entry) if entry.id() == session.id() => {
                entries.remove(nickname);
                Some(nickname.to_string())
            }
            _ => None,
        }
    }

    /// Active session registered under `nickname`, if any.
    pub fn lookup(&self, nickname: &str) -> Option<Arc<Session>> {
        self.entries()
            .get(nickname)
            .filter(|session| session.state() == SessionState::Active)
            .cloned()
    }

    /// Point-in-time copy of every registered session, ordered by nickname.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.entries().values().cloned().collect()
    }

    pub fn nicknames(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
