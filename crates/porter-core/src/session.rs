//! Registry of injected pipe sessions.
//!
//! Entries are keyed on the synthesized remote filename plus the backup
//! number. Regular files carry a live [`TarMember`]; directories, symlinks
//! and specials are registered metadata-only. Ownership of the member's
//! pipe follows the entry: injecting holds one shared reference, the
//! retrieving consumer another, and the child goes away with the last one.

use crate::tar::TarMember;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct SessionEntry {
    pub member: Option<Arc<TarMember>>,
    pub metadata: Vec<u8>,
}

#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<(String, i32), SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry, replacing any previous one under the same key.
    pub fn inject(
        &self,
        remote_fn: &str,
        backupnum: i32,
        member: Option<TarMember>,
        metadata: Vec<u8>,
    ) {
        let entry = SessionEntry {
            member: member.map(Arc::new),
            metadata,
        };
        self.entries
            .lock()
            .insert((remote_fn.to_string(), backupnum), entry);
    }

    pub fn retrieve(&self, remote_fn: &str, backupnum: i32) -> Option<SessionEntry> {
        self.entries
            .lock()
            .get(&(remote_fn.to_string(), backupnum))
            .cloned()
    }

    pub fn remove(&self, remote_fn: &str, backupnum: i32) -> bool {
        self.entries
            .lock()
            .remove(&(remote_fn.to_string(), backupnum))
            .is_some()
    }

    /// Visible entries as `(key, metadata)` pairs, sorted by key.
    pub fn list(&self) -> Vec<(String, Vec<u8>)> {
        let mut entries: Vec<(String, Vec<u8>)> = self
            .entries
            .lock()
            .iter()
            .map(|((name, _), entry)| (name.clone(), entry.metadata.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Normalize an archive entry name for session keying: one trailing slash
/// stripped, a lone `.` emptied, a leading `./` removed.
pub fn normalize_entry_name(name: &str) -> String {
    let name = name.strip_suffix('/').unwrap_or(name);
    if name == "." {
        return String::new();
    }
    name.strip_prefix("./").unwrap_or(name).to_string()
}

/// Stable remote filename for one archive entry:
/// `<output_fn>[/<entry>]|<backupnum>|<fn_random>`.
pub fn session_key(output_fn: &str, entry_name: &str, backupnum: i32, fn_random: i64) -> String {
    if entry_name.is_empty() {
        format!("{output_fn}|{backupnum}|{fn_random}")
    } else {
        format!("{output_fn}/{entry_name}|{backupnum}|{fn_random}")
    }
}
