// SPDX-License-Identifier: LGPL-3.0-or-later

//! Defaults (named-value bag) entity (§3): insertion-ordered acquisition
//! values and DSP symbol passthroughs. Insertion order is load-bearing for
//! the user-setup sequencer (§4.8).

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct DefaultEntry {
    pub name: String,
    pub current: f64,
    pub pending: Option<f64>,
    /// Set by the driver for values it will not accept a `set()` for
    /// (read-only acquisition values); the engine's `get()` falls back to
    /// the driver only for these (§4.6).
    pub read_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Defaults {
    pub alias: String,
    entries: Vec<DefaultEntry>,
}

impl Defaults {
    pub fn new() -> Self {
        Defaults {
            alias: String::new(),
            entries: Vec::new(),
        }
    }

    /// Insert at the end if new, otherwise update in place — insertion
    /// order must survive repeated `set()` calls so user-setup replays
    /// values in the order the client originally configured them.
    pub fn set(&mut self, name: &str, value: f64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.current = value;
            entry.pending = None;
        } else {
            self.entries.push(DefaultEntry {
                name: name.to_string(),
                current: value,
                pending: None,
                read_only: false,
            });
        }
    }

    pub fn mark_read_only(&mut self, name: &str, read_only: bool) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.read_only = read_only;
        }
    }

    pub fn get(&self, name: &str) -> Result<f64> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.current)
            .ok_or_else(|| Error::UnknownValue(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn entry(&self, name: &str) -> Option<&DefaultEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| Error::NoRemove(name.to_string()))?;
        self.entries.remove(pos);
        Ok(())
    }

    /// Application order for the user-setup sequencer: skips read-only
    /// entries (§4.8).
    pub fn iter_applicable(&self) -> impl Iterator<Item = &DefaultEntry> {
        self.entries.iter().filter(|e| !e.read_only)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DefaultEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// §3 invariant check helper: every name in `required` is present.
    pub fn has_all(&self, required: &[&str]) -> bool {
        required.iter().all(|name| self.contains(name))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_preserves_insertion_order_on_update() {
        let mut d = Defaults::new();
        d.set("peaking_time", 1.0);
        d.set("gap_time", 2.0);
        d.set("peaking_time", 5.0);
        let names: Vec<&str> = d.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["peaking_time", "gap_time"]);
        assert_eq!(d.get("peaking_time").unwrap(), 5.0);
    }

    #[test]
    fn read_only_entries_skipped_in_applicable_iteration() {
        let mut d = Defaults::new();
        d.set("a", 1.0);
        d.set("b", 2.0);
        d.mark_read_only("a", true);
        let names: Vec<&str> = d.iter_applicable().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }
}
