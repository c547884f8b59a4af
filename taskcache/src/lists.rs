//! Registry of known list names.
//!
//! A handful of default lists always exist. Any other name becomes known the
//! first time a task is created in it or a snapshot carries it, so a task's
//! list is always a registered name.

use std::collections::BTreeSet;

/// Lists every user starts with.
pub const DEFAULT_LISTS: [&str; 3] = ["Personal", "Work", "Grocery List"];

/// Known list names: the defaults in their configured order, then custom
/// names in sorted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRegistry {
    defaults: Vec<String>,
    custom: BTreeSet<String>,
}

impl Default for ListRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_LISTS.iter().map(ToString::to_string))
    }
}

impl ListRegistry {
    /// Creates a registry with the given default lists.
    pub fn new(defaults: impl IntoIterator<Item = String>) -> Self {
        let mut seen = BTreeSet::new();
        let defaults = defaults
            .into_iter()
            .filter(|name| !name.trim().is_empty() && seen.insert(name.clone()))
            .collect();
        Self {
            defaults,
            custom: BTreeSet::new(),
        }
    }

    /// Returns `true` if `name` is a known list.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.defaults.iter().any(|d| d == name) || self.custom.contains(name)
    }

    /// Registers `name` if it is not known yet. Returns `true` if it was added.
    pub fn ensure(&mut self, name: &str) -> bool {
        if name.trim().is_empty() || self.contains(name) {
            return false;
        }
        tracing::info!(list = name, "registered new list");
        self.custom.insert(name.to_string());
        true
    }

    /// All known list names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.defaults
            .iter()
            .chain(self.custom.iter())
            .map(String::as_str)
    }

    /// Name of the first default list, used when no list is given.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        self.names().next()
    }
}
