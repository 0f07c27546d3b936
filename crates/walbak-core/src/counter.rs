//! In-flight action accounting.
//!
//! Commands that must not race with long-running work (`clear-vol`, `stop`,
//! `restore`, ...) gate on `is_all_zero` over the relevant action names.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::stop::Notifier;

pub struct ActionCounters {
    counts: Mutex<HashMap<String, usize>>,
    notifier: Arc<Notifier>,
}

impl ActionCounters {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        ActionCounters {
            counts: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    pub fn increment(&self, name: &str) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(name.to_string()).or_insert(0) += 1;
        drop(counts);
        self.notifier.notify();
    }

    pub fn decrement(&self, name: &str) {
        let mut counts = self.counts.lock().unwrap();
        let c = counts
            .get_mut(name)
            .unwrap_or_else(|| panic!("decrement of untracked action '{name}'"));
        assert!(*c > 0, "action counter underflow for '{name}'");
        *c -= 1;
        drop(counts);
        self.notifier.notify();
    }

    pub fn value(&self, name: &str) -> usize {
        *self.counts.lock().unwrap().get(name).unwrap_or(&0)
    }

    pub fn is_all_zero(&self, names: &[&str]) -> bool {
        let counts = self.counts.lock().unwrap();
        names.iter().all(|n| counts.get(*n).copied().unwrap_or(0) == 0)
    }

    /// Snapshot of the non-zero counters, for status output.
    pub fn non_zero(&self) -> Vec<(String, usize)> {
        let counts = self.counts.lock().unwrap();
        let mut v: Vec<_> = counts
            .iter()
            .filter(|(_, c)| **c > 0)
            .map(|(n, c)| (n.clone(), *c))
            .collect();
        v.sort();
        v
    }
}

/// Scope guard: increments on construction, decrements on drop, so an
/// erroring action never leaves its counter dangling.
pub struct ActionCounterTransaction<'a> {
    ac: &'a ActionCounters,
    name: String,
}

impl<'a> ActionCounterTransaction<'a> {
    pub fn new(ac: &'a ActionCounters, name: &str) -> Self {
        ac.increment(name);
        ActionCounterTransaction {
            ac,
            name: name.to_string(),
        }
    }
}

impl Drop for ActionCounterTransaction<'_> {
    fn drop(&mut self) {
        self.ac.decrement(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters() -> ActionCounters {
        ActionCounters::new(Arc::new(Notifier::new()))
    }

    #[test]
    fn balanced_increments_reach_zero() {
        let ac = counters();
        assert!(ac.is_all_zero(&["Merge", "Apply"]));
        ac.increment("Merge");
        ac.increment("Merge");
        ac.increment("Apply");
        assert!(!ac.is_all_zero(&["Merge"]));
        ac.decrement("Merge");
        assert!(!ac.is_all_zero(&["Merge", "Apply"]));
        ac.decrement("Merge");
        ac.decrement("Apply");
        assert!(ac.is_all_zero(&["Merge", "Apply"]));
    }

    #[test]
    fn subset_ignores_other_names() {
        let ac = counters();
        ac.increment("Restore");
        assert!(ac.is_all_zero(&["Merge", "Apply"]));
        assert!(!ac.is_all_zero(&["Restore"]));
    }

    #[test]
    fn transaction_decrements_on_drop() {
        let ac = counters();
        {
            let _tran = ActionCounterTransaction::new(&ac, "Apply");
            assert_eq!(ac.value("Apply"), 1);
        }
        assert_eq!(ac.value("Apply"), 0);
    }
}
