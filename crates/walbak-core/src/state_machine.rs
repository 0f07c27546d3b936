//! Per-volume state machine.
//!
//! States form a directed graph whose edges are enumerated at construction.
//! Operations change state only through a scoped [`Transaction`]: assert the
//! expected rest state, flip to the transient, run the long work with the
//! lock released, then `commit` the final rest state. Dropping the
//! transaction without committing rolls back to the starting state. After an
//! explicit `leave_transient` the transient state stays visible instead, so
//! the operator sees the failed transfer (recovery is `reset-vol`).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use walbak_types::error::{Result, WalbakError};

use crate::stop::Notifier;

#[derive(Debug)]
pub struct StateMachine {
    state: Mutex<String>,
    edges: HashSet<(String, String)>,
    states: HashSet<String>,
    notifier: Arc<Notifier>,
}

impl StateMachine {
    pub fn new(initial: &str, table: &[(&str, &str)], notifier: Arc<Notifier>) -> Self {
        let mut edges = HashSet::new();
        let mut states = HashSet::new();
        for (from, to) in table {
            edges.insert((from.to_string(), to.to_string()));
            states.insert(from.to_string());
            states.insert(to.to_string());
        }
        states.insert(initial.to_string());
        StateMachine {
            state: Mutex::new(initial.to_string()),
            edges,
            states,
            notifier,
        }
    }

    pub fn get(&self) -> String {
        self.state.lock().unwrap().clone()
    }

    /// Force-set the state. Used for rehydration from disk and for
    /// `reset-vol` style recovery; the target must be a known state.
    pub fn set(&self, state: &str) -> Result<()> {
        if !self.states.contains(state) {
            return Err(WalbakError::Other(format!("unknown state '{state}'")));
        }
        *self.state.lock().unwrap() = state.to_string();
        self.notifier.notify();
        Ok(())
    }

    fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edges.contains(&(from.to_string(), to.to_string()))
    }

    /// Begin a transition `expected_from -> transient`.
    pub fn transaction<'a>(
        &'a self,
        vol: &str,
        expected_from: &str,
        transient: &str,
    ) -> Result<Transaction<'a>> {
        let mut state = self.state.lock().unwrap();
        if *state != expected_from {
            return Err(WalbakError::BadState {
                vol: vol.to_string(),
                current: state.clone(),
                expected: expected_from.to_string(),
            });
        }
        if !self.has_edge(expected_from, transient) {
            return Err(WalbakError::Other(format!(
                "no edge {expected_from} -> {transient}"
            )));
        }
        *state = transient.to_string();
        drop(state);
        self.notifier.notify();
        Ok(Transaction {
            sm: self,
            vol: vol.to_string(),
            from: expected_from.to_string(),
            transient: transient.to_string(),
            done: false,
        })
    }
}

#[derive(Debug)]
pub struct Transaction<'a> {
    sm: &'a StateMachine,
    vol: String,
    from: String,
    transient: String,
    done: bool,
}

impl Transaction<'_> {
    /// Finish the transition at `final_rest`.
    pub fn commit(mut self, final_rest: &str) -> Result<()> {
        if !self.sm.has_edge(&self.transient, final_rest) {
            return Err(WalbakError::Other(format!(
                "no edge {} -> {final_rest}",
                self.transient
            )));
        }
        let mut state = self.sm.state.lock().unwrap();
        debug_assert_eq!(*state, self.transient, "vol {}", self.vol);
        *state = final_rest.to_string();
        drop(state);
        self.sm.notifier.notify();
        self.done = true;
        Ok(())
    }

    /// Keep the transient state on failure instead of rolling back.
    /// The volume then needs explicit operator recovery. Waiters are still
    /// notified: the operation itself is over.
    pub fn leave_transient(mut self) {
        self.done = true;
        self.sm.notifier.notify();
    }

    pub fn transient(&self) -> &str {
        &self.transient
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut state = self.sm.state.lock().unwrap();
        if *state == self.transient {
            *state = self.from.clone();
        }
        drop(state);
        self.sm.notifier.notify();
    }
}
