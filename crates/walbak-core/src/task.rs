//! Named worker threads for data-plane transfers.
//!
//! A transfer launches its stages into a `TaskSet` and joins them at the end.
//! `join` surfaces the first error; the others are logged. A worker that dies
//! must have already signalled its queues (`fail`/`sync`), so joining never
//! deadlocks.

use std::thread::JoinHandle;

use tracing::error;

use walbak_types::error::{Result, WalbakError};

pub struct TaskSet {
    handles: Vec<(String, JoinHandle<Result<()>>)>,
}

impl TaskSet {
    pub fn new() -> Self {
        TaskSet { handles: Vec::new() }
    }

    pub fn spawn<F>(&mut self, name: &str, f: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .expect("spawn worker thread");
        self.handles.push((name.to_string(), handle));
    }

    /// Wait for every worker. The first failure is returned; later ones are
    /// logged so they are not silently lost.
    pub fn join(self) -> Result<()> {
        let mut first_err: Option<WalbakError> = None;
        for (name, handle) in self.handles {
            let result = match handle.join() {
                Ok(r) => r,
                Err(_) => Err(WalbakError::Other(format!("worker '{name}' panicked"))),
            };
            if let Err(e) = result {
                if first_err.is_none() {
                    first_err = Some(e);
                } else {
                    error!(worker = %name, error = %e, "additional worker failure");
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Join one scoped stage, turning a panic into an error.
pub fn join_stage(handle: std::thread::ScopedJoinHandle<'_, Result<()>>, name: &str) -> Result<()> {
    handle
        .join()
        .unwrap_or_else(|_| Err(WalbakError::Other(format!("{name} panicked"))))
}

/// Combine the results of scoped pipeline stages. Queue errors are only the
/// echo of a neighbour's failure, so the first non-queue error wins; when
/// every stage reports a queue error, the first of those stands for the
/// whole transfer. Later errors are logged. Used where workers borrow their
/// queues and so cannot go through a `TaskSet`.
pub fn first_error(results: Vec<(&str, Result<()>)>) -> Result<()> {
    let mut queue_err: Option<WalbakError> = None;
    let mut real_err: Option<WalbakError> = None;
    for (name, result) in results {
        if let Err(e) = result {
            let is_queue = matches!(e, WalbakError::QueueClosed | WalbakError::QueueFailed);
            match (is_queue, &queue_err, &real_err) {
                (true, None, _) => queue_err = Some(e),
                (false, _, None) => real_err = Some(e),
                _ => error!(worker = name, error = %e, "additional worker failure"),
            }
        }
    }
    match real_err.or(queue_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_is_ok_when_all_succeed() {
        let mut set = TaskSet::new();
        set.spawn("a", || Ok(()));
        set.spawn("b", || Ok(()));
        assert!(set.join().is_ok());
    }

    #[test]
    fn join_surfaces_first_error() {
        let mut set = TaskSet::new();
        set.spawn("ok", || Ok(()));
        set.spawn("bad", || Err(WalbakError::Other("boom".into())));
        let err = set.join().unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn panic_becomes_error() {
        let mut set = TaskSet::new();
        set.spawn("panics", || panic!("oops"));
        let err = set.join().unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[test]
    fn queue_errors_do_not_mask_the_cause() {
        let err = first_error(vec![
            ("consumer", Err(WalbakError::QueueFailed)),
            ("receiver", Err(WalbakError::Protocol("peer error".into()))),
            ("uncompressor", Err(WalbakError::QueueFailed)),
        ])
        .unwrap_err();
        assert!(matches!(err, WalbakError::Protocol(_)));

        let err = first_error(vec![
            ("a", Err(WalbakError::QueueFailed)),
            ("b", Ok(())),
        ])
        .unwrap_err();
        assert!(matches!(err, WalbakError::QueueFailed));
    }
}
