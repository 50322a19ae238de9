//! Progress reporting shared by the upload pipeline and the connectivity layer.
//!
//! Observers are called synchronously, in subscription order, with an integer
//! step code. A failing observer does not stop the dispatch to the ones after
//! it, but the failure is handed back to whoever called [`ProgressReporter::report`].

use thiserror::Error;

/// Fixed step codes carried on the progress channel.
pub mod code {
    /// An operation (request handler invocation) started.
    pub const STARTED: i32 = 1;
    /// Progress tick.
    pub const PROGRESS: i32 = 2;
    /// No connection / generic failure.
    pub const FAILURE: i32 = -1;
    /// Writing to the file store failed.
    pub const STORE_WRITE_FAILED: i32 = -2;
    /// The current transaction was aborted for good.
    pub const FATAL_ABORT: i32 = -3;
    /// Connectivity lost; emitted by the Wi-Fi layer.
    pub const CONNECTIVITY_LOST: i32 = -4;
}

type Observer = Box<dyn FnMut(i32) -> anyhow::Result<()> + Send>;

#[derive(Debug, Error)]
#[error("{failed} progress observer(s) failed on step {step}; first error: {first}")]
pub struct ProgressError {
    pub step: i32,
    pub failed: usize,
    pub first: String,
}

#[derive(Default)]
pub struct ProgressReporter {
    observers: Vec<Observer>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer that cannot fail.
    pub fn subscribe<F>(&mut self, mut observer: F)
    where
        F: FnMut(i32) + Send + 'static,
    {
        self.observers.push(Box::new(move |step| {
            observer(step);
            Ok(())
        }));
    }

    /// Register an observer whose errors are surfaced to the reporter's caller.
    pub fn subscribe_fallible<F>(&mut self, observer: F)
    where
        F: FnMut(i32) -> anyhow::Result<()> + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Invoke every observer once with `step`.
    pub fn report(&mut self, step: i32) -> Result<(), ProgressError> {
        let mut failed = 0;
        let mut first = None;

        for observer in self.observers.iter_mut() {
            if let Err(e) = observer(step) {
                failed += 1;
                first.get_or_insert_with(|| format!("{e:#}"));
            }
        }

        match first {
            None => Ok(()),
            Some(first) => Err(ProgressError { step, failed, first }),
        }
    }

    /// Report several steps back to back, logging observer failures.
    ///
    /// Used by the upload pipeline, which must keep going regardless of what
    /// the observers do.
    pub fn report_all(&mut self, steps: &[i32]) {
        for &step in steps {
            if let Err(e) = self.report(step) {
                log::warn!("{e}");
            }
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("observers", &self.observers.len())
            .finish()
    }
}
