//! Live status reporting.
//!
//! The orchestrator publishes per-target status messages through a
//! [`StatusSink`]. The CLI hands it a console sink; tests and the
//! restore flow use [`MemorySink`] to capture the final status lines.
//! A failed update never disrupts the run: the orchestrator logs the
//! error and carries on.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Mutex;

/// Receives per-target status updates.
pub trait StatusSink: Send + Sync {
    /// Publish `message` as the current status of `target`.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying display channel fails.
    fn update(&self, target: &str, message: &str) -> io::Result<()>;
}

/// Writes one status line per update to stderr.
#[derive(Debug, Default)]
pub struct ConsoleStatus;

impl StatusSink for ConsoleStatus {
    fn update(&self, target: &str, message: &str) -> io::Result<()> {
        writeln!(io::stderr().lock(), "{target}: {message}")
    }
}

/// Records updates in memory, keyed by target name. The last update per
/// target is retained alongside the full sequence.
#[derive(Debug, Default)]
pub struct MemorySink {
    updates: Mutex<Vec<(String, String)>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All updates in arrival order.
    #[must_use]
    pub fn updates(&self) -> Vec<(String, String)> {
        self.lock().clone()
    }

    /// The most recent message for each target.
    #[must_use]
    pub fn latest(&self) -> HashMap<String, String> {
        let mut latest = HashMap::new();
        for (target, message) in self.lock().iter() {
            latest.insert(target.clone(), message.clone());
        }
        latest
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, String)>> {
        match self.updates.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl StatusSink for MemorySink {
    fn update(&self, target: &str, message: &str) -> io::Result<()> {
        self.lock().push((target.to_string(), message.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_tracks_latest_per_target() {
        let sink = MemorySink::new();
        sink.update("a", "starting").unwrap();
        sink.update("b", "starting").unwrap();
        sink.update("a", "done").unwrap();
        assert_eq!(sink.updates().len(), 3);
        let latest = sink.latest();
        assert_eq!(latest["a"], "done");
        assert_eq!(latest["b"], "starting");
    }
}
