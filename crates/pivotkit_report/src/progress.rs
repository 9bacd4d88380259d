//! Progress reporting and cooperative cancellation.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpecProgressEvent {
    pub message: Option<String>,
    pub n_current: Option<usize>,
    pub n_total: Option<usize>,
    /// The run stopped; no further events follow.
    pub if_done: bool,
}

impl SpecProgressEvent {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn step(message: impl Into<String>, n_current: usize, n_total: usize) -> Self {
        Self {
            message: Some(message.into()),
            n_current: Some(n_current),
            n_total: Some(n_total),
            if_done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            if_done: true,
            ..Default::default()
        }
    }
}

impl fmt::Display for SpecProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.if_done {
            return f.write_str("done");
        }
        f.write_str(self.message.as_deref().unwrap_or_default())
    }
}

/// Receiver of progress events that may also request cancellation.
///
/// Sinks are shared with the thread running the report, so they must be
/// `Send + Sync`; `is_running` is polled between units of work.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: SpecProgressEvent);

    fn is_running(&self) -> bool {
        true
    }

    /// Mark the run as stopped.
    fn terminate(&self) {}
}

/// Logs events through `tracing`; never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn emit(&self, event: SpecProgressEvent) {
        match (event.n_current, event.n_total) {
            (Some(n_current), Some(n_total)) => {
                tracing::debug!(n_current, n_total, "{event}");
            }
            _ => tracing::info!("{event}"),
        }
    }
}

/// Cancellation flag shared with the caller, optionally forwarding events
/// over a channel.
#[derive(Debug, Clone)]
pub struct FlagProgressSink {
    if_running: Arc<AtomicBool>,
    tx: Option<Sender<SpecProgressEvent>>,
}

impl Default for FlagProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FlagProgressSink {
    pub fn new() -> Self {
        Self {
            if_running: Arc::new(AtomicBool::new(true)),
            tx: None,
        }
    }

    pub fn with_sender(mut self, tx: Sender<SpecProgressEvent>) -> Self {
        self.tx = Some(tx);
        self
    }

    /// Handle for requesting cancellation from another thread.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.if_running)
    }

    pub fn cancel(&self) {
        self.if_running.store(false, Ordering::SeqCst);
    }
}

impl ProgressSink for FlagProgressSink {
    fn emit(&self, event: SpecProgressEvent) {
        tracing::trace!("{event}");
        if let Some(tx) = &self.tx {
            // a dropped receiver only means nobody is listening
            let _ = tx.send(event);
        }
    }

    fn is_running(&self) -> bool {
        self.if_running.load(Ordering::SeqCst)
    }

    fn terminate(&self) {
        self.cancel();
    }
}

/// Emit through an optional sink.
pub(crate) fn emit(progress: Option<&dyn ProgressSink>, event: SpecProgressEvent) {
    if let Some(sink) = progress {
        sink.emit(event);
    }
}

/// Whether an optional sink still allows work to continue.
pub(crate) fn is_running(progress: Option<&dyn ProgressSink>) -> bool {
    progress.is_none_or(|sink| sink.is_running())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_flag_sink_cancels_and_forwards() {
        let (tx, rx) = mpsc::channel();
        let sink = FlagProgressSink::new().with_sender(tx);
        assert!(sink.is_running());

        sink.emit(SpecProgressEvent::step("Loading data: 2 of 10", 2, 10));
        sink.flag().store(false, Ordering::SeqCst);
        assert!(!sink.is_running());
        sink.emit(SpecProgressEvent::done());

        let l_events: Vec<SpecProgressEvent> = rx.try_iter().collect();
        assert_eq!(l_events.len(), 2);
        assert_eq!(l_events[0].n_current, Some(2));
        assert!(l_events[1].if_done);
    }

    #[test]
    fn test_optional_sink_helpers() {
        assert!(is_running(None));
        let sink = FlagProgressSink::new();
        sink.terminate();
        assert!(!is_running(Some(&sink)));
        emit(None, SpecProgressEvent::message("ignored"));
    }

    #[test]
    fn test_event_display() {
        assert_eq!(SpecProgressEvent::done().to_string(), "done");
        assert_eq!(
            SpecProgressEvent::message("Saving result...").to_string(),
            "Saving result..."
        );
        assert_eq!(
            SpecProgressEvent::step("Loading data: 2 of 4", 2, 4).to_string(),
            "Loading data: 2 of 4"
        );
    }
}
