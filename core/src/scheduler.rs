//! Cooperative cancellation and progress reporting.

use std::ops::ControlFlow;
use std::time::Instant;

/// Host hooks called by the orchestrator between methods and periodically
/// during a rebalance. Nothing inside a single insert or delete yields.
pub trait Scheduler {
    /// `Break` asks the run to stop; unsaved work of the current method is dropped.
    fn checkpoint(&mut self) -> ControlFlow<()>;

    fn report_progress(&mut self, message: &str);
}

/// Logs progress through `tracing`; stops at an optional deadline.
#[derive(Debug, Default)]
pub struct LoggingScheduler {
    deadline: Option<Instant>,
}

impl LoggingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self { deadline: Some(deadline) }
    }
}

impl Scheduler for LoggingScheduler {
    fn checkpoint(&mut self) -> ControlFlow<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                tracing::warn!("time limit reached, stopping at checkpoint");
                ControlFlow::Break(())
            }
            _ => ControlFlow::Continue(()),
        }
    }

    fn report_progress(&mut self, message: &str) {
        tracing::info!(progress = message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expired_deadline_breaks() {
        let mut s = LoggingScheduler::with_deadline(Instant::now());
        std::thread::sleep(Duration::from_millis(1));
        assert!(s.checkpoint().is_break());
        assert!(LoggingScheduler::new().checkpoint().is_continue());
    }
}
