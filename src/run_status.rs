use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Shared progress of one long-running backtest, readable from other threads.
#[derive(Clone, Default)]
pub struct RunStatus {
    inner: Arc<Mutex<RunStatusData>>,
}

#[derive(Default)]
struct RunStatusData {
    phase: String,
    total_steps: usize,
    completed_steps: usize,
    skipped_steps: usize,
    last_value: Option<f64>,
    note: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RunStatusSnapshot {
    pub phase: String,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub skipped_steps: usize,
    pub last_value: Option<f64>,
    pub note: Option<String>,
}

impl RunStatusSnapshot {
    /// Fraction of rebalance dates processed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total_steps == 0 {
            0.0
        } else {
            (self.completed_steps as f64 / self.total_steps as f64).min(1.0)
        }
    }
}

impl RunStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunStatusData {
                phase: "Initializing".to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn set_phase<S: Into<String>>(&self, phase: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase.into();
        }
    }

    pub fn set_total(&self, total_steps: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.total_steps = total_steps;
            data.completed_steps = 0;
            data.skipped_steps = 0;
        }
    }

    pub fn record_step(&self, value: f64, skipped: bool) {
        if let Ok(mut data) = self.inner.lock() {
            data.completed_steps += 1;
            if skipped {
                data.skipped_steps += 1;
            }
            data.last_value = Some(value);
        }
    }

    pub fn set_note<S: Into<String>>(&self, note: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.note = Some(note.into());
        }
    }

    pub fn snapshot(&self) -> RunStatusSnapshot {
        if let Ok(data) = self.inner.lock() {
            RunStatusSnapshot {
                phase: data.phase.clone(),
                total_steps: data.total_steps,
                completed_steps: data.completed_steps,
                skipped_steps: data.skipped_steps,
                last_value: data.last_value,
                note: data.note.clone(),
            }
        } else {
            RunStatusSnapshot {
                phase: "Status unavailable".to_string(),
                total_steps: 0,
                completed_steps: 0,
                skipped_steps: 0,
                last_value: None,
                note: None,
            }
        }
    }
}

/// Cooperative cancellation flag, checked between rebalance steps.
#[derive(Clone, Default, Debug)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_tracks_recorded_steps() {
        let status = RunStatus::new();
        assert_eq!(status.snapshot().phase, "Initializing");
        status.set_total(4);
        status.record_step(100.0, false);
        status.record_step(101.0, true);
        let snapshot = status.snapshot();
        assert_eq!(snapshot.completed_steps, 2);
        assert_eq!(snapshot.skipped_steps, 1);
        assert_eq!(snapshot.last_value, Some(101.0));
        assert!((snapshot.progress() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn clones_share_state() {
        let status = RunStatus::new();
        let reader = status.clone();
        status.set_phase("Rebalancing");
        assert_eq!(reader.snapshot().phase, "Rebalancing");

        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
