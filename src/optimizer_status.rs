use crate::models::BacktestTaskResult;
use crate::performance::format_profit_factor;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OptimizerPhase {
    #[default]
    Idle,
    Running,
    Completed,
    /// Stopped by the time budget or the cancel flag before every
    /// combination started.
    Cancelled,
}

impl OptimizerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerPhase::Idle => "idle",
            OptimizerPhase::Running => "running",
            OptimizerPhase::Completed => "completed",
            OptimizerPhase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OptimizerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters of one grid run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizerProgress {
    pub phase: OptimizerPhase,
    pub total: usize,
    pub evaluated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cache_hits: usize,
    pub best_profit_factor: Option<f64>,
}

impl OptimizerProgress {
    pub fn finished(&self) -> usize {
        self.evaluated + self.failed + self.skipped
    }

    /// Short line for the progress bar, e.g. `best PF 1.84 | 2 failed`.
    pub fn message(&self) -> String {
        let mut parts = vec![match self.best_profit_factor {
            Some(pf) => format!("best PF {}", format_profit_factor(pf)),
            None => "no results yet".to_string(),
        }];
        if self.failed > 0 {
            parts.push(format!("{} failed", self.failed));
        }
        if self.skipped > 0 {
            parts.push(format!("{} skipped", self.skipped));
        }
        if self.cache_hits > 0 {
            parts.push(format!("{} cached", self.cache_hits));
        }
        parts.join(" | ")
    }
}

/// Progress of a grid run, shared between the collecting loop and any
/// observer holding a clone.
#[derive(Clone, Default)]
pub struct OptimizerStatus {
    inner: Arc<Mutex<OptimizerProgress>>,
}

impl OptimizerStatus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, OptimizerProgress> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resets the counters for a run over `total` combinations.
    pub fn begin(&self, total: usize) {
        *self.lock() = OptimizerProgress {
            phase: OptimizerPhase::Running,
            total,
            ..OptimizerProgress::default()
        };
    }

    /// Counts one worker outcome and returns the updated progress.
    pub fn record(&self, outcome: &BacktestTaskResult) -> OptimizerProgress {
        let mut progress = self.lock();
        match (&outcome.result, &outcome.error) {
            (Some(result), _) => {
                progress.evaluated += 1;
                if outcome.cached {
                    progress.cache_hits += 1;
                }
                let pf = result.profit_factor;
                if progress.best_profit_factor.map_or(true, |best| pf > best) {
                    progress.best_profit_factor = Some(pf);
                }
            }
            (None, Some(_)) => progress.failed += 1,
            (None, None) => progress.skipped += 1,
        }
        progress.clone()
    }

    /// Closes the run. Any skipped combination marks it cancelled.
    pub fn finish(&self) -> OptimizerProgress {
        let mut progress = self.lock();
        progress.phase = if progress.skipped > 0 {
            OptimizerPhase::Cancelled
        } else {
            OptimizerPhase::Completed
        };
        progress.clone()
    }

    pub fn snapshot(&self) -> OptimizerProgress {
        self.lock().clone()
    }
}
