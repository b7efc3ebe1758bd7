use crate::tools::ProgressReporter;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Anomalies observed while a step attempt was running
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MonitorFlags {
    pub timeout: bool,
    pub resource_constraint: bool,
    pub performance_issue: bool,
}

impl MonitorFlags {
    pub fn any(&self) -> bool {
        self.timeout || self.resource_constraint || self.performance_issue
    }
}

/// Watches a single attempt against its estimate.
///
/// The memory baseline is fixed when the attempt starts: the step's memory
/// grant when it holds one, else the tool's first memory reading. The
/// monitor never preempts the call; its flags feed the next adaptation.
#[derive(Debug)]
pub struct StepMonitor {
    started: Instant,
    estimate: Duration,
    progress: ProgressReporter,
    baseline_memory: Option<f64>,
    flags: MonitorFlags,
}

impl StepMonitor {
    pub fn start(estimate: Duration, progress: ProgressReporter) -> Self {
        let baseline_memory = progress.memory();
        Self {
            started: Instant::now(),
            estimate,
            progress,
            baseline_memory,
            flags: MonitorFlags::default(),
        }
    }

    /// Compare memory readings against `baseline` instead of the first one
    pub fn with_baseline(mut self, baseline: Option<f64>) -> Self {
        if let Some(baseline) = baseline.filter(|b| b.is_finite() && *b > 0.0) {
            self.baseline_memory = Some(baseline);
        }
        self
    }

    pub fn baseline_memory(&self) -> Option<f64> {
        self.baseline_memory
    }

    /// Take one reading at `now`; returns the latest memory reading so the
    /// caller can forward it to the resource manager
    pub fn observe(&mut self, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.started);

        if !self.estimate.is_zero() && elapsed > self.estimate.saturating_mul(2) {
            self.flags.timeout = true;
        }

        let memory = self.progress.memory();
        if let Some(current) = memory {
            match self.baseline_memory {
                None => self.baseline_memory = Some(current),
                Some(baseline) if current > baseline * 2.0 => {
                    self.flags.resource_constraint = true;
                }
                Some(_) => {}
            }
        }

        if self.progress.has_reported() && !self.estimate.is_zero() && elapsed >= self.estimate / 4
        {
            let expected = (elapsed.as_secs_f64() / self.estimate.as_secs_f64()).min(1.0);
            if self.progress.progress() < expected * 0.5 {
                self.flags.performance_issue = true;
            }
        }

        memory
    }

    pub fn flags(&self) -> MonitorFlags {
        self.flags
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_flag_after_twice_the_estimate() {
        let mut monitor = StepMonitor::start(Duration::from_secs(10), ProgressReporter::new());
        let start = Instant::now();

        monitor.observe(start + Duration::from_secs(19));
        assert!(!monitor.flags().timeout);
        monitor.observe(start + Duration::from_secs(21));
        assert!(monitor.flags().timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_growth_against_baseline() {
        let progress = ProgressReporter::new();
        let mut monitor = StepMonitor::start(Duration::from_secs(10), progress.clone());
        let start = Instant::now();

        progress.report_memory(10.0);
        assert_eq!(monitor.observe(start), Some(10.0));
        progress.report_memory(19.0);
        monitor.observe(start + Duration::from_secs(1));
        assert!(!monitor.flags().resource_constraint);
        progress.report_memory(25.0);
        monitor.observe(start + Duration::from_secs(2));
        assert!(monitor.flags().resource_constraint);
    }

    #[tokio::test(start_paused = true)]
    async fn test_granted_baseline_is_fixed_at_start() {
        let progress = ProgressReporter::new();
        let mut monitor =
            StepMonitor::start(Duration::from_secs(10), progress.clone()).with_baseline(Some(20.0));
        assert_eq!(monitor.baseline_memory(), Some(20.0));
        let start = Instant::now();

        // a first reading far above the grant is already abnormal growth
        progress.report_memory(50.0);
        monitor.observe(start);
        assert!(monitor.flags().resource_constraint);
        assert_eq!(monitor.baseline_memory(), Some(20.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_baseline_falls_back_to_first_reading() {
        let progress = ProgressReporter::new();
        let mut monitor =
            StepMonitor::start(Duration::from_secs(10), progress.clone()).with_baseline(Some(0.0));
        assert_eq!(monitor.baseline_memory(), None);

        progress.report_memory(50.0);
        monitor.observe(Instant::now());
        assert!(!monitor.flags().resource_constraint);
        assert_eq!(monitor.baseline_memory(), Some(50.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_progress_flags_performance_issue() {
        let progress = ProgressReporter::new();
        let mut monitor = StepMonitor::start(Duration::from_secs(8), progress.clone());
        let start = Instant::now();

        // silent tools are never flagged
        monitor.observe(start + Duration::from_secs(6));
        assert!(!monitor.flags().performance_issue);

        progress.report(0.5);
        monitor.observe(start + Duration::from_secs(6));
        assert!(!monitor.flags().performance_issue);

        progress.report(0.2);
        monitor.observe(start + Duration::from_secs(6));
        assert!(monitor.flags().performance_issue);
        assert!(monitor.flags().any());
    }
}
