use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::util::{format_datetime, format_duration};

/// What a pool slot is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerState {
    Idle,
    Work,
    Starting,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "IDLE"),
            WorkerState::Work => write!(f, "WORK"),
            WorkerState::Starting => write!(f, "STARTING"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub id: usize,
    pub state: WorkerState,
    /// URL of the job in progress; empty unless working.
    pub url: String,
}

/// Snapshot of cluster progress.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub start_time: String,
    pub now: String,
    pub idle: bool,
    pub done_targets: usize,
    pub all_target_count: usize,
    pub done_perc_str: String,
    pub error_count: usize,
    pub error_perc: String,
    pub remaining_pages: usize,
    pub time_running: String,
    pub time_remaining: String,
    pub pages_per_second: String,
    pub pages_per_second_string: String,
    pub workers: Vec<WorkerStatus>,
}

/// Raw counters the status is derived from, captured under the cluster lock.
#[derive(Debug, Clone)]
pub(crate) struct Counters {
    pub all_target_count: usize,
    pub queued: usize,
    pub busy: usize,
    pub error_count: usize,
    pub workers: Vec<WorkerStatus>,
}

impl ClusterStatus {
    pub(crate) fn build(
        counters: Counters,
        started_at: DateTime<Local>,
        now: DateTime<Local>,
        elapsed: Duration,
    ) -> Self {
        let Counters {
            all_target_count,
            queued,
            busy,
            error_count,
            workers,
        } = counters;

        let done_targets = all_target_count.saturating_sub(queued + busy);
        let done_fraction = if all_target_count == 0 {
            1.0
        } else {
            done_targets as f64 / all_target_count as f64
        };
        let error_perc = if done_targets == 0 {
            "0.00".to_string()
        } else {
            format!("{:.2}", 100.0 * error_count as f64 / done_targets as f64)
        };

        let time_remaining = if done_fraction > 0.0 {
            let total = elapsed.as_secs_f64() / done_fraction;
            Some(Duration::from_secs_f64((total - elapsed.as_secs_f64()).max(0.0)))
        } else {
            None
        };

        let secs = elapsed.as_secs_f64();
        let pages_per_second = if done_targets == 0 || secs == 0.0 {
            "0".to_string()
        } else {
            format!("{:.2}", done_targets as f64 / secs)
        };

        Self {
            start_time: format_datetime(started_at),
            now: format_datetime(now),
            idle: busy == 0 && queued == 0,
            done_targets,
            all_target_count,
            done_perc_str: format!("{:.2}%", 100.0 * done_fraction),
            error_count,
            error_perc: format!("{error_perc}%"),
            remaining_pages: queued,
            time_running: format_duration(Some(elapsed)),
            time_remaining: format_duration(time_remaining),
            pages_per_second_string: format!("{pages_per_second} pages/second"),
            pages_per_second,
            workers,
        }
    }
}
