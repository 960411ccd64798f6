//! Terminal progress display and system load sampling.

mod display;
mod system;

use std::io;

pub use display::Display;
pub use system::{LoadSample, LoadWindow, MEASURE_INTERVAL, MEASURE_TIMESPAN, SystemMonitor};

use crate::cluster::{ClusterStatus, WorkerState};

/// Build the lines of one monitor frame.
pub fn frame_lines(status: &ClusterStatus, load: LoadSample) -> Vec<String> {
    let mut lines = vec![
        format!("== Start:     {}", status.start_time),
        format!(
            "== Now:       {} (running for {})",
            status.now, status.time_running
        ),
        format!(
            "== Progress:  {} / {} ({}), errors: {} ({})",
            status.done_targets,
            status.all_target_count,
            status.done_perc_str,
            status.error_count,
            status.error_perc
        ),
        format!(
            "== Remaining: {} (@ {})",
            status.time_remaining, status.pages_per_second_string
        ),
        format!(
            "== Sys. load: {:.1}% CPU / {:.1}% memory",
            load.cpu, load.memory
        ),
        format!("== Workers:   {}", status.workers.len()),
    ];

    for worker in &status.workers {
        lines.push(match worker.state {
            WorkerState::Starting => format!("   #{} STARTING...", worker.id),
            state => format!("   #{} {} {}", worker.id, state, worker.url),
        });
    }
    lines
}

/// Draw one frame and rewind the cursor for the next.
pub fn render(display: &mut Display, status: &ClusterStatus, load: LoadSample) -> io::Result<()> {
    for line in frame_lines(status, load) {
        display.log(&line)?;
    }
    display.reset_cursor()
}
