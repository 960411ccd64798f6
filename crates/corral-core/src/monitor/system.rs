use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio_util::sync::CancellationToken;

/// Spacing between two load samples.
pub const MEASURE_INTERVAL: Duration = Duration::from_millis(200);

/// Timespan the reported CPU load is averaged over.
pub const MEASURE_TIMESPAN: Duration = Duration::from_secs(5);

const INIT_INTERVAL: Duration = Duration::from_millis(50);

const WINDOW_SIZE: usize = (MEASURE_TIMESPAN.as_millis() / MEASURE_INTERVAL.as_millis()) as usize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    /// Global CPU usage in percent.
    pub cpu: f32,
    /// Used memory in percent of total.
    pub memory: f32,
}

/// Bounded window of the most recent load samples.
#[derive(Debug, Default)]
pub struct LoadWindow {
    samples: VecDeque<LoadSample>,
}

impl LoadWindow {
    pub fn push(&mut self, sample: LoadSample) {
        self.samples.push_back(sample);
        while self.samples.len() > WINDOW_SIZE {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean CPU usage over the window, `0.0` before the first sample.
    pub fn cpu_usage(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu).sum::<f32>() / self.samples.len() as f32
    }

    /// Memory usage of the latest sample.
    pub fn memory_usage(&self) -> f32 {
        self.samples.back().map_or(0.0, |s| s.memory)
    }
}

/// Samples CPU and memory load in the background.
pub struct SystemMonitor {
    window: Arc<Mutex<LoadWindow>>,
    cancel: CancellationToken,
}

impl SystemMonitor {
    /// Take the first samples and start the sampling loop. After this
    /// returns the usage getters report real values.
    pub async fn start() -> Self {
        let window = Arc::new(Mutex::new(LoadWindow::default()));
        let cancel = CancellationToken::new();

        let mut system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::new().with_cpu_usage())
                .with_memory(MemoryRefreshKind::new().with_ram()),
        );
        sample(&mut system);
        tokio::time::sleep(INIT_INTERVAL).await;
        lock_window(&window).push(sample(&mut system));

        let task_window = Arc::clone(&window);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MEASURE_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let load = sample(&mut system);
                        lock_window(&task_window).push(load);
                    }
                    () = task_cancel.cancelled() => break,
                }
            }
        });

        Self { window, cancel }
    }

    pub fn cpu_usage(&self) -> f32 {
        lock_window(&self.window).cpu_usage()
    }

    pub fn memory_usage(&self) -> f32 {
        lock_window(&self.window).memory_usage()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SystemMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn sample(system: &mut System) -> LoadSample {
    system.refresh_cpu_usage();
    system.refresh_memory();
    let total = system.total_memory();
    let memory = if total == 0 {
        0.0
    } else {
        (system.used_memory() as f64 * 100.0 / total as f64) as f32
    };
    let cpu = system.global_cpu_usage();
    LoadSample {
        cpu: if cpu.is_finite() { cpu.clamp(0.0, 100.0) } else { 0.0 },
        memory,
    }
}

fn lock_window(window: &Mutex<LoadWindow>) -> MutexGuard<'_, LoadWindow> {
    window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_is_bounded() {
        let mut window = LoadWindow::default();
        for i in 0..100 {
            window.push(LoadSample {
                cpu: i as f32,
                memory: 50.0,
            });
        }
        assert_eq!(window.len(), 25);
        // Only samples 75..100 remain.
        assert!((window.cpu_usage() - 87.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_empty_window_reports_zero() {
        let window = LoadWindow::default();
        assert!(window.is_empty());
        assert_eq!(window.cpu_usage(), 0.0);
        assert_eq!(window.memory_usage(), 0.0);
    }

    #[test]
    fn test_memory_is_latest_sample() {
        let mut window = LoadWindow::default();
        window.push(LoadSample {
            cpu: 10.0,
            memory: 40.0,
        });
        window.push(LoadSample {
            cpu: 20.0,
            memory: 45.5,
        });
        assert_eq!(window.memory_usage(), 45.5);
        assert_eq!(window.cpu_usage(), 15.0);
    }

    #[tokio::test]
    async fn test_monitor_reports_after_start() {
        let monitor = SystemMonitor::start().await;
        let cpu = monitor.cpu_usage();
        let memory = monitor.memory_usage();
        assert!((0.0..=100.0).contains(&cpu));
        assert!((0.0..=100.0).contains(&memory));
        monitor.close();
    }
}
