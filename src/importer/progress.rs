use std::time::{Duration, Instant};

use tracing::info;

/// Periodic `progress` lines for a long-running step.
#[derive(Debug, Clone)]
pub struct Progress {
    label: String,
    every: usize,
    start: Instant,
    last_log: Instant,
    processed: usize,
}

impl Progress {
    pub fn new<L: Into<String>>(label: L, every: usize) -> Self {
        let now = Instant::now();
        Self {
            label: label.into(),
            every: every.max(1),
            start: now,
            last_log: now,
            processed: 0,
        }
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn tick(&mut self) {
        self.processed += 1;
        if self.processed % self.every == 0 {
            self.log(false);
        }
    }

    pub fn finish(&mut self) {
        self.log(true);
    }

    fn log(&mut self, done: bool) {
        let now = Instant::now();
        if !done && now.duration_since(self.last_log) < Duration::from_millis(200) {
            // tiny intervals on fast input would flood the log
            return;
        }
        self.last_log = now;

        let elapsed = now.duration_since(self.start).as_secs_f64().max(0.001);
        let rate = (self.processed as f64) / elapsed;
        if done {
            info!(
                target: "progress",
                label = %self.label,
                processed = self.processed,
                rate = ?format!("{:.1}/s", rate),
                took = ?format!("{:.1}s", elapsed),
                "done"
            );
        } else {
            info!(
                target: "progress",
                label = %self.label,
                processed = self.processed,
                rate = ?format!("{:.1}/s", rate),
                "progress"
            );
        }
    }
}
