//! Build progress rendering.
//!
//! The task engine reports through an opaque adapter so the console surface
//! stays out of the core: the engine owns atomic per-group counters and the
//! adapter is polled at a fixed cadence while workers run.

use colored::Colorize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A named bucket of construction tasks used for progress reporting.
#[derive(Debug)]
pub struct TaskGroup {
    pub name: String,
    pub total: AtomicUsize,
    pub current: AtomicUsize,
}

impl TaskGroup {
    pub fn new(name: &str) -> Self {
        TaskGroup {
            name: name.to_string(),
            total: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
        }
    }
}

/// Observer of group counters; polled by the engine every 500 ms.
pub trait ProgressUi {
    fn init(&mut self, _groups: &[Arc<TaskGroup>]) {}
    fn update(&mut self, _groups: &[Arc<TaskGroup>]) {}
    fn finish(&mut self, _groups: &[Arc<TaskGroup>]) {}
}

/// Console renderer: one `group current/total` line per change.
#[derive(Default)]
pub struct ConsoleUi {
    last_counts: Vec<usize>,
}

impl ProgressUi for ConsoleUi {
    fn init(&mut self, groups: &[Arc<TaskGroup>]) {
        self.last_counts = vec![usize::MAX; groups.len()];
    }

    fn update(&mut self, groups: &[Arc<TaskGroup>]) {
        for (index, group) in groups.iter().enumerate() {
            let current = group.current.load(Ordering::Relaxed);
            let total = group.total.load(Ordering::Relaxed);
            if self.last_counts.get(index).copied() == Some(current) {
                continue;
            }
            if let Some(slot) = self.last_counts.get_mut(index) {
                *slot = current;
            }
            println!(
                "{} {}/{}",
                group.name.bright_white(),
                current.to_string().bright_green(),
                total
            );
        }
    }

    fn finish(&mut self, groups: &[Arc<TaskGroup>]) {
        for group in groups {
            let current = group.current.load(Ordering::Relaxed);
            let total = group.total.load(Ordering::Relaxed);
            let status = if current == total {
                "done".bright_green()
            } else {
                "stopped".bright_red()
            };
            println!("{} {}/{} {}", group.name.bright_white(), current, total, status);
        }
    }
}

/// No-op adapter for tests and `--no-output` runs.
#[derive(Default)]
pub struct SilentUi;

impl ProgressUi for SilentUi {}
