//! Incremental parallel task engine.
//!
//! Builds a DAG of construction tasks from the target database and executes
//! it on a worker pool sized `min(available_parallelism, 32)`. Each task
//! carries a freshness stamp: a target is rebuilt iff it does not exist yet,
//! the maximum stamp over its dependencies strictly exceeds its own mtime,
//! or a data dependency in its closure reports changed.
//!
//! Cancellation is cooperative: the first failing command sets an atomic
//! abort flag; tasks observe it on entry and short-circuit, while in-flight
//! external calls run to completion.

use crate::core::blueprint::BlueprintMatch;
use crate::core::commands;
use crate::core::error::YakkaError;
use crate::core::project::Project;
use crate::core::template::TemplateContext;
use crate::core::ui::{ProgressUi, TaskGroup};
use crate::core::utilities::{exec, has_data_dependency_changed, strip_dot_slash};
use crate::core::DATA_DEPENDENCY_IDENTIFIER;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

/// Widest the worker pool gets regardless of core count.
const MAX_WORKERS: usize = 32;
/// UI poll cadence while workers run.
const UI_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Freshness stamp of one construction task.
///
/// `Never` sorts below any file time and `Changed` above, so data
/// dependencies force or suppress rebuilds through the ordinary max/compare
/// logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stamp {
    Never,
    At(SystemTime),
    Changed,
}

/// One graph node per `(target, blueprint match)` pair, or a single leaf per
/// unmatched target.
struct TaskNode {
    target: String,
    matched: Option<Arc<BlueprintMatch>>,
    group: Option<Arc<TaskGroup>>,
    successors: Vec<usize>,
    predecessor_count: usize,
}

/// Result of a build run.
pub struct BuildOutcome {
    pub success: bool,
    /// Data subtree after `save :/data/...` mutations.
    pub data: Value,
}

#[derive(Default)]
pub struct TaskEngine {
    nodes: Vec<TaskNode>,
    /// target -> node indices; an already-seen target links its existing
    /// tasks instead of creating new ones.
    todo: FxHashMap<String, Vec<usize>>,
    groups: Vec<Arc<TaskGroup>>,
}

impl TaskEngine {
    pub fn new() -> Self {
        TaskEngine::default()
    }

    pub fn task_count(&self) -> usize {
        self.nodes.len()
    }

    /// Build the task graph for every command of the project.
    pub fn create_tasks(&mut self, project: &Project) {
        let mut commands: Vec<String> = project.commands.iter().cloned().collect();
        commands.sort();
        for command in commands {
            self.create_tasks_for(&command, None, project);
        }
    }

    fn group_for(&mut self, name: &str) -> Arc<TaskGroup> {
        if let Some(group) = self.groups.iter().find(|g| g.name == name) {
            return Arc::clone(group);
        }
        let group = Arc::new(TaskGroup::new(name));
        self.groups.push(Arc::clone(&group));
        group
    }

    fn link(&mut self, task: usize, parent: Option<usize>) {
        if let Some(parent) = parent {
            self.nodes[task].successors.push(parent);
            self.nodes[parent].predecessor_count += 1;
        }
    }

    fn create_tasks_for(&mut self, target_name: &str, parent: Option<usize>, project: &Project) {
        if target_name.is_empty() {
            error!("Empty target name");
            return;
        }

        if let Some(existing) = self.todo.get(target_name).cloned() {
            for task in existing {
                self.link(task, parent);
            }
            return;
        }

        let matches = project.target_database.get(target_name);

        // No match: a leaf node (source file, data dependency, or nothing).
        if matches.is_empty() {
            let index = self.nodes.len();
            self.nodes.push(TaskNode {
                target: target_name.to_string(),
                matched: None,
                group: None,
                successors: Vec::new(),
                predecessor_count: 0,
            });
            self.todo.entry(target_name.to_string()).or_default().push(index);
            self.link(index, parent);
            return;
        }

        for matched in matches.to_owned() {
            let group_name = matched
                .blueprint
                .group
                .clone()
                .unwrap_or_else(|| "Processing".to_string());
            let group = self.group_for(&group_name);
            group.total.fetch_add(1, Ordering::Relaxed);

            let index = self.nodes.len();
            self.nodes.push(TaskNode {
                target: target_name.to_string(),
                matched: Some(Arc::clone(&matched)),
                group: Some(group),
                successors: Vec::new(),
                predecessor_count: 0,
            });
            self.todo.entry(target_name.to_string()).or_default().push(index);
            self.link(index, parent);

            for dependency in &matched.dependencies {
                self.create_tasks_for(strip_dot_slash(dependency), Some(index), project);
            }
        }
    }

    /// Execute the graph. Consumes the engine; returns whether the build
    /// completed without an abort, plus the mutated data subtree.
    pub fn run(self, project: &Project, ui: &mut dyn ProgressUi) -> Result<BuildOutcome, YakkaError> {
        let groups = self.groups.clone();
        ui.init(&groups);

        if self.nodes.is_empty() {
            ui.finish(&groups);
            return Ok(BuildOutcome {
                success: true,
                data: project.summary.get("data").cloned().unwrap_or(Value::Null),
            });
        }

        let state = Arc::new(RunState {
            stamps: self.nodes.iter().map(|_| Mutex::new(Stamp::Never)).collect(),
            pending: self
                .nodes
                .iter()
                .map(|node| AtomicUsize::new(node.predecessor_count))
                .collect(),
            nodes: self.nodes,
            todo: self.todo,
            summary: project.summary.clone(),
            previous_summary: project.previous_summary.clone(),
            data: Mutex::new(project.summary.get("data").cloned().unwrap_or(Value::Null)),
            abort_build: AtomicBool::new(false),
            remaining: AtomicUsize::new(0),
        });
        state
            .remaining
            .store(state.nodes.len(), Ordering::SeqCst);

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_WORKERS);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| YakkaError::CommandError(format!("worker pool: {}", e)))?;

        let (done_tx, done_rx) = channel::<()>();
        let ready: Vec<usize> = (0..state.nodes.len())
            .filter(|&index| state.nodes[index].predecessor_count == 0)
            .collect();
        for index in ready {
            spawn_task(&pool, Arc::clone(&state), index, done_tx.clone());
        }
        drop(done_tx);

        loop {
            match done_rx.recv_timeout(UI_POLL_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => ui.update(&groups),
            }
        }
        ui.finish(&groups);

        let success = !state.abort_build.load(Ordering::SeqCst);
        let data = state
            .data
            .lock()
            .map(|d| d.clone())
            .unwrap_or(Value::Null);
        Ok(BuildOutcome { success, data })
    }
}

struct RunState {
    nodes: Vec<TaskNode>,
    todo: FxHashMap<String, Vec<usize>>,
    stamps: Vec<Mutex<Stamp>>,
    pending: Vec<AtomicUsize>,
    summary: Value,
    previous_summary: Value,
    data: Mutex<Value>,
    abort_build: AtomicBool,
    remaining: AtomicUsize,
}

fn spawn_task(pool: &rayon::ThreadPool, state: Arc<RunState>, index: usize, done: Sender<()>) {
    pool.spawn(move || execute_task(state, index, done));
}

fn execute_task(state: Arc<RunState>, index: usize, done: Sender<()>) {
    run_task_body(&state, index);

    // Successor spawns land on the current pool: rayon::spawn from a worker
    // thread targets that worker's registry.
    for successor in state.nodes[index].successors.clone() {
        if state.pending[successor].fetch_sub(1, Ordering::AcqRel) == 1 {
            let state = Arc::clone(&state);
            let done = done.clone();
            rayon::spawn(move || execute_task(state, successor, done));
        }
    }

    if state.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
        let _ = done.send(());
    }
}

fn set_stamp(state: &RunState, index: usize, stamp: Stamp) {
    if let Ok(mut slot) = state.stamps[index].lock() {
        *slot = stamp;
    }
}

fn file_stamp(target: &str) -> Option<Stamp> {
    std::fs::metadata(target)
        .and_then(|m| m.modified())
        .ok()
        .map(Stamp::At)
}

fn run_task_body(state: &RunState, index: usize) {
    if state.abort_build.load(Ordering::SeqCst) {
        return;
    }
    let node = &state.nodes[index];
    let target = node.target.as_str();

    let Some(matched) = &node.matched else {
        run_leaf_task(state, index, target);
        return;
    };

    if let Some(stamp) = file_stamp(target) {
        set_stamp(state, index, stamp);
    }

    let process_is_empty = matched.blueprint.process.is_null()
        || matched
            .blueprint
            .process
            .as_array()
            .is_some_and(Vec::is_empty);

    if matched.dependencies.is_empty() {
        // With no dependencies the process runs only to create the target.
        if !Path::new(target).exists() {
            let (_, retcode) = run_command(state, target, matched);
            set_stamp(state, index, Stamp::At(SystemTime::now()));
            if retcode != 0 {
                info!("Aborting: {} returned {}", target, retcode);
                state.abort_build.store(true, Ordering::SeqCst);
                return;
            }
        }
    } else if !process_is_empty {
        let mut newest = Stamp::Never;
        let mut newest_name = String::new();
        for dependency in &matched.dependencies {
            let key = strip_dot_slash(dependency);
            if let Some(tasks) = state.todo.get(key) {
                for &task in tasks {
                    let stamp = state.stamps[task]
                        .lock()
                        .map(|s| *s)
                        .unwrap_or(Stamp::Never);
                    if stamp > newest {
                        newest = stamp;
                        newest_name = key.to_string();
                    }
                }
            }
        }

        let current = state.stamps[index]
            .lock()
            .map(|s| *s)
            .unwrap_or(Stamp::Never);
        if !Path::new(target).exists() || newest > current {
            info!("{}: Updating because of {}", target, newest_name);
            let (_, retcode) = run_command(state, target, matched);
            set_stamp(state, index, Stamp::At(SystemTime::now()));
            if retcode < 0 {
                info!("Aborting: {} returned {}", target, retcode);
                state.abort_build.store(true, Ordering::SeqCst);
                return;
            }
        }
    } else {
        debug!("{} has no process", target);
    }

    if let Some(group) = &node.group {
        group.current.fetch_add(1, Ordering::Relaxed);
    }
}

fn run_leaf_task(state: &RunState, index: usize, target: &str) {
    if target.starts_with(DATA_DEPENDENCY_IDENTIFIER) {
        match has_data_dependency_changed(target, &state.previous_summary, &state.summary) {
            Ok(changed) => {
                let stamp = if changed { Stamp::Changed } else { Stamp::Never };
                if changed {
                    info!("{} has been updated", target);
                }
                set_stamp(state, index, stamp);
            }
            Err(e) => {
                error!("Data dependency '{}' error: {}", target, e);
            }
        }
    } else if let Some(stamp) = file_stamp(target) {
        set_stamp(state, index, stamp);
    } else {
        info!("Target {} has no action", target);
    }
}

/// Run a blueprint's process sequence, threading the captured output.
///
/// A command name that exists in `summary.tools` dispatches to `execute`
/// with the tool path prepended; otherwise it must be a built-in. Unknown
/// commands are fatal for the task.
fn run_command(state: &RunState, target: &str, matched: &BlueprintMatch) -> (Vec<u8>, i32) {
    let Some(process) = matched.blueprint.process.as_array() else {
        return (Vec::new(), 0);
    };

    let ctx = TemplateContext {
        summary: &state.summary,
        curdir: matched.blueprint.parent_path.clone(),
        regex_matches: &matched.regex_matches,
        reg_matches: &[],
        data_store: Some(&state.data),
    };

    let started = std::time::Instant::now();
    let mut captured: Vec<u8> = Vec::new();

    for entry in process {
        let Some(object) = entry.as_object() else {
            error!("Command entry for target '{}' is not an object", target);
            return (Vec::new(), -1);
        };
        if object.len() != 1 {
            error!(
                "Command '{}' for target '{}' is malformed",
                object.keys().next().map(String::as_str).unwrap_or(""),
                target
            );
            return (Vec::new(), -1);
        }
        let (command_name, command_value) = object.iter().next().expect("len checked");

        let retcode;
        if let Some(tool) = state
            .summary
            .pointer(&format!("/tools/{}", command_name))
            .and_then(Value::as_str)
        {
            let arguments = ctx.try_render(command_value.as_str().unwrap_or_default());
            let (output, tool_retcode) = exec(tool, &arguments);
            retcode = tool_retcode;
            if retcode != 0 {
                error!("Returned {}\n{}", retcode, output);
            }
            if retcode < 0 {
                return (output.into_bytes(), retcode);
            }
            info!("{}", output);
            captured = output.into_bytes();
        } else if let Some(builtin) = commands::lookup(command_name) {
            let result = builtin(target, command_value, captured, &ctx);
            captured = result.output;
            retcode = result.retcode;
        } else {
            error!("{} tool doesn't exist", command_name);
            return (Vec::new(), -1);
        }

        if retcode < 0 {
            return (captured, retcode);
        }
    }

    debug!("{}: {} milliseconds", target, started.elapsed().as_millis());
    (captured, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_ordering_brackets_file_times() {
        let file_time = Stamp::At(SystemTime::now());
        assert!(Stamp::Never < file_time);
        assert!(file_time < Stamp::Changed);
        assert!(Stamp::Never < Stamp::Changed);

        let earlier = Stamp::At(SystemTime::UNIX_EPOCH);
        assert!(earlier < file_time);
    }
}
