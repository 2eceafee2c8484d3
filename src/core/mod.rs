//! Core engine modules: component store, resolver, blueprint matcher,
//! target database, task engine, and blueprint command set.

pub mod blueprint;
pub mod blueprint_database;
pub mod commands;
pub mod component;
pub mod database;
pub mod error;
pub mod merge;
pub mod project;
pub mod slc;
pub mod target_database;
pub mod task_engine;
pub mod template;
pub mod ui;
pub mod utilities;
pub mod workspace;

/// Prefix marking a target as a data dependency (`:/data/...`).
pub const DATA_DEPENDENCY_IDENTIFIER: char = ':';

/// Wildcard segment usable in data dependency paths (`:/data/components/*/...`).
pub const DATA_WILDCARD_IDENTIFIER: char = '*';

/// Directory that holds per-project build output.
pub const DEFAULT_OUTPUT_DIRECTORY: &str = "output/";

/// Filename of the persisted project summary inside the project output directory.
pub const PROJECT_SUMMARY_FILENAME: &str = "bob_summary.json";

/// Filename of the YAML twin of the project summary.
pub const PROJECT_SUMMARY_YAML_FILENAME: &str = "bob_summary.yaml";

/// Host OS name recorded in the project summary.
#[cfg(target_os = "windows")]
pub const HOST_OS_STRING: &str = "windows";
#[cfg(target_os = "macos")]
pub const HOST_OS_STRING: &str = "macos";
#[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
pub const HOST_OS_STRING: &str = "linux";
