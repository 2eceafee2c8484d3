//! Shared helpers: external process execution, CLI token classification,
//! GCC dependency file parsing, and data dependency diffing.

use crate::core::error::YakkaError;
use crate::core::{DATA_DEPENDENCY_IDENTIFIER, DATA_WILDCARD_IDENTIFIER};
use rustc_hash::FxHashSet;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::{debug, error, info};

/// Run an external command, capturing stdout and stderr into one string.
///
/// Returns the combined output and the process exit code. A command that
/// cannot be spawned reports -1 rather than propagating, matching the
/// task engine's negative-retcode abort contract.
pub fn exec(command_text: &str, arg_text: &str) -> (String, i32) {
    info!("{} {}", command_text, arg_text);
    let full = if arg_text.is_empty() {
        command_text.to_string()
    } else {
        format!("{} {}", command_text, arg_text)
    };

    let output = if cfg!(target_os = "windows") {
        Command::new("cmd").args(["/C", &full]).output()
    } else {
        Command::new("sh").args(["-c", &full]).output()
    };

    match output {
        Ok(out) => {
            let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&out.stderr));
            let retcode = out.status.code().unwrap_or(-1);
            (text, retcode)
        }
        Err(e) => {
            error!("Failed to execute: {}\n{}", full, e);
            (String::new(), -1)
        }
    }
}

/// Classify free-form CLI tokens into components, features, and commands.
///
/// `+name` is a feature, `name!` is a command, anything else a component.
pub fn parse_arguments(
    tokens: &[String],
) -> (Vec<String>, Vec<String>, FxHashSet<String>) {
    let mut components = Vec::new();
    let mut features = Vec::new();
    let mut commands = FxHashSet::default();

    for token in tokens {
        if let Some(feature) = token.strip_prefix('+') {
            features.push(feature.to_string());
        } else if let Some(command) = token.strip_suffix('!') {
            commands.insert(command.to_string());
        } else {
            components.push(token.clone());
        }
    }

    (components, features, commands)
}

/// Compose a default project name from the requested components and features.
pub fn generate_project_name(components: &[String], features: &[String]) -> String {
    let mut name = components.join("-");
    for feature in features {
        name.push('-');
        name.push_str(feature);
    }
    if name.is_empty() {
        name.push_str("none");
    }
    name
}

/// Strip a leading `./` from a dependency path.
pub fn strip_dot_slash(path: &str) -> &str {
    match path.strip_prefix("./") {
        Some(rest) => rest.trim_start_matches('/'),
        None => path,
    }
}

/// Parse a dependency file as output by GCC or Clang, returning the listed paths.
///
/// The first line holds the target (`<target>: \`) and is skipped; subsequent
/// whitespace-separated entries are dependencies, with `\` line continuations
/// ignored.
pub fn parse_gcc_dependency_file(filename: &str) -> Vec<String> {
    let Ok(content) = fs::read_to_string(filename) else {
        return Vec::new();
    };

    let body = match content.find(':') {
        Some(index) => &content[index + 1..],
        None => return Vec::new(),
    };

    body.split_whitespace()
        .filter(|entry| *entry != "\\")
        .map(|entry| strip_dot_slash(entry).to_string())
        .collect()
}

/// Convert a parsed YAML document into the JSON value model used everywhere else.
pub fn yaml_to_json(input: &str) -> Result<Value, YakkaError> {
    let value: Value = serde_yaml::from_str(input)?;
    Ok(value)
}

/// Read a YAML file into the JSON value model.
pub fn load_yaml_file(path: &Path) -> Result<Value, YakkaError> {
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(Value::Null);
    }
    yaml_to_json(&content)
}

/// Derive a component id from a dotted component name: the last dotted segment.
pub fn component_dotname_to_id(dotname: &str) -> String {
    match dotname.rfind('.') {
        Some(index) => dotname[index + 1..].to_string(),
        None => dotname.to_string(),
    }
}

/// Determine whether the data subtree named by `data_path` differs between
/// the previous and current project summaries.
///
/// `data_path` has the form `:/data/...` or `:/components/<name>/...`; the
/// `*` wildcard expands over every component in the current summary.
pub fn has_data_dependency_changed(
    data_path: &str,
    previous: &Value,
    current: &Value,
) -> Result<bool, YakkaError> {
    let mut chars = data_path.chars();
    if chars.next() != Some(DATA_DEPENDENCY_IDENTIFIER) {
        return Ok(false);
    }
    if chars.next() != Some('/') {
        return Err(YakkaError::DataDependencyError(
            "invalid path format: missing root separator".to_string(),
        ));
    }

    // Nothing to compare against on a first run.
    if previous.is_null() || previous.get("components").is_none() {
        return Ok(true);
    }

    let pointer = &data_path[1..];
    let segments: Vec<&str> = pointer.split('/').skip(1).collect();

    if segments.first() == Some(&"components") {
        let Some(second) = segments.get(1) else {
            return Err(YakkaError::DataDependencyError(format!(
                "component data path '{}' names no component",
                data_path
            )));
        };

        let remaining = format!("/{}", segments[2..].join("/"));
        let compare = |name: &str, ptr: &str| -> bool {
            let left = previous.pointer(&format!("/components/{}", name));
            let right = current.pointer(&format!("/components/{}", name));
            match (left, right) {
                (Some(left), Some(right)) => {
                    let l = if ptr == "/" { Some(left) } else { left.pointer(ptr) };
                    let r = if ptr == "/" { Some(right) } else { right.pointer(ptr) };
                    l != r
                }
                _ => true,
            }
        };

        if second.chars().next() == Some(DATA_WILDCARD_IDENTIFIER) {
            if let Some(components) = current.get("components").and_then(Value::as_object) {
                for name in components.keys() {
                    if compare(name, &remaining) {
                        debug!("Data dependency changed for component: {}", name);
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        } else {
            let changed = compare(second, &remaining);
            if changed {
                debug!("Data dependency changed for component: {}", second);
            }
            Ok(changed)
        }
    } else {
        match (previous.pointer(pointer), current.pointer(pointer)) {
            (Some(left), Some(right)) => Ok(left != right),
            _ => Ok(true),
        }
    }
}
