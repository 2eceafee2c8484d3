//! The blueprint command vocabulary.
//!
//! A blueprint `process` is an ordered list of single-key objects; the key
//! names the command, the value is its parameter. Commands thread a captured
//! output buffer through the sequence (pipeline semantics). The buffer is
//! raw bytes: most commands treat it as text, but `pack` appends binary data
//! and `save` writes it verbatim.
//!
//! A negative return code is fatal for the task; the engine sets the abort
//! flag. Unknown commands (that are not project tools) report -1.

use crate::core::error::YakkaError;
use crate::core::template::{value_to_string, TemplateContext};
use crate::core::utilities::exec;
use crate::core::DATA_DEPENDENCY_IDENTIFIER;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::Path;
use tracing::{debug, error, info};

pub struct CommandResult {
    pub output: Vec<u8>,
    pub retcode: i32,
}

impl CommandResult {
    fn ok(output: Vec<u8>) -> Self {
        CommandResult { output, retcode: 0 }
    }

    fn fail() -> Self {
        CommandResult { output: Vec::new(), retcode: -1 }
    }
}

pub type BlueprintCommand = fn(&str, &Value, Vec<u8>, &TemplateContext) -> CommandResult;

/// Resolve a command name to its implementation.
pub fn lookup(name: &str) -> Option<BlueprintCommand> {
    match name {
        "echo" => Some(echo_command),
        "execute" => Some(execute_command),
        "shell" => Some(shell_command),
        "regex" => Some(regex_command),
        "inja" | "template" => Some(template_command),
        "save" => Some(save_command),
        "create_directory" => Some(create_directory_command),
        "verify" => Some(verify_command),
        "rm" => Some(rm_command),
        "rmdir" => Some(rmdir_command),
        "pack" => Some(pack_command),
        "copy" => Some(copy_command),
        "cat" => Some(cat_command),
        "as_json" => Some(as_json_command),
        "as_yaml" => Some(as_yaml_command),
        "diff" => Some(diff_command),
        _ => None,
    }
}

fn text(buffer: &[u8]) -> String {
    String::from_utf8_lossy(buffer).into_owned()
}

fn echo_command(_target: &str, command: &Value, captured: Vec<u8>, ctx: &TemplateContext) -> CommandResult {
    let output = match command.as_str() {
        Some(template) => ctx.try_render(template).into_bytes(),
        None => captured,
    };
    println!("{}", text(&output));
    CommandResult::ok(output)
}

fn execute_command(target: &str, command: &Value, _captured: Vec<u8>, ctx: &TemplateContext) -> CommandResult {
    let Some(template) = command.as_str() else {
        error!("'execute' command for '{}' has no command string", target);
        return CommandResult::fail();
    };
    let rendered = match ctx.render(template) {
        Ok(rendered) => rendered,
        Err(e) => {
            error!("Failed to execute: {}\n{}", template, e);
            return CommandResult::fail();
        }
    };
    debug!("Executing '{}'", rendered);
    let (output, retcode) = exec(&rendered, "");
    if retcode != 0 && !output.is_empty() {
        error!("{} returned {}\n{}", rendered, retcode, output);
    } else if !output.is_empty() {
        info!("{}", output);
    }
    CommandResult { output: output.into_bytes(), retcode }
}

/// Same as `execute`; the spawned command already goes through the OS shell.
fn shell_command(target: &str, command: &Value, captured: Vec<u8>, ctx: &TemplateContext) -> CommandResult {
    execute_command(target, command, captured, ctx)
}

fn template_command(_target: &str, command: &Value, _captured: Vec<u8>, ctx: &TemplateContext) -> CommandResult {
    match command {
        Value::String(template) => CommandResult::ok(ctx.try_render(template).into_bytes()),
        Value::Object(map) => {
            let mut data = Value::Null;
            if let Some(data_file) = map.get("data_file").and_then(Value::as_str) {
                let filename = ctx.try_render(data_file);
                data = match load_data_file(&filename) {
                    Ok(data) => data,
                    Err(e) => {
                        error!("Failed to load template data '{}': {}", filename, e);
                        return CommandResult::fail();
                    }
                };
            } else if let Some(inline) = map.get("data").and_then(Value::as_str) {
                let rendered = ctx.try_render(inline);
                match serde_yaml::from_str(&rendered) {
                    Ok(value) => data = value,
                    Err(e) => {
                        error!("Failed to parse template data: {}", e);
                        return CommandResult::fail();
                    }
                }
            }

            let template_text = if let Some(file) = map.get("template_file").and_then(Value::as_str)
            {
                let filename = ctx.try_render(file);
                match fs::read_to_string(&filename) {
                    Ok(content) => content,
                    Err(e) => {
                        error!("Failed to read template file '{}': {}", filename, e);
                        return CommandResult::fail();
                    }
                }
            } else if let Some(inline) = map.get("template").and_then(Value::as_str) {
                inline.to_string()
            } else {
                error!("Template command is invalid: {}", command);
                return CommandResult::fail();
            };

            let rendered = if data.is_null() {
                ctx.try_render(&template_text)
            } else {
                let data_ctx = TemplateContext {
                    curdir: ctx.curdir.clone(),
                    regex_matches: ctx.regex_matches,
                    reg_matches: ctx.reg_matches,
                    data_store: ctx.data_store,
                    summary: &data,
                };
                data_ctx.try_render(&template_text)
            };
            CommandResult::ok(rendered.into_bytes())
        }
        _ => {
            error!("Template command is invalid: {}", command);
            CommandResult::fail()
        }
    }
}

fn load_data_file(filename: &str) -> Result<Value, YakkaError> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    if extension == "json" {
        Ok(serde_json::from_str(&fs::read_to_string(filename)?)?)
    } else {
        crate::core::utilities::load_yaml_file(Path::new(filename))
    }
}

fn save_command(target: &str, command: &Value, captured: Vec<u8>, ctx: &TemplateContext) -> CommandResult {
    let filename = match command.as_str() {
        Some(template) => ctx.try_render(template),
        None => target.to_string(),
    };

    // `:/data/...` stores into the run's data subtree instead of a file.
    if filename.starts_with(DATA_DEPENDENCY_IDENTIFIER) {
        let Some(rest) = filename.strip_prefix(":/data/") else {
            error!("Data dependency pointer must start with '/data'");
            return CommandResult::fail();
        };
        let pointer = format!("/{}", rest);
        let Some(store) = ctx.data_store else {
            error!("No data store available to save '{}'", filename);
            return CommandResult::fail();
        };
        let Ok(mut data) = store.lock() else {
            error!("Data store lock poisoned");
            return CommandResult::fail();
        };
        set_pointer(&mut data, &pointer, Value::String(text(&captured)));
        return CommandResult::ok(captured);
    }

    let path = Path::new(&filename);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = fs::create_dir_all(parent)
    {
        error!("Failed to save file '{}': {}", filename, e);
        return CommandResult::fail();
    }
    if let Err(e) = fs::write(path, &captured) {
        error!("Failed to save file '{}': {}", filename, e);
        return CommandResult::fail();
    }
    CommandResult::ok(captured)
}

fn set_pointer(root: &mut Value, pointer: &str, value: Value) {
    let mut current = root;
    for segment in pointer.split('/').skip(1) {
        if !current.is_object() {
            *current = json!({});
        }
        current = current
            .as_object_mut()
            .expect("just made an object")
            .entry(segment.to_string())
            .or_insert(Value::Null);
    }
    *current = value;
}

fn create_directory_command(_target: &str, command: &Value, _captured: Vec<u8>, ctx: &TemplateContext) -> CommandResult {
    if let Some(template) = command.as_str() {
        let filename = ctx.try_render(template);
        if !filename.is_empty()
            && let Some(parent) = Path::new(&filename).parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = fs::create_dir_all(parent)
        {
            error!("Couldn't create directory for '{}': {}", filename, e);
            return CommandResult::fail();
        }
    }
    CommandResult::ok(Vec::new())
}

fn verify_command(_target: &str, command: &Value, captured: Vec<u8>, ctx: &TemplateContext) -> CommandResult {
    let filename = ctx.try_render(command.as_str().unwrap_or_default());
    if Path::new(&filename).exists() {
        info!("{} exists", filename);
        CommandResult::ok(captured)
    } else {
        error!("{} doesn't exist", filename);
        CommandResult::fail()
    }
}

fn rm_command(_target: &str, command: &Value, captured: Vec<u8>, ctx: &TemplateContext) -> CommandResult {
    let filename = ctx.try_render(command.as_str().unwrap_or_default());
    if filename.starts_with('[') && filename.ends_with(']') {
        match serde_yaml::from_str::<Vec<String>>(&filename) {
            Ok(files) => {
                for file in files {
                    let _ = fs::remove_file(&file);
                }
            }
            Err(e) => error!("Failed to parse file list '{}': {}", filename, e),
        }
    } else {
        let _ = fs::remove_file(&filename);
    }
    CommandResult::ok(captured)
}

fn rmdir_command(_target: &str, command: &Value, captured: Vec<u8>, ctx: &TemplateContext) -> CommandResult {
    let path = ctx.try_render(command.as_str().unwrap_or_default());
    if let Err(e) = fs::remove_dir_all(&path) {
        error!("'rmdir' command failed for '{}': {}", path, e);
    }
    CommandResult::ok(captured)
}

/// Binary-pack rendered scalars per a `struct`-style format string.
///
/// Format characters: `L`/`l` 4 bytes, `S`/`s` 2 bytes, `C`/`c` 1 byte,
/// `x` a zero pad byte. Values are little-endian; `0x` prefixes select
/// hexadecimal and a leading `-` a signed parse.
fn pack_command(_target: &str, command: &Value, mut captured: Vec<u8>, ctx: &TemplateContext) -> CommandResult {
    let Some(data) = command.get("data").and_then(Value::as_array) else {
        error!("'pack' command requires 'data'");
        return CommandResult::fail();
    };
    let Some(format) = command.get("format").and_then(Value::as_str) else {
        error!("'pack' command requires 'format'");
        return CommandResult::fail();
    };
    let format = ctx.try_render(format);
    let mut format_chars = format.chars();

    for entry in data {
        let rendered = match entry.as_str() {
            Some(template) => ctx.try_render(template),
            None => value_to_string(entry),
        };
        let Some(code) = format_chars.next() else {
            error!("'pack' format string is shorter than its data");
            return CommandResult::fail();
        };

        let parsed: u32 = if let Some(hex) = rendered.strip_prefix("0x").or_else(|| rendered.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16).unwrap_or_else(|e| {
                error!("Error converting number '{}': {}", rendered, e);
                0
            })
        } else if rendered.starts_with('-') {
            rendered.parse::<i32>().unwrap_or_else(|e| {
                error!("Error converting number '{}': {}", rendered, e);
                0
            }) as u32
        } else {
            rendered.parse::<u32>().unwrap_or_else(|e| {
                error!("Error converting number '{}': {}", rendered, e);
                0
            })
        };

        let bytes = parsed.to_le_bytes();
        match code {
            'L' | 'l' => captured.extend_from_slice(&bytes),
            'S' | 's' => captured.extend_from_slice(&bytes[..2]),
            'C' | 'c' => captured.push(bytes[0]),
            'x' => captured.push(0),
            other => error!("Unknown pack type '{}'", other),
        }
    }
    CommandResult::ok(captured)
}

fn copy_command(target: &str, command: &Value, _captured: Vec<u8>, ctx: &TemplateContext) -> CommandResult {
    let Some(destination) = command.get("destination").and_then(Value::as_str) else {
        error!("'copy' command has no 'destination' while processing {}", target);
        return CommandResult::fail();
    };
    let destination = ctx.try_render(destination);

    let source = if let Some(source) = command.get("source") {
        source.clone()
    } else if let Some(list) = command.get("yaml_list").and_then(Value::as_str) {
        let rendered = ctx.try_render(list);
        match serde_yaml::from_str(&rendered) {
            Ok(value) => value,
            Err(e) => {
                error!("'copy' command failed to parse yaml_list: {}", e);
                return CommandResult::fail();
            }
        }
    } else {
        error!("'copy' command does not have 'source' or 'yaml_list'");
        return CommandResult::fail();
    };

    let result = match &source {
        Value::String(template) => {
            copy_recursively(&ctx.try_render(template), Path::new(&destination))
        }
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .try_for_each(|template| {
                copy_recursively(&ctx.try_render(template), Path::new(&destination))
            }),
        Value::Object(map) => copy_from_object(map, &destination, ctx),
        _ => {
            error!("'copy' command missing 'source' or 'list' while processing {}", target);
            return CommandResult::fail();
        }
    };

    match result {
        Ok(()) => CommandResult::ok(Vec::new()),
        Err(e) => {
            error!("'copy' command failed while processing {}: {}", target, e);
            CommandResult::fail()
        }
    }
}

fn copy_from_object(
    map: &Map<String, Value>,
    destination: &str,
    ctx: &TemplateContext,
) -> Result<(), YakkaError> {
    // `folder_paths`/`file_paths` recreate the source path under the
    // destination; `folders`/`files` copy into the destination directly.
    if let Some(folders) = map.get("folder_paths").and_then(Value::as_array) {
        for template in folders.iter().filter_map(Value::as_str) {
            let source = ctx.try_render(template);
            let nested = format!("{}/{}", destination, source);
            fs::create_dir_all(&nested)?;
            copy_recursively(&source, Path::new(&nested))?;
        }
    }
    if let Some(folders) = map.get("folders").and_then(Value::as_array) {
        for template in folders.iter().filter_map(Value::as_str) {
            copy_recursively(&ctx.try_render(template), Path::new(destination))?;
        }
    }
    if let Some(files) = map.get("file_paths").and_then(Value::as_array) {
        for template in files.iter().filter_map(Value::as_str) {
            let source = ctx.try_render(template);
            let nested = format!("{}/{}", destination, source);
            if let Some(parent) = Path::new(&nested).parent() {
                fs::create_dir_all(parent)?;
            }
            copy_file_if_newer(Path::new(&source), Path::new(&nested))?;
        }
    }
    if let Some(files) = map.get("files").and_then(Value::as_array) {
        for template in files.iter().filter_map(Value::as_str) {
            let source = ctx.try_render(template);
            let name = Path::new(&source).file_name().unwrap_or_default();
            copy_file_if_newer(Path::new(&source), &Path::new(destination).join(name))?;
        }
    }
    Ok(())
}

/// Recursive copy with update semantics: files only overwrite when newer.
fn copy_recursively(source: &str, destination: &Path) -> Result<(), YakkaError> {
    let source_path = Path::new(source);
    if source_path.is_file() {
        let target = if destination.is_dir() {
            destination.join(source_path.file_name().unwrap_or_default())
        } else {
            destination.to_path_buf()
        };
        return copy_file_if_newer(source_path, &target);
    }
    for entry in walkdir::WalkDir::new(source_path).into_iter().filter_map(Result::ok) {
        let relative = entry
            .path()
            .strip_prefix(source_path)
            .unwrap_or(entry.path());
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            copy_file_if_newer(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn copy_file_if_newer(source: &Path, destination: &Path) -> Result<(), YakkaError> {
    if let (Ok(src), Ok(dst)) = (fs::metadata(source), fs::metadata(destination))
        && let (Ok(src_time), Ok(dst_time)) = (src.modified(), dst.modified())
        && src_time <= dst_time
    {
        return Ok(());
    }
    fs::copy(source, destination)?;
    Ok(())
}

fn cat_command(_target: &str, command: &Value, _captured: Vec<u8>, ctx: &TemplateContext) -> CommandResult {
    let filename = ctx.try_render(command.as_str().unwrap_or_default());
    match fs::read(&filename) {
        Ok(contents) => CommandResult::ok(contents),
        Err(e) => {
            error!("'cat' failed to read '{}': {}", filename, e);
            CommandResult::fail()
        }
    }
}

fn as_json_command(_target: &str, _command: &Value, captured: Vec<u8>, _ctx: &TemplateContext) -> CommandResult {
    match serde_json::from_slice::<Value>(&captured) {
        Ok(value) => CommandResult::ok(
            serde_json::to_string_pretty(&value).unwrap_or_default().into_bytes(),
        ),
        Err(e) => {
            error!("'as_json' failed to parse captured output: {}", e);
            CommandResult::fail()
        }
    }
}

fn as_yaml_command(_target: &str, _command: &Value, captured: Vec<u8>, _ctx: &TemplateContext) -> CommandResult {
    match serde_yaml::from_slice::<Value>(&captured) {
        Ok(value) => CommandResult::ok(
            serde_yaml::to_string(&value).unwrap_or_default().into_bytes(),
        ),
        Err(e) => {
            error!("'as_yaml' failed to parse captured output: {}", e);
            CommandResult::fail()
        }
    }
}

fn diff_command(_target: &str, command: &Value, _captured: Vec<u8>, ctx: &TemplateContext) -> CommandResult {
    if !command.is_object() {
        error!("'diff' command invalid");
        return CommandResult::fail();
    }
    let load_side = |file_key: &str, inline_key: &str| -> Result<Value, YakkaError> {
        if let Some(file) = command.get(file_key).and_then(Value::as_str) {
            let filename = ctx.try_render(file);
            Ok(serde_json::from_str(&fs::read_to_string(&filename)?)?)
        } else if let Some(inline) = command.get(inline_key).and_then(Value::as_str) {
            Ok(Value::String(ctx.try_render(inline)))
        } else {
            Ok(Value::Null)
        }
    };

    let left = match load_side("left_file", "left") {
        Ok(value) => value,
        Err(e) => {
            error!("'diff' failed to load left side: {}", e);
            return CommandResult::fail();
        }
    };
    let right = match load_side("right_file", "right") {
        Ok(value) => value,
        Err(e) => {
            error!("'diff' failed to load right side: {}", e);
            return CommandResult::fail();
        }
    };

    let mut patch = Vec::new();
    json_diff(&left, &right, "", &mut patch);
    CommandResult::ok(
        serde_json::to_string(&Value::Array(patch)).unwrap_or_default().into_bytes(),
    )
}

/// Minimal JSON Patch style diff: replace/add/remove operations for every
/// path that differs between the two documents.
fn json_diff(left: &Value, right: &Value, path: &str, patch: &mut Vec<Value>) {
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => {
            for (key, left_value) in l {
                let child = format!("{}/{}", path, key);
                match r.get(key) {
                    Some(right_value) => json_diff(left_value, right_value, &child, patch),
                    None => patch.push(json!({"op": "remove", "path": child})),
                }
            }
            for (key, right_value) in r {
                if !l.contains_key(key) {
                    let child = format!("{}/{}", path, key);
                    patch.push(json!({"op": "add", "path": child, "value": right_value}));
                }
            }
        }
        (Value::Array(l), Value::Array(r)) => {
            for (index, (left_value, right_value)) in l.iter().zip(r.iter()).enumerate() {
                json_diff(left_value, right_value, &format!("{}/{}", path, index), patch);
            }
            for index in r.len()..l.len() {
                patch.push(json!({"op": "remove", "path": format!("{}/{}", path, index)}));
            }
            for (index, right_value) in r.iter().enumerate().skip(l.len()) {
                patch.push(json!({
                    "op": "add",
                    "path": format!("{}/{}", path, index),
                    "value": right_value
                }));
            }
        }
        (l, r) => {
            if l != r {
                patch.push(json!({"op": "replace", "path": path, "value": r}));
            }
        }
    }
}

/// Apply a regex transformation to the captured output.
///
/// Patterns compile with multi-line mode on every platform. `replace` keeps
/// only the expanded matches when `split` is present; `match` re-renders a
/// template per hit with `reg(i)` bound to the captures; `to_yaml` builds a
/// YAML sequence from named capture positions.
fn regex_command(_target: &str, command: &Value, captured: Vec<u8>, ctx: &TemplateContext) -> CommandResult {
    let Some(search) = command.get("search").and_then(Value::as_str) else {
        error!("'regex' command requires 'search'");
        return CommandResult::fail();
    };
    let re = match Regex::new(&format!("(?m){}", search)) {
        Ok(re) => re,
        Err(e) => {
            error!("'regex' failed to compile '{}': {}", search, e);
            return CommandResult::fail();
        }
    };

    let prefix = command
        .get("prefix")
        .and_then(Value::as_str)
        .map(|p| ctx.try_render(p))
        .unwrap_or_default();
    let suffix = command
        .get("suffix")
        .and_then(Value::as_str)
        .map(|s| ctx.try_render(s))
        .unwrap_or_default();
    let input = text(&captured);

    let output = if command.get("split").is_some() {
        let mut output = String::new();
        output.push_str(&prefix);
        for line in input.lines() {
            if let Some(replacement) = command.get("replace").and_then(Value::as_str) {
                for captures in re.captures_iter(line) {
                    let mut expanded = String::new();
                    captures.expand(replacement, &mut expanded);
                    output.push_str(&expanded);
                }
            } else if let Some(template) = command.get("match").and_then(Value::as_str) {
                for captures in re.captures_iter(line) {
                    output.push_str(&render_match(ctx, template, &captures));
                }
            } else if let Some(names) = command.get("to_yaml").and_then(Value::as_array) {
                let Some(captures) = re.captures(line) else { continue };
                let entry = yaml_entry(names, &captures);
                output.push_str(&serde_yaml::to_string(&vec![entry]).unwrap_or_default());
            } else {
                error!("'regex' command does not have enough information");
                return CommandResult::fail();
            }
        }
        output.push_str(&suffix);
        output
    } else if let Some(names) = command.get("to_yaml").and_then(Value::as_array) {
        let entries: Vec<Value> = re
            .captures_iter(&input)
            .map(|captures| yaml_entry(names, &captures))
            .collect();
        format!(
            "{}{}\n{}",
            prefix,
            serde_yaml::to_string(&entries).unwrap_or_default().trim_end(),
            suffix
        )
    } else if let Some(replacement) = command.get("replace").and_then(Value::as_str) {
        format!("{}{}{}", prefix, re.replace_all(&input, replacement), suffix)
    } else if let Some(template) = command.get("match").and_then(Value::as_str) {
        let mut output = prefix;
        for captures in re.captures_iter(&input) {
            output.push_str(&render_match(ctx, template, &captures));
        }
        output.push_str(&suffix);
        output
    } else {
        error!("'regex' command does not have enough information");
        return CommandResult::fail();
    };

    CommandResult::ok(output.into_bytes())
}

fn render_match(ctx: &TemplateContext, template: &str, captures: &regex::Captures) -> String {
    let reg_matches: Vec<String> = captures
        .iter()
        .map(|c| c.map(|m| m.as_str().to_string()).unwrap_or_default())
        .collect();
    let local = TemplateContext {
        summary: ctx.summary,
        curdir: ctx.curdir.clone(),
        regex_matches: ctx.regex_matches,
        reg_matches: &reg_matches,
        data_store: ctx.data_store,
    };
    local.try_render(template)
}

fn yaml_entry(names: &[Value], captures: &regex::Captures) -> Value {
    let mut entry = Map::new();
    for (position, name) in names.iter().filter_map(Value::as_str).enumerate() {
        let capture = captures
            .get(position + 1)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        entry.insert(name.to_string(), Value::String(capture));
    }
    Value::Object(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn summary() -> Value {
        json!({
            "project_name": "demo",
            "project_output": "output/demo",
            "features": [],
            "components": {},
            "data": {},
            "tools": {}
        })
    }

    #[test]
    fn echo_renders_and_passes_through() {
        let summary = summary();
        let ctx = TemplateContext::new(&summary);
        let result = echo_command("t", &json!("hello {{project_name}}"), Vec::new(), &ctx);
        assert_eq!(result.retcode, 0);
        assert_eq!(text(&result.output), "hello demo");

        let passthrough = echo_command("t", &Value::Null, b"existing".to_vec(), &ctx);
        assert_eq!(text(&passthrough.output), "existing");
    }

    #[test]
    fn save_writes_captured_output() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("artifact.txt");
        let summary = summary();
        let ctx = TemplateContext::new(&summary);

        let result = save_command(
            target.to_str().unwrap(),
            &Value::Null,
            b"payload".to_vec(),
            &ctx,
        );
        assert_eq!(result.retcode, 0);
        assert_eq!(fs::read_to_string(&target).unwrap(), "payload");
    }

    #[test]
    fn save_into_data_store() {
        let summary = summary();
        let store = Mutex::new(Value::Null);
        let ctx = TemplateContext {
            data_store: Some(&store),
            ..TemplateContext::new(&summary)
        };
        let result = save_command("t", &json!(":/data/result"), b"42".to_vec(), &ctx);
        assert_eq!(result.retcode, 0);
        assert_eq!(store.lock().unwrap().pointer("/result").unwrap(), "42");
    }

    #[test]
    fn save_rejects_non_data_pointer() {
        let summary = summary();
        let ctx = TemplateContext::new(&summary);
        let result = save_command("t", &json!(":/other/place"), Vec::new(), &ctx);
        assert_eq!(result.retcode, -1);
    }

    #[test]
    fn cat_then_as_json_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.json");
        fs::write(&file, "{\"b\":2,\"a\":1}").unwrap();
        let summary = summary();
        let ctx = TemplateContext::new(&summary);

        let captured = cat_command("t", &json!(file.to_str().unwrap()), Vec::new(), &ctx);
        assert_eq!(captured.retcode, 0);
        let pretty = as_json_command("t", &Value::Null, captured.output, &ctx);
        assert_eq!(pretty.retcode, 0);
        assert!(text(&pretty.output).contains("\"a\": 1"));
    }

    #[test]
    fn regex_replace_transforms_output() {
        let summary = summary();
        let ctx = TemplateContext::new(&summary);
        let command = json!({"search": r"(\w+)\.o", "replace": "$1.c"});
        let result = regex_command("t", &command, b"main.o util.o".to_vec(), &ctx);
        assert_eq!(result.retcode, 0);
        assert_eq!(text(&result.output), "main.c util.c");
    }

    #[test]
    fn regex_match_renders_template_per_hit() {
        let summary = summary();
        let ctx = TemplateContext::new(&summary);
        let command = json!({"search": r"(\w+)=(\d+)", "match": "{{reg(1)}}:{{reg(2)}};"});
        let result = regex_command("t", &command, b"a=1 b=2".to_vec(), &ctx);
        assert_eq!(text(&result.output), "a:1;b:2;");
    }

    #[test]
    fn regex_to_yaml_builds_sequence() {
        let summary = summary();
        let ctx = TemplateContext::new(&summary);
        let command = json!({"search": r"(\w+)@(\d+)", "to_yaml": ["symbol", "address"]});
        let result = regex_command("t", &command, b"reset@0 main@64".to_vec(), &ctx);
        let parsed: Value = serde_yaml::from_str(&text(&result.output)).unwrap();
        assert_eq!(parsed[0]["symbol"], "reset");
        assert_eq!(parsed[1]["address"], "64");
    }

    #[test]
    fn pack_encodes_little_endian() {
        let summary = summary();
        let ctx = TemplateContext::new(&summary);
        let command = json!({"format": "LSCx", "data": ["0x01020304", "5", "-1", "0"]});
        let result = pack_command("t", &command, Vec::new(), &ctx);
        assert_eq!(result.retcode, 0);
        assert_eq!(
            result.output,
            vec![0x04, 0x03, 0x02, 0x01, 0x05, 0x00, 0xff, 0x00]
        );
    }

    #[test]
    fn copy_updates_only_newer_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("nested")).unwrap();
        fs::write(source.join("a.txt"), "a").unwrap();
        fs::write(source.join("nested/b.txt"), "b").unwrap();
        let destination = dir.path().join("dst");

        let summary = summary();
        let ctx = TemplateContext::new(&summary);
        let command = json!({
            "source": source.to_str().unwrap(),
            "destination": destination.to_str().unwrap()
        });
        let result = copy_command("t", &command, Vec::new(), &ctx);
        assert_eq!(result.retcode, 0);
        assert_eq!(fs::read_to_string(destination.join("a.txt")).unwrap(), "a");
        assert_eq!(
            fs::read_to_string(destination.join("nested/b.txt")).unwrap(),
            "b"
        );
    }

    #[test]
    fn verify_fails_for_missing_file() {
        let summary = summary();
        let ctx = TemplateContext::new(&summary);
        let result = verify_command("t", &json!("/definitely/not/here"), Vec::new(), &ctx);
        assert_eq!(result.retcode, -1);
    }

    #[test]
    fn diff_reports_changed_paths() {
        let summary = summary();
        let ctx = TemplateContext::new(&summary);
        let dir = tempfile::tempdir().unwrap();
        let left = dir.path().join("left.json");
        let right = dir.path().join("right.json");
        fs::write(&left, "{\"version\": 1, \"kept\": true}").unwrap();
        fs::write(&right, "{\"version\": 2, \"kept\": true}").unwrap();

        let command = json!({
            "left_file": left.to_str().unwrap(),
            "right_file": right.to_str().unwrap()
        });
        let result = diff_command("t", &command, Vec::new(), &ctx);
        let patch: Value = serde_json::from_slice(&result.output).unwrap();
        assert_eq!(patch[0]["op"], "replace");
        assert_eq!(patch[0]["path"], "/version");
        assert_eq!(patch.as_array().unwrap().len(), 1);
    }

    #[test]
    fn unknown_command_has_no_entry() {
        assert!(lookup("definitely_not_a_command").is_none());
        assert!(lookup("echo").is_some());
        assert!(lookup("template").is_some());
        assert!(lookup("inja").is_some());
    }
}
