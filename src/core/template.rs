//! Expression templating over the project summary.
//!
//! Blueprint targets, dependencies, tool strings, and process commands embed
//! `{{ ... }}` expressions that are resolved against the merged project
//! summary. Rather than ambient callbacks, every render site builds a
//! [`TemplateContext`] carrying the summary plus the per-task state the
//! expression functions need: the blueprint's directory (`curdir()`), regex
//! captures (`$(i)`), per-run match captures (`reg(i)`), and the run's data
//! store (`store`/`fetch`/`push_back`).
//!
//! Render failures never abort resolution: [`TemplateContext::try_render`]
//! logs the failure and yields an empty string, matching the engine's
//! error policy.

use crate::core::error::YakkaError;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use tracing::error;

/// All state an expression can reach during one render call.
pub struct TemplateContext<'a> {
    pub summary: &'a Value,
    pub curdir: String,
    pub regex_matches: &'a [String],
    pub reg_matches: &'a [String],
    pub data_store: Option<&'a Mutex<Value>>,
}

impl<'a> TemplateContext<'a> {
    /// Context with no per-task state, for summary-level rendering.
    pub fn new(summary: &'a Value) -> Self {
        TemplateContext {
            summary,
            curdir: ".".to_string(),
            regex_matches: &[],
            reg_matches: &[],
            data_store: None,
        }
    }

    pub fn with_curdir(summary: &'a Value, curdir: impl Into<String>) -> Self {
        TemplateContext {
            curdir: curdir.into(),
            ..TemplateContext::new(summary)
        }
    }

    /// Render `input`, substituting each `{{ expr }}` span.
    pub fn render(&self, input: &str) -> Result<String, YakkaError> {
        let mut output = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("{{") {
            output.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                return Err(YakkaError::TemplateError {
                    input: input.to_string(),
                    reason: "unterminated expression".to_string(),
                });
            };
            let expr = after[..end].trim();
            let value = self.evaluate(expr).map_err(|reason| YakkaError::TemplateError {
                input: input.to_string(),
                reason,
            })?;
            output.push_str(&value_to_string(&value));
            rest = &after[end + 2..];
        }
        output.push_str(rest);
        Ok(output)
    }

    /// Render, logging failures and returning an empty string instead of erroring.
    pub fn try_render(&self, input: &str) -> String {
        match self.render(input) {
            Ok(rendered) => rendered,
            Err(e) => {
                error!("{}", e);
                String::new()
            }
        }
    }

    fn evaluate(&self, expr: &str) -> Result<Value, String> {
        let mut parser = Parser::new(expr);
        let value = parser.expression(self)?;
        parser.skip_whitespace();
        if !parser.at_end() {
            return Err(format!("unexpected trailing input in '{}'", expr));
        }
        Ok(value)
    }

    /// Resolve a dotted path against the summary.
    fn lookup(&self, path: &str) -> Result<Value, String> {
        let mut current = self.summary;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map
                    .get(segment)
                    .ok_or_else(|| format!("unknown field '{}' in '{}'", segment, path))?,
                Value::Array(items) => {
                    let index: usize = segment
                        .parse()
                        .map_err(|_| format!("bad array index '{}' in '{}'", segment, path))?;
                    items
                        .get(index)
                        .ok_or_else(|| format!("index {} out of range in '{}'", index, path))?
                }
                _ => return Err(format!("cannot descend into '{}' at '{}'", path, segment)),
            };
        }
        Ok(current.clone())
    }

    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, String> {
        match name {
            "$" => {
                let index = arg_usize(&args, 0, name)?;
                match self.regex_matches.get(index) {
                    Some(capture) => Ok(Value::String(capture.clone())),
                    None => Ok(Value::Null),
                }
            }
            "reg" => {
                let index = arg_usize(&args, 0, name)?;
                match self.reg_matches.get(index) {
                    Some(capture) => Ok(Value::String(capture.clone())),
                    None => Ok(Value::Null),
                }
            }
            "curdir" => Ok(Value::String(self.curdir.clone())),
            "render" => {
                let input = arg_str(&args, 0, name)?;
                self.render(input).map(Value::String).map_err(|e| e.to_string())
            }
            "select" => self.select(&args),
            "aggregate" => {
                let pointer = arg_str(&args, 0, name)?;
                Ok(self.aggregate(pointer))
            }
            "store" => self.store(&args),
            "push_back" => self.push_back(&args),
            "fetch" => self.fetch(&args),
            "dir" => {
                let path = Path::new(arg_str(&args, 0, name)?);
                let parent = if path.file_name().is_some() {
                    path.parent().unwrap_or(Path::new("")).to_string_lossy()
                } else {
                    path.to_string_lossy()
                };
                Ok(Value::String(parent.into_owned()))
            }
            "not_dir" => {
                let path = Path::new(arg_str(&args, 0, name)?);
                Ok(Value::String(
                    path.file_name()
                        .map(|f| f.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                ))
            }
            "absolute_dir" | "absolute_path" => {
                let path = Path::new(arg_str(&args, 0, name)?);
                let absolute = std::path::absolute(path)
                    .map_err(|e| format!("absolute path failed: {}", e))?;
                Ok(Value::String(absolute.to_string_lossy().replace('\\', "/")))
            }
            "extension" => {
                let path = Path::new(arg_str(&args, 0, name)?);
                Ok(Value::String(
                    path.extension()
                        .map(|e| e.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                ))
            }
            "read_file" => {
                let path = arg_str(&args, 0, name)?;
                fs::read_to_string(path)
                    .map(Value::String)
                    .map_err(|e| format!("read_file('{}') failed: {}", path, e))
            }
            "file_exists" => {
                let path = arg_str(&args, 0, name)?;
                Ok(Value::Bool(Path::new(path).exists()))
            }
            "replace" => {
                let input = arg_str(&args, 0, name)?;
                let pattern = arg_str(&args, 1, name)?;
                let substitution = arg_str(&args, 2, name)?;
                let re = regex::Regex::new(pattern).map_err(|e| e.to_string())?;
                Ok(Value::String(re.replace_all(input, substitution).into_owned()))
            }
            "quote" => {
                let text = value_to_string(&args[0]);
                Ok(Value::String(format!("\"{}\"", text.replace('"', "\\\""))))
            }
            "trim" => Ok(Value::String(arg_str(&args, 0, name)?.trim().to_string())),
            "join" => {
                let Some(items) = args.first().and_then(Value::as_array) else {
                    return Err("join() expects an array as the first argument".to_string());
                };
                let separator = arg_str(&args, 1, name)?;
                Ok(Value::String(
                    items
                        .iter()
                        .map(value_to_string)
                        .collect::<Vec<_>>()
                        .join(separator),
                ))
            }
            "concatenate" => {
                let mut output = String::new();
                for arg in &args {
                    output.push_str(&value_to_string(arg));
                }
                Ok(Value::String(output))
            }
            "hex2dec" => {
                let input = arg_str(&args, 0, name)?;
                let digits = input.trim_start_matches("0x").trim_start_matches("0X");
                u64::from_str_radix(digits, 16)
                    .map(|v| Value::Number(v.into()))
                    .map_err(|e| format!("hex2dec('{}') failed: {}", input, e))
            }
            _ => Err(format!("unknown template function '{}'", name)),
        }
    }

    /// Return the feature or component name from the options map that is
    /// actually part of the project. At most one option may match.
    fn select(&self, args: &[Value]) -> Result<Value, String> {
        let Some(options) = args.first().and_then(Value::as_object) else {
            return Err("select() expects an options object".to_string());
        };
        let mut choice = Value::Null;
        for (kind, value) in options {
            let Some(name) = value.as_str() else { continue };
            let selected = match kind.as_str() {
                "feature" => self
                    .summary
                    .get("features")
                    .and_then(Value::as_array)
                    .is_some_and(|f| f.iter().any(|v| v.as_str() == Some(name))),
                "component" => self
                    .summary
                    .pointer(&format!("/components/{}", name))
                    .is_some(),
                _ => false,
            };
            if selected {
                if !choice.is_null() {
                    return Err("select() matched more than one option".to_string());
                }
                choice = Value::String(name.to_string());
            }
        }
        Ok(choice)
    }

    /// Fold the subtree at `pointer` across every component manifest and the
    /// project data into a single object or array.
    fn aggregate(&self, pointer: &str) -> Value {
        let mut aggregate = Value::Null;
        let fold = |aggregate: &mut Value, node: &Value| match node {
            Value::Object(entries) => {
                if !aggregate.is_object() {
                    *aggregate = Value::Object(Map::new());
                }
                if let Value::Object(out) = aggregate {
                    for (key, value) in entries {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Array(items) => {
                if !aggregate.is_array() {
                    *aggregate = Value::Array(Vec::new());
                }
                if let Value::Array(out) = aggregate {
                    for item in items {
                        if item.is_object() {
                            out.push(item.clone());
                        } else if let Some(text) = item.as_str() {
                            out.push(Value::String(self.try_render(text)));
                        } else {
                            out.push(item.clone());
                        }
                    }
                }
            }
            Value::Null => {}
            scalar => {
                if !aggregate.is_array() {
                    *aggregate = Value::Array(Vec::new());
                }
                if let Value::Array(out) = aggregate {
                    if let Some(text) = scalar.as_str() {
                        out.push(Value::String(self.try_render(text)));
                    } else {
                        out.push(scalar.clone());
                    }
                }
            }
        };

        if let Some(components) = self.summary.get("components").and_then(Value::as_object) {
            for manifest in components.values() {
                if let Some(node) = manifest.pointer(pointer) {
                    fold(&mut aggregate, node);
                }
            }
        }
        if let Some(data) = self.summary.get("data")
            && let Some(node) = data.pointer(pointer)
        {
            fold(&mut aggregate, node);
        }
        aggregate
    }

    fn store(&self, args: &[Value]) -> Result<Value, String> {
        let store = self
            .data_store
            .ok_or_else(|| "store() is not available in this context".to_string())?;
        let (pointer, value) = store_pointer_and_value(args)?;
        let mut data = store.lock().map_err(|_| "data store lock poisoned".to_string())?;
        set_at_pointer(&mut data, &pointer, value);
        Ok(Value::Null)
    }

    fn push_back(&self, args: &[Value]) -> Result<Value, String> {
        let store = self
            .data_store
            .ok_or_else(|| "push_back() is not available in this context".to_string())?;
        let (pointer, value) = store_pointer_and_value(args)?;
        let mut data = store.lock().map_err(|_| "data store lock poisoned".to_string())?;
        let slot = slot_at_pointer(&mut data, &pointer);
        if !slot.is_array() {
            *slot = Value::Array(Vec::new());
        }
        if let Value::Array(items) = slot {
            items.push(value);
        }
        Ok(Value::Null)
    }

    fn fetch(&self, args: &[Value]) -> Result<Value, String> {
        let store = self
            .data_store
            .ok_or_else(|| "fetch() is not available in this context".to_string())?;
        let Some(pointer) = args.first().and_then(Value::as_str) else {
            return Err("fetch() expects a pointer string".to_string());
        };
        let data = store.lock().map_err(|_| "data store lock poisoned".to_string())?;
        let mut value = data.pointer(pointer).cloned().unwrap_or(Value::Null);
        if let Some(key) = args.get(1).and_then(Value::as_str) {
            value = value.get(key).cloned().unwrap_or(Value::Null);
        }
        Ok(value)
    }
}

/// Combine a pointer argument with an optional key segment: `store(ptr, v)`
/// or `store(ptr, key, v)`.
fn store_pointer_and_value(args: &[Value]) -> Result<(String, Value), String> {
    let Some(pointer) = args.first().and_then(Value::as_str) else {
        return Err("expected a pointer string".to_string());
    };
    match args.len() {
        2 => Ok((pointer.to_string(), args[1].clone())),
        3 => {
            let key = match &args[1] {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                other => value_to_string(other),
            };
            let combined = if key.starts_with('/') {
                format!("{}{}", pointer, key)
            } else {
                format!("{}/{}", pointer, key)
            };
            Ok((combined, args[2].clone()))
        }
        _ => Err("expected (pointer, value) or (pointer, key, value)".to_string()),
    }
}

fn slot_at_pointer<'a>(root: &'a mut Value, pointer: &str) -> &'a mut Value {
    let mut current = root;
    for segment in pointer.split('/').skip(1) {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .expect("just made an object")
            .entry(segment.to_string())
            .or_insert(Value::Null);
    }
    current
}

fn set_at_pointer(root: &mut Value, pointer: &str, value: Value) {
    *slot_at_pointer(root, pointer) = value;
}

/// Stringify a rendered value: strings verbatim, null empty, everything else
/// as compact JSON (arrays round-trip through the YAML dependency splitter).
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn arg_str<'v>(args: &'v [Value], index: usize, name: &str) -> Result<&'v str, String> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("{}() expects a string argument at position {}", name, index))
}

fn arg_usize(args: &[Value], index: usize, name: &str) -> Result<usize, String> {
    args.get(index)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .ok_or_else(|| format!("{}() expects an integer argument at position {}", name, index))
}

/// Recursive-descent parser over a single template expression.
struct Parser<'i> {
    input: &'i str,
    pos: usize,
}

impl<'i> Parser<'i> {
    fn new(input: &'i str) -> Self {
        Parser { input, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn expression(&mut self, ctx: &TemplateContext) -> Result<Value, String> {
        self.skip_whitespace();
        match self.peek() {
            Some('\'') | Some('"') => self.string_literal(),
            Some('{') => self.object_literal(ctx),
            Some(c) if c.is_ascii_digit() || c == '-' => self.number_literal(),
            Some(c) if c.is_alphanumeric() || c == '_' || c == '$' => self.ident_or_call(ctx),
            Some(c) => Err(format!("unexpected character '{}'", c)),
            None => Err("empty expression".to_string()),
        }
    }

    fn string_literal(&mut self) -> Result<Value, String> {
        let quote = self.bump().expect("peeked");
        let mut text = String::new();
        loop {
            match self.bump() {
                Some('\\') => {
                    if let Some(escaped) = self.bump() {
                        text.push(escaped);
                    }
                }
                Some(c) if c == quote => return Ok(Value::String(text)),
                Some(c) => text.push(c),
                None => return Err("unterminated string literal".to_string()),
            }
        }
    }

    fn number_literal(&mut self) -> Result<Value, String> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        let text = &self.input[start..self.pos];
        text.parse::<i64>()
            .map(|v| Value::Number(v.into()))
            .map_err(|_| format!("bad number literal '{}'", text))
    }

    fn object_literal(&mut self, ctx: &TemplateContext) -> Result<Value, String> {
        self.bump(); // consume '{'
        let mut map = Map::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some('}') {
                self.bump();
                return Ok(Value::Object(map));
            }
            let key = match self.peek() {
                Some('\'') | Some('"') => match self.string_literal()? {
                    Value::String(s) => s,
                    _ => unreachable!(),
                },
                _ => self.identifier()?,
            };
            self.skip_whitespace();
            if self.bump() != Some(':') {
                return Err("expected ':' in object literal".to_string());
            }
            let value = self.object_value(ctx)?;
            map.insert(key, value);
            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some('}') => {}
                _ => return Err("expected ',' or '}' in object literal".to_string()),
            }
        }
    }

    /// Parse an object literal value. Bare words are taken as strings, the
    /// common manifest form: `select({feature: tcp})`. Calls and dotted paths
    /// still evaluate as expressions.
    fn object_value(&mut self, ctx: &TemplateContext) -> Result<Value, String> {
        self.skip_whitespace();
        let is_bare_word = self
            .peek()
            .is_some_and(|c| c.is_alphabetic() || c == '_');
        if !is_bare_word {
            return self.expression(ctx);
        }
        let start = self.pos;
        let word = self.identifier()?;
        if matches!(self.peek(), Some('(') | Some('.')) {
            self.pos = start;
            return self.expression(ctx);
        }
        Ok(Value::String(word))
    }

    fn identifier(&mut self) -> Result<String, String> {
        let start = self.pos;
        if self.peek() == Some('$') {
            self.bump();
        } else {
            while self
                .peek()
                .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '-')
            {
                self.bump();
            }
        }
        if self.pos == start {
            return Err("expected identifier".to_string());
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn ident_or_call(&mut self, ctx: &TemplateContext) -> Result<Value, String> {
        let mut path = self.identifier()?;

        self.skip_whitespace();
        if self.peek() == Some('(') {
            self.bump();
            let mut args = Vec::new();
            loop {
                self.skip_whitespace();
                if self.peek() == Some(')') {
                    self.bump();
                    break;
                }
                args.push(self.expression(ctx)?);
                self.skip_whitespace();
                match self.peek() {
                    Some(',') => {
                        self.bump();
                    }
                    Some(')') => {}
                    _ => return Err("expected ',' or ')' in argument list".to_string()),
                }
            }
            return ctx.call(&path, args);
        }

        // Dotted path lookup. A bare word that resolves to nothing is an
        // error surfaced by lookup().
        while self.peek() == Some('.') {
            self.bump();
            path.push('.');
            path.push_str(&self.identifier()?);
        }
        ctx.lookup(&path)
    }
}
