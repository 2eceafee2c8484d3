//! Schema-driven deep merge of manifest fragments.
//!
//! Components contribute conditional fragments (`supports.*`), data subtrees,
//! and schema fragments that are all folded into larger documents with the
//! same type-directed rules:
//!
//! - object into object: deep-merge by key
//! - array into array: append
//! - scalar into array: append
//! - scalar into scalar: wrap the target into an array and append
//! - anything into an object (except an object), or an object into a
//!   scalar/array: rejected
//! - null fragments are no-ops
//!
//! A per-path merge strategy may override the default append behaviour.
//! Strategies are declared in component `schema` fragments via a `merge` key
//! and collected into a [`StrategyMap`] before summary construction.

use crate::core::error::YakkaError;
use rustc_hash::FxHashMap;
use serde_json::Value;

/// Per-path merge behaviour. `Concatenate` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Concatenate,
    Max,
    Min,
    Sort,
    Unique,
    Overwrite,
}

impl MergeStrategy {
    /// Parse a strategy name as written in schema fragments.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "concatenate" => Some(MergeStrategy::Concatenate),
            "max" => Some(MergeStrategy::Max),
            "min" => Some(MergeStrategy::Min),
            "sort" => Some(MergeStrategy::Sort),
            "unique" => Some(MergeStrategy::Unique),
            "overwrite" => Some(MergeStrategy::Overwrite),
            _ => None,
        }
    }
}

/// Json-pointer path to merge strategy lookup, aggregated from schema fragments.
#[derive(Debug, Default, Clone)]
pub struct StrategyMap {
    strategies: FxHashMap<String, MergeStrategy>,
}

impl StrategyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect `merge: <strategy>` declarations from a schema fragment.
    ///
    /// Every object node carrying a `merge` key registers a strategy for the
    /// json-pointer path at which it appears.
    pub fn collect(&mut self, schema: &Value) {
        self.collect_at("", schema);
    }

    fn collect_at(&mut self, path: &str, node: &Value) {
        let Some(object) = node.as_object() else {
            return;
        };
        if let Some(name) = object.get("merge").and_then(Value::as_str)
            && let Some(strategy) = MergeStrategy::from_name(name)
        {
            self.strategies.insert(path.to_string(), strategy);
        }
        for (key, child) in object {
            if key == "merge" {
                continue;
            }
            let child_path = format!("{}/{}", path, key);
            self.collect_at(&child_path, child);
        }
    }

    pub fn lookup(&self, path: &str) -> MergeStrategy {
        self.strategies
            .get(path)
            .copied()
            .unwrap_or(MergeStrategy::Concatenate)
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

/// Merge `fragment` into `target` at the given json-pointer path under the
/// default strategy everywhere.
pub fn json_node_merge(
    target: &mut Value,
    pointer: &str,
    fragment: &Value,
) -> Result<(), YakkaError> {
    json_node_merge_with(target, pointer, fragment, &StrategyMap::default())
}

/// Merge `fragment` into `target` at the given json-pointer path, honouring
/// per-path strategies.
///
/// The fragment is never mutated; a missing target subtree is created.
pub fn json_node_merge_with(
    target: &mut Value,
    pointer: &str,
    fragment: &Value,
    strategies: &StrategyMap,
) -> Result<(), YakkaError> {
    if fragment.is_null() {
        return Ok(());
    }
    let slot = ensure_pointer(target, pointer)?;
    merge_into(slot, pointer, fragment, strategies)
}

/// Walk (and create) the object spine down to a json-pointer path.
fn ensure_pointer<'a>(target: &'a mut Value, pointer: &str) -> Result<&'a mut Value, YakkaError> {
    if pointer.is_empty() {
        return Ok(target);
    }
    let mut current = target;
    for segment in pointer.split('/').skip(1) {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        let object = current.as_object_mut().ok_or_else(|| {
            YakkaError::MergeError(
                pointer.to_string(),
                "pointer traverses a non-object node".to_string(),
            )
        })?;
        current = object
            .entry(segment.to_string())
            .or_insert(Value::Null);
    }
    Ok(current)
}

fn merge_into(
    target: &mut Value,
    path: &str,
    fragment: &Value,
    strategies: &StrategyMap,
) -> Result<(), YakkaError> {
    match fragment {
        Value::Null => Ok(()),

        Value::Object(entries) => {
            if target.is_null() {
                *target = Value::Object(serde_json::Map::new());
            }
            let Some(object) = target.as_object_mut() else {
                return Err(YakkaError::MergeError(
                    path.to_string(),
                    "cannot merge object into non-object".to_string(),
                ));
            };
            for (key, value) in entries {
                let child_path = format!("{}/{}", path, key);
                match object.get_mut(key) {
                    Some(existing) => merge_into(existing, &child_path, value, strategies)?,
                    None => {
                        object.insert(key.clone(), value.clone());
                    }
                }
            }
            Ok(())
        }

        Value::Array(items) => {
            if target.is_object() {
                return Err(YakkaError::MergeError(
                    path.to_string(),
                    "cannot merge array into an object".to_string(),
                ));
            }
            if let MergeStrategy::Overwrite = strategies.lookup(path) {
                *target = fragment.clone();
                return Ok(());
            }
            promote_to_array(target);
            if let Value::Array(existing) = target {
                existing.extend(items.iter().cloned());
            }
            apply_array_strategy(target, path, strategies);
            Ok(())
        }

        scalar => {
            if target.is_object() {
                return Err(YakkaError::MergeError(
                    path.to_string(),
                    "cannot merge scalar into an object".to_string(),
                ));
            }
            match strategies.lookup(path) {
                MergeStrategy::Overwrite => {
                    *target = scalar.clone();
                }
                MergeStrategy::Max => {
                    if scalar_ordering(scalar, target) == std::cmp::Ordering::Greater {
                        *target = scalar.clone();
                    }
                }
                MergeStrategy::Min => {
                    if scalar_ordering(scalar, target) == std::cmp::Ordering::Less {
                        *target = scalar.clone();
                    }
                }
                _ => {
                    promote_to_array(target);
                    if let Value::Array(existing) = target {
                        existing.push(scalar.clone());
                    }
                    apply_array_strategy(target, path, strategies);
                }
            }
            Ok(())
        }
    }
}

/// Wrap a scalar target into a single-element array; null becomes empty.
fn promote_to_array(target: &mut Value) {
    match target {
        Value::Array(_) => {}
        Value::Null => *target = Value::Array(Vec::new()),
        _ => {
            let previous = std::mem::take(target);
            *target = Value::Array(vec![previous]);
        }
    }
}

fn apply_array_strategy(target: &mut Value, path: &str, strategies: &StrategyMap) {
    let Value::Array(items) = target else {
        return;
    };
    match strategies.lookup(path) {
        MergeStrategy::Unique => {
            let mut seen: Vec<Value> = Vec::with_capacity(items.len());
            items.retain(|item| {
                if seen.contains(item) {
                    false
                } else {
                    seen.push(item.clone());
                    true
                }
            });
        }
        MergeStrategy::Sort => {
            items.sort_by(|a, b| scalar_ordering(a, b));
        }
        _ => {}
    }
}

fn scalar_ordering(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => x.cmp(y),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}
