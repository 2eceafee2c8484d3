//! Blueprint data model: a parameterised rule for building a target.

use serde_json::Value;

/// How a blueprint dependency entry is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// Rendered text; YAML array literals split into elements.
    Default,
    /// A GCC-style dependency file whose contents list the real dependencies.
    DependencyFile,
    /// A pseudo-target diffed against the previous summary (`:/data/...`).
    Data,
}

#[derive(Debug, Clone)]
pub struct Dependency {
    pub kind: DependencyKind,
    pub name: String,
}

/// A build rule declared by a component.
#[derive(Debug, Clone)]
pub struct Blueprint {
    /// Target name or, for regex blueprints, the rendered pattern.
    pub target: String,
    /// Full-string regex the target must match, when present.
    pub regex: Option<String>,
    /// Tool components the blueprint needs loaded before running.
    pub requirements: Vec<String>,
    pub dependencies: Vec<Dependency>,
    /// Ordered list of single-key command objects.
    pub process: Value,
    /// Directory of the declaring component; `curdir()` resolves here.
    pub parent_path: String,
    /// Progress group; tasks default to "Processing" when empty.
    pub group: Option<String>,
}

impl Blueprint {
    /// Build a blueprint from its manifest entry.
    pub fn from_json(target: &str, node: &Value, parent_path: &str) -> Self {
        let regex = node
            .get("regex")
            .and_then(Value::as_str)
            .map(str::to_string);

        let requirements = node
            .get("requires")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut dependencies = Vec::new();
        if let Some(depends) = node.get("depends").and_then(Value::as_array) {
            for entry in depends {
                match entry {
                    Value::Object(map) => {
                        if let Some(data) = map.get("data") {
                            match data {
                                Value::Array(items) => {
                                    for item in items.iter().filter_map(Value::as_str) {
                                        dependencies.push(Dependency {
                                            kind: DependencyKind::Data,
                                            name: item.to_string(),
                                        });
                                    }
                                }
                                Value::String(name) => dependencies.push(Dependency {
                                    kind: DependencyKind::Data,
                                    name: name.clone(),
                                }),
                                _ => {}
                            }
                        } else if let Some(file) =
                            map.get("dependency_file").and_then(Value::as_str)
                        {
                            dependencies.push(Dependency {
                                kind: DependencyKind::DependencyFile,
                                name: file.to_string(),
                            });
                        }
                    }
                    scalar => {
                        let name = match scalar {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        dependencies.push(Dependency {
                            kind: DependencyKind::Default,
                            name,
                        });
                    }
                }
            }
        }

        Blueprint {
            target: target.to_string(),
            regex,
            requirements,
            dependencies,
            process: node.get("process").cloned().unwrap_or(Value::Null),
            parent_path: parent_path.to_string(),
            group: node.get("group").and_then(Value::as_str).map(str::to_string),
        }
    }

    /// Serialise for `blueprints.json`.
    pub fn as_json(&self) -> Value {
        let mut out = serde_json::Map::new();
        out.insert("target".to_string(), Value::String(self.target.clone()));
        if let Some(regex) = &self.regex {
            out.insert("regex".to_string(), Value::String(regex.clone()));
        }
        if !self.requirements.is_empty() {
            out.insert(
                "requires".to_string(),
                Value::Array(
                    self.requirements
                        .iter()
                        .map(|r| Value::String(r.clone()))
                        .collect(),
                ),
            );
        }
        if !self.dependencies.is_empty() {
            let deps = self
                .dependencies
                .iter()
                .map(|dep| match dep.kind {
                    DependencyKind::Data => {
                        serde_json::json!({"data": dep.name})
                    }
                    DependencyKind::DependencyFile => {
                        serde_json::json!({"dependency_file": dep.name})
                    }
                    DependencyKind::Default => Value::String(dep.name.clone()),
                })
                .collect();
            out.insert("depends".to_string(), Value::Array(deps));
        }
        if !self.process.is_null() {
            out.insert("process".to_string(), self.process.clone());
        }
        if let Some(group) = &self.group {
            out.insert("group".to_string(), Value::String(group.clone()));
        }
        Value::Object(out)
    }
}

/// One blueprint matched against a concrete target: the captures from the
/// regex match (index 0 is the whole target) and the fully rendered
/// dependency list.
#[derive(Debug, Clone)]
pub struct BlueprintMatch {
    pub blueprint: std::sync::Arc<Blueprint>,
    pub regex_matches: Vec<String>,
    pub dependencies: Vec<String>,
}
