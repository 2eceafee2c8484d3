//! Blueprint database: matching targets against declared blueprints.
//!
//! A target matches a blueprint either by literal name equality or by a
//! full-string regex match. Each match renders its dependency list through
//! the template engine with the match's captures bound to `$(i)` and the
//! blueprint's directory bound to `curdir()`.

use crate::core::blueprint::{Blueprint, BlueprintMatch, DependencyKind};
use crate::core::error::YakkaError;
use crate::core::template::TemplateContext;
use crate::core::utilities::{parse_gcc_dependency_file, strip_dot_slash};
use crate::core::DATA_DEPENDENCY_IDENTIFIER;
use regex::Regex;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// All blueprints known to the project, in insertion order.
///
/// Insertion order matters: when a target matches several blueprints, the
/// matches register as siblings in the order their blueprints were added.
#[derive(Debug, Default)]
pub struct BlueprintDatabase {
    pub blueprints: Vec<(String, Arc<Blueprint>)>,
}

impl BlueprintDatabase {
    /// Add a blueprint under its rendered key (target name or regex).
    pub fn insert(&mut self, key: String, blueprint: Blueprint) {
        self.blueprints.push((key, Arc::new(blueprint)));
    }

    /// Find every blueprint matching `target` and render its dependencies.
    ///
    /// A missing match is non-fatal: the result is empty and the task engine
    /// treats the target as a leaf.
    pub fn find_match(
        &self,
        target: &str,
        summary: &Value,
    ) -> Result<Vec<Arc<BlueprintMatch>>, YakkaError> {
        let mut result = Vec::new();

        for (key, blueprint) in &self.blueprints {
            let regex_matches = if blueprint.regex.is_some() {
                let re = Regex::new(&anchored(key))?;
                let Some(captures) = re.captures(target) else {
                    continue;
                };
                captures
                    .iter()
                    .map(|c| c.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect()
            } else {
                if target != key {
                    continue;
                }
                vec![target.to_string()]
            };

            let ctx = TemplateContext {
                curdir: blueprint.parent_path.clone(),
                regex_matches: &regex_matches,
                ..TemplateContext::new(summary)
            };

            let mut dependencies = Vec::new();
            for dependency in &blueprint.dependencies {
                match dependency.kind {
                    DependencyKind::DependencyFile => {
                        let dep_file = ctx.try_render(&dependency.name);
                        dependencies.extend(parse_gcc_dependency_file(&dep_file));
                    }
                    DependencyKind::Data => {
                        let mut name = ctx.try_render(&dependency.name);
                        if !name.starts_with(DATA_DEPENDENCY_IDENTIFIER) {
                            name.insert(0, DATA_DEPENDENCY_IDENTIFIER);
                        }
                        dependencies.push(name);
                    }
                    DependencyKind::Default => {
                        let rendered = match ctx.render(&dependency.name) {
                            Ok(rendered) => rendered,
                            Err(e) => {
                                error!(
                                    "Error evaluating dependency '{}' for {}: {}",
                                    dependency.name, key, e
                                );
                                return Ok(result);
                            }
                        };
                        push_rendered_dependency(&mut dependencies, &rendered);
                    }
                }
            }

            result.push(Arc::new(BlueprintMatch {
                blueprint: Arc::clone(blueprint),
                regex_matches,
                dependencies,
            }));
        }

        if result.is_empty() && !Path::new(target).exists() {
            info!("No blueprint for '{}'", target);
        }
        Ok(result)
    }

    /// Serialise the database for `blueprints.json`.
    pub fn save(&self, filename: &Path) -> Result<(), YakkaError> {
        let mut output = serde_json::Map::new();
        for (key, blueprint) in &self.blueprints {
            let entry = output
                .entry(key.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = entry {
                items.push(blueprint.as_json());
            }
        }
        if let Some(parent) = filename.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(filename, serde_json::to_string_pretty(&Value::Object(output))?)?;
        Ok(())
    }
}

/// Regex blueprints match the whole target string.
fn anchored(pattern: &str) -> String {
    let mut anchored = String::with_capacity(pattern.len() + 2);
    if !pattern.starts_with('^') {
        anchored.push('^');
    }
    anchored.push_str(pattern);
    if !pattern.ends_with('$') {
        anchored.push('$');
    }
    anchored
}

/// A rendered DEFAULT dependency may be a YAML array literal; split it into
/// its elements, stripping any leading `./`.
fn push_rendered_dependency(dependencies: &mut Vec<String>, rendered: &str) {
    if rendered.starts_with('[') && rendered.ends_with(']') {
        match serde_yaml::from_str::<Vec<String>>(rendered) {
            Ok(items) => {
                for item in items {
                    dependencies.push(strip_dot_slash(&item).to_string());
                }
                return;
            }
            Err(e) => {
                error!("Failed to parse dependency list '{}': {}", rendered, e);
            }
        }
    }
    dependencies.push(strip_dot_slash(rendered).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn summary() -> Value {
        json!({
            "project_output": "output/demo",
            "features": ["tcp"],
            "components": {"app": {"directory": "comps/app"}},
            "data": {}
        })
    }

    fn database() -> BlueprintDatabase {
        let mut db = BlueprintDatabase::default();
        db.insert(
            "build".to_string(),
            Blueprint::from_json(
                "build",
                &json!({"depends": ["main.o"], "process": [{"echo": "link"}]}),
                "comps/app",
            ),
        );
        db.insert(
            r"^(.+)\.o$".to_string(),
            Blueprint::from_json(
                r"^(.+)\.o$",
                &json!({
                    "regex": r"^(.+)\.o$",
                    "depends": ["{{$(1)}}.c"],
                    "process": [{"echo": "compile"}]
                }),
                "comps/app",
            ),
        );
        db
    }

    #[test]
    fn literal_match_renders_dependencies() {
        let db = database();
        let matches = db.find_match("build", &summary()).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].regex_matches, vec!["build"]);
        assert_eq!(matches[0].dependencies, vec!["main.o"]);
    }

    #[test]
    fn regex_match_captures_and_substitutes() {
        let db = database();
        let matches = db.find_match("foo.o", &summary()).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].regex_matches, vec!["foo.o", "foo"]);
        assert_eq!(matches[0].dependencies, vec!["foo.c"]);
    }

    #[test]
    fn no_match_is_empty_not_error() {
        let db = database();
        let matches = db.find_match("unknown-target", &summary()).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn matcher_is_deterministic() {
        let db = database();
        let summary = summary();
        let first = db.find_match("bar.o", &summary).unwrap();
        let second = db.find_match("bar.o", &summary).unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.regex_matches, b.regex_matches);
            assert_eq!(a.dependencies, b.dependencies);
        }
    }

    #[test]
    fn data_dependencies_gain_prefix() {
        let mut db = BlueprintDatabase::default();
        db.insert(
            "gen.h".to_string(),
            Blueprint::from_json(
                "gen.h",
                &json!({"depends": [{"data": "/data/version"}], "process": [{"echo": "gen"}]}),
                ".",
            ),
        );
        let matches = db.find_match("gen.h", &summary()).unwrap();
        assert_eq!(matches[0].dependencies, vec![":/data/version"]);
    }

    #[test]
    fn yaml_array_dependency_splits() {
        let mut db = BlueprintDatabase::default();
        db.insert(
            "all".to_string(),
            Blueprint::from_json(
                "all",
                &json!({"depends": ["[./a.o, b.o]"], "process": []}),
                ".",
            ),
        );
        let matches = db.find_match("all", &summary()).unwrap();
        assert_eq!(matches[0].dependencies, vec!["a.o", "b.o"]);
    }

    #[test]
    fn multiple_blueprints_match_in_insertion_order() {
        let mut db = database();
        db.insert(
            r"^foo\.(.+)$".to_string(),
            Blueprint::from_json(
                r"^foo\.(.+)$",
                &json!({"regex": r"^foo\.(.+)$", "depends": [], "process": []}),
                ".",
            ),
        );
        let matches = db.find_match("foo.o", &summary()).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].regex_matches[1], "foo");
        assert_eq!(matches[1].regex_matches[1], "o");
    }

    #[test]
    fn save_writes_grouped_blueprints() {
        let db = database();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blueprints.json");
        db.save(&path).unwrap();

        let saved: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(saved.get("build").is_some());
        assert_eq!(saved["build"][0]["target"], "build");
    }
}
