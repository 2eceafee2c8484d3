//! SLC post-processing: instance expansion, config file generation,
//! template contribution ordering, and toolchain setting aggregation.
//!
//! Runs after a valid resolution, once the summary exists. Instantiable
//! components render their templated entries once per instance; `config_file`
//! entries become generated copy blueprints honouring `override.file_id`
//! declarations; `template_contribution` entries are bucketed by name and
//! stably ordered by ascending priority.

use crate::core::blueprint::Blueprint;
use crate::core::component::ManifestKind;
use crate::core::error::YakkaError;
use crate::core::project::Project;
use crate::core::template::TemplateContext;
use globset::Glob;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::error;
use walkdir::WalkDir;

/// Render a string with only `instance` bound, against an otherwise empty
/// summary. Instantiable entries are written as `{{instance}}_timer` etc.
fn render_with_instance(template: &str, instance: &str) -> String {
    let data = json!({"instance": instance});
    TemplateContext::new(&data).try_render(template)
}

impl Project<'_> {
    /// Apply all SLC rules to the resolved component set.
    pub fn process_slc_rules(&mut self) -> Result<(), YakkaError> {
        let mut index = 0;
        while index < self.components.len() {
            if self.components[index].kind == ManifestKind::Yakka {
                index += 1;
                continue;
            }

            if self.components[index].kind == ManifestKind::Slce {
                self.expand_slc_extension(index)?;
                index += 1;
                continue;
            }

            let instantiable = self.components[index].json.get("instantiable").is_some();
            let instance_prefix = self.components[index]
                .json
                .pointer("/instantiable/prefix")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let instance_names: Vec<String> = self
                .instances
                .iter()
                .filter(|(component, _)| component == &self.components[index].id)
                .map(|(_, instance)| instance.clone())
                .collect();

            self.process_slc_sources(index);
            self.process_slc_includes(index);
            self.process_slc_defines(index, instantiable, &instance_prefix);
            self.process_slc_libraries(index);
            self.process_template_contributions(index, instantiable, &instance_names);
            self.process_config_files(index, instantiable, &instance_prefix, &instance_names)?;
            self.process_template_files(index);

            index += 1;
        }

        self.aggregate_toolchain_settings();
        self.order_template_contributions();
        Ok(())
    }

    /// `.slce` extension manifests name globbed roots that may hold further
    /// SLC components; add them all and re-run the fixpoint.
    fn expand_slc_extension(&mut self, index: usize) -> Result<(), YakkaError> {
        let Some(paths) = self.components[index]
            .json
            .get("component_path")
            .and_then(Value::as_array)
            .cloned()
        else {
            return Ok(());
        };

        let matcher = Glob::new("**/*.slcc")
            .expect("static glob pattern")
            .compile_matcher();
        let base = self.components[index].directory.clone();

        for entry in paths {
            let Some(path) = entry.get("path").and_then(Value::as_str) else {
                continue;
            };
            let root = if Path::new(path).is_absolute() {
                PathBuf::from(path)
            } else {
                base.join(path)
            };
            for file in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
                if !file.file_type().is_file() || !matcher.is_match(file.path()) {
                    continue;
                }
                let already_loaded = self
                    .components
                    .iter()
                    .any(|c| c.file_path == file.path());
                if already_loaded {
                    continue;
                }
                match crate::core::component::Component::parse_file(file.path()) {
                    Ok(component) => {
                        for feature in
                            crate::core::component::string_or_list(&component.json, "/requires/features")
                        {
                            self.slc_required.insert(feature);
                        }
                        self.components.push(component);
                    }
                    Err(e) => error!("{}", e),
                }
            }
        }
        self.evaluate_dependencies();
        Ok(())
    }

    fn process_slc_sources(&mut self, index: usize) {
        let Some(sources) = self.components[index]
            .json
            .get("source")
            .and_then(Value::as_array)
            .cloned()
        else {
            return;
        };
        for source in sources {
            let Some(path) = source.get("path").and_then(Value::as_str) else {
                continue;
            };
            if self.is_disqualified_by_unless(&source) || !self.condition_is_fulfilled(&source) {
                continue;
            }
            // Headers are carried by the include set, not the source list.
            if Path::new(path).extension().and_then(|e| e.to_str()) == Some("h") {
                continue;
            }
            push_to(&mut self.components[index].json, "/sources", json!(path));
        }
    }

    fn process_slc_includes(&mut self, index: usize) {
        let Some(includes) = self.components[index]
            .json
            .get("include")
            .and_then(Value::as_array)
            .cloned()
        else {
            return;
        };
        for include in includes {
            let Some(path) = include.get("path") else { continue };
            if self.is_disqualified_by_unless(&include) || !self.condition_is_fulfilled(&include) {
                continue;
            }
            push_to(
                &mut self.components[index].json,
                "/includes/global",
                path.clone(),
            );
        }
    }

    fn process_slc_defines(&mut self, index: usize, instantiable: bool, prefix: &str) {
        let Some(defines) = self.components[index]
            .json
            .get("define")
            .and_then(Value::as_array)
            .cloned()
        else {
            return;
        };
        for define in defines {
            if self.is_disqualified_by_unless(&define) || !self.condition_is_fulfilled(&define) {
                continue;
            }
            let mut entry = if define.get("value").is_some() {
                define.clone()
            } else {
                define.get("name").cloned().unwrap_or(Value::Null)
            };
            if entry.is_null() {
                continue;
            }
            if instantiable {
                entry = match entry {
                    Value::Object(mut map) => {
                        if let Some(name) = map.get("name").and_then(Value::as_str) {
                            let rendered = render_with_instance(name, prefix);
                            map.insert("name".to_string(), Value::String(rendered));
                        }
                        Value::Object(map)
                    }
                    Value::String(name) => Value::String(render_with_instance(&name, prefix)),
                    other => other,
                };
            }
            push_to(&mut self.components[index].json, "/defines/global", entry);
        }
    }

    fn process_slc_libraries(&mut self, index: usize) {
        let Some(libraries) = self.components[index]
            .json
            .get("library")
            .and_then(Value::as_array)
            .cloned()
        else {
            return;
        };
        for library in libraries {
            let Some(path) = library.get("path") else { continue };
            if self.is_disqualified_by_unless(&library) || !self.condition_is_fulfilled(&library) {
                continue;
            }
            push_to(&mut self.components[index].json, "/libraries", path.clone());
        }
    }

    /// Bucket contributions by name; instantiable string/object values render
    /// once per instance with `instance` bound.
    fn process_template_contributions(
        &mut self,
        index: usize,
        instantiable: bool,
        instance_names: &[String],
    ) {
        let Some(contributions) = self.components[index]
            .json
            .get("template_contribution")
            .and_then(Value::as_array)
            .cloned()
        else {
            return;
        };
        if self.template_contributions.is_null() {
            self.template_contributions = json!({});
        }

        for contribution in contributions {
            if self.is_disqualified_by_unless(&contribution)
                || !self.condition_is_fulfilled(&contribution)
            {
                continue;
            }
            let Some(name) = contribution.get("name").and_then(Value::as_str) else {
                continue;
            };
            let bucket = self.template_contributions[name]
                .as_array_mut()
                .map(|_| ())
                .is_some();
            if !bucket {
                self.template_contributions[name] = json!([]);
            }
            let Some(target) = self.template_contributions[name].as_array_mut() else {
                continue;
            };

            match contribution.get("value") {
                Some(Value::String(value)) if instantiable => {
                    for instance in instance_names {
                        let mut entry = contribution.clone();
                        entry["value"] = Value::String(render_with_instance(value, instance));
                        target.push(entry);
                    }
                }
                Some(Value::Object(map)) if instantiable => {
                    for instance in instance_names {
                        let mut entry = contribution.clone();
                        let mut rendered = map.clone();
                        for value in rendered.values_mut() {
                            if let Some(text) = value.as_str() {
                                *value = Value::String(render_with_instance(text, instance));
                            }
                        }
                        entry["value"] = Value::Object(rendered);
                        target.push(entry);
                    }
                }
                _ => target.push(contribution.clone()),
            }
        }
    }

    /// Emit generated copy/render blueprints for `config_file` entries,
    /// honouring `override.file_id` redirects.
    fn process_config_files(
        &mut self,
        index: usize,
        instantiable: bool,
        prefix: &str,
        instance_names: &[String],
    ) -> Result<(), YakkaError> {
        let Some(configs) = self.components[index]
            .json
            .get("config_file")
            .and_then(Value::as_array)
            .cloned()
        else {
            return Ok(());
        };
        for config in configs {
            if config.get("path").is_none() {
                continue;
            }
            if self.is_disqualified_by_unless(&config) || !self.condition_is_fulfilled(&config) {
                continue;
            }
            // Override declarations are redirects, not files of their own.
            if config.get("override").is_some() {
                continue;
            }
            if instantiable && instance_names.is_empty() {
                continue;
            }

            if instantiable {
                for instance in instance_names.to_owned() {
                    self.create_config_file(index, &config, prefix, &instance)?;
                }
            } else {
                self.create_config_file(index, &config, prefix, prefix)?;
            }
        }
        Ok(())
    }

    /// Generate the blueprint that materialises one config file into
    /// `<output>/config/`.
    fn create_config_file(
        &mut self,
        index: usize,
        config: &Value,
        prefix: &str,
        instance_name: &str,
    ) -> Result<(), YakkaError> {
        let Some(config_filename) = config.get("path").and_then(Value::as_str) else {
            return Ok(());
        };
        let mut config_path = self.components[index].directory.join(config_filename);

        // Another component may override this file by id, optionally pinned
        // to one instance.
        if let Some(file_id) = config.get("file_id").and_then(Value::as_str) {
            let overriding: Vec<usize> = self
                .slc_overrides
                .iter()
                .filter(|(id, _)| id == file_id)
                .map(|(_, component)| *component)
                .collect();
            'outer: for overriding_index in overriding {
                let Some(entries) = self.components[overriding_index]
                    .json
                    .get("config_file")
                    .and_then(Value::as_array)
                    .cloned()
                else {
                    continue;
                };
                for entry in entries {
                    let matches_id = entry.pointer("/override/file_id").and_then(Value::as_str)
                        == Some(file_id);
                    if !matches_id
                        || self.is_disqualified_by_unless(&entry)
                        || !self.condition_is_fulfilled(&entry)
                    {
                        continue;
                    }
                    let instance_filter = entry.pointer("/override/instance").and_then(Value::as_str);
                    let applies = match instance_filter {
                        Some(filter) => filter == instance_name,
                        None => true,
                    };
                    if applies && let Some(path) = entry.get("path").and_then(Value::as_str) {
                        config_path = self.components[overriding_index].directory.join(path);
                        break 'outer;
                    }
                }
            }
        }

        let rendered_source = render_with_instance(
            &config_path.to_string_lossy().replace('\\', "/"),
            prefix,
        );
        let filename = Path::new(config_filename)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| config_filename.to_string());
        let destination = format!(
            "{}/config/{}",
            self.output_path.to_string_lossy().replace('\\', "/"),
            render_with_instance(&filename, instance_name)
        );

        if !Path::new(&rendered_source).exists() {
            error!("Failed to find config_file: {}", rendered_source);
            return Ok(());
        }

        let instance_upper = instance_name.to_uppercase();
        let blueprint = json!({
            "depends": [rendered_source, "{{project_output}}/template_contributions.json"],
            "process": [
                {"cat": rendered_source},
                {"regex": {"search": r"\bINSTANCE\b", "replace": instance_upper}},
                {"save": null}
            ]
        });

        let directory = self.components[index].directory.to_string_lossy().replace('\\', "/");
        self.blueprint_database.insert(
            destination.clone(),
            Blueprint::from_json(&destination, &blueprint, &directory),
        );
        push_to(
            &mut self.components[index].json,
            "/generated/includes",
            json!(destination),
        );
        Ok(())
    }

    /// Emit generated render blueprints for `template_file` entries; targets
    /// are classified by extension.
    fn process_template_files(&mut self, index: usize) {
        let Some(templates) = self.components[index]
            .json
            .get("template_file")
            .and_then(Value::as_array)
            .cloned()
        else {
            return;
        };
        for template in templates {
            if self.is_disqualified_by_unless(&template) || !self.condition_is_fulfilled(&template)
            {
                continue;
            }
            let Some(path) = template.get("path").and_then(Value::as_str) else {
                continue;
            };
            let template_file = Path::new(path);
            let mut target_file = PathBuf::from(
                template_file.file_name().unwrap_or_default(),
            );
            target_file.set_extension("");

            let target = format!(
                "{{{{project_output}}}}/generated/{}",
                target_file.to_string_lossy()
            );

            let generated_kind = match target_file.extension().and_then(|e| e.to_str()) {
                Some("c") | Some("cpp") => "/generated/sources",
                Some("h") | Some("hpp") => "/generated/includes",
                Some("ld") => "/generated/linker_script",
                _ => "/generated/files",
            };
            push_to(&mut self.components[index].json, generated_kind, json!(target));

            let directory = self.components[index].directory.to_string_lossy().replace('\\', "/");
            let source = format!("{}/{}", directory, path);
            let blueprint = json!({
                "depends": [source, "{{project_output}}/template_contributions.json"],
                "process": [
                    {"template": {
                        "template_file": source,
                        "data_file": "{{project_output}}/template_contributions.json"
                    }},
                    {"save": null}
                ]
            });
            self.blueprint_database
                .insert(target.clone(), Blueprint::from_json(&target, &blueprint, &directory));
        }
    }

    /// Aggregate `toolchain_settings` across components; scalar conflicts
    /// promote to arrays.
    fn aggregate_toolchain_settings(&mut self) {
        let mut settings = Map::new();
        for index in 0..self.components.len() {
            let Some(entries) = self.components[index]
                .json
                .get("toolchain_settings")
                .and_then(Value::as_array)
                .cloned()
            else {
                continue;
            };
            for entry in entries {
                if self.is_disqualified_by_unless(&entry) || !self.condition_is_fulfilled(&entry) {
                    continue;
                }
                let Some(option) = entry.get("option").and_then(Value::as_str) else {
                    continue;
                };
                let value = entry.get("value").cloned().unwrap_or(Value::Null);
                match settings.get_mut(option) {
                    Some(Value::Array(existing)) => existing.push(value),
                    Some(existing) => {
                        let previous = existing.take();
                        *existing = Value::Array(vec![previous, value]);
                    }
                    None => {
                        settings.insert(option.to_string(), value);
                    }
                }
            }
        }
        self.summary["toolchain_settings"] = Value::Object(settings);
    }

    /// Stable sort of each contribution bucket by ascending priority
    /// (missing priority is 0); the sorted values are exposed at
    /// `template_contributions.<name>`.
    fn order_template_contributions(&mut self) {
        let Some(buckets) = self.template_contributions.as_object_mut() else {
            return;
        };
        let mut ordered = Map::new();
        for (name, bucket) in buckets.iter() {
            let Some(entries) = bucket.as_array() else { continue };
            let mut sorted: Vec<Value> = entries.clone();
            sorted.sort_by_key(|entry| {
                entry.get("priority").and_then(Value::as_i64).unwrap_or(0)
            });
            let values: Vec<Value> = sorted
                .into_iter()
                .map(|entry| entry.get("value").cloned().unwrap_or(Value::Null))
                .collect();
            ordered.insert(name.clone(), Value::Array(values));
        }
        self.template_contributions = Value::Object(ordered);
    }
}

/// Append a value to an array at `pointer`, creating it when missing.
fn push_to(node: &mut Value, pointer: &str, value: Value) {
    let mut current = node;
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
    if !current.is_array() {
        if current.is_null() {
            *current = json!([]);
        } else {
            let previous = current.take();
            *current = Value::Array(vec![previous]);
        }
    }
    if let Value::Array(items) = current {
        items.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::project::{Project, ProjectState};
    use crate::core::workspace::Workspace;
    use rustc_hash::FxHashSet;
    use std::fs;

    fn project_with_slcc(body: &str) -> (tempfile::TempDir, Workspace) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("timer");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("timer.slcc"), body).unwrap();
        let workspace = Workspace::init(tmp.path()).unwrap();
        (tmp, workspace)
    }

    #[test]
    fn contributions_sorted_by_priority() {
        let (tmp, workspace) = project_with_slcc(
            concat!(
                "template_contribution:\n",
                "  - name: event_handler\n",
                "    value: late\n",
                "    priority: 10\n",
                "  - name: event_handler\n",
                "    value: early\n",
                "    priority: -5\n",
                "  - name: event_handler\n",
                "    value: middle\n",
            ),
        );
        let mut project = Project::new("slc", &workspace);
        project.output_path = tmp.path().join("output/slc");
        project
            .init(vec!["timer".to_string()], Vec::new(), FxHashSet::default())
            .unwrap();
        // The lone SLCC provides nothing, so resolution reports unresolved;
        // contribution processing is exercised regardless.
        let state = project.evaluate_dependencies();
        assert_ne!(state, ProjectState::HasInvalidComponent);

        project.generate_project_summary();
        project.process_slc_rules().unwrap();

        assert_eq!(
            project.template_contributions["event_handler"],
            json!(["early", "middle", "late"])
        );
    }

    #[test]
    fn instantiable_contributions_render_per_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("timer");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("timer.slcc"),
            concat!(
                "instantiable:\n",
                "  prefix: inst\n",
                "instances:\n",
                "  timer: [timer0, timer1]\n",
                "template_contribution:\n",
                "  - name: handles\n",
                "    value: \"{{instance}}_handle\"\n",
            ),
        )
        .unwrap();
        let workspace = Workspace::init(tmp.path()).unwrap();

        let mut project = Project::new("slc", &workspace);
        project.output_path = tmp.path().join("output/slc");
        project
            .init(vec!["timer".to_string()], Vec::new(), FxHashSet::default())
            .unwrap();
        project.evaluate_dependencies();
        project.generate_project_summary();
        project.process_slc_rules().unwrap();

        assert_eq!(
            project.template_contributions["handles"],
            json!(["timer0_handle", "timer1_handle"])
        );
    }

    #[test]
    fn conditional_sources_filtered_by_required_features() {
        let (tmp, workspace) = project_with_slcc(
            concat!(
                "source:\n",
                "  - path: always.c\n",
                "  - path: freertos_port.c\n",
                "    condition: [freertos]\n",
                "  - path: baremetal.c\n",
                "    unless: [freertos]\n",
                "  - path: header.h\n",
            ),
        );
        let mut project = Project::new("slc", &workspace);
        project.output_path = tmp.path().join("output/slc");
        project
            .init(vec!["timer".to_string()], Vec::new(), FxHashSet::default())
            .unwrap();
        project.evaluate_dependencies();
        project.generate_project_summary();
        project.process_slc_rules().unwrap();

        let sources = project.components[0].json["sources"].clone();
        assert_eq!(sources, json!(["always.c", "baremetal.c"]));
    }

    #[test]
    fn config_file_generates_copy_blueprint() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("timer");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("timer_config.h"), "#define INSTANCE 1\n").unwrap();
        fs::write(
            dir.join("timer.slcc"),
            "config_file:\n  - path: timer_config.h\n    file_id: timer_cfg\n",
        )
        .unwrap();
        let workspace = Workspace::init(tmp.path()).unwrap();

        let mut project = Project::new("slc", &workspace);
        project.output_path = tmp.path().join("output/slc");
        project
            .init(vec!["timer".to_string()], Vec::new(), FxHashSet::default())
            .unwrap();
        project.evaluate_dependencies();
        project.generate_project_summary();
        project.process_slc_rules().unwrap();

        let keys: Vec<&String> = project
            .blueprint_database
            .blueprints
            .iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].ends_with("/config/timer_config.h"));
    }

    #[test]
    fn toolchain_settings_promote_scalar_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        for (name, value) in [("one", "-Os"), ("two", "-flto")] {
            let dir = tmp.path().join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(
                dir.join(format!("{}.slcc", name)),
                format!("toolchain_settings:\n  - option: optimize\n    value: \"{}\"\n", value),
            )
            .unwrap();
        }
        let workspace = Workspace::init(tmp.path()).unwrap();

        let mut project = Project::new("slc", &workspace);
        project.output_path = tmp.path().join("output/slc");
        project
            .init(
                vec!["one".to_string(), "two".to_string()],
                Vec::new(),
                FxHashSet::default(),
            )
            .unwrap();
        project.evaluate_dependencies();
        project.generate_project_summary();
        project.process_slc_rules().unwrap();

        assert_eq!(
            project.summary["toolchain_settings"]["optimize"],
            json!(["-Os", "-flto"])
        );
    }
}
