//! Project resolution: the dependency & choice fixpoint and the merged
//! project summary.
//!
//! A project starts from the components, features, and commands named on the
//! command line and grows the required sets to a fixpoint:
//!
//! 1. drain unprocessed components (parsing manifests, recording provides,
//!    requires, choices, replacements, and `supports.*` fragments)
//! 2. drain unprocessed features (applying matching `supports.features`
//!    fragments of already-required components)
//! 3. when both queues stall: pick defaults for unmatched choices, commit
//!    pending replacements (restarting the epoch from the initial request),
//!    chase feature recommendations, then reconcile SLC requirements
//!
//! Replacement commits reset all resolver state; the epoch count is bounded
//! by the number of distinct `replaces.component` declarations, so the loop
//! terminates. Choice violations are collected by a separate pass
//! (`evaluate_choices`) after the fixpoint.

use crate::core::blueprint::Blueprint;
use crate::core::blueprint_database::BlueprintDatabase;
use crate::core::component::{string_or_list, Component, ManifestKind};
use crate::core::database::DatabaseFlag;
use crate::core::error::YakkaError;
use crate::core::merge::{json_node_merge, StrategyMap};
use crate::core::target_database::TargetDatabase;
use crate::core::template::TemplateContext;
use crate::core::utilities::load_yaml_file;
use crate::core::workspace::Workspace;
use crate::core::{
    DATA_DEPENDENCY_IDENTIFIER, DEFAULT_OUTPUT_DIRECTORY, HOST_OS_STRING,
    PROJECT_SUMMARY_FILENAME, PROJECT_SUMMARY_YAML_FILENAME,
};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Terminal state of dependency evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectState {
    Valid,
    HasUnknownComponents,
    HasInvalidComponent,
    HasMultipleReplacements,
    HasUnresolvedRequirements,
}

pub struct Project<'w> {
    pub name: String,
    pub output_path: PathBuf,
    pub project_file: PathBuf,
    pub initial_components: Vec<String>,
    pub initial_features: Vec<String>,
    pub commands: FxHashSet<String>,
    pub state: ProjectState,
    pub component_flags: DatabaseFlag,
    pub has_slc: bool,

    // Fixpoint state. The `unprocessed_*` queues drain into the
    // `required_*` sets; replacements restart the epoch.
    unprocessed_components: FxHashSet<String>,
    unprocessed_features: FxHashSet<String>,
    unprocessed_choices: FxHashSet<String>,
    pending_replacements: FxHashMap<String, String>,
    pub replacements: FxHashMap<String, String>,
    pub required_components: FxHashSet<String>,
    pub required_features: FxHashSet<String>,
    pub provided_features: FxHashSet<String>,
    pub unprovided_features: FxHashSet<String>,
    feature_recommendations: FxHashMap<String, Value>,
    pub unknown_components: FxHashSet<String>,
    pub incomplete_choices: Vec<(String, String)>,
    pub multiple_answer_choices: Vec<String>,

    // SLC reconciliation state.
    pub slc_required: FxHashSet<String>,
    pub slc_provided: FxHashSet<String>,
    pub slc_recommended: FxHashMap<String, Value>,
    /// component id -> instance names (a component may have several).
    pub instances: Vec<(String, String)>,
    /// (file_id, component index) pairs for config overrides.
    pub slc_overrides: Vec<(String, usize)>,

    pub additional_tools: FxHashSet<String>,

    pub components: Vec<Component>,
    pub summary: Value,
    pub previous_summary: Value,
    pub template_contributions: Value,
    pub merge_strategies: StrategyMap,
    pub blueprint_database: BlueprintDatabase,
    pub target_database: TargetDatabase,

    pub workspace: &'w Workspace,
}

impl<'w> Project<'w> {
    pub fn new(name: &str, workspace: &'w Workspace) -> Self {
        Project {
            name: name.to_string(),
            output_path: PathBuf::from(format!("{}{}", DEFAULT_OUTPUT_DIRECTORY, name)),
            project_file: PathBuf::from(format!("{}.yakka", name)),
            initial_components: Vec::new(),
            initial_features: Vec::new(),
            commands: FxHashSet::default(),
            state: ProjectState::Valid,
            component_flags: DatabaseFlag::All,
            has_slc: false,
            unprocessed_components: FxHashSet::default(),
            unprocessed_features: FxHashSet::default(),
            unprocessed_choices: FxHashSet::default(),
            pending_replacements: FxHashMap::default(),
            replacements: FxHashMap::default(),
            required_components: FxHashSet::default(),
            required_features: FxHashSet::default(),
            provided_features: FxHashSet::default(),
            unprovided_features: FxHashSet::default(),
            feature_recommendations: FxHashMap::default(),
            unknown_components: FxHashSet::default(),
            incomplete_choices: Vec::new(),
            multiple_answer_choices: Vec::new(),
            slc_required: FxHashSet::default(),
            slc_provided: FxHashSet::default(),
            slc_recommended: FxHashMap::default(),
            instances: Vec::new(),
            slc_overrides: Vec::new(),
            additional_tools: FxHashSet::default(),
            components: Vec::new(),
            summary: json!({"choices": {}}),
            previous_summary: Value::Null,
            template_contributions: Value::Null,
            merge_strategies: StrategyMap::new(),
            blueprint_database: BlueprintDatabase::default(),
            target_database: TargetDatabase::default(),
            workspace,
        }
    }

    /// Seed the resolver with the initial request and load prior-run state.
    pub fn init(
        &mut self,
        components: Vec<String>,
        features: Vec<String>,
        commands: FxHashSet<String>,
    ) -> Result<(), YakkaError> {
        for component in &components {
            self.unprocessed_components.insert(component.clone());
        }
        for feature in &features {
            self.unprocessed_features.insert(feature.clone());
        }
        self.initial_components = components;
        self.initial_features = features;
        self.commands = commands;

        // The prior run's summary backs data dependency diffs. Entries for
        // components that have since disappeared stay in place.
        let summary_file = self.output_path.join(PROJECT_SUMMARY_FILENAME);
        if summary_file.exists() {
            let raw = fs::read_to_string(&summary_file)?;
            match serde_json::from_str(&raw) {
                Ok(previous) => self.previous_summary = previous,
                Err(e) => warn!("Ignoring unreadable previous summary: {}", e),
            }
        } else {
            fs::create_dir_all(&self.output_path)?;
        }
        Ok(())
    }

    /// Merge `<project>.yakka` and `--data` fragments into the summary data.
    pub fn apply_project_data(&mut self, extra: Option<&str>) -> Result<(), YakkaError> {
        if self.project_file.exists() {
            let node = load_yaml_file(&self.project_file)?;
            if let Some(data) = node.get("data") {
                json_node_merge(&mut self.summary, "/data", data)?;
            }
        }
        if let Some(extra) = extra {
            let node: Value = serde_yaml::from_str(extra)?;
            json_node_merge(&mut self.summary, "/data", &node)?;
        }
        Ok(())
    }

    fn note_feature_requirement(&mut self, entry: &Value, is_slc: bool) {
        let name = match entry {
            Value::String(s) => s.clone(),
            Value::Object(map) => {
                let Some(name) = map.get("name").and_then(Value::as_str) else {
                    return;
                };
                if let Some(recommends) = map.get("recommends") {
                    self.feature_recommendations
                        .entry(name.to_string())
                        .or_insert_with(|| recommends.clone());
                }
                name.to_string()
            }
            _ => return,
        };
        if is_slc {
            self.slc_required.insert(name.clone());
        }
        self.unprocessed_features.insert(name);
    }

    fn note_component_requirement(&mut self, entry: &Value) {
        match entry {
            Value::String(name) => {
                self.unprocessed_components.insert(name.clone());
            }
            Value::Object(map) => {
                let Some(name) = map
                    .get("id")
                    .or_else(|| map.get("name"))
                    .and_then(Value::as_str)
                else {
                    return;
                };
                self.unprocessed_components.insert(name.to_string());
                if let Some(instances) = map.get("instance").and_then(Value::as_array) {
                    for instance in instances.iter().filter_map(Value::as_str) {
                        self.add_instance(name, instance);
                    }
                }
            }
            _ => {}
        }
    }

    fn add_instance(&mut self, component: &str, instance: &str) {
        let pair = (component.to_string(), instance.to_string());
        if !self.instances.contains(&pair) {
            self.instances.push(pair);
        }
    }

    /// Register a choice the first time its name is seen.
    fn register_choices(&mut self, node: &Value, parent: &str) {
        let Some(choices) = node.get("choices").and_then(Value::as_object) else {
            return;
        };
        for (name, choice) in choices {
            let known = self
                .summary
                .pointer(&format!("/choices/{}", name))
                .is_some();
            if !known {
                self.unprocessed_choices.insert(name.clone());
                let mut entry = choice.clone();
                if let Some(map) = entry.as_object_mut() {
                    map.insert("parent".to_string(), Value::String(parent.to_string()));
                }
                self.summary["choices"][name] = entry;
            }
        }
    }

    /// Apply a conditional fragment to a component and enqueue everything it
    /// requires. The fragment's own `supports.*` sections are re-examined
    /// against the already-required sets.
    fn process_requirements(&mut self, index: usize, fragment: Value) {
        if let Err(e) = json_node_merge(&mut self.components[index].json, "", &fragment) {
            error!(
                "Could not merge fragment into '{}': {}",
                self.components[index].id, e
            );
            return;
        }
        let is_slc = self.components[index].kind.is_slc();
        let parent = self.components[index].id.clone();

        if let Some(requires) = fragment.pointer("/requires/components") {
            match requires {
                Value::Array(items) => {
                    for item in items {
                        self.note_component_requirement(item);
                    }
                }
                single => self.note_component_requirement(single),
            }
        }

        if let Some(requires) = fragment.pointer("/requires/features") {
            match requires {
                Value::Array(items) => {
                    for item in items {
                        self.note_feature_requirement(item, is_slc);
                    }
                }
                single => self.note_feature_requirement(single, is_slc),
            }
        }

        for feature in string_or_list(&fragment, "/provides/features") {
            if is_slc {
                self.slc_provided.insert(feature.clone());
            }
            self.provided_features.insert(feature);
        }

        self.register_choices(&fragment, &parent);

        if let Some(supported) = fragment.pointer("/supports/components").and_then(Value::as_object)
        {
            for component in self.required_components.clone() {
                if let Some(child) = supported.get(&component) {
                    info!("Processing component '{}' in {}", component, parent);
                    self.process_requirements(index, child.clone());
                }
            }
        }
        if let Some(supported) = fragment.pointer("/supports/features").and_then(Value::as_object) {
            for feature in self.required_features.clone() {
                if let Some(child) = supported.get(&feature) {
                    info!("Processing feature '{}' in {}", feature, parent);
                    self.process_requirements(index, child.clone());
                }
            }
        }
    }

    /// Capture SLC-specific metadata from a newly parsed manifest.
    fn record_slc_metadata(&mut self, index: usize) {
        let kind = self.components[index].kind;
        let json = self.components[index].json.clone();
        match kind {
            ManifestKind::Yakka => {
                if self.has_slc {
                    for feature in string_or_list(&json, "/requires/slc") {
                        self.slc_required.insert(feature);
                    }
                }
                return;
            }
            ManifestKind::Slcc => {
                self.has_slc = true;
                for feature in string_or_list(&json, "/provides/features") {
                    self.slc_provided.insert(feature);
                }
            }
            ManifestKind::Slcp | ManifestKind::Slce => {}
        }

        for feature in string_or_list(&json, "/requires/features") {
            self.slc_required.insert(feature);
        }

        if let Some(recommends) = json.get("recommends").and_then(Value::as_array) {
            for entry in recommends {
                let Some(id) = entry.get("id").and_then(Value::as_str) else {
                    continue;
                };
                // Instance placeholders are written as `prefix%instance%rest`.
                let id = strip_instance_placeholder(id);
                self.slc_recommended.entry(id).or_insert_with(|| entry.clone());
            }
        }

        if let Some(instances) = json.get("instances").and_then(Value::as_object) {
            for (component_id, list) in instances {
                if let Some(items) = list.as_array() {
                    for instance in items.iter().filter_map(Value::as_str) {
                        self.add_instance(component_id, instance);
                    }
                }
            }
        }

        if kind == ManifestKind::Slcc
            && let Some(configs) = json.get("config_file").and_then(Value::as_array)
        {
            for config in configs {
                if let Some(file_id) = config.pointer("/override/file_id").and_then(Value::as_str) {
                    self.slc_overrides.push((file_id.to_string(), index));
                }
            }
        }
    }

    /// Bring one component into the project. Returns true when the component
    /// is new; failure modes set the project state.
    fn add_component(&mut self, component_name: &str, flags: DatabaseFlag) -> bool {
        let component_id = crate::core::utilities::component_dotname_to_id(component_name);

        if let Some(replacement) = self.replacements.get(&component_id) {
            info!("Skipping {}. Being replaced by {}", component_id, replacement);
            self.unprocessed_components.insert(replacement.clone());
            return false;
        }

        let Some(location) = self.workspace.find_component(&component_id, flags) else {
            self.unknown_components.insert(component_id);
            return false;
        };

        if !self.required_components.insert(component_id.clone()) {
            return false;
        }

        let component = match Component::parse_file(&location) {
            Ok(component) => component,
            Err(e) => {
                error!("{}", e);
                self.state = ProjectState::HasInvalidComponent;
                return false;
            }
        };
        self.components.push(component);
        let index = self.components.len() - 1;

        self.record_slc_metadata(index);

        for schema_key in ["/schema", "/data_schema"] {
            if let Some(schema) = self.components[index].json.pointer(schema_key) {
                self.merge_strategies.collect(&schema.clone());
            }
        }

        let json = self.components[index].json.clone();

        if let Some(requires) = json.pointer("/requires/components") {
            match requires {
                Value::Array(items) => {
                    for entry in items.to_owned() {
                        self.note_component_requirement(&entry);
                    }
                }
                single => self.note_component_requirement(&single.clone()),
            }
        }
        let is_slc = self.components[index].kind.is_slc();
        if let Some(requires) = json.pointer("/requires/features") {
            match requires {
                Value::Array(items) => {
                    for entry in items.to_owned() {
                        self.note_feature_requirement(&entry, is_slc);
                    }
                }
                single => self.note_feature_requirement(&single.clone(), is_slc),
            }
        }
        for feature in string_or_list(&json, "/provides/features") {
            self.provided_features.insert(feature);
        }

        self.register_choices(&json, &component_id);

        if let Some(replaced) = json.pointer("/replaces/component").and_then(Value::as_str) {
            let conflicting = self
                .replacements
                .get(replaced)
                .or_else(|| self.pending_replacements.get(replaced))
                .is_some_and(|existing| existing != &component_id);
            if conflicting {
                error!("Multiple components replacing {}", replaced);
                self.state = ProjectState::HasMultipleReplacements;
                return false;
            }
            if !self.replacements.contains_key(replaced) {
                info!("{} replaces {}", component_id, replaced);
                self.pending_replacements
                    .insert(replaced.to_string(), component_id.clone());
            }
        }

        // The new component may support features/components that are already
        // required; new features are handled later in the feature pass.
        if let Some(supported) = json.pointer("/supports/features").and_then(Value::as_object) {
            for feature in self.required_features.clone() {
                if let Some(fragment) = supported.get(&feature) {
                    info!("Processing required feature '{}' in {}", feature, component_id);
                    self.process_requirements(index, fragment.clone());
                }
            }
        }
        if let Some(supported) = json.pointer("/supports/components").and_then(Value::as_object) {
            for required in self.required_components.clone() {
                if let Some(fragment) = supported.get(&required) {
                    info!("Processing required component '{}' in {}", required, component_id);
                    self.process_requirements(index, fragment.clone());
                }
            }
        }

        // Existing components may carry support for the new arrival.
        for other in 0..self.components.len() {
            if other == index {
                continue;
            }
            let fragment = self.components[other]
                .json
                .pointer(&format!("/supports/components/{}", component_id))
                .cloned();
            if let Some(fragment) = fragment {
                info!(
                    "Processing component '{}' in {}",
                    component_id, self.components[other].id
                );
                self.process_requirements(other, fragment);
            }
        }

        true
    }

    /// Require a feature, applying matching `supports.features` fragments of
    /// every known component.
    fn add_feature(&mut self, feature_name: &str) -> bool {
        if !self.required_features.insert(feature_name.to_string()) {
            return false;
        }
        if !self.provided_features.contains(feature_name) {
            self.unprovided_features.insert(feature_name.to_string());
        }

        for index in 0..self.components.len() {
            let fragment = self.components[index]
                .json
                .pointer(&format!("/supports/features/{}", feature_name))
                .cloned();
            if let Some(fragment) = fragment {
                info!(
                    "Processing feature '{}' in {}",
                    feature_name, self.components[index].id
                );
                self.process_requirements(index, fragment);
            }
        }
        true
    }

    /// Run the fixpoint. See the module docs for the pass structure.
    pub fn evaluate_dependencies(&mut self) -> ProjectState {
        while !self.unprocessed_components.is_empty()
            || !self.unprocessed_features.is_empty()
            || !self.slc_required.is_empty()
        {
            let component_batch: Vec<String> =
                std::mem::take(&mut self.unprocessed_components).into_iter().collect();
            for component in component_batch {
                self.add_component(&component, self.component_flags);
                if self.state != ProjectState::Valid {
                    return self.state;
                }
            }

            let feature_batch: Vec<String> =
                std::mem::take(&mut self.unprocessed_features).into_iter().collect();
            for feature in feature_batch {
                self.add_feature(&feature);
            }

            let stalled = self.unprocessed_components.is_empty()
                && self.unprocessed_features.is_empty();

            if stalled && !self.unprocessed_choices.is_empty() {
                self.select_default_choices();
            }

            if self.unprocessed_components.is_empty()
                && self.unprocessed_features.is_empty()
                && !self.pending_replacements.is_empty()
            {
                self.commit_replacements_and_restart();
                continue;
            }

            if self.unprocessed_components.is_empty()
                && self.unprocessed_features.is_empty()
                && !self.unprovided_features.is_empty()
            {
                self.chase_feature_recommendations();
            }

            if self.unprocessed_components.is_empty()
                && self.unprocessed_features.is_empty()
                && self.component_flags != DatabaseFlag::IgnoreAllSlc
            {
                self.reconcile_slc_requirements();
                self.resolve_slc_via_components();
            }

            if self.unprocessed_components.is_empty() && self.unprocessed_features.is_empty() {
                break;
            }
        }

        // Providers pulled in late (SLC reconciliation, recommendations) may
        // have satisfied features recorded as unprovided earlier.
        let provided = self.provided_features.clone();
        self.unprovided_features.retain(|f| !provided.contains(f));
        let slc_provided = self.slc_provided.clone();
        self.slc_required.retain(|f| !slc_provided.contains(f));

        for requirement in &self.slc_required {
            match self.workspace.find_feature(requirement) {
                Some(providers) => error!(
                    "Found possible providers for '{}' but there are multiple options: {:?}",
                    requirement, providers
                ),
                None => error!("Failed to find provider for feature '{}'", requirement),
            }
        }

        if !self.unknown_components.is_empty() {
            return ProjectState::HasUnknownComponents;
        }
        if !self.slc_required.is_empty() || !self.unprovided_features.is_empty() {
            return ProjectState::HasUnresolvedRequirements;
        }
        ProjectState::Valid
    }

    /// When the queues stall, enqueue the default of one unmatched choice.
    fn select_default_choices(&mut self) {
        let pending: Vec<String> = self.unprocessed_choices.iter().cloned().collect();
        for name in pending {
            let Some(choice) = self.summary.pointer(&format!("/choices/{}", name)).cloned()
            else {
                continue;
            };
            let matches = self.count_choice_matches(&choice);
            if matches == 0
                && let Some(default) = choice.get("default")
            {
                info!("Selecting default choice for {}", name);
                if let Some(feature) = default.get("feature").and_then(Value::as_str) {
                    self.unprocessed_features.insert(feature.to_string());
                    self.unprocessed_choices.remove(&name);
                } else if let Some(component) = default.get("component").and_then(Value::as_str) {
                    self.unprocessed_components.insert(component.to_string());
                    self.unprocessed_choices.remove(&name);
                } else {
                    error!("Invalid default choice in {}", name);
                }
                break;
            }
        }
    }

    fn count_choice_matches(&self, choice: &Value) -> usize {
        if let Some(features) = choice.get("features").and_then(Value::as_array) {
            features
                .iter()
                .filter_map(Value::as_str)
                .filter(|f| self.required_features.contains(*f))
                .count()
        } else if let Some(components) = choice.get("components").and_then(Value::as_array) {
            components
                .iter()
                .filter_map(Value::as_str)
                .filter(|c| self.required_components.contains(*c))
                .count()
        } else {
            0
        }
    }

    /// Commit pending replacements and restart the epoch from `C₀, F₀`.
    fn commit_replacements_and_restart(&mut self) {
        for (replaced, id) in std::mem::take(&mut self.pending_replacements) {
            info!("Adding {} to replaced components", replaced);
            self.replacements.insert(replaced, id);
        }

        self.required_components.clear();
        self.required_features.clear();
        self.provided_features.clear();
        self.unprovided_features.clear();
        self.unknown_components.clear();
        self.unprocessed_choices.clear();
        self.unprocessed_components.clear();
        self.unprocessed_features.clear();
        self.components.clear();
        self.summary["choices"] = json!({});

        for component in &self.initial_components {
            self.unprocessed_components.insert(component.clone());
        }
        for feature in &self.initial_features {
            self.unprocessed_features.insert(feature.clone());
        }
        info!("Start project processing again...");
    }

    /// Enqueue recommendations for features that remain unprovided.
    fn chase_feature_recommendations(&mut self) {
        let unprovided: Vec<String> =
            std::mem::take(&mut self.unprovided_features).into_iter().collect();
        for feature in unprovided {
            if self.provided_features.contains(&feature) {
                continue;
            }
            match self.feature_recommendations.get(&feature) {
                Some(recommendation) => {
                    if let Some(component) =
                        recommendation.get("component").and_then(Value::as_str)
                    {
                        info!("Adding component '{}' for '{}'", component, feature);
                        self.unprocessed_components.insert(component.to_string());
                    } else if let Some(recommended) =
                        recommendation.get("feature").and_then(Value::as_str)
                    {
                        info!("Adding feature '{}' for '{}'", recommended, feature);
                        self.unprocessed_features.insert(recommended.to_string());
                    } else {
                        self.unprovided_features.insert(feature);
                    }
                }
                None => {
                    self.unprovided_features.insert(feature);
                }
            }
        }
    }

    /// Ask the store for providers of each unprovided SLC requirement and
    /// apply the recommended/other decision table.
    fn reconcile_slc_requirements(&mut self) {
        let requirements: Vec<String> =
            std::mem::take(&mut self.slc_required).into_iter().collect();
        for requirement in requirements {
            if self.slc_provided.contains(&requirement) {
                continue;
            }

            let Some(providers) = self.workspace.find_feature(&requirement) else {
                self.slc_required.insert(requirement);
                continue;
            };

            let mut recommended: Vec<String> = Vec::new();
            let mut other: Vec<String> = Vec::new();
            for provider in providers {
                match self.slc_recommended.get(&provider) {
                    Some(entry) => {
                        if self.condition_is_fulfilled(entry)
                            && !self.is_disqualified_by_unless(entry)
                        {
                            recommended.push(provider);
                        }
                    }
                    None => other.push(provider),
                }
            }

            if recommended.len() > 1 {
                error!("Multiple recommendations for '{}'", requirement);
                self.slc_required.insert(requirement);
            } else if recommended.len() == 1 {
                let name = recommended.remove(0);
                info!("Adding recommended component '{}' to satisfy '{}'", name, requirement);
                if let Some(instances) = self
                    .slc_recommended
                    .get(&name)
                    .and_then(|entry| entry.get("instance"))
                    .and_then(Value::as_array)
                    .cloned()
                {
                    for instance in instances.iter().filter_map(Value::as_str) {
                        info!("Creating instance '{}' for '{}'", instance, name);
                        self.add_instance(&name, instance);
                    }
                }
                self.add_component(&name, DatabaseFlag::OnlySlc);
            } else if other.len() == 1 {
                let name = other.remove(0);
                info!("Adding component '{}' to satisfy '{}'", name, requirement);
                self.add_component(&name, DatabaseFlag::OnlySlc);
            } else {
                self.slc_required.insert(requirement);
            }
        }
    }

    /// Last resort: a native component whose id matches the requirement.
    fn resolve_slc_via_components(&mut self) {
        if self.slc_required.is_empty() {
            return;
        }
        let requirements: Vec<String> =
            std::mem::take(&mut self.slc_required).into_iter().collect();
        for requirement in requirements {
            if self.slc_provided.contains(&requirement) {
                continue;
            }
            if self
                .workspace
                .find_component(&requirement, self.component_flags)
                .is_some()
            {
                info!("Adding component '{}' to satisfy itself", requirement);
                self.unprocessed_components.insert(requirement);
            } else {
                self.slc_required.insert(requirement);
            }
        }
    }

    /// An `unless` list disqualifies when any listed feature is required.
    pub fn is_disqualified_by_unless(&self, node: &Value) -> bool {
        node.get("unless")
            .and_then(Value::as_array)
            .is_some_and(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|feature| self.required_features.contains(feature))
            })
    }

    /// A `condition` list is satisfied when every listed feature is required.
    pub fn condition_is_fulfilled(&self, node: &Value) -> bool {
        node.get("condition")
            .and_then(Value::as_array)
            .is_none_or(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .all(|feature| self.required_features.contains(feature))
            })
    }

    /// Post-fixpoint pass collecting choice violations per reachable choice.
    pub fn evaluate_choices(&mut self) {
        for component in &self.components {
            let Some(choices) = component.json.get("choices").and_then(Value::as_object) else {
                continue;
            };
            for (name, choice) in choices {
                let matches = self.count_choice_matches(choice);
                if matches == 0 {
                    self.incomplete_choices
                        .push((component.id.clone(), name.clone()));
                } else if matches > 1 {
                    self.multiple_answer_choices.push(name.clone());
                }
            }
        }
    }

    /// Emit the merged project summary.
    pub fn generate_project_summary(&mut self) {
        self.summary["project_name"] = Value::String(self.name.clone());
        self.summary["project_file"] =
            Value::String(self.project_file.to_string_lossy().replace('\\', "/"));
        self.summary["project_output"] =
            Value::String(format!("{}{}", DEFAULT_OUTPUT_DIRECTORY, self.name));
        self.summary["configuration"] = self.workspace.configuration.clone();

        if self.summary.get("tools").is_none() {
            self.summary["tools"] = json!({});
        }

        let mut components = Map::new();
        for component in &self.components {
            components.insert(component.id.clone(), component.json.clone());
        }
        self.summary["components"] = Value::Object(components);

        for index in 0..self.components.len() {
            self.process_tools(index);
        }

        let mut features: Vec<String> = self.required_features.iter().cloned().collect();
        features.sort();
        self.summary["features"] = json!(features);

        self.summary["initial"] = json!({
            "components": self.initial_components,
            "features": self.initial_features,
        });

        if self.summary.get("data").is_none() {
            self.summary["data"] = json!({});
        }
        self.summary["host"] = json!({"name": HOST_OS_STRING});
    }

    /// Render a component's tool strings into `summary.tools`.
    pub fn process_tools(&mut self, index: usize) {
        let Some(tools) = self.components[index]
            .json
            .get("tools")
            .and_then(Value::as_object)
            .cloned()
        else {
            return;
        };
        let curdir = std::path::absolute(&self.components[index].directory)
            .unwrap_or_else(|_| self.components[index].directory.clone())
            .to_string_lossy()
            .replace('\\', "/");
        for (key, value) in tools {
            let Some(template) = value.as_str() else { continue };
            let ctx = TemplateContext::with_curdir(&self.summary, curdir.clone());
            let rendered = ctx.try_render(template);
            self.summary["tools"][&key] = Value::String(rendered);
        }
    }

    /// Register a component's blueprints, rendering their keys.
    pub fn process_component_blueprints(&mut self, index: usize) {
        let Some(blueprints) = self.components[index]
            .json
            .get("blueprints")
            .and_then(Value::as_object)
            .cloned()
        else {
            return;
        };
        let directory = self.components[index]
            .directory
            .to_string_lossy()
            .replace('\\', "/");
        for (key, value) in blueprints {
            let source = value
                .get("regex")
                .and_then(Value::as_str)
                .unwrap_or(key.as_str());
            let ctx = TemplateContext::new(&self.summary);
            let rendered = ctx.try_render(source);
            if rendered.is_empty() {
                continue;
            }
            if rendered.starts_with(DATA_DEPENDENCY_IDENTIFIER) && !rendered.starts_with(":/data/")
            {
                error!("Invalid data blueprint: {}", rendered);
                continue;
            }
            info!("Additional blueprint: {}", rendered);
            self.blueprint_database
                .insert(rendered.clone(), Blueprint::from_json(&rendered, &value, &directory));
        }
    }

    pub fn process_blueprints(&mut self) {
        for index in 0..self.components.len() {
            self.process_component_blueprints(index);
        }
    }

    /// Merge every component's subtree at each `requires.data` path into the
    /// summary data. Returns the required paths that remain missing.
    pub fn update_project_data(&mut self) -> Vec<String> {
        let mut required_data: FxHashSet<String> = FxHashSet::default();
        for component in &self.components {
            if let Some(paths) = component.json.pointer("/requires/data").and_then(Value::as_array)
            {
                for path in paths.iter().filter_map(Value::as_str) {
                    required_data.insert(path.to_string());
                }
            }
        }

        // Merge into the data subtree itself so `data_schema` strategy paths
        // line up with the merge paths.
        let mut data = self
            .summary
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null);
        if data.is_null() {
            data = json!({});
        }
        let strategies = self.merge_strategies.clone();
        for index in 0..self.components.len() {
            for path in required_data.clone() {
                let Some(fragment) = self.components[index].json.pointer(&path).cloned() else {
                    continue;
                };
                if let Err(e) =
                    crate::core::merge::json_node_merge_with(&mut data, &path, &fragment, &strategies)
                {
                    error!("Could not merge data '{}': {}", path, e);
                }
            }
        }
        self.summary["data"] = data;

        let mut missing: Vec<String> = required_data
            .into_iter()
            .filter(|path| {
                self.summary
                    .pointer(&format!("/data{}", path))
                    .is_none()
            })
            .collect();
        missing.sort();
        missing
    }

    /// Breadth-first closure of the target database starting from the
    /// command set. Data dependencies are recorded but not expanded;
    /// blueprint `requirements` pull in tool components on demand.
    pub fn generate_target_database(&mut self) -> Result<(), YakkaError> {
        let mut processed: FxHashSet<String> = FxHashSet::default();
        let mut unprocessed: Vec<String> = self.commands.iter().cloned().collect();
        unprocessed.sort();

        while !unprocessed.is_empty() {
            let mut new_targets = Vec::new();
            for target in &unprocessed {
                if !processed.insert(target.clone()) {
                    continue;
                }

                if !self.target_database.contains(target) {
                    let matches = if target.starts_with(DATA_DEPENDENCY_IDENTIFIER) {
                        Vec::new()
                    } else {
                        self.blueprint_database.find_match(target, &self.summary)?
                    };

                    let mut requirements = Vec::new();
                    for entry in &matches {
                        requirements.extend(entry.blueprint.requirements.iter().cloned());
                    }
                    self.target_database.insert(target.clone(), matches);

                    for requirement in requirements {
                        if self.additional_tools.contains(&requirement) {
                            continue;
                        }
                        if let Some(path) =
                            self.workspace.find_component(&requirement, self.component_flags)
                        {
                            self.add_additional_tool(&path)?;
                        }
                    }
                }

                for entry in self.target_database.get(target) {
                    for dependency in &entry.dependencies {
                        if !dependency.starts_with(DATA_DEPENDENCY_IDENTIFIER) {
                            new_targets.push(dependency.clone());
                        } else if !self.target_database.contains(dependency) {
                            // Recorded as a leaf; diffed at execution time.
                            new_targets.push(dependency.clone());
                        }
                    }
                }
            }
            unprocessed = new_targets;
        }
        Ok(())
    }

    /// Load a tool-providing component on demand, merging its blueprints and
    /// tools into the project.
    pub fn add_additional_tool(&mut self, path: &Path) -> Result<(), YakkaError> {
        let component = Component::parse_file(path)?;
        let id = component.id.clone();
        self.components.push(component);
        let index = self.components.len() - 1;

        self.summary["components"][&id] = self.components[index].json.clone();
        self.process_component_blueprints(index);
        self.process_tools(index);
        self.additional_tools.insert(id);
        Ok(())
    }

    /// Persist the summary (JSON and YAML twins) and the ordered template
    /// contributions; the contributions file is rewritten only on change.
    pub fn save_summary(&self) -> Result<(), YakkaError> {
        fs::create_dir_all(&self.output_path)?;

        let json_path = self.output_path.join(PROJECT_SUMMARY_FILENAME);
        fs::write(&json_path, serde_json::to_string_pretty(&self.summary)?)?;

        let yaml_path = self.output_path.join(PROJECT_SUMMARY_YAML_FILENAME);
        fs::write(&yaml_path, serde_yaml::to_string(&self.summary)?)?;

        let contributions_path = self.output_path.join("template_contributions.json");
        if contributions_path.exists() {
            let existing = fs::read_to_string(&contributions_path)?;
            if let Ok(existing) = serde_json::from_str::<Value>(&existing)
                && existing == self.template_contributions
            {
                return Ok(());
            }
        }
        fs::write(
            &contributions_path,
            serde_json::to_string_pretty(&self.template_contributions)?,
        )?;
        Ok(())
    }

    pub fn save_blueprints(&self) -> Result<(), YakkaError> {
        self.blueprint_database
            .save(&self.output_path.join("blueprints.json"))
    }

    /// Write a starter `<project>.yakka` file.
    pub fn create_project_file(&self) -> Result<(), YakkaError> {
        let mut body = format!("name: {}\ntype: project\n", self.name);
        if !self.initial_components.is_empty() {
            body.push_str("components:\n");
            for component in &self.initial_components {
                body.push_str(&format!("  - {}\n", component));
            }
        }
        if !self.initial_features.is_empty() {
            body.push_str("features:\n");
            for feature in &self.initial_features {
                body.push_str(&format!("  - {}\n", feature));
            }
        }
        body.push_str("data: ~\n");
        fs::write(&self.project_file, body)?;
        Ok(())
    }
}

/// Remove a `%instance%` placeholder from a recommend id.
fn strip_instance_placeholder(id: &str) -> String {
    match (id.find('%'), id.rfind('%')) {
        (Some(start), Some(end)) if start < end => {
            let mut out = String::with_capacity(id.len());
            out.push_str(&id[..start]);
            out.push_str(&id[end + 1..]);
            out
        }
        _ => id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_manifest(root: &Path, relative: &str, body: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn workspace_with(manifests: &[(&str, &str)]) -> (tempfile::TempDir, Workspace) {
        let tmp = tempfile::tempdir().unwrap();
        for (relative, body) in manifests {
            write_manifest(tmp.path(), relative, body);
        }
        let workspace = Workspace::init(tmp.path()).unwrap();
        (tmp, workspace)
    }

    fn resolve<'w>(
        workspace: &'w Workspace,
        root: &Path,
        components: &[&str],
        features: &[&str],
    ) -> (Project<'w>, ProjectState) {
        let mut project = Project::new("test", workspace);
        project.output_path = root.join("output/test");
        project.project_file = root.join("test.yakka");
        project
            .init(
                components.iter().map(|s| s.to_string()).collect(),
                features.iter().map(|s| s.to_string()).collect(),
                FxHashSet::default(),
            )
            .unwrap();
        let state = project.evaluate_dependencies();
        (project, state)
    }

    #[test]
    fn requires_chain_closes_transitively() {
        let (tmp, workspace) = workspace_with(&[
            ("app/app.yakka", "requires:\n  components: [core]\n"),
            ("core/core.yakka", "requires:\n  components: [hal]\n"),
            ("hal/hal.yakka", "provides:\n  features: [io]\n"),
        ]);
        let (project, state) = resolve(&workspace, tmp.path(), &["app"], &[]);

        assert_eq!(state, ProjectState::Valid);
        for id in ["app", "core", "hal"] {
            assert!(project.required_components.contains(id), "missing {}", id);
        }
    }

    #[test]
    fn unknown_component_is_reported_not_fatal_mid_pass() {
        let (tmp, workspace) =
            workspace_with(&[("app/app.yakka", "requires:\n  components: [ghost]\n")]);
        let (project, state) = resolve(&workspace, tmp.path(), &["app"], &[]);

        assert_eq!(state, ProjectState::HasUnknownComponents);
        assert!(project.unknown_components.contains("ghost"));
        assert!(project.required_components.contains("app"));
    }

    #[test]
    fn feature_pulls_component_via_supports() {
        let (tmp, workspace) = workspace_with(&[
            (
                "core/core.yakka",
                "supports:\n  features:\n    logging:\n      requires:\n        components: [log]\n",
            ),
            ("log/log.yakka", "provides:\n  features: [logging]\n"),
        ]);
        let (project, state) = resolve(&workspace, tmp.path(), &["core"], &["logging"]);

        assert_eq!(state, ProjectState::Valid);
        assert!(project.required_components.contains("log"));
        assert!(project.required_features.contains("logging"));
        assert!(project.unprovided_features.is_empty());
    }

    #[test]
    fn choice_default_selected_when_unmatched() {
        let (tmp, workspace) = workspace_with(&[(
            "net/net.yakka",
            "choices:\n  transport:\n    description: transport layer\n    features: [tcp, udp]\n    default:\n      feature: tcp\nsupports:\n  features:\n    tcp:\n      provides:\n        features: [tcp]\n",
        )]);
        let (mut project, state) = resolve(&workspace, tmp.path(), &["net"], &[]);

        assert_eq!(state, ProjectState::Valid);
        assert!(project.required_features.contains("tcp"));
        assert!(!project.required_features.contains("udp"));
        project.evaluate_choices();
        assert!(project.incomplete_choices.is_empty());
    }

    #[test]
    fn incomplete_choice_without_default_is_reported() {
        let (tmp, workspace) = workspace_with(&[(
            "net/net.yakka",
            "choices:\n  transport:\n    description: transport layer\n    features: [tcp, udp]\n",
        )]);
        let (mut project, state) = resolve(&workspace, tmp.path(), &["net"], &[]);

        assert_eq!(state, ProjectState::Valid);
        project.evaluate_choices();
        assert_eq!(
            project.incomplete_choices,
            vec![("net".to_string(), "transport".to_string())]
        );
    }

    #[test]
    fn multiple_answer_choice_is_reported() {
        let (tmp, workspace) = workspace_with(&[(
            "net/net.yakka",
            "choices:\n  transport:\n    description: transport layer\n    features: [tcp, udp]\n",
        )]);
        let (mut project, state) = resolve(&workspace, tmp.path(), &["net"], &["tcp", "udp"]);

        assert_eq!(state, ProjectState::HasUnresolvedRequirements);
        project.evaluate_choices();
        assert_eq!(project.multiple_answer_choices, vec!["transport"]);
    }

    #[test]
    fn replacement_triggers_one_extra_epoch() {
        let (tmp, workspace) = workspace_with(&[
            ("a/a.yakka", "requires:\n  components: [b]\n"),
            ("b/b.yakka", "replaces:\n  component: c\n"),
            ("c/c.yakka", "provides:\n  features: [legacy]\n"),
        ]);
        let (project, state) = resolve(&workspace, tmp.path(), &["a"], &[]);

        assert_eq!(state, ProjectState::Valid);
        assert!(project.required_components.contains("a"));
        assert!(project.required_components.contains("b"));
        assert!(!project.required_components.contains("c"));
        assert_eq!(project.replacements.get("c"), Some(&"b".to_string()));
    }

    #[test]
    fn replaced_component_redirects_to_replacement() {
        let (tmp, workspace) = workspace_with(&[
            ("a/a.yakka", "requires:\n  components: [b, c]\n"),
            ("b/b.yakka", "replaces:\n  component: c\n"),
            ("c/c.yakka", "provides:\n  features: [legacy]\n"),
        ]);
        let (project, state) = resolve(&workspace, tmp.path(), &["a"], &[]);

        assert_eq!(state, ProjectState::Valid);
        assert!(!project.required_components.contains("c"));
        assert_eq!(project.replacements.get("c"), Some(&"b".to_string()));
    }

    #[test]
    fn conflicting_replacements_are_fatal() {
        let (tmp, workspace) = workspace_with(&[
            ("a/a.yakka", "requires:\n  components: [b, d]\n"),
            ("b/b.yakka", "replaces:\n  component: c\n"),
            ("d/d.yakka", "replaces:\n  component: c\n"),
        ]);
        let (_, state) = resolve(&workspace, tmp.path(), &["a"], &[]);
        assert_eq!(state, ProjectState::HasMultipleReplacements);
    }

    #[test]
    fn unprovided_feature_chases_recommendation() {
        let (tmp, workspace) = workspace_with(&[
            (
                "app/app.yakka",
                "requires:\n  features:\n    - name: storage\n      recommends:\n        component: flash\n",
            ),
            ("flash/flash.yakka", "provides:\n  features: [storage]\n"),
        ]);
        let (project, state) = resolve(&workspace, tmp.path(), &["app"], &[]);

        assert_eq!(state, ProjectState::Valid);
        assert!(project.required_components.contains("flash"));
        assert!(project.unprovided_features.is_empty());
    }

    #[test]
    fn unresolved_requirement_is_terminal() {
        let (tmp, workspace) =
            workspace_with(&[("app/app.yakka", "requires:\n  features: [nothing_provides_this]\n")]);
        let (project, state) = resolve(&workspace, tmp.path(), &["app"], &[]);

        assert_eq!(state, ProjectState::HasUnresolvedRequirements);
        assert!(project.unprovided_features.contains("nothing_provides_this"));
    }

    #[test]
    fn invalid_manifest_is_fatal() {
        let (tmp, workspace) = workspace_with(&[("bad/bad.yakka", "requires: [unclosed\n")]);
        let (_, state) = resolve(&workspace, tmp.path(), &["bad"], &[]);
        assert_eq!(state, ProjectState::HasInvalidComponent);
    }

    #[test]
    fn summary_contains_expected_sections() {
        let (tmp, workspace) = workspace_with(&[(
            "app/app.yakka",
            "provides:\n  features: [main]\ntools:\n  greet: \"echo {{project_name}}\"\n",
        )]);
        let (mut project, state) = resolve(&workspace, tmp.path(), &["app"], &[]);
        assert_eq!(state, ProjectState::Valid);

        project.generate_project_summary();
        let summary = &project.summary;
        assert_eq!(summary["project_name"], "test");
        assert!(summary["components"]["app"].is_object());
        assert_eq!(summary["initial"]["components"][0], "app");
        assert_eq!(summary["tools"]["greet"], "echo test");
        assert!(summary["host"]["name"].is_string());
    }

    #[test]
    fn required_data_merges_into_summary() {
        let (tmp, workspace) = workspace_with(&[
            (
                "app/app.yakka",
                "requires:\n  data: [/memory]\nmemory:\n  flash: 1024\n",
            ),
            ("board/board.yakka", "memory:\n  ram: 256\n"),
        ]);
        let (mut project, state) = resolve(&workspace, tmp.path(), &["app", "board"], &[]);
        assert_eq!(state, ProjectState::Valid);

        project.generate_project_summary();
        let missing = project.update_project_data();
        assert!(missing.is_empty());
        assert_eq!(project.summary["data"]["memory"]["flash"], 1024);
        assert_eq!(project.summary["data"]["memory"]["ram"], 256);
    }

    #[test]
    fn target_database_closes_over_dependencies() {
        let (tmp, workspace) = workspace_with(&[(
            "app/app.yakka",
            concat!(
                "blueprints:\n",
                "  build:\n",
                "    depends: [main.o]\n",
                "    process:\n",
                "      - echo: link\n",
                "  main.o:\n",
                "    depends: [main.c]\n",
                "    process:\n",
                "      - echo: compile\n",
            ),
        )]);
        let (mut project, state) = resolve(&workspace, tmp.path(), &["app"], &[]);
        assert_eq!(state, ProjectState::Valid);

        project.generate_project_summary();
        project.process_blueprints();
        project.commands.insert("build".to_string());
        project.generate_target_database().unwrap();

        let names = project.target_database.target_names();
        assert_eq!(names, vec!["build", "main.c", "main.o"]);
        assert_eq!(project.target_database.get("main.c").len(), 0);
    }

    #[test]
    fn blueprint_requirements_load_additional_tools() {
        let (tmp, workspace) = workspace_with(&[
            (
                "app/app.yakka",
                concat!(
                    "blueprints:\n",
                    "  build:\n",
                    "    requires: [compiler]\n",
                    "    process:\n",
                    "      - echo: build\n",
                ),
            ),
            (
                "compiler/compiler.yakka",
                "tools:\n  cc: \"/usr/bin/cc\"\nblueprints:\n  compiler_check:\n    process:\n      - echo: ok\n",
            ),
        ]);
        let (mut project, state) = resolve(&workspace, tmp.path(), &["app"], &[]);
        assert_eq!(state, ProjectState::Valid);

        project.generate_project_summary();
        project.process_blueprints();
        project.commands.insert("build".to_string());
        project.generate_target_database().unwrap();

        assert!(project.additional_tools.contains("compiler"));
        assert_eq!(project.summary["tools"]["cc"], "/usr/bin/cc");
    }

    #[test]
    fn project_data_file_merges_into_summary() {
        let (tmp, workspace) = workspace_with(&[("app/app.yakka", "provides:\n  features: [x]\n")]);
        fs::write(tmp.path().join("test.yakka"), "name: test\ndata:\n  version: \"7\"\n").unwrap();

        let (mut project, state) = resolve(&workspace, tmp.path(), &["app"], &[]);
        assert_eq!(state, ProjectState::Valid);
        project.generate_project_summary();
        project.apply_project_data(Some("build: fast")).unwrap();

        assert_eq!(project.summary["data"]["version"], "7");
        assert_eq!(project.summary["data"]["build"], "fast");
    }
}
