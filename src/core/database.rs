//! Component database: filesystem scan, lookup, and on-disk cache.
//!
//! A database maps component ids to manifest paths within one root
//! directory. Scans also index which features each manifest provides and
//! which blueprints it declares, so the resolver can ask "who provides
//! feature f" and the target database can pull in tool components by
//! blueprint name.

use crate::core::component::{string_or_list, ManifestKind};
use crate::core::error::YakkaError;
use crate::core::utilities::load_yaml_file;
use globset::{Glob, GlobSet, GlobSetBuilder};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Search filter applied during component lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseFlag {
    All,
    IgnoreYakka,
    OnlySlc,
    IgnoreAllSlc,
}

impl DatabaseFlag {
    fn admits(self, kind: ManifestKind) -> bool {
        match self {
            DatabaseFlag::All => true,
            DatabaseFlag::IgnoreYakka => kind.is_slc(),
            DatabaseFlag::OnlySlc => kind.is_slc(),
            DatabaseFlag::IgnoreAllSlc => !kind.is_slc(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DatabaseContents {
    /// component id -> manifest paths (an id may exist in several flavours)
    components: FxHashMap<String, Vec<PathBuf>>,
    /// feature name -> provider component ids
    features: FxHashMap<String, Vec<String>>,
    /// blueprint target name -> declaring component id
    blueprints: FxHashMap<String, String>,
}

/// Component database over one directory tree.
#[derive(Debug, Default)]
pub struct ComponentDatabase {
    path: PathBuf,
    contents: DatabaseContents,
}

const DATABASE_FILENAME: &str = "yakka-components.yaml";
const MANIFEST_GLOBS: [&str; 4] = ["*.yakka", "*.slcc", "*.slcp", "*.slce"];

fn manifest_globset() -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in MANIFEST_GLOBS {
        builder.add(Glob::new(pattern).expect("static glob pattern"));
    }
    builder.build().expect("static glob set")
}

impl ComponentDatabase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ComponentDatabase {
            path: path.into(),
            contents: DatabaseContents::default(),
        }
    }

    pub fn get_path(&self) -> &Path {
        &self.path
    }

    /// Walk the database root, indexing every manifest found.
    ///
    /// Output directories and VCS internals are skipped.
    pub fn scan_for_components(&mut self) -> Result<(), YakkaError> {
        let matcher = manifest_globset();
        let walker = WalkDir::new(&self.path).follow_links(false).into_iter();
        for entry in walker.filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !(e.file_type().is_dir() && (name == ".git" || name == "output" || name == "target"))
        }) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Scan error under {}: {}", self.path.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if !matcher.is_match(entry.file_name().to_string_lossy().as_ref()) {
                continue;
            }
            if let Err(e) = self.index_manifest(entry.path()) {
                warn!("Skipping manifest {}: {}", entry.path().display(), e);
            }
        }
        debug!(
            "Scanned {}: {} components",
            self.path.display(),
            self.contents.components.len()
        );
        Ok(())
    }

    fn index_manifest(&mut self, path: &Path) -> Result<(), YakkaError> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let id = crate::core::utilities::component_dotname_to_id(stem);
        if id.is_empty() {
            return Ok(());
        }

        self.contents
            .components
            .entry(id.clone())
            .or_default()
            .push(path.to_path_buf());

        // Index provided features and blueprint names so lookups don't need
        // to re-read every manifest.
        let json = load_yaml_file(path)?;
        if json.is_object() {
            for feature in string_or_list(&json, "/provides/features") {
                let providers = self.contents.features.entry(feature).or_default();
                if !providers.contains(&id) {
                    providers.push(id.clone());
                }
            }
            if let Some(blueprints) = json.pointer("/blueprints").and_then(Value::as_object) {
                for name in blueprints.keys() {
                    self.contents
                        .blueprints
                        .entry(name.clone())
                        .or_insert_with(|| id.clone());
                }
            }
        }
        Ok(())
    }

    /// Find a manifest for the given id, honouring the flavour filter.
    pub fn find_component(&self, id: &str, flags: DatabaseFlag) -> Option<PathBuf> {
        let paths = self.contents.components.get(id)?;
        paths
            .iter()
            .find(|path| {
                ManifestKind::from_path(path).is_some_and(|kind| flags.admits(kind))
            })
            .cloned()
    }

    /// Component ids providing the named feature.
    pub fn find_feature_providers(&self, feature: &str) -> Vec<String> {
        self.contents
            .features
            .get(feature)
            .cloned()
            .unwrap_or_default()
    }

    /// Component id declaring the named blueprint, if any.
    pub fn find_blueprint_provider(&self, blueprint: &str) -> Option<&String> {
        self.contents.blueprints.get(blueprint)
    }

    pub fn component_ids(&self) -> Vec<&String> {
        let mut ids: Vec<&String> = self.contents.components.keys().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.contents.components.is_empty()
    }

    pub fn clear(&mut self) {
        self.contents = DatabaseContents::default();
    }

    fn cache_file(&self) -> PathBuf {
        self.path.join(DATABASE_FILENAME)
    }

    /// Persist the index as YAML next to the scanned tree.
    pub fn save(&self) -> Result<(), YakkaError> {
        let contents = serde_yaml::to_string(&self.contents)?;
        fs::write(self.cache_file(), contents)?;
        Ok(())
    }

    /// Load a previously saved index; returns false when no cache exists.
    pub fn load(&mut self) -> Result<bool, YakkaError> {
        let cache = self.cache_file();
        if !cache.exists() {
            return Ok(false);
        }
        let raw = fs::read_to_string(&cache)?;
        self.contents = serde_yaml::from_str(&raw)?;
        Ok(true)
    }

    /// Remove the on-disk cache.
    pub fn erase(&self) {
        let _ = fs::remove_file(self.cache_file());
    }
}
