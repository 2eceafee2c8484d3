//! Component manifests: the unit of declarative configuration.
//!
//! A manifest is a YAML document describing what a component requires,
//! provides, supports, chooses, replaces, and how its targets are built
//! (blueprints). Manifests are parsed once into the JSON value model and
//! owned by the component store; later phases only read them.

use crate::core::error::YakkaError;
use crate::core::utilities::{component_dotname_to_id, load_yaml_file};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Manifest flavour, derived from the file extension.
///
/// `.yakka` files are native manifests; `.slcc`/`.slcp`/`.slce` files carry
/// SLC conventions (instances, recommends, config overrides) that get
/// special treatment during resolution and post-processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Yakka,
    Slcc,
    Slcp,
    Slce,
}

impl ManifestKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yakka" => Some(ManifestKind::Yakka),
            "slcc" => Some(ManifestKind::Slcc),
            "slcp" => Some(ManifestKind::Slcp),
            "slce" => Some(ManifestKind::Slce),
            _ => None,
        }
    }

    pub fn is_slc(self) -> bool {
        !matches!(self, ManifestKind::Yakka)
    }
}

/// A parsed component manifest.
#[derive(Debug, Clone)]
pub struct Component {
    /// Component id: the manifest filename stem's last dotted segment.
    pub id: String,
    pub kind: ManifestKind,
    /// Path of the manifest file itself.
    pub file_path: PathBuf,
    /// Directory containing the manifest; blueprint `curdir()` resolves here.
    pub directory: PathBuf,
    /// The manifest document. `name`, `directory`, and `yakka_file` are
    /// injected during parsing so templates can reach them.
    pub json: Value,
}

impl Component {
    /// Parse a manifest file.
    ///
    /// Fails with [`YakkaError::InvalidComponent`] on unreadable or
    /// non-mapping documents; the resolver reports this as
    /// `PROJECT_HAS_INVALID_COMPONENT`.
    pub fn parse_file(path: &Path) -> Result<Self, YakkaError> {
        let kind = ManifestKind::from_path(path).ok_or_else(|| {
            YakkaError::InvalidComponent(
                path.display().to_string(),
                "unrecognised manifest extension".to_string(),
            )
        })?;

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                YakkaError::InvalidComponent(
                    path.display().to_string(),
                    "manifest has no filename".to_string(),
                )
            })?;
        let id = component_dotname_to_id(stem);

        let mut json = load_yaml_file(path).map_err(|e| {
            YakkaError::InvalidComponent(id.clone(), e.to_string())
        })?;
        if json.is_null() {
            json = Value::Object(serde_json::Map::new());
        }
        if !json.is_object() {
            return Err(YakkaError::InvalidComponent(
                id,
                "manifest root is not a mapping".to_string(),
            ));
        }

        let directory = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        if let Some(map) = json.as_object_mut() {
            map.entry("name".to_string())
                .or_insert_with(|| Value::String(id.clone()));
            map.insert(
                "directory".to_string(),
                Value::String(directory.to_string_lossy().replace('\\', "/")),
            );
            map.insert(
                "yakka_file".to_string(),
                Value::String(path.to_string_lossy().replace('\\', "/")),
            );
        }

        Ok(Component {
            id,
            kind,
            file_path: path.to_path_buf(),
            directory,
            json,
        })
    }

    /// Feature names this component provides.
    pub fn provided_features(&self) -> Vec<String> {
        string_or_list(&self.json, "/provides/features")
    }

    /// Blueprint target names (or regexes) this component declares.
    pub fn blueprint_names(&self) -> Vec<String> {
        self.json
            .pointer("/blueprints")
            .and_then(Value::as_object)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Read a manifest entry that may be a scalar or a sequence of scalars or
/// `{name: ...}` objects, yielding the names.
pub fn string_or_list(node: &Value, pointer: &str) -> Vec<String> {
    let Some(entry) = node.pointer(pointer) else {
        return Vec::new();
    };
    match entry {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(map) => map.get("name").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_yakka_manifest_and_injects_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uart.yakka");
        fs::write(
            &path,
            "requires:\n  components:\n    - gpio\nprovides:\n  features:\n    - serial\n",
        )
        .unwrap();

        let component = Component::parse_file(&path).unwrap();
        assert_eq!(component.id, "uart");
        assert_eq!(component.kind, ManifestKind::Yakka);
        assert_eq!(component.json["name"], "uart");
        assert!(component.json["directory"].as_str().is_some());
        assert_eq!(component.provided_features(), vec!["serial"]);
    }

    #[test]
    fn dotted_filename_takes_last_segment_as_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vendor.family.uart.yakka");
        fs::write(&path, "provides:\n  features: [serial]\n").unwrap();

        let component = Component::parse_file(&path).unwrap();
        assert_eq!(component.id, "uart");
    }

    #[test]
    fn invalid_yaml_is_invalid_component() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yakka");
        fs::write(&path, "requires: [unclosed\n").unwrap();

        assert!(matches!(
            Component::parse_file(&path),
            Err(YakkaError::InvalidComponent(_, _))
        ));
    }

    #[test]
    fn slc_kinds_detected_by_extension() {
        assert_eq!(
            ManifestKind::from_path(Path::new("a/b.slcc")),
            Some(ManifestKind::Slcc)
        );
        assert_eq!(
            ManifestKind::from_path(Path::new("a/b.slcp")),
            Some(ManifestKind::Slcp)
        );
        assert!(ManifestKind::Slce.is_slc());
        assert!(!ManifestKind::Yakka.is_slc());
    }

    #[test]
    fn string_or_list_accepts_objects_with_name() {
        let node = serde_json::json!({
            "requires": {"features": [
                "plain",
                {"name": "named", "recommends": {"component": "x"}}
            ]}
        });
        assert_eq!(
            string_or_list(&node, "/requires/features"),
            vec!["plain", "named"]
        );
    }
}
