//! Workspace: the directory context a build runs in.
//!
//! A workspace owns the local component database (the current directory
//! tree), the shared database under the Yakka home directory, the set of
//! registered component registries, and the workspace configuration that
//! feeds the project summary.

use crate::core::database::{ComponentDatabase, DatabaseFlag};
use crate::core::error::YakkaError;
use crate::core::utilities::{exec, load_yaml_file};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the shared components/database directory.
pub const YAKKA_HOME_ENV: &str = "YAKKA_HOME";

/// A component registry: a named index of fetchable components.
#[derive(Debug, Clone)]
pub struct Registry {
    pub name: String,
    pub url: String,
    /// Raw registry document; `provides.components` lists fetch specs.
    pub json: Value,
}

#[derive(Debug, Default)]
pub struct Workspace {
    pub workspace_path: PathBuf,
    pub shared_home: PathBuf,
    pub local_database: ComponentDatabase,
    pub shared_database: ComponentDatabase,
    pub registries: Vec<Registry>,
    /// Workspace configuration merged into the project summary.
    pub configuration: Value,
}

impl Workspace {
    /// Initialise the workspace rooted at `path`.
    ///
    /// Loads (or builds) the component databases, reads registries from
    /// `.yakka/registries/`, and reads the workspace config file.
    pub fn init(path: &Path) -> Result<Self, YakkaError> {
        let shared_home = shared_home_directory();
        let mut workspace = Workspace {
            workspace_path: path.to_path_buf(),
            local_database: ComponentDatabase::new(path),
            shared_database: ComponentDatabase::new(&shared_home),
            shared_home,
            registries: Vec::new(),
            configuration: Value::Null,
        };

        if !workspace.local_database.load()? {
            workspace.local_database.scan_for_components()?;
            // Cache save is best-effort; read-only checkouts still work.
            if let Err(e) = workspace.local_database.save() {
                warn!("Could not save local component database: {}", e);
            }
        }
        if workspace.shared_home.exists() && !workspace.shared_database.load()? {
            workspace.shared_database.scan_for_components()?;
            if let Err(e) = workspace.shared_database.save() {
                warn!("Could not save shared component database: {}", e);
            }
        }

        workspace.load_registries()?;
        workspace.load_configuration()?;
        Ok(workspace)
    }

    /// Rescan both databases, discarding caches.
    pub fn refresh(&mut self) -> Result<(), YakkaError> {
        self.local_database.erase();
        self.local_database.clear();
        self.local_database.scan_for_components()?;
        self.local_database.save()?;

        if self.shared_home.exists() {
            self.shared_database.erase();
            self.shared_database.clear();
            self.shared_database.scan_for_components()?;
            self.shared_database.save()?;
        }
        Ok(())
    }

    fn registries_directory(&self) -> PathBuf {
        self.workspace_path.join(".yakka").join("registries")
    }

    /// Git working area for a fetched component.
    pub fn repo_directory(&self, component: &str) -> PathBuf {
        self.workspace_path
            .join(".yakka")
            .join("repos")
            .join(component)
    }

    fn load_registries(&mut self) -> Result<(), YakkaError> {
        let dir = self.registries_directory();
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml");
            if !is_yaml {
                continue;
            }
            match load_yaml_file(&path) {
                Ok(json) => {
                    let name = json
                        .get("name")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| {
                            path.file_stem().unwrap_or_default().to_string_lossy().into_owned()
                        });
                    let url = json
                        .get("url")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    self.registries.push(Registry { name, url, json });
                }
                Err(e) => warn!("Skipping registry {}: {}", path.display(), e),
            }
        }
        Ok(())
    }

    fn load_configuration(&mut self) -> Result<(), YakkaError> {
        let config_path = self.workspace_path.join(".yakka").join("config.yaml");
        if config_path.exists() {
            self.configuration = load_yaml_file(&config_path)?;
        }
        Ok(())
    }

    /// Locate a component manifest: local database first, then shared.
    pub fn find_component(&self, id: &str, flags: DatabaseFlag) -> Option<PathBuf> {
        self.local_database
            .find_component(id, flags)
            .or_else(|| self.shared_database.find_component(id, flags))
    }

    /// Providers of a feature across both databases, deduplicated.
    pub fn find_feature(&self, feature: &str) -> Option<Vec<String>> {
        let mut providers = self.local_database.find_feature_providers(feature);
        for provider in self.shared_database.find_feature_providers(feature) {
            if !providers.contains(&provider) {
                providers.push(provider);
            }
        }
        if providers.is_empty() { None } else { Some(providers) }
    }

    /// Find a registry entry describing the named component.
    pub fn find_registry_component(&self, name: &str) -> Option<&Registry> {
        self.registries.iter().find(|registry| {
            registry
                .json
                .pointer("/provides/components")
                .and_then(Value::as_object)
                .is_some_and(|components| components.contains_key(name))
        })
    }

    /// Clone a registry under `.yakka/registries/`.
    pub fn add_registry(&mut self, url: &str) -> Result<(), YakkaError> {
        let dir = self.registries_directory();
        fs::create_dir_all(&dir)?;
        let name = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("registry")
            .trim_end_matches(".git");
        let destination = dir.join(name);
        let (output, retcode) = exec(
            "git",
            &format!("clone {} {}", url, destination.to_string_lossy()),
        );
        if retcode != 0 {
            return Err(YakkaError::WorkspaceError(format!(
                "failed to clone registry '{}': {}",
                url, output
            )));
        }
        info!("Registered {}", url);
        self.registries.clear();
        self.load_registries()
    }

    /// Run a git command inside a component's working area.
    pub fn execute_git_command(&self, component: &str, arguments: &str) -> Result<(), YakkaError> {
        let repo = self.repo_directory(component);
        if !repo.exists() {
            return Err(YakkaError::NotFound(format!(
                "component working area '{}'",
                repo.display()
            )));
        }
        let (output, retcode) = exec(
            "git",
            &format!("-C {} {}", repo.to_string_lossy(), arguments),
        );
        if retcode != 0 {
            return Err(YakkaError::WorkspaceError(format!(
                "git {} failed in {}: {}",
                arguments,
                repo.display(),
                output
            )));
        }
        if !output.is_empty() {
            println!("{}", output.trim_end());
        }
        Ok(())
    }

    /// Fetch a component named in a registry into the workspace repos area.
    pub fn fetch_component(&self, name: &str) -> Result<PathBuf, YakkaError> {
        let registry = self.find_registry_component(name).ok_or_else(|| {
            YakkaError::NotFound(format!("component '{}' in any registry", name))
        })?;
        let spec = registry
            .json
            .pointer(&format!("/provides/components/{}", name))
            .cloned()
            .unwrap_or(Value::Null);
        let url = spec
            .get("packages")
            .and_then(|p| p.get("default"))
            .and_then(|d| d.get("url"))
            .or_else(|| spec.get("url"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                YakkaError::WorkspaceError(format!("registry entry for '{}' has no url", name))
            })?;

        let destination = self.repo_directory(name);
        fs::create_dir_all(destination.parent().unwrap_or(Path::new(".")))?;
        let (output, retcode) = exec(
            "git",
            &format!("clone {} {}", url, destination.to_string_lossy()),
        );
        if retcode != 0 {
            return Err(YakkaError::WorkspaceError(format!(
                "failed to fetch '{}': {}",
                name, output
            )));
        }
        Ok(destination)
    }

    /// Delete a component's working area.
    pub fn remove_component(&self, name: &str) -> Result<(), YakkaError> {
        let repo = self.repo_directory(name);
        if !repo.exists() {
            return Err(YakkaError::NotFound(format!(
                "component working area '{}'",
                repo.display()
            )));
        }
        fs::remove_dir_all(&repo)?;
        Ok(())
    }
}

/// Shared components directory: `$YAKKA_HOME`, else `~/.yakka`.
pub fn shared_home_directory() -> PathBuf {
    if let Ok(home) = std::env::var(YAKKA_HOME_ENV) {
        return PathBuf::from(home);
    }
    let user_home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    PathBuf::from(user_home).join(".yakka")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_scans_local_components() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("uart")).unwrap();
        fs::write(
            tmp.path().join("uart/uart.yakka"),
            "provides:\n  features: [serial]\n",
        )
        .unwrap();

        let workspace = Workspace::init(tmp.path()).unwrap();
        assert!(workspace.find_component("uart", DatabaseFlag::All).is_some());
        assert_eq!(workspace.find_feature("serial"), Some(vec!["uart".to_string()]));
        assert!(workspace.find_feature("absent").is_none());
    }

    #[test]
    fn registries_load_from_yaml_files() {
        let tmp = tempfile::tempdir().unwrap();
        let registries = tmp.path().join(".yakka/registries");
        fs::create_dir_all(&registries).unwrap();
        fs::write(
            registries.join("main.yaml"),
            "name: main\nurl: https://example.com/registry\nprovides:\n  components:\n    stm32:\n      url: https://example.com/stm32\n",
        )
        .unwrap();

        let workspace = Workspace::init(tmp.path()).unwrap();
        assert_eq!(workspace.registries.len(), 1);
        assert_eq!(workspace.registries[0].name, "main");
        assert!(workspace.find_registry_component("stm32").is_some());
        assert!(workspace.find_registry_component("missing").is_none());
    }

    #[test]
    fn configuration_feeds_from_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join(".yakka")).unwrap();
        fs::write(
            tmp.path().join(".yakka/config.yaml"),
            "toolchain: gcc\n",
        )
        .unwrap();

        let workspace = Workspace::init(tmp.path()).unwrap();
        assert_eq!(workspace.configuration["toolchain"], "gcc");
    }
}
