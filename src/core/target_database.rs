//! Target database: memoised map from target name to blueprint matches.
//!
//! Grown by a breadth-first closure starting from the command set (see
//! `Project::generate_target_database`): a target is a key iff it was a
//! command argument or appears as a dependency of a match already in the
//! database. Data dependencies are recorded but never expanded further.

use crate::core::blueprint::BlueprintMatch;
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct TargetDatabase {
    targets: FxHashMap<String, Vec<Arc<BlueprintMatch>>>,
}

impl TargetDatabase {
    pub fn contains(&self, target: &str) -> bool {
        self.targets.contains_key(target)
    }

    pub fn insert(&mut self, target: String, matches: Vec<Arc<BlueprintMatch>>) {
        self.targets.insert(target, matches);
    }

    /// Matches bound to a target; empty when the target is a leaf.
    pub fn get(&self, target: &str) -> &[Arc<BlueprintMatch>] {
        self.targets.get(target).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn target_names(&self) -> Vec<&String> {
        let mut names: Vec<&String> = self.targets.keys().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::blueprint::Blueprint;
    use serde_json::json;

    #[test]
    fn insert_and_lookup() {
        let mut db = TargetDatabase::default();
        assert!(!db.contains("build"));
        assert!(db.get("build").is_empty());

        let blueprint = Blueprint::from_json("build", &json!({"process": []}), ".");
        db.insert(
            "build".to_string(),
            vec![Arc::new(BlueprintMatch {
                blueprint: Arc::new(blueprint),
                regex_matches: vec!["build".to_string()],
                dependencies: vec!["main.o".to_string()],
            })],
        );

        assert!(db.contains("build"));
        assert_eq!(db.get("build").len(), 1);
        assert_eq!(db.get("build")[0].dependencies, vec!["main.o"]);
        assert_eq!(db.target_names(), vec!["build"]);
    }

    #[test]
    fn leaf_targets_hold_empty_match_lists() {
        let mut db = TargetDatabase::default();
        db.insert("main.c".to_string(), Vec::new());
        assert!(db.contains("main.c"));
        assert!(db.get("main.c").is_empty());
    }
}
