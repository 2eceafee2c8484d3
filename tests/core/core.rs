//! Cross-module integration checks for the core building blocks.

use serde_json::{json, Value};
use std::fs;
use std::sync::Mutex;
use yakka::core::blueprint::Blueprint;
use yakka::core::blueprint_database::BlueprintDatabase;
use yakka::core::component::Component;
use yakka::core::database::{ComponentDatabase, DatabaseFlag};
use yakka::core::merge::{json_node_merge, json_node_merge_with, MergeStrategy, StrategyMap};
use yakka::core::template::TemplateContext;
use yakka::core::utilities;

#[test]
fn merge_is_monotone_and_right_biased() {
    // Monotone: merging never removes keys from the target.
    let mut target = json!({"a": {"x": 1}, "b": [1, 2]});
    let fragment = json!({"a": {"y": 2}, "b": [3], "c": "new"});
    json_node_merge(&mut target, "", &fragment).unwrap();

    assert_eq!(target["a"]["x"], 1);
    assert_eq!(target["a"]["y"], 2);
    assert_eq!(target["b"], json!([1, 2, 3]));
    assert_eq!(target["c"], "new");

    // Right-biased under overwrite: the fragment's value wins.
    let mut strategies = StrategyMap::new();
    strategies.collect(&json!({"c": {"merge": "overwrite"}}));
    assert_eq!(strategies.lookup("/c"), MergeStrategy::Overwrite);
    json_node_merge_with(&mut target, "", &json!({"c": "newer"}), &strategies).unwrap();
    assert_eq!(target["c"], "newer");
}

#[test]
fn merge_purity_fragment_unchanged() {
    let mut target = json!({"list": [1]});
    let fragment = json!({"list": [2, 3]});
    let fragment_before = fragment.clone();
    json_node_merge(&mut target, "", &fragment).unwrap();
    assert_eq!(fragment, fragment_before);
}

#[test]
fn component_store_lookup_by_id_feature_and_blueprint() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("uart");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("uart.yakka"),
        concat!(
            "provides:\n",
            "  features: [serial]\n",
            "blueprints:\n",
            "  uart_doc:\n",
            "    process:\n",
            "      - echo: doc\n",
        ),
    )
    .unwrap();

    let mut db = ComponentDatabase::new(tmp.path());
    db.scan_for_components().unwrap();

    let path = db.find_component("uart", DatabaseFlag::All).unwrap();
    assert_eq!(db.find_feature_providers("serial"), vec!["uart"]);
    assert_eq!(db.find_blueprint_provider("uart_doc"), Some(&"uart".to_string()));

    let component = Component::parse_file(&path).unwrap();
    assert_eq!(component.id, "uart");
    assert_eq!(component.blueprint_names(), vec!["uart_doc"]);
}

#[test]
fn dependency_file_expands_to_listed_paths() {
    let tmp = tempfile::tempdir().unwrap();
    let dep_file = tmp.path().join("main.d");
    fs::write(
        &dep_file,
        "main.o: main.c \\\n  include/app.h\n",
    )
    .unwrap();

    let mut db = BlueprintDatabase::default();
    db.insert(
        "main.o".to_string(),
        Blueprint::from_json(
            "main.o",
            &json!({
                "depends": [{"dependency_file": dep_file.to_str().unwrap()}],
                "process": [{"echo": "compile"}]
            }),
            ".",
        ),
    );

    let summary = json!({"components": {}, "features": [], "data": {}});
    let matches = db.find_match("main.o", &summary).unwrap();
    assert_eq!(
        matches[0].dependencies,
        vec!["main.c", "include/app.h"]
    );
}

#[test]
fn template_store_fetch_shared_across_renders() {
    let summary = json!({"components": {}, "features": [], "data": {}});
    let store = Mutex::new(Value::Null);
    let ctx = TemplateContext {
        data_store: Some(&store),
        ..TemplateContext::new(&summary)
    };

    ctx.render("{{store('/symbols', 'count', 2)}}").unwrap();
    assert_eq!(ctx.render("{{fetch('/symbols', 'count')}}").unwrap(), "2");
    assert_eq!(
        store.lock().unwrap().pointer("/symbols/count").unwrap(),
        &json!(2)
    );
}

#[test]
fn data_dependency_wildcard_observes_component_removal() {
    // A component present in the previous summary but absent now reads as
    // changed, because the previous entry is retained for diffing.
    let previous = json!({"components": {"a": {"config": 1}, "b": {"config": 2}}});
    let current = json!({"components": {"a": {"config": 1}}});
    assert!(!utilities::has_data_dependency_changed(
        ":/components/a/config",
        &previous,
        &current
    )
    .unwrap());
    assert!(utilities::has_data_dependency_changed(
        ":/components/b/config",
        &previous,
        &current
    )
    .unwrap());
}

#[test]
fn project_name_generation_matches_cli_contract() {
    let (components, features, commands) = utilities::parse_arguments(&[
        "app".to_string(),
        "board".to_string(),
        "+debug".to_string(),
        "build!".to_string(),
    ]);
    assert_eq!(
        utilities::generate_project_name(&components, &features),
        "app-board-debug"
    );
    assert!(commands.contains("build"));
}
