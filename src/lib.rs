//! Yakka: a component-oriented build orchestrator.
//!
//! Given components, features, and commands named on the command line, Yakka
//! resolves a closed transitive dependency graph over a mixed component
//! ecosystem, merges per-component declarations into a single project
//! summary, derives build targets from blueprint rules, and runs them as an
//! incrementally rebuilt task graph across worker threads.
//!
//! # CLI surface
//!
//! ```bash
//! # Build: positional action plus free-form tokens
//! #   +name  => feature     name! => command     anything else => component
//! yakka build! app board +debug
//!
//! # Workspace actions
//! yakka list
//! yakka register https://example.com/registry.git
//! yakka fetch stm32
//! yakka git stm32 status
//! ```
//!
//! Exit codes: 0 on success, -1 on any resolver or build failure.
//!
//! # Crate structure
//!
//! - [`core`]: engine modules (component store, resolver, blueprint matcher,
//!   target database, task engine, blueprint command set)

pub mod core;

use crate::core::database::DatabaseFlag;
use crate::core::error::YakkaError;
use crate::core::project::{Project, ProjectState};
use crate::core::task_engine::TaskEngine;
use crate::core::ui::{ConsoleUi, ProgressUi, SilentUi};
use crate::core::utilities::{generate_project_name, parse_arguments};
use crate::core::workspace::Workspace;
use clap::Parser;
use colored::Colorize;
use rustc_hash::FxHashSet;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[clap(
    name = "yakka",
    version = env!("CARGO_PKG_VERSION"),
    about = "Yakka the embedded builder",
    disable_version_flag = true
)]
pub struct Cli {
    /// 'register', 'list', 'update', 'remove', 'git', 'fetch', or a build
    /// command ending in '!'
    pub action: Option<String>,

    /// Components, +features, and commands! for the build
    pub tokens: Vec<String>,

    /// Refresh the component database before anything else
    #[clap(short = 'r', long)]
    pub refresh: bool,

    /// Skip the dependency and choice evaluation
    #[clap(short = 'n', long = "no-eval")]
    pub no_eval: bool,

    /// Ignore dependency and choice evaluation errors
    #[clap(short = 'i', long = "ignore-eval")]
    pub ignore_eval: bool,

    /// Do not generate the output folder
    #[clap(short = 'o', long = "no-output")]
    pub no_output: bool,

    /// Automatically fetch missing components
    #[clap(short = 'f', long)]
    pub fetch: bool,

    /// Set the project name
    #[clap(short = 'p', long = "project-name")]
    pub project_name: Option<String>,

    /// Additional SLC feature
    #[clap(short = 'w', long = "with")]
    pub with: Vec<String>,

    /// Additional data merged into the project summary (YAML fragment)
    #[clap(short = 'd', long = "data")]
    pub data: Option<String>,

    /// Ignore SLC files
    #[clap(long = "no-slcc")]
    pub no_slcc: bool,

    /// Ignore Yakka files
    #[clap(long = "no-yakka")]
    pub no_yakka: bool,
}

/// Entry point used by the binary. Returns the process exit code.
pub fn run() -> i32 {
    let cli = Cli::parse();
    match run_with(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e.to_string().bright_red());
            -1
        }
    }
}

pub fn run_with(cli: Cli) -> Result<i32, YakkaError> {
    let current_dir = std::env::current_dir()?;
    let mut workspace = Workspace::init(&current_dir)?;

    if cli.refresh {
        println!("Scanning '{}' for components", current_dir.display());
        workspace.refresh()?;
        println!("Scan complete.");
    }

    let Some(action) = cli.action.clone() else {
        println!("Provide an action or a command (commands end with !). See --help.");
        return Ok(0);
    };

    if let Some(command) = action.strip_suffix('!') {
        return run_build(&cli, &workspace, command);
    }

    match action.as_str() {
        "register" => {
            let Some(url) = cli.tokens.first() else {
                eprintln!("'register' requires a registry URL");
                return Ok(-1);
            };
            workspace.add_registry(url)?;
            Ok(0)
        }
        "list" => {
            run_list(&workspace);
            Ok(0)
        }
        "update" => {
            for component in &cli.tokens {
                workspace.execute_git_command(component, "pull")?;
            }
            Ok(0)
        }
        "remove" => {
            for component in &cli.tokens {
                workspace.remove_component(component)?;
                println!("Removed {}", component);
            }
            Ok(0)
        }
        "git" => {
            let Some((component, arguments)) = cli.tokens.split_first() else {
                eprintln!("'git' requires a component and a git command");
                return Ok(-1);
            };
            workspace.execute_git_command(component, &arguments.join(" "))?;
            Ok(0)
        }
        "fetch" => {
            for component in &cli.tokens {
                let path = workspace.fetch_component(component)?;
                println!("Fetched {} into {}", component, path.display());
            }
            workspace.refresh()?;
            Ok(0)
        }
        other => {
            println!(
                "Unknown action '{}'. Must provide an action or a command (commands end with !)",
                other
            );
            Ok(0)
        }
    }
}

fn run_list(workspace: &Workspace) {
    println!("{}", "Registries:".bright_white());
    for registry in &workspace.registries {
        println!("  {} ({})", registry.name, registry.url);
    }
    println!("{}", "Components:".bright_white());
    for id in workspace.local_database.component_ids() {
        println!("  {}", id);
    }
}

fn run_build(cli: &Cli, workspace: &Workspace, action_command: &str) -> Result<i32, YakkaError> {
    let (components, features, mut commands) = parse_arguments(&cli.tokens);
    commands.insert(action_command.to_string());

    if components.is_empty() {
        error!("No components identified");
        eprintln!("{}", "No components identified".bright_red());
        return Ok(-1);
    }

    let project_name = cli
        .project_name
        .clone()
        .unwrap_or_else(|| generate_project_name(&components, &features));

    let outcome = evaluate_and_build(
        cli,
        workspace,
        &project_name,
        components.clone(),
        features.clone(),
        commands.clone(),
        cli.fetch,
    )?;
    let unknown = match outcome {
        BuildAttempt::Done(code) => return Ok(code),
        BuildAttempt::MissingComponents(unknown) => unknown,
    };

    // Unknown components may be fetchable from a registry; one retry after
    // fetching is enough since fetched trees are rescanned.
    for component in &unknown {
        match workspace.fetch_component(component) {
            Ok(path) => info!("Fetched {} into {}", component, path.display()),
            Err(e) => {
                eprintln!("{}", e.to_string().bright_red());
                return Ok(-1);
            }
        }
    }
    let mut refreshed = Workspace::init(&workspace.workspace_path)?;
    refreshed.refresh()?;
    match evaluate_and_build(
        cli,
        &refreshed,
        &project_name,
        components,
        features,
        commands,
        false,
    )? {
        BuildAttempt::Done(code) => Ok(code),
        BuildAttempt::MissingComponents(_) => Ok(-1),
    }
}

enum BuildAttempt {
    Done(i32),
    MissingComponents(Vec<String>),
}

fn evaluate_and_build(
    cli: &Cli,
    workspace: &Workspace,
    project_name: &str,
    components: Vec<String>,
    features: Vec<String>,
    commands: FxHashSet<String>,
    fetch_missing: bool,
) -> Result<BuildAttempt, YakkaError> {
    let mut project = Project::new(project_name, workspace);

    if cli.no_yakka {
        project.component_flags = DatabaseFlag::IgnoreYakka;
    }
    if cli.no_slcc {
        project.component_flags = DatabaseFlag::IgnoreAllSlc;
    } else {
        for feature in &cli.with {
            project.slc_required.insert(feature.clone());
        }
    }

    project.init(components, features, commands)?;

    if !cli.no_eval {
        let state = project.evaluate_dependencies();

        if state == ProjectState::HasUnknownComponents && fetch_missing {
            let unknown: Vec<String> = project.unknown_components.iter().cloned().collect();
            return Ok(BuildAttempt::MissingComponents(unknown));
        }

        if state != ProjectState::Valid {
            report_state(&project, state);
            if !cli.ignore_eval {
                return Ok(BuildAttempt::Done(-1));
            }
        }

        project.evaluate_choices();
        if !project.incomplete_choices.is_empty() || !project.multiple_answer_choices.is_empty() {
            for (component, choice) in &project.incomplete_choices {
                eprintln!(
                    "{} '{}' in '{}' has no answer",
                    "Choice".bright_red(),
                    choice,
                    component
                );
            }
            for choice in &project.multiple_answer_choices {
                eprintln!(
                    "{} '{}' has multiple answers",
                    "Choice".bright_red(),
                    choice
                );
            }
            if !cli.ignore_eval {
                return Ok(BuildAttempt::Done(-1));
            }
        }
    }

    project.generate_project_summary();
    if project.component_flags != DatabaseFlag::IgnoreAllSlc {
        project.process_slc_rules()?;
    }
    project.process_blueprints();

    let missing_data = project.update_project_data();
    if !missing_data.is_empty() {
        for path in &missing_data {
            eprintln!("{} {}", "Missing required data:".bright_red(), path);
        }
        if !cli.ignore_eval {
            return Ok(BuildAttempt::Done(-1));
        }
    }

    project.apply_project_data(cli.data.as_deref())?;

    if !cli.no_output {
        project.save_summary()?;
    }

    project.generate_target_database()?;
    if !cli.no_output {
        project.save_blueprints()?;
    }

    let mut engine = TaskEngine::new();
    engine.create_tasks(&project);
    info!("{} tasks to run", engine.task_count());

    let mut console_ui = ConsoleUi::default();
    let mut silent_ui = SilentUi;
    let ui: &mut dyn ProgressUi = if cli.no_output {
        &mut silent_ui
    } else {
        &mut console_ui
    };
    let outcome = engine.run(&project, ui)?;

    // Persist `save :/data/...` results for the next run's diffing.
    project.summary["data"] = outcome.data;
    if !cli.no_output {
        project.save_summary()?;
    }

    Ok(BuildAttempt::Done(if outcome.success { 0 } else { -1 }))
}

fn report_state(project: &Project, state: ProjectState) {
    match state {
        ProjectState::HasUnknownComponents => {
            for component in &project.unknown_components {
                eprintln!("{} {}", "Unknown component:".bright_red(), component);
            }
        }
        ProjectState::HasInvalidComponent => {
            eprintln!("{}", "Project has an invalid component".bright_red());
        }
        ProjectState::HasMultipleReplacements => {
            eprintln!("{}", "Project has multiple replacements".bright_red());
        }
        ProjectState::HasUnresolvedRequirements => {
            for feature in &project.unprovided_features {
                eprintln!("{} {}", "Unprovided feature:".bright_red(), feature);
            }
            for requirement in &project.slc_required {
                eprintln!("{} {}", "Unresolved requirement:".bright_red(), requirement);
            }
        }
        ProjectState::Valid => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_build_tokens() {
        let cli = Cli::parse_from(["yakka", "build!", "app", "+debug", "-p", "demo"]);
        assert_eq!(cli.action.as_deref(), Some("build!"));
        assert_eq!(cli.tokens, vec!["app", "+debug"]);
        assert_eq!(cli.project_name.as_deref(), Some("demo"));
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::parse_from([
            "yakka", "build!", "app", "-r", "-i", "--no-slcc", "-w", "bluetooth",
        ]);
        assert!(cli.refresh);
        assert!(cli.ignore_eval);
        assert!(cli.no_slcc);
        assert_eq!(cli.with, vec!["bluetooth"]);
    }
}
