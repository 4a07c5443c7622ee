use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gm_agents::ClaudeBackend;
use gm_core::config::{load_config, ConfigError};
use gm_core::state::{DecisionAction, ProjectPhase};
use gm_core::types::DecisionId;
use gm_core::validation::{Validate, ValidationIssue, ValidationLevel};
use gmd::{EventHub, GeneralManager, PipelineError, SqliteStore, StoreError, CHANNEL_GM};

const DEFAULT_CONFIG_PATH: &str = "config/gm.toml";
const DEFAULT_SQLITE_PATH: &str = ".gm/state.sqlite";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AutoPolicy {
    Approve,
    Reject,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    config_path: PathBuf,
    sqlite_path: PathBuf,
    auto: AutoPolicy,
    project: String,
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("{0}")]
    Args(String),
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load config at {path}: {source}")]
    LoadConfig {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },
    #[error("{0}")]
    InvalidConfig(String),
    #[error("unknown project template: {name}")]
    UnknownProject { name: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

fn main() {
    match run() {
        Ok(completed) => {
            if !completed {
                std::process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("gmd failed: {err}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<bool, MainError> {
    let mut argv = env::args();
    let program = argv.next().unwrap_or_else(|| "gmd".to_string());
    let args = parse_cli_args(argv.collect::<Vec<_>>(), &program)?;

    ensure_parent_dir(&args.sqlite_path)?;

    let config = load_config(&args.config_path).map_err(|source| MainError::LoadConfig {
        path: args.config_path.clone(),
        source,
    })?;
    report_config_issues(&config.validate())?;

    let request = config
        .launch_request(&args.project)
        .ok_or_else(|| MainError::UnknownProject {
            name: args.project.clone(),
        })?;

    let store = Arc::new(SqliteStore::open(&args.sqlite_path)?);
    store.migrate()?;

    let hub = EventHub::new(config.hub.clone());
    hub.start_heartbeat();

    let manager = GeneralManager::new(
        config,
        Arc::clone(&store),
        hub.clone(),
        Arc::new(ClaudeBackend::default()),
    );

    let interrupted = manager.sweep_interrupted()?;
    if interrupted > 0 {
        eprintln!("marked {interrupted} interrupted projects as failed");
    }

    // Headless runs resolve approval gates with a fixed policy; the
    // interactive surfaces resolve them through the decision API instead.
    if args.auto != AutoPolicy::None {
        spawn_auto_resolver(&manager, &hub, args.auto);
    }

    let project_id = manager.launch_project(request)?;
    eprintln!(
        "project {} launched from template '{}'",
        project_id.0, args.project
    );

    let phase = loop {
        if let Some(phase) = manager.wait_for_terminal(&project_id, Duration::from_secs(3600)) {
            break phase;
        }
        eprintln!("project {} still running", project_id.0);
    };

    hub.stop_heartbeat();
    println!("{}", project_id.0);
    Ok(phase == ProjectPhase::Completed)
}

fn spawn_auto_resolver(manager: &GeneralManager, hub: &EventHub, policy: AutoPolicy) {
    let action = match policy {
        AutoPolicy::Approve => DecisionAction::Approve,
        AutoPolicy::Reject => DecisionAction::Reject,
        AutoPolicy::None => return,
    };
    let sub = hub.subscribe(CHANNEL_GM);
    let manager = manager.clone();
    thread::spawn(move || loop {
        let Some(event) = sub.recv_timeout(Duration::from_secs(1)) else {
            if sub.is_closed() {
                return;
            }
            continue;
        };
        if event["type"] == "decision_required" {
            if let Some(id) = event["decision_id"].as_str() {
                let decision_id = DecisionId::new(id.to_string());
                if let Err(err) = manager.resolve_decision(&decision_id, action) {
                    eprintln!("auto-resolve of {id} failed: {err}");
                }
            }
        }
    });
}

fn parse_cli_args(argv: Vec<String>, program: &str) -> Result<CliArgs, MainError> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut sqlite_path = PathBuf::from(DEFAULT_SQLITE_PATH);
    let mut auto = AutoPolicy::Approve;
    let mut project: Option<String> = None;

    let mut iter = argv.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                config_path = PathBuf::from(expect_value(&mut iter, "--config", program)?);
            }
            "--db" => {
                sqlite_path = PathBuf::from(expect_value(&mut iter, "--db", program)?);
            }
            "--auto" => {
                let value = expect_value(&mut iter, "--auto", program)?;
                auto = match value.as_str() {
                    "approve" => AutoPolicy::Approve,
                    "reject" => AutoPolicy::Reject,
                    "none" => AutoPolicy::None,
                    other => {
                        return Err(MainError::Args(format!(
                            "invalid --auto value '{other}' (expected approve, reject, or none)"
                        )))
                    }
                };
            }
            "launch" => {
                let name = expect_value(&mut iter, "launch", program)?;
                project = Some(name);
            }
            "--help" | "-h" => {
                return Err(MainError::Args(usage(program)));
            }
            other => {
                return Err(MainError::Args(format!(
                    "unknown argument '{other}'\n{}",
                    usage(program)
                )));
            }
        }
    }

    let project = project.ok_or_else(|| {
        MainError::Args(format!("missing launch command\n{}", usage(program)))
    })?;

    Ok(CliArgs {
        config_path,
        sqlite_path,
        auto,
        project,
    })
}

fn expect_value(
    iter: &mut impl Iterator<Item = String>,
    flag: &str,
    program: &str,
) -> Result<String, MainError> {
    iter.next()
        .ok_or_else(|| MainError::Args(format!("{flag} requires a value\n{}", usage(program))))
}

fn usage(program: &str) -> String {
    format!(
        "usage: {program} [--config PATH] [--db PATH] [--auto approve|reject|none] launch PROJECT"
    )
}

fn ensure_parent_dir(path: &Path) -> Result<(), MainError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| MainError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    Ok(())
}

fn report_config_issues(issues: &[ValidationIssue]) -> Result<(), MainError> {
    let mut errors = Vec::new();
    for issue in issues {
        match issue.level {
            ValidationLevel::Error => errors.push(format!("{}: {}", issue.code, issue.message)),
            ValidationLevel::Warning => {
                eprintln!("config warning {}: {}", issue.code, issue.message);
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(MainError::InvalidConfig(errors.join("; ")))
    }
}
