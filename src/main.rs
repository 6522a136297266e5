//! Bosun CLI - file-based task broker for fleets of AI coding agents.

use bosun::cli::{AgentCommands, Cli, Commands, LockCommands, TaskCommands};
use bosun::commands::{self, Envelope, Render};
use bosun::config::find_project_root;
use clap::Parser;
use std::env;
use std::path::{Path, PathBuf};
use std::process;

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;

    let project_root = resolve_project_root(cli.project_path, human);

    if let Err(e) = run_command(cli.command, &project_root, human) {
        report_failure(&e.to_string(), human);
        process::exit(1);
    }
}

/// Resolve the project root: explicit flag or AGENT_PROJECT_PATH first,
/// otherwise walk up from the current directory looking for a marker.
fn resolve_project_root(explicit_path: Option<PathBuf>, human: bool) -> PathBuf {
    match explicit_path {
        Some(path) => {
            if !path.exists() {
                report_failure(
                    &format!("project path does not exist: {}", path.display()),
                    human,
                );
                process::exit(1);
            }
            path
        }
        None => {
            let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            find_project_root(&cwd)
        }
    }
}

fn run_command(
    command: Option<Commands>,
    project_root: &Path,
    human: bool,
) -> Result<(), bosun::Error> {
    match command {
        Some(Commands::Init) => output(&commands::init(project_root)?, human),
        Some(Commands::Status) => output(&commands::status(project_root)?, human),
        Some(Commands::Watch { ticks }) => commands::watch(project_root, ticks, human)?,
        Some(Commands::Task { command }) => match command {
            TaskCommands::Create {
                title,
                description,
                priority,
                files,
                depends_on,
                tags,
                max_attempts,
            } => output(
                &commands::task_create(
                    project_root,
                    &title,
                    description,
                    &priority,
                    files,
                    depends_on,
                    tags,
                    max_attempts,
                )?,
                human,
            ),
            TaskCommands::List { status } => {
                output(&commands::task_list(project_root, status.as_deref())?, human)
            }
            TaskCommands::Show { id } => output(&commands::task_show(project_root, &id)?, human),
            TaskCommands::Cancel { id } => {
                output(&commands::task_cancel(project_root, &id)?, human)
            }
        },
        Some(Commands::Agent { command }) => match command {
            AgentCommands::List => output(&commands::agent_list(project_root)?, human),
        },
        Some(Commands::Lock { command }) => match command {
            LockCommands::List => output(&commands::lock_list(project_root)?, human),
            LockCommands::Release { path } => {
                output(&commands::lock_release(project_root, &path)?, human)
            }
        },
        Some(Commands::Clean { max_age_ms }) => {
            output(&commands::clean(project_root, max_age_ms)?, human)
        }
        None => {
            // No subcommand: show status when initialized, a hint otherwise.
            match commands::status(project_root) {
                Ok(summary) => output(&summary, human),
                Err(bosun::Error::NotInitialized) => {
                    println!("No coordinator here yet. Run `bosun init` to create one.");
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

/// Print a command result in the selected format.
fn output<T: Render>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}

/// Print a failure to stderr, enveloped as JSON unless `--human` is set.
fn report_failure(msg: &str, human: bool) {
    if human {
        eprintln!("Error: {}", msg);
    } else {
        eprintln!(
            "{}",
            serde_json::to_string(&Envelope::failure(msg)).unwrap_or_else(|_| msg.to_string())
        );
    }
}
