use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tracing::{debug, trace};

use strata_core::drift::DriftOptions;
use strata_core::migrate::{self, MigrateOptions};
use strata_core::{CoreError, CoreResult, WorkspaceManager, ops};
use strata_state::{BackendConfig, RetentionPolicy};

mod render;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Terraform state lifecycle and drift manager", long_about = None)]
struct Cli {
    /// Directory holding the registry, settings and audit log
    #[arg(long, global = true, env = "STRATA_ROOT", default_value = strata_core::config::DEFAULT_ROOT)]
    root: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a backend and make it the default for new workspaces
    ConfigureBackend {
        /// Backend provider: local, s3 or remote
        provider: String,

        /// Directory, bucket[/prefix] or base URL
        location: String,

        /// Region of the S3 bucket
        #[arg(long)]
        region: Option<String>,

        /// Additional backend parameter (e.g. profile=ops, auto_create=true)
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Create a workspace on the default backend
    CreateWorkspace {
        name: String,
    },
    /// Make a workspace current
    SwitchWorkspace {
        name: String,
    },
    /// Delete a workspace, keeping its state as a backup
    DeleteWorkspace {
        name: String,

        /// Delete even if it still manages resources
        #[arg(long)]
        force: bool,
    },
    /// List workspaces
    ListWorkspaces,
    /// Select an environment workspace, creating it if needed
    UseEnvironment {
        name: String,
    },
    /// Move the current workspace's state to another backend
    Migrate {
        /// Target backend: local:<dir>, s3://bucket/prefix?region=<r> or https://host/path
        target: String,

        /// Replace state of another lineage on the target
        #[arg(long)]
        overwrite: bool,
    },
    /// Compare the current state with a live snapshot
    DetectDrift {
        /// Snapshot: terraform state pull, terraform show -json or a strata state file
        path: PathBuf,

        /// Also list resources that did not change
        #[arg(long)]
        include_unchanged: bool,

        /// Save the report under <root>/reports
        #[arg(long)]
        save_report: bool,
    },
    /// Prune old state backups
    Cleanup {
        /// Local state directory to prune instead of the current workspace's backend
        path: Option<PathBuf>,

        /// Remove backups older than this (e.g. 14days)
        #[arg(long, value_parser = parse_duration)]
        max_age: Option<Duration>,

        /// Keep at most this many backups
        #[arg(long)]
        max_count: Option<usize>,

        /// Always keep this many of the newest backups
        #[arg(long)]
        keep_latest: Option<usize>,

        /// Report what would be removed without removing it
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the current workspace's state
    Show,
    /// Replace the current workspace's state with a state or snapshot file
    Push {
        path: PathBuf,

        /// Replace state of another lineage
        #[arg(long)]
        force: bool,
    },
    /// Take a backup of the current workspace's state now
    Backup {
        /// Also write the state document to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List backups of the current workspace
    Backups,
    /// Roll the current workspace back to a backup
    Restore {
        backup_id: String,

        /// Restore a backup of another lineage
        #[arg(long)]
        force: bool,
    },
    /// Remove a lock left behind by an interrupted operation
    ForceUnlock {
        lock_id: String,
    },
    /// Generate shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2)
        .with_line_number(cli.verbose >= 3)
        .init();

    debug!("strata started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let out = Output { json: cli.json };
    if let Err(e) = run(cli, &out).await {
        out.error(&e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli, out: &Output) -> CoreResult<()> {
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "strata", &mut std::io::stdout());
        return Ok(());
    }

    let mut manager = WorkspaceManager::open(&cli.root)?;
    match cli.command {
        Commands::ConfigureBackend {
            provider,
            location,
            region,
            params,
        } => {
            let mut config = BackendConfig::from_provider(&provider, &location, region.as_deref())?;
            config.location_params.extend(params);
            let configured = manager.configure_backend(config).await?;
            out.emit(&configured, |c| {
                println!("{} {}", "Configured backend".green().bold(), c.backend);
                if let Some(name) = &c.created_workspace {
                    println!("Created workspace {} and made it current", name.cyan().bold());
                }
            })
        }
        Commands::CreateWorkspace { name } => {
            let created = manager.create(&name).await?;
            out.emit(&created, |w| {
                println!("{} {} on {}", "Created workspace".green().bold(), w.name.cyan().bold(), w.backend);
            })
        }
        Commands::SwitchWorkspace { name } => {
            manager.switch_to(&name)?;
            out.emit(&serde_json::json!({ "current": name }), |_| {
                println!("Switched to workspace {}", name.cyan().bold());
            })
        }
        Commands::DeleteWorkspace { name, force } => {
            let deleted = manager.delete(&name, force).await?;
            out.emit(&deleted, render::workspace_deleted)
        }
        Commands::ListWorkspaces => {
            let workspaces = manager.list();
            out.emit(&workspaces, |w| render::workspaces(w))
        }
        Commands::UseEnvironment { name } => {
            let selected = manager.use_environment(&name).await?;
            out.emit(&selected, |s| {
                if s.created {
                    println!("{} {}", "Created workspace".green().bold(), s.name.cyan().bold());
                }
                println!("Using environment {}", s.name.cyan().bold());
            })
        }
        Commands::Migrate { target, overwrite } => {
            let target = BackendConfig::from_spec(&target)?;
            let outcome = migrate::migrate(&mut manager, target, &MigrateOptions { overwrite }).await?;
            out.emit(&outcome, render::migration)
        }
        Commands::DetectDrift {
            path,
            include_unchanged,
            save_report,
        } => {
            let options = DriftOptions { include_unchanged };
            let outcome = ops::detect_drift(&manager, &path, &options, save_report).await?;
            out.emit(&outcome, render::drift)
        }
        Commands::Cleanup {
            path,
            max_age,
            max_count,
            keep_latest,
            dry_run,
        } => {
            let policy = retention_policy(manager.settings().retention, max_age, max_count, keep_latest);
            let outcomes = ops::cleanup(&manager, path.as_deref(), &policy, dry_run).await?;
            out.emit(&outcomes, |o| render::pruned(o))
        }
        Commands::Show => {
            let state = ops::show(&manager).await?;
            let lock = ops::lock_status(&manager).await?;
            let migrated = ops::migration_status(&manager).await?;
            let workspace = manager.current()?;
            if out.json {
                out.emit(&state, |_| {})
            } else {
                render::state(workspace, &state, lock.as_ref(), migrated.as_ref());
                Ok(())
            }
        }
        Commands::Push { path, force } => {
            let pushed = ops::push(&manager, &path, force).await?;
            out.emit(&pushed, |p| {
                println!(
                    "{} {} ({}): version {}, serial {}, {} resource(s)",
                    "Pushed".green().bold(),
                    path.display(),
                    p.artifact,
                    p.state.version,
                    p.state.serial,
                    p.state.resources
                );
                if p.state.lineage_changed {
                    println!("{} lineage is now {}", "Note:".yellow().bold(), p.state.lineage);
                }
            })
        }
        Commands::Backup { output } => {
            let created = ops::backup(&manager, output.as_deref()).await?;
            out.emit(&created, render::backup_created)
        }
        Commands::Backups => {
            let backups = ops::backups(&manager).await?;
            out.emit(&backups, |b| render::backups(b))
        }
        Commands::Restore { backup_id, force } => {
            let restored = ops::restore(&manager, &backup_id, force).await?;
            out.emit(&restored, |r| {
                println!(
                    "{} {} to backup {}: version {}, serial {}",
                    "Restored".green().bold(),
                    r.workspace.cyan().bold(),
                    backup_id,
                    r.version,
                    r.serial
                );
            })
        }
        Commands::ForceUnlock { lock_id } => {
            let workspace = ops::force_unlock(&manager, &lock_id).await?;
            out.emit(&serde_json::json!({ "workspace": workspace, "lock_id": lock_id }), |_| {
                println!("{} {} on {}", "Released lock".yellow().bold(), lock_id, workspace.cyan().bold());
            })
        }
        Commands::Completions { .. } => Ok(()),
    }
}

/// Settings' retention policy with command-line overrides applied
fn retention_policy(
    base: RetentionPolicy,
    max_age: Option<Duration>,
    max_count: Option<usize>,
    keep_latest: Option<usize>,
) -> RetentionPolicy {
    RetentionPolicy {
        max_age: max_age.or(base.max_age),
        max_count: max_count.or(base.max_count),
        keep_latest: keep_latest.unwrap_or(base.keep_latest),
    }
}

/// Where results go: JSON on stdout, or human-readable text
struct Output {
    json: bool,
}

impl Output {
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T)) -> CoreResult<()> {
        if self.json {
            let text = serde_json::to_string_pretty(value)
                .map_err(|e| CoreError::Serialization(e.to_string()))?;
            println!("{}", text);
        } else {
            human(value);
        }
        Ok(())
    }

    fn error(&self, error: &CoreError) {
        if self.json {
            let body = serde_json::json!({
                "error": error.to_string(),
                "exit_code": error.exit_code(),
                "remedy": error.remedy(),
            });
            println!("{}", body);
            return;
        }
        eprintln!("{} {}", "Error:".red().bold(), error);
        if let Some(remedy) = error.remedy() {
            eprintln!("{} {}", "Hint:".yellow().bold(), remedy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["strata", "--json", "delete-workspace", "old", "--force"]).unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::DeleteWorkspace { ref name, force: true } if name == "old"
        ));

        let cli = Cli::try_parse_from([
            "strata",
            "configure-backend",
            "s3",
            "tf-state/core",
            "--region",
            "eu-west-1",
            "--param",
            "auto_create=true",
        ])
        .unwrap();
        match cli.command {
            Commands::ConfigureBackend { provider, params, region, .. } => {
                assert_eq!(provider, "s3");
                assert_eq!(region.as_deref(), Some("eu-west-1"));
                assert_eq!(params, vec![("auto_create".to_string(), "true".to_string())]);
            }
            _ => panic!("expected configure-backend"),
        }
    }

    #[test]
    fn test_cleanup_flags() {
        let cli = Cli::try_parse_from(["strata", "cleanup", "--max-age", "14days", "--dry-run"]).unwrap();
        match cli.command {
            Commands::Cleanup { path, max_age, dry_run, .. } => {
                assert!(path.is_none());
                assert_eq!(max_age, Some(Duration::from_secs(14 * 24 * 60 * 60)));
                assert!(dry_run);
            }
            _ => panic!("expected cleanup"),
        }
        assert!(Cli::try_parse_from(["strata", "cleanup", "--max-age", "soon"]).is_err());
    }

    #[test]
    fn test_backup_output_flag() {
        let cli = Cli::try_parse_from(["strata", "backup", "--output", "snap.json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Backup { output: Some(ref path) } if path == &PathBuf::from("snap.json")
        ));
        let cli = Cli::try_parse_from(["strata", "backup"]).unwrap();
        assert!(matches!(cli.command, Commands::Backup { output: None }));
    }

    #[test]
    fn test_retention_overrides() {
        let base = RetentionPolicy::default();
        let policy = retention_policy(base, None, Some(5), None);
        assert_eq!(policy.max_count, Some(5));
        assert_eq!(policy.max_age, base.max_age);
        assert_eq!(policy.keep_latest, base.keep_latest);
    }
}
