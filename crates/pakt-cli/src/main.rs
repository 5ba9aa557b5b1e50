//! pakt - query and change pacman packages through the pakt backend.
//!
//! Usage:
//!   pakt search vim            # Search names and descriptions
//!   pakt show vim              # Show one package
//!   pakt install vim           # Install through the privileged worker
//!   pakt upgrade --dist        # Full system upgrade

mod session;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pakt_core::{
    Backend, BackendConfig, Package, PackageDatabase, PackageState, ProcessTransport, WorkerTransport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::session::{format_size, Job, Session};

#[derive(Parser)]
#[command(name = "pakt")]
#[command(about = "pacman package manager front end", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.config/pakt/pakt.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search package names and descriptions
    Search {
        /// Search terms, all of which must match
        #[arg(required = true)]
        terms: Vec<String>,
    },
    /// Show details of a package
    Show { name: String },
    /// Count packages, optionally only those in any of the given states
    Count {
        /// States such as installed, upgradeable, to-remove
        #[arg(long, value_delimiter = ',')]
        state: Vec<String>,
    },
    /// List packages
    List {
        #[arg(value_enum, default_value = "available")]
        which: ListKind,
    },
    /// List package groups
    Groups,
    /// List the members of a group
    Group { name: String },
    /// Install packages
    Install {
        #[arg(required = true)]
        packages: Vec<String>,

        /// Accept the default answer to every question
        #[arg(short, long)]
        yes: bool,
    },
    /// Remove packages
    Remove {
        #[arg(required = true)]
        packages: Vec<String>,

        /// Accept the default answer to every question
        #[arg(short, long)]
        yes: bool,
    },
    /// Upgrade installed packages
    Upgrade {
        /// Full system upgrade, also syncing the databases
        #[arg(long)]
        dist: bool,

        /// Accept the default answer to every question
        #[arg(short, long)]
        yes: bool,
    },
    /// Refresh the package databases
    Update,
    /// Rebuild the search index
    Index {
        /// Rebuild even when the index is current
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ListKind {
    Available,
    Upgradeable,
    Marked,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => BackendConfig::load(path)?,
        None => BackendConfig::load_default()?,
    };
    let backend = open_backend(config).await?;

    if !run_command(cli.command, backend).await? {
        std::process::exit(1);
    }
    Ok(())
}

async fn open_backend(config: BackendConfig) -> Result<Backend> {
    let transport: Arc<dyn WorkerTransport> = Arc::new(ProcessTransport::from_config(&config));
    tokio::task::spawn_blocking(move || {
        let database = open_database(&config)?;
        Backend::init(database, transport, config)
    })
    .await?
    .context("failed to open the package database")
}

#[cfg(feature = "libalpm")]
fn open_database(config: &BackendConfig) -> pakt_core::Result<Arc<dyn PackageDatabase>> {
    Ok(Arc::new(pakt_alpm::AlpmDatabase::new(config.database.clone())?))
}

#[cfg(not(feature = "libalpm"))]
fn open_database(config: &BackendConfig) -> pakt_core::Result<Arc<dyn PackageDatabase>> {
    Ok(Arc::new(pakt_alpm::ExpacDatabase::new(config.database.clone())))
}

/// Runs one subcommand; `false` means a worker job failed.
async fn run_command(command: Commands, backend: Backend) -> Result<bool> {
    match command {
        Commands::Search { terms } => {
            let results = backend.search(&terms.join(" "));
            if results.is_empty() {
                println!("No packages found");
            }
            for package in &results {
                print_summary(package);
            }
        }
        Commands::Show { name } => {
            let package = backend
                .package(&name)
                .ok_or_else(|| anyhow!("package '{}' was not found", name))?;
            print_details(&package);
        }
        Commands::Count { state } => {
            let states = parse_states(&state)?;
            let count = if states.is_empty() {
                backend.package_count()
            } else {
                backend.package_count_with(states)
            };
            println!("{}", count);
        }
        Commands::List { which } => {
            let packages = match which {
                ListKind::Available => backend.available_packages(),
                ListKind::Upgradeable => backend.upgradeable_packages(),
                ListKind::Marked => backend.marked_packages(),
            };
            for package in &packages {
                print_summary(package);
            }
        }
        Commands::Groups => {
            for group in backend.available_groups() {
                println!("{} ({})", group.name, group.len());
            }
        }
        Commands::Group { name } => {
            let group = backend
                .group(&name)
                .ok_or_else(|| anyhow!("group '{}' was not found", name))?;
            for member in &group.members {
                println!("{} {}", group.name, member);
            }
        }
        Commands::Install { packages, yes } => {
            for name in &packages {
                backend.mark_package_for_install(name)?;
            }
            return commit(backend, false, yes).await;
        }
        Commands::Remove { packages, yes } => {
            for name in &packages {
                backend.mark_package_for_removal(name)?;
            }
            return commit(backend, false, yes).await;
        }
        Commands::Upgrade { dist, yes } => {
            if dist {
                backend.mark_packages_for_dist_upgrade();
            } else {
                backend.mark_packages_for_upgrade();
            }
            return commit(backend, dist, yes).await;
        }
        Commands::Update => {
            return Session::new(backend, false).run(Job::UpdateCache).await;
        }
        Commands::Index { force } => {
            if !force && !backend.search_index_needs_update() {
                println!("Search index is up to date");
                return Ok(true);
            }
            let indexer = backend.clone();
            tokio::task::spawn_blocking(move || indexer.update_search_index()).await??;
            println!("Indexed {} packages", backend.package_count());
        }
    }
    Ok(true)
}

/// Prints the pending changes and hands them to the worker. A dist-upgrade
/// runs even with nothing marked, since it syncs the databases first.
async fn commit(backend: Backend, dist: bool, assume_yes: bool) -> Result<bool> {
    let marked = backend.marked_packages();
    if marked.is_empty() && !dist {
        println!("Nothing to do");
        return Ok(true);
    }

    for package in &marked {
        let state = package.state();
        let action = if state.contains(PackageState::TO_REMOVE) {
            "remove"
        } else if state.contains(PackageState::TO_UPGRADE) {
            "upgrade"
        } else {
            "install"
        };
        println!("{:8} {}", action, package.name);
    }

    info!("Committing {} changes", marked.len());
    Session::new(backend, assume_yes).run(Job::Commit).await
}

fn parse_states(names: &[String]) -> Result<PackageState> {
    names.iter().try_fold(PackageState::empty(), |states, name| {
        PackageState::from_name(&name.trim().to_uppercase().replace('-', "_"))
            .map(|state| states | state)
            .ok_or_else(|| anyhow!("unknown package state '{}'", name))
    })
}

fn print_summary(package: &Package) {
    let version = package
        .version()
        .map(|v| v.to_string())
        .unwrap_or_default();
    let installed = if package.is_upgradeable() {
        " [installed: upgradeable]"
    } else if package.is_installed() {
        " [installed]"
    } else {
        ""
    };
    println!("{}/{} {}{}", package.repository, package.name, version, installed);
    if !package.description.is_empty() {
        println!("    {}", package.description);
    }
}

fn print_details(package: &Package) {
    let show = |v: Option<String>| v.unwrap_or_else(|| "None".to_string());
    println!("{:<16}: {}", "Name", package.name);
    println!("{:<16}: {}", "Repository", package.repository);
    println!(
        "{:<16}: {}",
        "Installed",
        show(package.installed_version.as_ref().map(|v| v.to_string()))
    );
    println!(
        "{:<16}: {}",
        "Available",
        show(package.available_version.as_ref().map(|v| v.to_string()))
    );
    println!("{:<16}: {}", "Description", package.description);
    println!(
        "{:<16}: {}",
        "Groups",
        if package.groups.is_empty() {
            "None".to_string()
        } else {
            package.groups.join("  ")
        }
    );
    println!(
        "{:<16}: {}",
        "Install Reason",
        show(package.reason.as_ref().map(|r| format!("{:?}", r)))
    );
    println!("{:<16}: {}", "Download Size", format_size(package.download_size));
    println!("{:<16}: {}", "Installed Size", format_size(package.installed_size));
    let states: Vec<_> = package.state().iter_names().map(|(name, _)| name).collect();
    println!("{:<16}: {}", "State", states.join(" "));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_states() {
        let states = parse_states(&["installed".into(), "to-remove".into()]).unwrap();
        assert_eq!(states, PackageState::INSTALLED | PackageState::TO_REMOVE);
        assert!(parse_states(&[]).unwrap().is_empty());
        assert!(parse_states(&["sideways".into()]).is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["pakt", "count", "--state", "installed,upgradeable"]).unwrap();
        match cli.command {
            Commands::Count { state } => assert_eq!(state, vec!["installed", "upgradeable"]),
            _ => panic!("expected count"),
        }

        let cli = Cli::try_parse_from(["pakt", "upgrade", "--dist", "-y"]).unwrap();
        assert!(matches!(cli.command, Commands::Upgrade { dist: true, yes: true }));

        assert!(Cli::try_parse_from(["pakt", "install"]).is_err());
    }
}
