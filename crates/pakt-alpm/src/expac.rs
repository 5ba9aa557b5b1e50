//! Package database read through `expac`.
//!
//! expac prints one line per package with the fields we ask for, which
//! keeps libalpm out of the process.

use chrono::{DateTime, Utc};
use pakt_core::{
    error::{Error, Result},
    DatabaseConfig, InstallReason, Package, PackageDatabase,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info, warn};

use crate::repos::pacman_repos;

/// repo, name, version, download size, installed size, groups, description
const SYNC_FORMAT: &str = "%r\t%n\t%v\t%k\t%m\t%G\t%d";
/// name, version, install reason, installed size, groups, description
const LOCAL_FORMAT: &str = "%n\t%v\t%w\t%m\t%G\t%d";
const LIST_DELIM: &str = ",";

/// Reads the pacman databases by running expac.
#[derive(Debug, Clone)]
pub struct ExpacDatabase {
    config: DatabaseConfig,
    program: String,
}

impl ExpacDatabase {
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            program: "expac".to_string(),
        }
    }

    /// Uses a different expac binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn run(&self, query: &str, format: &str) -> Result<String> {
        let output = Command::new(&self.program)
            .args(["--config", &self.config.pacman_conf, query, "-l", LIST_DELIM, format])
            .env("LC_ALL", "C")
            .output()
            .map_err(|e| Error::DatabaseError(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(Error::DatabaseError(format!(
                "{} {} failed: {}",
                self.program,
                query,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl PackageDatabase for ExpacDatabase {
    fn source_id(&self) -> &str {
        "expac"
    }

    fn load(&self) -> Result<Vec<Package>> {
        let repos = pacman_repos(Path::new(&self.config.pacman_conf));
        let sync = self.run("-S", SYNC_FORMAT)?;
        let local = self.run("-Q", LOCAL_FORMAT)?;
        let packages = merge(&sync, &local, &repos);
        info!("expac reported {} packages", packages.len());
        Ok(packages)
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        database_mtime(Path::new(&self.config.dbpath))
    }
}

/// Combines expac sync and local output into one package per name.
/// A package offered by several repositories takes the version of the
/// highest-priority one.
pub fn merge(sync: &str, local: &str, repos: &[String]) -> Vec<Package> {
    let priority = |repo: &str| repos.iter().position(|r| r == repo).unwrap_or(usize::MAX);
    let mut packages: BTreeMap<String, Package> = BTreeMap::new();

    for line in sync.lines() {
        let Some(package) = parse_sync_line(line) else {
            if !line.trim().is_empty() {
                debug!("Skipping sync line: {}", line);
            }
            continue;
        };
        match packages.get(&package.name) {
            Some(existing) if priority(&existing.repository) <= priority(&package.repository) => {}
            _ => {
                packages.insert(package.name.clone(), package);
            }
        }
    }

    for line in local.lines() {
        let Some(installed) = parse_local_line(line) else {
            if !line.trim().is_empty() {
                debug!("Skipping local line: {}", line);
            }
            continue;
        };
        match packages.get_mut(&installed.name) {
            Some(package) => {
                package.installed_version = installed.installed_version;
                package.reason = installed.reason;
                package.installed_size = installed.installed_size;
            }
            None => {
                packages.insert(installed.name.clone(), installed);
            }
        }
    }

    packages.into_values().collect()
}

fn parse_sync_line(line: &str) -> Option<Package> {
    let mut fields = line.splitn(7, '\t');
    let repo = fields.next()?;
    let name = fields.next()?;
    let version = fields.next()?;
    let download_size = parse_size(fields.next()?);
    let installed_size = parse_size(fields.next()?);
    let groups = parse_list(fields.next()?);
    let description = fields.next().unwrap_or_default();
    if repo.is_empty() || name.is_empty() || version.is_empty() {
        return None;
    }

    Some(
        Package::new(name, description)
            .with_available(version, repo)
            .with_groups(groups)
            .with_sizes(download_size, installed_size),
    )
}

fn parse_local_line(line: &str) -> Option<Package> {
    let mut fields = line.splitn(6, '\t');
    let name = fields.next()?;
    let version = fields.next()?;
    let reason = match fields.next()? {
        "dependency" => InstallReason::Dependency,
        _ => InstallReason::Explicit,
    };
    let installed_size = parse_size(fields.next()?);
    let groups = parse_list(fields.next()?);
    let description = fields.next().unwrap_or_default();
    if name.is_empty() || version.is_empty() {
        return None;
    }

    Some(
        Package::new(name, description)
            .with_installed(version, reason)
            .with_groups(groups)
            .with_sizes(0, installed_size),
    )
}

fn parse_size(field: &str) -> u64 {
    field.trim().parse().unwrap_or(0)
}

fn parse_list(field: &str) -> Vec<String> {
    field
        .split(LIST_DELIM)
        .map(str::trim)
        .filter(|item| !item.is_empty() && *item != "None")
        .map(str::to_string)
        .collect()
}

/// Newest modification time of the local database and the sync
/// databases below `dbpath`.
pub fn database_mtime(dbpath: &Path) -> Option<DateTime<Utc>> {
    let mut candidates = vec![dbpath.join("local")];
    match std::fs::read_dir(dbpath.join("sync")) {
        Ok(entries) => candidates.extend(
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "db")),
        ),
        Err(e) => warn!("Failed to list sync databases: {}", e),
    }

    candidates
        .iter()
        .filter_map(|path| std::fs::metadata(path).and_then(|m| m.modified()).ok())
        .max()
        .map(DateTime::<Utc>::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYNC: &str = "core\tbash\t5.2.026-2\t1800000\t9000000\tNone\tThe GNU Bourne Again shell
core\tlinux\t6.9.2-1\t140000000\t130000000\t\tThe Linux kernel and modules
extra\tvim\t9.1.0-1\t2000000\t4000000\teditors\tVi Improved, a highly configurable text editor
extra-testing\tvim\t9.1.1-1\t2000000\t4000000\teditors\tVi Improved, a highly configurable text editor
extra\tgcc\t14.1.1-1\t50000000\t200000000\tbase-devel,toolchain\tThe GNU Compiler Collection - C and C++ frontends
";

    const LOCAL: &str = "bash\t5.2.026-2\texplicit\t9000000\t\tThe GNU Bourne Again shell
linux\t6.9.1-1\texplicit\t130000000\t\tThe Linux kernel and modules
yay\t12.3.5-1\texplicit\t8000000\t\tYet another yogurt. Pacman wrapper and AUR helper written in go.
zlib\t1:1.3.1-1\tdependency\t300000\t\tCompression library
garbage line
";

    fn repos() -> Vec<String> {
        vec!["core".into(), "extra".into(), "extra-testing".into()]
    }

    #[test]
    fn test_merge_sync_and_local() {
        let packages = merge(SYNC, LOCAL, &repos());
        let names: Vec<_> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["bash", "gcc", "linux", "vim", "yay", "zlib"]);

        let linux = &packages[2];
        assert!(linux.is_upgradeable());
        assert_eq!(linux.repository, "core");
        assert_eq!(linux.download_size, 140_000_000);

        let yay = &packages[4];
        assert!(yay.is_foreign());
        assert_eq!(yay.repository, "local");

        assert_eq!(packages[5].reason, Some(InstallReason::Dependency));
        assert_eq!(packages[5].installed_version.as_ref().unwrap().epoch, Some(1));
    }

    #[test]
    fn test_repository_priority() {
        let packages = merge(SYNC, "", &repos());
        let vim = packages.iter().find(|p| p.name == "vim").unwrap();
        assert_eq!(vim.repository, "extra");
        assert_eq!(vim.available_version.as_ref().unwrap().full, "9.1.0-1");

        // Without a repository list the first line wins.
        let packages = merge(SYNC, "", &[]);
        let vim = packages.iter().find(|p| p.name == "vim").unwrap();
        assert_eq!(vim.repository, "extra");
    }

    #[test]
    fn test_group_lists() {
        let packages = merge(SYNC, "", &repos());
        let gcc = packages.iter().find(|p| p.name == "gcc").unwrap();
        assert_eq!(gcc.groups, vec!["base-devel", "toolchain"]);
        let bash = packages.iter().find(|p| p.name == "bash").unwrap();
        assert!(bash.groups.is_empty());
    }

    #[test]
    fn test_database_mtime() {
        let dir = tempfile::tempdir().unwrap();
        assert!(database_mtime(dir.path()).is_none());

        std::fs::create_dir(dir.path().join("local")).unwrap();
        std::fs::create_dir(dir.path().join("sync")).unwrap();
        std::fs::write(dir.path().join("sync").join("core.db"), b"").unwrap();
        std::fs::write(dir.path().join("sync").join("core.files"), b"").unwrap();
        assert!(database_mtime(dir.path()).is_some());
    }

    #[test]
    fn test_missing_expac_is_database_error() {
        let db = ExpacDatabase::new(DatabaseConfig::default()).with_program("/nonexistent/expac");
        assert!(matches!(db.load(), Err(Error::DatabaseError(_))));
    }
}
