//! Package database read through libalpm.

use alpm::{Alpm, PackageReason, SigLevel};
use chrono::{DateTime, Utc};
use pakt_core::{
    error::{Error, Result},
    DatabaseConfig, InstallReason, Package, PackageDatabase,
};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::expac::database_mtime;
use crate::repos::pacman_repos;

/// The pacman/libalpm database.
pub struct AlpmDatabase {
    config: DatabaseConfig,
    repos: Vec<String>,
}

impl AlpmDatabase {
    /// Creates the database, reading the repository list from pacman.conf.
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        // Verify the database path exists.
        if !Path::new(&config.dbpath).exists() {
            return Err(Error::DatabaseError(format!(
                "Database path does not exist: {}",
                config.dbpath
            )));
        }

        let repos = pacman_repos(Path::new(&config.pacman_conf));
        Ok(Self { config, repos })
    }

    /// Creates an ALPM handle with every configured sync database
    /// registered (must be called from blocking context).
    fn create_handle(&self) -> Result<Alpm> {
        let mut handle = Alpm::new(self.config.root.clone(), self.config.dbpath.clone())
            .map_err(|e| Error::DatabaseError(format!("Failed to initialize ALPM: {}", e)))?;

        let siglevel = SigLevel::PACKAGE_OPTIONAL | SigLevel::DATABASE_OPTIONAL;
        for repo in &self.repos {
            if let Err(e) = handle.register_syncdb_mut(repo.as_str(), siglevel) {
                warn!("Failed to register {}: {}", repo, e);
            } else {
                debug!("Registered sync database: {}", repo);
            }
        }

        Ok(handle)
    }
}

impl PackageDatabase for AlpmDatabase {
    fn source_id(&self) -> &str {
        "alpm"
    }

    fn load(&self) -> Result<Vec<Package>> {
        let handle = self.create_handle()?;
        let mut packages: BTreeMap<String, Package> = BTreeMap::new();

        // Sync databases are registered in priority order, first one wins.
        for db in handle.syncdbs() {
            for pkg in db.pkgs() {
                if packages.contains_key(pkg.name()) {
                    continue;
                }
                let package = Package::new(pkg.name(), pkg.desc().unwrap_or_default())
                    .with_available(pkg.version().as_str(), db.name())
                    .with_groups(pkg.groups().iter())
                    .with_sizes(pkg.download_size() as u64, pkg.isize() as u64);
                packages.insert(package.name.clone(), package);
            }
        }

        for pkg in handle.localdb().pkgs() {
            let reason = match pkg.reason() {
                PackageReason::Explicit => InstallReason::Explicit,
                PackageReason::Depend => InstallReason::Dependency,
            };
            let version = pkg.version().as_str();

            match packages.get_mut(pkg.name()) {
                Some(package) => {
                    let installed = Package::new(pkg.name(), "").with_installed(version, reason);
                    package.installed_version = installed.installed_version;
                    package.reason = installed.reason;
                    package.installed_size = pkg.isize() as u64;
                }
                None => {
                    let package = Package::new(pkg.name(), pkg.desc().unwrap_or_default())
                        .with_installed(version, reason)
                        .with_groups(pkg.groups().iter())
                        .with_sizes(0, pkg.isize() as u64);
                    packages.insert(package.name.clone(), package);
                }
            }
        }

        info!("libalpm reported {} packages", packages.len());
        Ok(packages.into_values().collect())
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        database_mtime(Path::new(&self.config.dbpath))
    }
}
