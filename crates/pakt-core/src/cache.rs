//! In-memory package cache with pending marks.

use crate::error::{Error, Result};
use crate::package::{Group, Mark, Package, PackageState};
use crate::protocol::ChangeSet;
use std::collections::BTreeMap;

/// A loaded database snapshot, sorted by name, plus the groups derived
/// from it and the marks made since it was loaded.
#[derive(Debug, Clone, Default)]
pub struct PackageCache {
    packages: BTreeMap<String, Package>,
    groups: BTreeMap<String, Group>,
    dist_upgrade: bool,
}

impl PackageCache {
    /// Builds the cache from a snapshot. Incoming marks are reset.
    pub fn new(snapshot: Vec<Package>) -> Self {
        let mut packages = BTreeMap::new();
        let mut groups: BTreeMap<String, Group> = BTreeMap::new();

        for mut package in snapshot {
            package.mark = Mark::Keep;
            if package.exists() {
                for group in &package.groups {
                    groups
                        .entry(group.clone())
                        .or_insert_with(|| Group {
                            name: group.clone(),
                            members: Vec::new(),
                        })
                        .members
                        .push(package.name.clone());
                }
            }
            packages.insert(package.name.clone(), package);
        }

        for group in groups.values_mut() {
            group.members.sort();
            group.members.dedup();
        }

        Self {
            packages,
            groups,
            dist_upgrade: false,
        }
    }

    pub fn package(&self, name: &str) -> Option<&Package> {
        self.packages.get(name).filter(|p| p.exists())
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Every package that still exists, sorted by name.
    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.values().filter(|p| p.exists())
    }

    /// Number of packages that still exist.
    pub fn len(&self) -> usize {
        self.packages().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of existing packages having any of `states`.
    pub fn count(&self, states: PackageState) -> usize {
        self.packages()
            .filter(|p| p.state().intersects(states))
            .count()
    }

    pub fn upgradeable(&self) -> impl Iterator<Item = &Package> {
        self.packages().filter(|p| p.is_upgradeable())
    }

    pub fn marked(&self) -> impl Iterator<Item = &Package> {
        self.packages().filter(|p| p.is_marked())
    }

    /// Whether a system upgrade was requested since the last reset.
    pub fn is_dist_upgrade(&self) -> bool {
        self.dist_upgrade
    }

    /// Marks a package for installation, or for upgrade when an installed
    /// version is outdated. Returns whether the mark changed.
    pub fn mark_install(&mut self, name: &str) -> Result<bool> {
        let package = self.existing_mut(name)?;
        let mark = if !package.is_installed() {
            Mark::Install
        } else if package.is_upgradeable() {
            Mark::Upgrade
        } else {
            Mark::Keep
        };
        Ok(set_mark(package, mark))
    }

    /// Marks an installed package for removal. A package that is not
    /// installed only loses a pending install.
    pub fn mark_remove(&mut self, name: &str) -> Result<bool> {
        let package = self.existing_mut(name)?;
        let mark = if package.is_installed() {
            Mark::Remove
        } else {
            Mark::Keep
        };
        Ok(set_mark(package, mark))
    }

    /// Drops any pending change of a package.
    pub fn mark_keep(&mut self, name: &str) -> Result<bool> {
        let package = self.existing_mut(name)?;
        Ok(set_mark(package, Mark::Keep))
    }

    /// Marks every upgradeable package for upgrade. With `dist` the worker
    /// is also allowed to install new packages the upgrade pulls in;
    /// without it a previously requested dist-upgrade is withdrawn.
    /// Returns the number of packages whose mark changed.
    pub fn mark_all_upgrades(&mut self, dist: bool) -> usize {
        self.dist_upgrade = dist;
        self.packages
            .values_mut()
            .filter(|p| p.exists() && p.is_upgradeable())
            .map(|p| set_mark(p, Mark::Upgrade))
            .filter(|changed| *changed)
            .count()
    }

    pub fn clear_marks(&mut self) {
        for package in self.packages.values_mut() {
            package.mark = Mark::Keep;
        }
        self.dist_upgrade = false;
    }

    /// The pending changes in the form the worker expects.
    pub fn change_set(&self) -> ChangeSet {
        let mut changes = ChangeSet {
            dist_upgrade: self.dist_upgrade,
            ..Default::default()
        };
        for package in self.marked() {
            let list = match package.mark {
                Mark::Install => &mut changes.install,
                Mark::Upgrade => &mut changes.upgrade,
                Mark::Remove => &mut changes.remove,
                Mark::Keep => continue,
            };
            list.push(package.name.clone());
        }
        changes
    }

    fn existing_mut(&mut self, name: &str) -> Result<&mut Package> {
        self.packages
            .get_mut(name)
            .filter(|p| p.exists())
            .ok_or_else(|| Error::PackageNotFound(name.to_string()))
    }
}

fn set_mark(package: &mut Package, mark: Mark) -> bool {
    let changed = package.mark != mark;
    package.mark = mark;
    changed
}
