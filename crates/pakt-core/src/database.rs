//! The package database the backend reads from.

use crate::error::Result;
use crate::package::Package;
use chrono::{DateTime, Utc};
use std::sync::RwLock;

/// A source of package snapshots: the system's record of installed and
/// available packages.
///
/// Implementations are blocking; the backend calls them from a blocking
/// context when it runs inside an async runtime.
pub trait PackageDatabase: Send + Sync {
    /// Identifier of the database (e.g., "expac", "alpm").
    fn source_id(&self) -> &str;

    /// Reads every known package. Pending marks are always `Keep`.
    fn load(&self) -> Result<Vec<Package>>;

    /// When the database last changed on disk, if known.
    fn last_modified(&self) -> Option<DateTime<Utc>>;
}

/// An in-memory database whose snapshot can be swapped at runtime.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    packages: RwLock<Vec<Package>>,
    modified: RwLock<Option<DateTime<Utc>>>,
}

impl MemoryDatabase {
    pub fn new(packages: Vec<Package>) -> Self {
        Self {
            packages: RwLock::new(packages),
            modified: RwLock::new(Some(Utc::now())),
        }
    }

    /// Replaces the snapshot and bumps the modification time.
    pub fn replace(&self, packages: Vec<Package>) {
        *self.packages.write().unwrap_or_else(|e| e.into_inner()) = packages;
        self.touch(Utc::now());
    }

    pub fn touch(&self, at: DateTime<Utc>) {
        *self.modified.write().unwrap_or_else(|e| e.into_inner()) = Some(at);
    }
}

impl PackageDatabase for MemoryDatabase {
    fn source_id(&self) -> &str {
        "memory"
    }

    fn load(&self) -> Result<Vec<Package>> {
        Ok(self.packages.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        *self.modified.read().unwrap_or_else(|e| e.into_inner())
    }
}
