//! Package, group and version types.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Represents a package version with comparison support.
///
/// Equality follows the version ordering, so `1:2.0-1` equals `01:2.0-1`
/// and a missing epoch equals `0:`. Compare `full` for the raw text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    /// The full version string (e.g., "1.2.3-1").
    pub full: String,
    /// Epoch (if any).
    pub epoch: Option<u32>,
    /// Package version (upstream).
    pub pkgver: String,
    /// Package release number.
    pub pkgrel: String,
}

impl Version {
    /// Creates a new Version from a version string.
    pub fn new(version_str: &str) -> Self {
        let (epoch, rest) = match version_str.split_once(':') {
            Some((epoch, rest)) => (epoch.parse().ok(), rest),
            None => (None, version_str),
        };

        let (pkgver, pkgrel) = match rest.rsplit_once('-') {
            Some((pkgver, pkgrel)) => (pkgver.to_string(), pkgrel.to_string()),
            None => (rest.to_string(), String::new()),
        };

        Self {
            full: version_str.to_string(),
            epoch,
            pkgver,
            pkgrel,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        // A missing epoch counts as 0.
        match self.epoch.unwrap_or(0).cmp(&other.epoch.unwrap_or(0)) {
            Ordering::Equal => {}
            ord => return ord,
        }

        match vercmp(&self.pkgver, &other.pkgver) {
            Ordering::Equal => {}
            ord => return ord,
        }

        vercmp(&self.pkgrel, &other.pkgrel)
    }
}

/// Segment-wise version comparison (numeric runs against numeric runs,
/// alphabetic runs against alphabetic runs).
pub fn vercmp(a: &str, b: &str) -> Ordering {
    let mut a_chars = a.chars().peekable();
    let mut b_chars = b.chars().peekable();

    loop {
        while a_chars.peek().is_some_and(|c| !c.is_alphanumeric()) {
            a_chars.next();
        }
        while b_chars.peek().is_some_and(|c| !c.is_alphanumeric()) {
            b_chars.next();
        }

        let (ac, bc) = match (a_chars.peek().copied(), b_chars.peek().copied()) {
            (None, None) => return Ordering::Equal,
            // A trailing letter segment marks a pre-release: 1.0rc1 < 1.0 < 1.0.1.
            (None, Some(bc)) if bc.is_alphabetic() => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(ac), None) if ac.is_alphabetic() => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ac), Some(bc)) => (ac, bc),
        };

        match (ac.is_ascii_digit(), bc.is_ascii_digit()) {
            (true, true) => {
                let a_num = take_run(&mut a_chars, |c| c.is_ascii_digit());
                let b_num = take_run(&mut b_chars, |c| c.is_ascii_digit());
                let a_num = a_num.trim_start_matches('0');
                let b_num = b_num.trim_start_matches('0');

                // Longer numeric run is greater, otherwise lexicographic.
                match a_num.len().cmp(&b_num.len()).then_with(|| a_num.cmp(b_num)) {
                    Ordering::Equal => continue,
                    ord => return ord,
                }
            }
            (false, false) => {
                let a_alpha = take_run(&mut a_chars, |c| c.is_alphabetic());
                let b_alpha = take_run(&mut b_chars, |c| c.is_alphabetic());

                match a_alpha.cmp(&b_alpha) {
                    Ordering::Equal => continue,
                    ord => return ord,
                }
            }
            // Numbers > letters
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
        }
    }
}

fn take_run<I>(chars: &mut std::iter::Peekable<I>, pred: impl Fn(char) -> bool) -> String
where
    I: Iterator<Item = char>,
{
    let mut run = String::new();
    while let Some(&c) = chars.peek() {
        if !pred(c) {
            break;
        }
        run.push(c);
        chars.next();
    }
    run
}

/// Why a package was installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstallReason {
    /// Explicitly installed by user.
    Explicit,
    /// Installed as a dependency.
    Dependency,
}

/// A pending, not yet committed change to a package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mark {
    /// No change.
    #[default]
    Keep,
    /// Install a package that is not installed.
    Install,
    /// Upgrade an installed package to the available version.
    Upgrade,
    /// Remove an installed package.
    Remove,
}

bitflags! {
    /// State flags of a package, used to filter counts and listings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PackageState: u32 {
        const INSTALLED = 1 << 0;
        const NOT_INSTALLED = 1 << 1;
        const UPGRADEABLE = 1 << 2;
        const TO_KEEP = 1 << 3;
        const TO_INSTALL = 1 << 4;
        const NEW_INSTALL = 1 << 5;
        const TO_UPGRADE = 1 << 6;
        const TO_REMOVE = 1 << 7;
        const IS_AUTO = 1 << 8;
        const IS_FOREIGN = 1 << 9;
    }
}

/// A package as seen by the backend: what is installed, what the
/// repositories offer, and any pending change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Package name.
    pub name: String,
    /// Installed version, if installed.
    pub installed_version: Option<Version>,
    /// Version offered by the first repository carrying the package.
    pub available_version: Option<Version>,
    /// Package description.
    pub description: String,
    /// Repository name (e.g., "extra"), or "local" for foreign packages.
    pub repository: String,
    /// Groups the package belongs to.
    pub groups: Vec<String>,
    /// Install reason (installed packages only).
    pub reason: Option<InstallReason>,
    /// Download size in bytes.
    pub download_size: u64,
    /// Installed size in bytes.
    pub installed_size: u64,
    /// Pending change.
    #[serde(default)]
    pub mark: Mark,
}

impl Package {
    /// Creates a package that is neither installed nor available.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            installed_version: None,
            available_version: None,
            description: description.into(),
            repository: "local".to_string(),
            groups: Vec::new(),
            reason: None,
            download_size: 0,
            installed_size: 0,
            mark: Mark::Keep,
        }
    }

    pub fn with_installed(mut self, version: &str, reason: InstallReason) -> Self {
        self.installed_version = Some(Version::new(version));
        self.reason = Some(reason);
        self
    }

    pub fn with_available(mut self, version: &str, repository: impl Into<String>) -> Self {
        self.available_version = Some(Version::new(version));
        self.repository = repository.into();
        self
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sizes(mut self, download_size: u64, installed_size: u64) -> Self {
        self.download_size = download_size;
        self.installed_size = installed_size;
        self
    }

    /// False for leftovers that have neither an installed nor an
    /// available version.
    pub fn exists(&self) -> bool {
        self.installed_version.is_some() || self.available_version.is_some()
    }

    pub fn is_installed(&self) -> bool {
        self.installed_version.is_some()
    }

    pub fn is_upgradeable(&self) -> bool {
        match (&self.installed_version, &self.available_version) {
            (Some(installed), Some(available)) => available > installed,
            _ => false,
        }
    }

    /// Installed but not offered by any repository.
    pub fn is_foreign(&self) -> bool {
        self.installed_version.is_some() && self.available_version.is_none()
    }

    /// The version to show: the installed one, else the available one.
    pub fn version(&self) -> Option<&Version> {
        self.installed_version
            .as_ref()
            .or(self.available_version.as_ref())
    }

    pub fn is_marked(&self) -> bool {
        self.mark != Mark::Keep
    }

    /// Computes the state flags from versions, reason and mark.
    pub fn state(&self) -> PackageState {
        let mut state = if self.is_installed() {
            PackageState::INSTALLED
        } else {
            PackageState::NOT_INSTALLED
        };

        if self.is_upgradeable() {
            state |= PackageState::UPGRADEABLE;
        }
        if self.reason == Some(InstallReason::Dependency) {
            state |= PackageState::IS_AUTO;
        }
        if self.is_foreign() {
            state |= PackageState::IS_FOREIGN;
        }

        state |= match self.mark {
            Mark::Keep => PackageState::TO_KEEP,
            Mark::Install => PackageState::TO_INSTALL | PackageState::NEW_INSTALL,
            Mark::Upgrade => PackageState::TO_UPGRADE,
            Mark::Remove => PackageState::TO_REMOVE,
        };

        state
    }
}

/// A package group and the names of its members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group name.
    pub name: String,
    /// Sorted member package names.
    pub members: Vec<String>,
}

impl Group {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, package: &str) -> bool {
        self.members.binary_search_by(|m| m.as_str().cmp(package)).is_ok()
    }
}
