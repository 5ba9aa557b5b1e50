//! Repository list from pacman.conf.

use std::path::Path;
use tracing::warn;

/// Returns the repositories configured in `pacman.conf`, in priority order.
/// An unreadable file yields an empty list.
pub fn pacman_repos(pacman_conf: &Path) -> Vec<String> {
    match std::fs::read_to_string(pacman_conf) {
        Ok(content) => parse_repos(&content),
        Err(e) => {
            warn!("Failed to read {}: {}", pacman_conf.display(), e);
            Vec::new()
        }
    }
}

/// Extracts repository section names, skipping `[options]` and comments.
pub fn parse_repos(content: &str) -> Vec<String> {
    let mut repos = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if let Some(repo) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let repo = repo.trim();
            if !repo.is_empty() && repo != "options" && !repos.iter().any(|r| r == repo) {
                repos.push(repo.to_string());
            }
        }
    }
    repos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repos() {
        let conf = r#"
[options]
HoldPkg     = pacman glibc
Architecture = auto

#[core-testing]
#Include = /etc/pacman.d/mirrorlist

[core]
Include = /etc/pacman.d/mirrorlist

[extra]
Include = /etc/pacman.d/mirrorlist

[chaotic-aur]
Include = /etc/pacman.d/chaotic-mirrorlist
"#;
        assert_eq!(parse_repos(conf), vec!["core", "extra", "chaotic-aur"]);
    }

    #[test]
    fn test_missing_file() {
        assert!(pacman_repos(Path::new("/nonexistent/pacman.conf")).is_empty());
    }
}
