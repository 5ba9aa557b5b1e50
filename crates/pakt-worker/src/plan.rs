//! Turns worker jobs into pacman invocations.

use pakt_core::ChangeSet;
use std::fmt;

/// Flags passed to every pacman invocation.
const COMMON_FLAGS: [&str; 3] = ["--noprogressbar", "--color", "never"];

/// One pacman invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacmanCommand {
    pub args: Vec<String>,
}

impl PacmanCommand {
    fn new<'a>(operation: impl IntoIterator<Item = &'a str>, targets: &[String]) -> Self {
        let mut args: Vec<String> = operation.into_iter().map(str::to_string).collect();
        args.extend(COMMON_FLAGS.iter().map(|f| f.to_string()));
        if !targets.is_empty() {
            args.push("--".to_string());
            args.extend(targets.iter().cloned());
        }
        Self { args }
    }
}

impl fmt::Display for PacmanCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pacman {}", self.args.join(" "))
    }
}

/// Refreshes the sync databases.
pub fn update_plan() -> Vec<PacmanCommand> {
    vec![PacmanCommand::new(["-Sy"], &[])]
}

/// Applies a change set: removals first, then installs and upgrades in one
/// transaction. A dist-upgrade turns the second step into a full `-Syu`.
pub fn commit_plan(changes: &ChangeSet) -> Vec<PacmanCommand> {
    let mut plan = Vec::new();

    if !changes.remove.is_empty() {
        plan.push(PacmanCommand::new(["-R"], &changes.remove));
    }

    if changes.dist_upgrade {
        // -u already covers every outdated package.
        plan.push(PacmanCommand::new(["-Syu"], &changes.install));
    } else {
        let targets: Vec<String> = changes
            .install
            .iter()
            .chain(&changes.upgrade)
            .cloned()
            .collect();
        if !targets.is_empty() {
            plan.push(PacmanCommand::new(["-S", "--needed"], &targets));
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_plan() {
        let plan = update_plan();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].to_string(), "pacman -Sy --noprogressbar --color never");
    }

    #[test]
    fn test_commit_plan_orders_removals_first() {
        let changes = ChangeSet {
            install: vec!["vim".into()],
            upgrade: vec!["linux".into()],
            remove: vec!["nano".into()],
            dist_upgrade: false,
        };
        let plan = commit_plan(&changes);
        assert_eq!(
            plan.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
            vec![
                "pacman -R --noprogressbar --color never -- nano",
                "pacman -S --needed --noprogressbar --color never -- vim linux",
            ]
        );
    }

    #[test]
    fn test_dist_upgrade_plan() {
        let changes = ChangeSet {
            install: vec!["vim".into()],
            upgrade: vec!["linux".into()],
            dist_upgrade: true,
            ..Default::default()
        };
        let plan = commit_plan(&changes);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].args[0], "-Syu");
        assert_eq!(plan[0].args.last().unwrap(), "vim");

        let bare = commit_plan(&ChangeSet {
            dist_upgrade: true,
            ..Default::default()
        });
        assert_eq!(bare[0].to_string(), "pacman -Syu --noprogressbar --color never");
    }

    #[test]
    fn test_empty_change_set() {
        assert!(commit_plan(&ChangeSet::default()).is_empty());
    }
}
