/// Derives the runner argument list for a single run from the base arguments
/// and the change that triggered it.
///
/// A change narrows the run with the runner's test-selection flag. If the base
/// arguments already select tests, the changed path is appended to that
/// comma-separated list in place; otherwise a new `-t <path>` pair is appended.
use std::fmt;

/// Spellings of the runner's test-selection flag, in lookup order.
pub const SCOPE_FLAGS: [&str; 2] = ["-t", "--tests"];

/// Separator used by the runner for multiple test selections.
const SCOPE_SEPARATOR: char = ',';

/// One classified filesystem notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeDescriptor {
    /// Changed path relative to the watch root. `None` means the watcher could
    /// not attribute the change to a path; such a change runs the full suite.
    pub name: Option<String>,
    /// A directory was just created. These events never trigger a run.
    pub is_mkdir: bool,
    /// The changed path is a directory rather than a file.
    pub is_dir: bool,
}

impl ChangeDescriptor {
    /// A change with no known path.
    pub fn unscoped() -> Self {
        Self::default()
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            is_dir: true,
            ..Self::default()
        }
    }

    pub fn mkdir(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            is_mkdir: true,
            is_dir: true,
        }
    }

    /// Directory-creation events are filtered before they reach the scheduler's
    /// state machine. A creation flag on its own is enough: the watcher only
    /// raises it for directories.
    pub fn is_directory_creation(&self) -> bool {
        self.is_mkdir
    }

    /// The selection this change contributes: `<dir>/*` for directories, the
    /// bare path for files, nothing for an unscoped change.
    pub fn scope_token(&self) -> Option<String> {
        let name = self.name.as_deref()?;
        if self.is_dir {
            Some(format!("{}/*", name.trim_end_matches('/')))
        } else {
            Some(name.to_string())
        }
    }
}

impl fmt::Display for ChangeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, self.is_dir) {
            (Some(name), true) => write!(f, "{name}/"),
            (Some(name), false) => f.write_str(name),
            (None, _) => f.write_str("<unknown path>"),
        }
    }
}

/// Returns the index of the first test-selection flag in `args`, if any.
fn find_scope_flag(args: &[String]) -> Option<usize> {
    args.iter()
        .position(|arg| SCOPE_FLAGS.contains(&arg.as_str()))
}

/// Computes the arguments for a run triggered by `change`.
///
/// Pure: `base` is never modified and the same inputs always give the same
/// output. Flag order and every unrelated flag are preserved.
pub fn resolve_args(base: &[String], change: &ChangeDescriptor) -> Vec<String> {
    let mut args = base.to_vec();
    let Some(token) = change.scope_token() else {
        return args;
    };

    match find_scope_flag(&args) {
        Some(flag_idx) => {
            let value_idx = flag_idx + 1;
            match args.get_mut(value_idx) {
                Some(existing) if !existing.is_empty() => {
                    existing.push(SCOPE_SEPARATOR);
                    existing.push_str(&token);
                }
                Some(existing) => *existing = token,
                // Trailing flag with no value: give it one.
                None => args.push(token),
            }
        }
        None => {
            args.push(SCOPE_FLAGS[0].to_string());
            args.push(token);
        }
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    // ── scope_token ───────────────────────────────────────────────────────────

    #[test]
    fn scope_token_for_file_is_bare_path() {
        let change = ChangeDescriptor::file("some/file.js");
        assert_eq!(change.scope_token().as_deref(), Some("some/file.js"));
    }

    #[test]
    fn scope_token_for_directory_globs_its_contents() {
        let change = ChangeDescriptor::dir("test");
        assert_eq!(change.scope_token().as_deref(), Some("test/*"));
    }

    #[test]
    fn scope_token_for_directory_with_trailing_slash() {
        let change = ChangeDescriptor::dir("test/");
        assert_eq!(change.scope_token().as_deref(), Some("test/*"));
    }

    #[test]
    fn scope_token_absent_without_name() {
        assert!(ChangeDescriptor::unscoped().scope_token().is_none());
    }

    #[test]
    fn mkdir_counts_as_directory_creation() {
        assert!(ChangeDescriptor::mkdir("test").is_directory_creation());
        assert!(!ChangeDescriptor::dir("test").is_directory_creation());
        assert!(!ChangeDescriptor::file("a.js").is_directory_creation());
    }

    #[test]
    fn display_marks_directories() {
        assert_eq!(ChangeDescriptor::file("a.js").to_string(), "a.js");
        assert_eq!(ChangeDescriptor::dir("test").to_string(), "test/");
        assert_eq!(ChangeDescriptor::unscoped().to_string(), "<unknown path>");
    }

    // ── resolve_args ──────────────────────────────────────────────────────────

    #[test]
    fn file_change_without_base_args_adds_scope_flag() {
        let args = resolve_args(&[], &ChangeDescriptor::file("some/file.js"));
        assert_eq!(args, argv(&["-t", "some/file.js"]));
    }

    #[test]
    fn unscoped_change_without_base_args_is_empty() {
        let args = resolve_args(&[], &ChangeDescriptor::unscoped());
        assert!(args.is_empty());
    }

    #[test]
    fn unscoped_change_keeps_base_args_unchanged() {
        let base = argv(&["-r", "specification", "-t", "file.js"]);
        let args = resolve_args(&base, &ChangeDescriptor::unscoped());
        assert_eq!(args, base);
    }

    #[test]
    fn directory_change_scopes_to_directory_contents() {
        let args = resolve_args(&[], &ChangeDescriptor::dir("test"));
        assert_eq!(args, argv(&["-t", "test/*"]));
    }

    #[test]
    fn appends_to_existing_short_flag() {
        let base = argv(&["-t", "file.js"]);
        let args = resolve_args(&base, &ChangeDescriptor::file("test/thing-test.js"));
        assert_eq!(args, argv(&["-t", "file.js,test/thing-test.js"]));
    }

    #[test]
    fn appends_to_existing_long_flag() {
        let base = argv(&["--tests", "file.js"]);
        let args = resolve_args(&base, &ChangeDescriptor::file("test/thing-test.js"));
        assert_eq!(args, argv(&["--tests", "file.js,test/thing-test.js"]));
    }

    #[test]
    fn preserves_position_of_surrounding_flags() {
        let base = argv(&["-r", "specification", "--tests", "file.js", "--node"]);
        let args = resolve_args(&base, &ChangeDescriptor::file("test/thing-test.js"));
        assert_eq!(
            args,
            argv(&[
                "-r",
                "specification",
                "--tests",
                "file.js,test/thing-test.js",
                "--node",
            ])
        );
    }

    #[test]
    fn appends_new_flag_after_unrelated_base_args() {
        let base = argv(&["-r", "specification"]);
        let args = resolve_args(&base, &ChangeDescriptor::file("a.js"));
        assert_eq!(args, argv(&["-r", "specification", "-t", "a.js"]));
    }

    #[test]
    fn trailing_scope_flag_receives_token_as_value() {
        let base = argv(&["--node", "-t"]);
        let args = resolve_args(&base, &ChangeDescriptor::file("a.js"));
        assert_eq!(args, argv(&["--node", "-t", "a.js"]));
    }

    #[test]
    fn does_not_mutate_base_args() {
        let base = argv(&["-t", "file.js"]);
        let _ = resolve_args(&base, &ChangeDescriptor::file("b.js"));
        assert_eq!(base, argv(&["-t", "file.js"]));
    }

    #[test]
    fn same_inputs_give_same_output() {
        let base = argv(&["--tests", "x.js", "--node"]);
        let change = ChangeDescriptor::dir("lib");
        assert_eq!(resolve_args(&base, &change), resolve_args(&base, &change));
    }
}
