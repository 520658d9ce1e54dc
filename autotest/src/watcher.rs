/// Recursive filesystem watcher feeding the scheduler.
///
/// Raw `notify` events are classified into [`ChangeDescriptor`]s on the
/// watcher's own thread and forwarded into the scheduler channel.
use anyhow::{Context, Result};
use notify::event::CreateKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::SchedulerEvent;
use crate::scope::ChangeDescriptor;

/// Paths under the root that never trigger a run.
#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    /// Path components whose subtrees are skipped.
    pub exclude: Vec<String>,
    /// Files we write ourselves, like the status file. Matched exactly.
    pub own_files: Vec<PathBuf>,
}

/// Starts watching `root` recursively. The returned watcher must be kept
/// alive; dropping it stops the notifications.
pub fn watch(
    root: &Path,
    filter: WatchFilter,
    tx: mpsc::Sender<SchedulerEvent>,
) -> Result<RecommendedWatcher> {
    let base = root.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in classify(&event, &base, &filter) {
                    if tx.blocking_send(SchedulerEvent::Change(change)).is_err() {
                        // Scheduler is gone; nothing left to notify.
                        return;
                    }
                }
            }
            Err(e) => warn!("watch error: {e}"),
        },
        NotifyConfig::default(),
    )
    .context("Failed to create file watcher")?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", root.display()))?;

    Ok(watcher)
}

/// Turns one `notify` event into zero or more change descriptors.
///
/// Access events are dropped, as is every path under an excluded directory,
/// naming an editor scratch file, or written by autotest itself. An event with
/// no paths becomes one unscoped change.
pub fn classify(event: &Event, root: &Path, filter: &WatchFilter) -> Vec<ChangeDescriptor> {
    if matches!(event.kind, EventKind::Access(_)) {
        return Vec::new();
    }
    if event.paths.is_empty() {
        return vec![ChangeDescriptor::unscoped()];
    }

    event
        .paths
        .iter()
        .filter_map(|path| {
            if filter.own_files.iter().any(|own| own == path) {
                return None;
            }
            let rel = path.strip_prefix(root).unwrap_or(path);
            if is_excluded(rel, &filter.exclude) {
                debug!(path = %rel.display(), "excluded");
                return None;
            }

            let created_dir = matches!(event.kind, EventKind::Create(CreateKind::Folder));
            let is_dir = created_dir || path.is_dir();
            Some(ChangeDescriptor {
                name: relative_name(rel),
                is_mkdir: created_dir || (is_dir && matches!(event.kind, EventKind::Create(_))),
                is_dir,
            })
        })
        .collect()
}

/// `/`-joined relative path, or `None` for the root itself.
fn relative_name(rel: &Path) -> Option<String> {
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn is_excluded(rel: &Path, exclude: &[String]) -> bool {
    let in_excluded_dir = rel
        .components()
        .any(|c| exclude.iter().any(|e| c.as_os_str() == e.as_str()));
    if in_excluded_dir {
        return true;
    }

    // Emacs lock files and backup files.
    match rel.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.starts_with(".#") || name.ends_with('~'),
        None => false,
    }
}
