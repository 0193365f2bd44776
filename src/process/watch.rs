use crate::error::{OverseerError, Result};
use crate::process::events::SupervisorEvent;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Paths the watcher must never react to
#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    root: PathBuf,
    patterns: Vec<String>,
    log_files: Vec<PathBuf>,
}

impl WatchFilter {
    pub fn new(root: &Path, patterns: &[String], log_files: Vec<PathBuf>) -> Self {
        Self {
            root: root.to_path_buf(),
            patterns: patterns.to_vec(),
            log_files,
        }
    }

    /// `true` when `path` is one of the process's own log files, or any of its
    /// components matches an ignore pattern (`node_modules`, `*.log`)
    pub fn is_ignored(&self, path: &Path) -> bool {
        if self.log_files.iter().any(|log| log == path) {
            return true;
        }

        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative.components().any(|component| {
            let component = component.as_os_str().to_string_lossy();
            self.patterns.iter().any(|pattern| match pattern.strip_prefix("*.") {
                Some(ext) => component
                    .rsplit_once('.')
                    .is_some_and(|(_, actual)| actual == ext),
                None => component == pattern.as_str(),
            })
        })
    }
}

/// Recursive file watcher over a process's working directory.
///
/// Dropping it stops the watch.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl FileWatcher {
    pub(crate) fn start(
        name: &str,
        filter: WatchFilter,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Result<Self> {
        let root = filter.root.clone();
        let process = name.to_string();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        return;
                    }
                    if let Some(path) = event.paths.iter().find(|p| !filter.is_ignored(p)) {
                        debug!("Watched file changed for {}: {}", process, path.display());
                        let _ = events.send(SupervisorEvent::FileChanged {
                            name: process.clone(),
                            path: path.clone(),
                        });
                    }
                }
                Err(e) => warn!("File watch error for {}: {}", process, e),
            },
            Config::default(),
        )
        .map_err(|e| OverseerError::Other(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| {
                OverseerError::Other(format!("Failed to watch {}: {}", root.display(), e))
            })?;

        Ok(Self {
            _watcher: watcher,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn filter(root: &Path) -> WatchFilter {
        WatchFilter::new(
            root,
            &["node_modules".to_string(), ".git".to_string(), "*.log".to_string()],
            vec![root.join("logs-out.txt")],
        )
    }

    #[test]
    fn test_filter_ignores_patterns_and_log_files() {
        let root = Path::new("/srv/app");
        let filter = filter(root);

        assert!(filter.is_ignored(&root.join("node_modules/left-pad/index.js")));
        assert!(filter.is_ignored(&root.join(".git/HEAD")));
        assert!(filter.is_ignored(&root.join("server.log")));
        assert!(filter.is_ignored(&root.join("logs-out.txt")));
        assert!(!filter.is_ignored(&root.join("src/index.js")));
        assert!(!filter.is_ignored(&root.join("catalog.ts")));
    }

    #[tokio::test]
    async fn test_watcher_reports_changes() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = FileWatcher::start("api", filter(dir.path()), tx).unwrap();
        assert_eq!(watcher.root(), dir.path());

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(dir.path().join("ignored.log"), "x").unwrap();
        std::fs::write(dir.path().join("index.js"), "console.log(1)").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no file change reported")
            .unwrap();
        match event {
            SupervisorEvent::FileChanged { name, path } => {
                assert_eq!(name, "api");
                assert_eq!(path.file_name().unwrap(), "index.js");
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }
}
