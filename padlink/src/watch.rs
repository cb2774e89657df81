use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::core::prelude::*;

/// Flags edits to a script file so the operator can rerun it.
pub struct ScriptWatch {
    changed: Arc<AtomicBool>,
    _watcher: RecommendedWatcher,
}

impl ScriptWatch {
    pub fn start(path: PathBuf) -> Result<Self, notify::Error> {
        let changed = Arc::new(AtomicBool::new(false));
        let changed_flag = changed.clone();
        let last_loaded = Arc::new(Mutex::new(fs::read(&path).ok()));
        let script_path = path.clone();
        let watch_dir = script_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        info!(
            "watching '{}' via directory '{}'",
            script_path.display(),
            watch_dir.display()
        );

        let mut watcher = notify::recommended_watcher(move |result| {
            let event: Event = match result {
                Ok(event) => event,
                Err(err) => {
                    warn!(
                        "script watcher failed for '{}': {}",
                        script_path.display(),
                        err
                    );
                    return;
                }
            };

            if !script_changed(&event, &script_path) {
                return;
            }

            let contents = match fs::read(&script_path) {
                Ok(contents) => contents,
                Err(err) => {
                    trace!(
                        "change event before readable file '{}': {}",
                        script_path.display(),
                        err
                    );
                    return;
                }
            };

            if let Ok(mut guard) = last_loaded.lock() {
                if guard.as_deref() == Some(contents.as_slice()) {
                    trace!("'{}' unchanged", script_path.display());
                    return;
                }
                *guard = Some(contents);
            }

            changed_flag.store(true, Ordering::SeqCst);
            info!("detected change: {}", script_path.display());
        })?;

        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        Ok(Self {
            changed,
            _watcher: watcher,
        })
    }

    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::SeqCst)
    }
}

fn script_changed(event: &Event, script_path: &Path) -> bool {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }

    event
        .paths
        .iter()
        .any(|path| path_matches_target(path, script_path))
}

fn path_matches_target(path: &Path, target: &Path) -> bool {
    if path == target || path.file_name() == target.file_name() {
        return true;
    }

    match (path.canonicalize(), target.canonicalize()) {
        (Ok(path), Ok(target)) => path == target,
        _ => false,
    }
}
