//! File-change watchers for the template and the geoip data files.

use std::path::{Path, PathBuf};

use anyhow::Result;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

/// Keeps the underlying watcher alive for as long as the handle is held.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
}

/// Invokes `on_change` with the changed path whenever one of `paths` is
/// modified or recreated.
pub fn watch_paths<F>(paths: &[PathBuf], on_change: F) -> Result<FileWatcher>
where
    F: Fn(&Path) + Send + 'static,
{
    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                if event.kind.is_modify() || event.kind.is_create() {
                    for path in &event.paths {
                        on_change(path);
                    }
                }
            },
            Err(e) => tracing::warn!("File watch error: {}", e),
        })?;

    for path in paths {
        watcher.watch(path, RecursiveMode::NonRecursive)?;
    }

    Ok(FileWatcher {
        _watcher: watcher,
    })
}

/// Every regular file under `dir`, recursively. Missing directories yield
/// an empty list.
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return files,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(files_under(&path));
        } else {
            files.push(path);
        }
    }

    files
}

#[cfg(test)]
mod tests {
    use std::{
        sync::mpsc,
        time::Duration,
    };

    use super::*;

    #[test]
    fn files_under_missing_dir_is_empty() {
        assert!(files_under(Path::new("/no/such/directory")).is_empty());
    }

    #[test]
    fn files_under_walks_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(dir.path().join("a.dat"), b"a").unwrap();
        std::fs::write(sub.join("b.dat"), b"b").unwrap();

        let mut files = files_under(dir.path());
        files.sort();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn watcher_fires_on_modification() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("watched.tmpl");
        std::fs::write(&file, b"before").unwrap();

        let (tx, rx) = mpsc::channel();
        let _watcher = watch_paths(&[file.clone()], move |path| {
            let _ = tx.send(path.to_path_buf());
        })
        .unwrap();

        std::fs::write(&file, b"after").unwrap();

        let changed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(changed.file_name(), file.file_name());
    }
}
