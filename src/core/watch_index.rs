use std::{
    collections::{BTreeMap, BTreeSet},
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

/// Directory → tracked base names, built once from the credential paths.
///
/// Notifications arrive per directory, so several credential files living in
/// one secret mount share a single subscription. Lookups use the event path's
/// parent and file name exactly as reported; when a directory can be
/// canonicalized its canonical spelling is indexed as well, because some
/// backends report resolved paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchTargetIndex {
    dirs: BTreeMap<PathBuf, BTreeSet<OsString>>,
    watch_dirs: Vec<PathBuf>,
}

impl WatchTargetIndex {
    pub fn build<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Self {
        let mut index = Self::default();

        for path in paths {
            let Some(base) = path.file_name() else {
                tracing::warn!(
                    target: "tls_reload",
                    path = %path.display(),
                    "Credential path has no file name; it will not be watched"
                );
                continue;
            };
            let dir = parent_dir(path);

            if !index.watch_dirs.contains(&dir) {
                index.watch_dirs.push(dir.clone());
            }
            index.insert(dir.clone(), base);

            if let Ok(canonical) = std::fs::canonicalize(&dir) {
                if canonical != dir {
                    index.insert(canonical, base);
                }
            }
        }

        index
    }

    fn insert(&mut self, dir: PathBuf, base: &OsStr) {
        self.dirs.entry(dir).or_default().insert(base.to_os_string());
    }

    /// Distinct directories to subscribe to, in first-seen order.
    pub fn watch_dirs(&self) -> &[PathBuf] {
        &self.watch_dirs
    }

    /// Tracked names under `dir`, if the directory is indexed.
    pub fn tracked_names(&self, dir: &Path) -> Option<&BTreeSet<OsString>> {
        self.dirs.get(dir)
    }

    /// Whether a change to `path` concerns one of the credential files.
    pub fn is_relevant(&self, path: &Path) -> bool {
        let Some(base) = path.file_name() else {
            return false;
        };
        self.dirs
            .get(&parent_dir(path))
            .is_some_and(|names| names.contains(base))
    }

    pub fn is_empty(&self) -> bool {
        self.watch_dirs.is_empty()
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
