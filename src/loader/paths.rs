//! Search-path resolution for import names.
//!
//! The precedence is fixed and deliberately short:
//!
//! 1. each recorded client-library directory, in insertion order;
//! 2. `{systemroot}/system32/{name}`;
//! 3. `{systemroot}/{name}`.
//!
//! The current directory and `PATH` are not consulted; both are documented
//! non-goals. The system root is captured once at init from the host (on a
//! real system it comes out of the registry); when it is unavailable the two
//! system steps are skipped.

use std::path::{Path, PathBuf};

use crate::{loader::bootstrap::BOOTSTRAP_SLOTS, host::LoaderHost, Error, Result};

/// Bound on a forwarder target's module-name length (`MAXIMUM_PATH`).
pub(crate) const MAX_FORWARDER_MODULE: usize = 260;

/// Directory prefixes used to locate dependencies.
#[derive(Debug, Default)]
pub struct SearchPaths {
    /// Directories of client libraries recorded during bootstrap.
    client_dirs: Vec<PathBuf>,
    /// System root captured at init; `None` disables the system steps.
    system_root: Option<PathBuf>,
}

impl SearchPaths {
    /// Creates an empty search-path set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a client-library directory for later dependency resolution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] when the fixed-capacity table is
    /// full; client libraries are a bootstrap-window concept and only a
    /// handful are expected.
    pub fn push_client_dir(&mut self, dir: PathBuf) -> Result<()> {
        if self.client_dirs.len() >= BOOTSTRAP_SLOTS {
            debug_assert!(false, "client search-path table full");
            return Err(Error::ResourceExhausted("client search-path table"));
        }
        self.client_dirs.push(dir);
        Ok(())
    }

    /// Sets the system root used for the `system32` and windows-dir steps.
    pub fn set_system_root(&mut self, root: Option<PathBuf>) {
        self.system_root = root;
    }

    /// Produces the candidate paths for `name` that exist on disk, in
    /// precedence order. The caller attempts each in turn; a candidate that
    /// exists but fails to load does not stop the search.
    #[must_use]
    pub fn candidates(&self, host: &dyn LoaderHost, name: &str) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut probe = |path: PathBuf| {
            log::debug!("looking for {}", path.display());
            if host.file_exists(&path) {
                found.push(path);
            }
        };

        for dir in &self.client_dirs {
            probe(dir.join(name));
        }
        if let Some(root) = &self.system_root {
            probe(root.join("system32").join(name));
            probe(root.join(name));
        }
        found
    }
}

/// Short file-name component of a path (`"c:/lib/foo.dll"` -> `"foo.dll"`).
#[must_use]
pub fn short_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.to_string_lossy().into_owned(), |n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Host whose filesystem is an explicit path set.
    struct FsHost {
        files: HashSet<PathBuf>,
    }

    impl FsHost {
        fn new(files: &[&str]) -> Self {
            Self {
                files: files.iter().map(PathBuf::from).collect(),
            }
        }
    }

    impl LoaderHost for FsHost {
        fn file_exists(&self, path: &Path) -> bool {
            self.files.contains(path)
        }

        fn read_file(&self, _path: &Path) -> std::io::Result<Vec<u8>> {
            Err(std::io::Error::from(std::io::ErrorKind::NotFound))
        }
    }

    #[test]
    fn precedence_client_then_system32_then_windows() {
        let mut paths = SearchPaths::new();
        paths.push_client_dir(PathBuf::from("/client")).unwrap();
        paths.set_system_root(Some(PathBuf::from("/windows")));

        let host = FsHost::new(&[
            "/client/dep.dll",
            "/windows/system32/dep.dll",
            "/windows/dep.dll",
        ]);
        let candidates = paths.candidates(&host, "dep.dll");
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/client/dep.dll"),
                PathBuf::from("/windows/system32/dep.dll"),
                PathBuf::from("/windows/dep.dll"),
            ]
        );
    }

    #[test]
    fn missing_system_root_skips_system_steps() {
        let mut paths = SearchPaths::new();
        paths.push_client_dir(PathBuf::from("/client")).unwrap();
        let host = FsHost::new(&["/windows/system32/dep.dll"]);
        assert!(paths.candidates(&host, "dep.dll").is_empty());
    }

    #[test]
    fn client_dirs_keep_insertion_order() {
        let mut paths = SearchPaths::new();
        paths.push_client_dir(PathBuf::from("/first")).unwrap();
        paths.push_client_dir(PathBuf::from("/second")).unwrap();
        let host = FsHost::new(&["/first/x.dll", "/second/x.dll"]);
        let candidates = paths.candidates(&host, "x.dll");
        assert_eq!(candidates[0], PathBuf::from("/first/x.dll"));
    }

    #[test]
    fn client_dir_table_is_bounded() {
        let mut paths = SearchPaths::new();
        for i in 0..BOOTSTRAP_SLOTS {
            paths.push_client_dir(PathBuf::from(format!("/dir{i}"))).unwrap();
        }
        // Release behavior is a graceful error; debug asserts
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            paths.push_client_dir(PathBuf::from("/overflow"))
        }));
        if let Ok(result) = result {
            assert!(matches!(result, Err(Error::ResourceExhausted(_))));
        }
    }

    #[test]
    fn short_name_extracts_file_component() {
        assert_eq!(short_name(Path::new("/a/b/foo.dll")), "foo.dll");
        assert_eq!(short_name(Path::new("foo.dll")), "foo.dll");
    }
}
