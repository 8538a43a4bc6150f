//! Filesystem enumeration for backup.
//!
//! The walker yields entries in a deterministic (name-sorted) order and
//! consults an externally supplied predicate for include/exclude
//! decisions; the pattern language itself lives outside the engine. An
//! excluded directory prunes its whole subtree.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::WalkBuilder;

use cairn_types::error::{CairnError, Result};

/// Include/exclude predicate: `(path relative to the source root, is_dir)`.
/// Returning `false` for a directory skips its entire subtree.
pub type Matcher = Arc<dyn Fn(&Path, bool) -> bool + Send + Sync>;

/// A matcher that includes everything.
pub fn match_all() -> Matcher {
    Arc::new(|_, _| true)
}

/// Returns `true` for I/O errors safe to skip (permission denied, races
/// with deletion). The walk continues; the file is counted as an error.
pub fn is_soft_io_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound
    )
}

/// Returns `true` for walk errors caused by soft I/O conditions.
pub fn is_soft_walk_error(e: &ignore::Error) -> bool {
    e.io_error().is_some_and(is_soft_io_error)
}

/// Build the configured recursive walker over one source directory.
///
/// Symlinks are never followed; hidden files are included; sort order is
/// by file name so archives are reproducible.
pub fn build_walker(source: &Path, matcher: Option<Matcher>) -> Result<ignore::Walk> {
    if !source.exists() {
        return Err(CairnError::Other(format!(
            "source does not exist: {}",
            source.display()
        )));
    }

    let mut builder = WalkBuilder::new(source);
    builder.follow_links(false);
    builder.hidden(false);
    builder.ignore(false);
    builder.git_global(false);
    builder.git_exclude(false);
    builder.git_ignore(false);
    builder.parents(false);
    builder.require_git(false);
    builder.sort_by_file_name(std::ffi::OsStr::cmp);

    if let Some(matcher) = matcher {
        let root: PathBuf = source.to_path_buf();
        builder.filter_entry(move |entry| {
            let path = entry.path();
            if path == root {
                return true;
            }
            let rel = path.strip_prefix(&root).unwrap_or(path);
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            matcher(rel, is_dir)
        });
    }

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join("b.log"), b"b").unwrap();
        fs::write(dir.path().join("sub/c.txt"), b"c").unwrap();
        fs::write(dir.path().join("sub/deep/d.txt"), b"d").unwrap();
        dir
    }

    fn rel_paths(dir: &Path, matcher: Option<Matcher>) -> Vec<String> {
        build_walker(dir, matcher)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.path()
                    .strip_prefix(dir)
                    .ok()
                    .map(|p| p.to_string_lossy().into_owned())
            })
            .filter(|p| !p.is_empty())
            .collect()
    }

    #[test]
    fn walk_is_sorted_and_complete() {
        let dir = tree();
        let paths = rel_paths(dir.path(), None);
        assert_eq!(paths, vec!["a.txt", "b.log", "sub", "sub/c.txt", "sub/deep", "sub/deep/d.txt"]);
    }

    #[test]
    fn matcher_excludes_files() {
        let dir = tree();
        let matcher: Matcher =
            Arc::new(|path, _| path.extension().map_or(true, |e| e != "log"));
        let paths = rel_paths(dir.path(), Some(matcher));
        assert!(!paths.contains(&"b.log".to_string()));
        assert!(paths.contains(&"a.txt".to_string()));
    }

    #[test]
    fn excluded_directory_prunes_subtree() {
        let dir = tree();
        let matcher: Matcher = Arc::new(|path, is_dir| !(is_dir && path.ends_with(Path::new("sub"))));
        let paths = rel_paths(dir.path(), Some(matcher));
        assert_eq!(paths, vec!["a.txt", "b.log"]);
    }

    #[test]
    fn missing_source_is_an_error() {
        assert!(build_walker(Path::new("/no/such/dir/anywhere"), None).is_err());
    }
}
