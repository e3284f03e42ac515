use std::collections::HashMap;
use std::fs;

use globset::{GlobBuilder, GlobMatcher};
use tracing::warn;

use crate::error::{PackratError, Result};
use crate::node::Node;
use crate::platform;

/// Exclude patterns read from an `--exclude-from` file, one per line.
///
/// Patterns starting with `/` match the full node path (with a leading
/// separator); all others match the basename only. Matching is shell-glob
/// style and wildcards never cross a separator.
pub struct ExcludeList {
    anchored: Vec<GlobMatcher>,
    by_name: Vec<GlobMatcher>,
}

impl ExcludeList {
    pub fn empty() -> Self {
        ExcludeList {
            anchored: Vec::new(),
            by_name: Vec::new(),
        }
    }

    pub fn from_file(path: Option<&str>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::empty());
        };
        let text = fs::read_to_string(path)?;
        let mut list = Self::empty();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let glob = GlobBuilder::new(line.trim_start_matches('/'))
                .literal_separator(true)
                .build()
                .map_err(|e| PackratError::Other(format!("bad exclude pattern '{line}': {e}")))?
                .compile_matcher();
            if line.starts_with('/') {
                list.anchored.push(glob);
            } else {
                list.by_name.push(glob);
            }
        }
        Ok(list)
    }

    /// Should the entry `name` inside `dir` be skipped?
    pub fn excluded(&self, dir: &str, name: &str) -> bool {
        if self.by_name.iter().any(|g| g.is_match(name)) {
            return true;
        }
        if self.anchored.is_empty() {
            return false;
        }
        let full = if dir.is_empty() {
            name.to_string()
        } else {
            format!("{dir}/{name}")
        };
        self.anchored.iter().any(|g| g.is_match(&full))
    }
}

/// Ordered set of scanned nodes keyed by path. Duplicates are dropped,
/// first occurrence wins.
#[derive(Default)]
pub struct NodeMap {
    pub names: Vec<String>,
    pub nodes: HashMap<String, Node>,
}

impl NodeMap {
    pub fn insert(&mut self, node: Node) -> bool {
        if self.nodes.contains_key(&node.name) {
            return false;
        }
        self.names.push(node.name.clone());
        self.nodes.insert(node.name.clone(), node);
        true
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Normalize a source argument to a clean `/`-separated node name.
pub fn clean_source_path(src: &str) -> String {
    let normalized = src.replace(std::path::MAIN_SEPARATOR, "/");
    let mut parts: Vec<&str> = Vec::new();
    let absolute = normalized.starts_with('/');
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                // Collapse where possible; a leading ".." is kept verbatim.
                if matches!(parts.last(), Some(&p) if p != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            p => parts.push(p),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Walk the source roots, applying excludes, and produce the node set.
/// I/O failures on individual entries are counted but never fatal.
pub fn scan_sources(srcs: &[String], excludes: &ExcludeList) -> (NodeMap, usize) {
    let mut out = NodeMap::default();
    let mut errors = 0usize;
    for src in srcs {
        scan_one(&clean_source_path(src), None, excludes, &mut out, &mut errors);
    }
    (out, errors)
}

fn scan_one(
    name: &str,
    meta: Option<fs::Metadata>,
    excludes: &ExcludeList,
    out: &mut NodeMap,
    errors: &mut usize,
) {
    let fs_path = platform::to_host_path(name);
    let meta = match meta {
        Some(m) => m,
        None => match fs::symlink_metadata(&fs_path) {
            Ok(m) => m,
            Err(e) => {
                warn!("F {name}: {e}");
                *errors += 1;
                return;
            }
        },
    };

    let file_type = meta.file_type();
    if file_type.is_dir() {
        if !out.insert(Node::directory(name.to_string(), platform::perm_bits(&meta))) {
            return;
        }
        let children = match fs::read_dir(&fs_path) {
            Ok(c) => c,
            Err(e) => {
                warn!("F {name}: {e}");
                *errors += 1;
                return;
            }
        };
        for child in children {
            let child = match child {
                Ok(c) => c,
                Err(e) => {
                    warn!("F {name}: {e}");
                    *errors += 1;
                    continue;
                }
            };
            let child_name = child.file_name().to_string_lossy().into_owned();
            if excludes.excluded(name, &child_name) {
                continue;
            }
            let child_path = format!("{name}/{child_name}");
            scan_one(&child_path, child.metadata().ok(), excludes, out, errors);
        }
    } else if file_type.is_file() {
        out.insert(Node::regular_file(
            name.to_string(),
            meta.len() as i64,
            platform::mtime_ns(&meta),
            platform::perm_bits(&meta),
        ));
    } else if file_type.is_symlink() {
        match fs::read_link(&fs_path) {
            Ok(target) => {
                out.insert(Node::symlink(
                    name.to_string(),
                    target.to_string_lossy().into_owned(),
                ));
            }
            Err(e) => {
                warn!("F {name}: {e}");
                *errors += 1;
            }
        }
    }
    // Sockets, fifos and devices are silently ignored.
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::path::Path;

    fn write_excludes(dir: &Path, lines: &str) -> String {
        let path = dir.join("excludes");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(lines.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn clean_source_path_normalizes() {
        assert_eq!(clean_source_path("a/b/"), "a/b");
        assert_eq!(clean_source_path("./a/./b"), "a/b");
        assert_eq!(clean_source_path("a/x/../b"), "a/b");
        assert_eq!(clean_source_path("/a//b"), "/a/b");
        assert_eq!(clean_source_path("."), ".");
    }

    #[test]
    fn basename_patterns_match_any_level() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_excludes(tmp.path(), "*.tmp\n");
        let ex = ExcludeList::from_file(Some(&path)).unwrap();
        assert!(ex.excluded("some/dir", "junk.tmp"));
        assert!(ex.excluded("", "junk.tmp"));
        assert!(!ex.excluded("some/dir", "keep.txt"));
    }

    #[test]
    fn anchored_patterns_match_full_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_excludes(tmp.path(), "/src/target\n");
        let ex = ExcludeList::from_file(Some(&path)).unwrap();
        assert!(ex.excluded("src", "target"));
        assert!(!ex.excluded("other/src", "target"));
    }

    #[test]
    fn wildcards_stop_at_separators() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_excludes(tmp.path(), "/src/*\n");
        let ex = ExcludeList::from_file(Some(&path)).unwrap();
        assert!(ex.excluded("src", "anything"));
        // `*` must not swallow the separator of deeper paths.
        assert!(!ex.excluded("src/deep", "anything"));
    }

    #[test]
    fn bad_pattern_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_excludes(tmp.path(), "[unclosed\n");
        assert!(ExcludeList::from_file(Some(&path)).is_err());
    }

    #[test]
    fn scan_collects_files_dirs_and_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/file.txt"), b"hello").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("/tmp/x", root.join("link")).unwrap();

        let src = root.to_string_lossy().into_owned();
        let (map, errors) = scan_sources(&[src.clone()], &ExcludeList::empty());
        assert_eq!(errors, 0);

        let base = clean_source_path(&src);
        let file = map.get(&format!("{base}/sub/file.txt")).unwrap();
        assert!(file.is_file());
        assert_eq!(file.size, 5);
        assert!(file.mtime_ns > 0);
        assert!(map.get(&format!("{base}/sub")).unwrap().is_dir());
        #[cfg(unix)]
        assert_eq!(map.get(&format!("{base}/link")).unwrap().target, "/tmp/x");
    }

    #[test]
    fn scan_skips_excluded_subtrees() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir(root.join("keep")).unwrap();
        fs::create_dir(root.join("skip")).unwrap();
        fs::write(root.join("keep/a"), b"a").unwrap();
        fs::write(root.join("skip/b"), b"b").unwrap();
        let pattern_file = write_excludes(root, "skip\n");

        let src = root.to_string_lossy().into_owned();
        let ex = ExcludeList::from_file(Some(&pattern_file)).unwrap();
        let (map, _) = scan_sources(&[src.clone()], &ex);
        let base = clean_source_path(&src);
        assert!(map.get(&format!("{base}/keep/a")).is_some());
        assert!(map.get(&format!("{base}/skip")).is_none());
        assert!(map.get(&format!("{base}/skip/b")).is_none());
    }

    #[test]
    fn missing_source_counts_an_error() {
        let (map, errors) = scan_sources(
            &["/definitely/not/there".to_string()],
            &ExcludeList::empty(),
        );
        assert_eq!(errors, 1);
        assert!(map.is_empty());
    }

    #[test]
    fn duplicate_sources_deduplicate() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("f"), b"x").unwrap();
        let src = tmp.path().to_string_lossy().into_owned();
        let (map, errors) = scan_sources(&[src.clone(), src.clone()], &ExcludeList::empty());
        assert_eq!(errors, 0);
        let base = clean_source_path(&src);
        assert_eq!(
            map.names.iter().filter(|n| **n == format!("{base}/f")).count(),
            1
        );
    }
}
