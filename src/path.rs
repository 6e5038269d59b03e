//! Path model: absolute paths, rebasable relative paths, and glob pattern
//! sets.
//!
//! `AbsPath` is an absolute, lexically normalized location that always uses
//! forward slashes and compares by its canonical string. `RelPath` is an
//! absolute path that remembers the sub-fragment it was derived from so it
//! can be rebased onto another root (source tree → object tree). `PathSet`
//! is a glob pattern compiled to one regex matcher, with an optional
//! concrete root used for traversal.

use crate::errors::BuildError;
use path_absolutize::Absolutize;
use regex::Regex;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::path::{Path, PathBuf};

/// An absolute, normalized filesystem location using forward slashes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AbsPath {
    inner: String,
}

impl AbsPath {
    /// Normalize the argument into an absolute forward-slash path. Relative
    /// inputs are resolved against the current directory; `.` and `..`
    /// components are collapsed lexically.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let p = path.as_ref();
        let abs: Cow<'_, Path> = p.absolutize().unwrap_or(Cow::Borrowed(p));
        let mut s = abs.to_string_lossy().replace('\\', "/");
        while s.len() > 1 && s.ends_with('/') {
            s.pop();
        }
        if s == "/" {
            s.clear();
        }
        Self { inner: s }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn std_path(&self) -> &Path {
        Path::new(&self.inner)
    }

    /// Join a sub-fragment and re-normalize.
    pub fn resolve(&self, sub: &str) -> AbsPath {
        AbsPath::new(format!("{}/{}", self.inner, sub))
    }

    /// Join a sub-fragment, keeping the fragment as the relative part.
    pub fn subpath(&self, child: &str) -> RelPath {
        RelPath {
            full: self.resolve(child),
            rel: child.trim_matches('/').to_string(),
        }
    }

    /// The last path element, including extensions.
    pub fn name(&self) -> &str {
        self.inner.rsplit('/').next().unwrap_or("")
    }

    /// The extension after the last dot of the name, if any.
    pub fn extension(&self) -> Option<&str> {
        let name = self.name();
        name.rfind('.').map(|k| &name[k + 1..])
    }

    pub fn has_extension(&self, exts: &[&str]) -> bool {
        match self.extension() {
            Some(e) => exts.iter().any(|x| *x == e),
            None => false,
        }
    }

    /// Replace (or strip, with `None`) the extension of the last element.
    pub fn with_extension(&self, ext: Option<&str>) -> AbsPath {
        let bare = match self.name().rfind('.') {
            Some(k) => {
                let cut = self.inner.len() - (self.name().len() - k);
                self.inner[..cut].to_string()
            }
            None => self.inner.clone(),
        };
        match ext {
            Some(e) => AbsPath {
                inner: format!("{bare}.{e}"),
            },
            None => AbsPath { inner: bare },
        }
    }

    /// Ancestor path the given number of layers up, if it exists.
    pub fn ancestor(&self, steps: usize) -> Option<AbsPath> {
        let mut at = self.inner.as_str();
        for _ in 0..steps {
            let k = at.rfind('/')?;
            at = &at[..k];
        }
        Some(AbsPath {
            inner: at.to_string(),
        })
    }

    pub fn parent(&self) -> Option<AbsPath> {
        self.ancestor(1)
    }

    /// True iff `self` equals `ancestor` or lies strictly below it.
    /// `"/ab"` is not a subpath of `"/a"`.
    pub fn is_subpath(&self, ancestor: &AbsPath) -> bool {
        let sub = self.inner.as_str();
        let anc = ancestor.inner.as_str();
        sub.starts_with(anc) && (sub.len() == anc.len() || sub.as_bytes()[anc.len()] == b'/')
    }

    /// Relative view of `self` against `base`; `self` must lie below it.
    pub fn relative_to(&self, base: &AbsPath) -> Result<RelPath, BuildError> {
        if !self.is_subpath(base) {
            return Err(BuildError::Invariant(format!(
                "{self} is not below {base}"
            )));
        }
        let rel = self.inner[base.inner.len()..]
            .trim_start_matches('/')
            .to_string();
        Ok(RelPath {
            full: self.clone(),
            rel,
        })
    }

    /// Relative view keeping the last `steps` path elements.
    pub fn relative_to_ancestor(&self, steps: usize) -> Result<RelPath, BuildError> {
        let base = self.ancestor(steps).ok_or_else(|| {
            BuildError::Invariant(format!("{self} has no ancestor {steps} levels up"))
        })?;
        self.relative_to(&base)
    }

    pub fn exists(&self) -> bool {
        self.std_path().exists()
    }

    pub fn is_file(&self) -> bool {
        self.std_path().is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.std_path().is_dir()
    }

    /// Modification time as fractional seconds since the epoch, or `None`
    /// for absent paths.
    pub fn modified_time(&self) -> Option<f64> {
        let meta = std::fs::metadata(self.std_path()).ok()?;
        let modified = meta.modified().ok()?;
        modified
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs_f64())
    }

    /// Direct children, deterministically sorted.
    pub fn children(&self) -> Vec<AbsPath> {
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(self.std_path()) {
            for entry in entries.flatten() {
                out.push(AbsPath::new(entry.path()));
            }
        }
        out.sort();
        out
    }

    /// All paths below (and including) this one, parents before children,
    /// deterministically sorted.
    pub fn preorder(&self) -> Vec<AbsPath> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(self.std_path())
            .sort_by_file_name()
            .into_iter()
            .flatten()
        {
            out.push(AbsPath::new(entry.path()));
        }
        out
    }

    pub fn create_dir_all(&self) -> Result<(), BuildError> {
        std::fs::create_dir_all(self.std_path()).map_err(|source| BuildError::Io {
            path: self.inner.clone(),
            source,
        })
    }

    pub fn copy_to(&self, target: &AbsPath) -> Result<(), BuildError> {
        std::fs::copy(self.std_path(), target.std_path())
            .map(|_| ())
            .map_err(|source| BuildError::Io {
                path: self.inner.clone(),
                source,
            })
    }
}

impl fmt::Display for AbsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

impl fmt::Debug for AbsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AbsPath({:?})", self.inner)
    }
}

impl From<&AbsPath> for PathBuf {
    fn from(p: &AbsPath) -> Self {
        PathBuf::from(&p.inner)
    }
}

/// An absolute path that carries the sub-fragment it was derived from, so
/// outputs can mirror the source layout under another root.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct RelPath {
    full: AbsPath,
    rel: String,
}

impl RelPath {
    /// Re-anchor the relative fragment under a different root.
    pub fn rebase(&self, target: &AbsPath) -> RelPath {
        RelPath {
            full: target.resolve(&self.rel),
            rel: self.rel.clone(),
        }
    }

    pub fn rel_str(&self) -> &str {
        &self.rel
    }

    pub fn path(&self) -> &AbsPath {
        &self.full
    }

    pub fn into_path(self) -> AbsPath {
        self.full
    }

    /// Replace the extension on both the full path and the fragment.
    pub fn with_extension(&self, ext: Option<&str>) -> RelPath {
        let rel = match self.rel.rfind('.') {
            Some(k) if !self.rel[k..].contains('/') => self.rel[..k].to_string(),
            _ => self.rel.clone(),
        };
        let rel = match ext {
            Some(e) => format!("{rel}.{e}"),
            None => rel,
        };
        RelPath {
            full: self.full.with_extension(ext),
            rel,
        }
    }
}

impl Deref for RelPath {
    type Target = AbsPath;

    fn deref(&self) -> &AbsPath {
        &self.full
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.full.fmt(f)
    }
}

/// A set of paths defined by a glob pattern.
///
/// Supported syntax: `?` matches one non-separator character, `*` any
/// non-separator run, `**` any run including separators; `/**/` also
/// matches a single separator, a trailing `/**` also matches nothing, and a
/// trailing `/` restricts matches to directories. Every plain path is a
/// valid pattern for the singleton set containing it.
#[derive(Clone)]
pub struct PathSet {
    pattern: String,
    root: Option<AbsPath>,
    matcher: Option<Regex>,
    dir_only: bool,
}

impl PathSet {
    pub fn new(pattern: &str) -> Self {
        let dir_only = pattern.ends_with('/') && pattern.len() > 1;
        let trimmed = pattern.trim_end_matches('/');

        // Longest literal prefix becomes the traversal root; it is
        // absolutized so relative patterns anchor at the current directory.
        let segments: Vec<&str> = trimmed.split('/').collect();
        let wild = |s: &&str| s.contains('*') || s.contains('?');
        let first_wild = segments.iter().position(wild);

        let (root, full_pattern) = match first_wild {
            None => {
                let root = AbsPath::new(trimmed);
                let pattern = root.as_str().to_string();
                (Some(root), pattern)
            }
            Some(0) => (None, trimmed.to_string()),
            Some(k) => {
                let root = AbsPath::new(segments[..k].join("/"));
                let rest = segments[k..].join("/");
                let pattern = format!("{root}/{rest}");
                (Some(root), pattern)
            }
        };

        let matcher = match first_wild {
            None => None,
            Some(_) => Some(compile_pattern(&full_pattern)),
        };

        Self {
            pattern: full_pattern,
            root,
            matcher,
            dir_only,
        }
    }

    /// The singleton set containing exactly one concrete path.
    pub fn singleton(path: AbsPath) -> Self {
        Self {
            pattern: path.as_str().to_string(),
            root: Some(path),
            matcher: None,
            dir_only: false,
        }
    }

    /// Every path below (and including) the given directory.
    pub fn under(dir: &AbsPath) -> Self {
        Self::new(&format!("{dir}/**"))
    }

    /// True if this set can only ever match one path.
    pub fn is_singleton(&self) -> bool {
        self.matcher.is_none()
    }

    pub fn can_find_all(&self) -> bool {
        self.root.is_some()
    }

    pub fn root(&self) -> Option<&AbsPath> {
        self.root.as_ref()
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn contains(&self, path: &AbsPath) -> bool {
        let hit = match &self.matcher {
            None => self.root.as_ref() == Some(path),
            Some(re) => re.is_match(path.as_str()),
        };
        hit && (!self.dir_only || path.is_dir())
    }

    /// Enumerate all existing paths in the set, deterministically sorted,
    /// parents before children. Traversal starts at the explicit root or at
    /// the override.
    pub fn find_all(&self, from: Option<&AbsPath>) -> Result<Vec<AbsPath>, BuildError> {
        let start = from.or(self.root.as_ref()).ok_or_else(|| {
            BuildError::Invariant(format!("path set {} has no root to traverse", self.pattern))
        })?;
        let mut out = Vec::new();
        if !start.exists() {
            return Ok(out);
        }
        for p in start.preorder() {
            let matched = match &self.matcher {
                // A fully matched concrete root spans its whole subtree.
                None => true,
                Some(re) => re.is_match(p.as_str()),
            };
            if matched && (!self.dir_only || p.is_dir()) {
                out.push(p);
            }
        }
        Ok(out)
    }
}

impl PartialEq for PathSet {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.dir_only == other.dir_only
    }
}

impl Eq for PathSet {}

impl Hash for PathSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pattern.hash(state);
        self.dir_only.hash(state);
    }
}

impl PartialOrd for PathSet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathSet {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pattern.cmp(&other.pattern)
    }
}

impl fmt::Display for PathSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)?;
        if self.dir_only {
            f.write_str("/")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PathSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathSet({:?})", self.pattern)
    }
}

/// Translate the glob pattern into an anchored regex.
fn compile_pattern(pattern: &str) -> Regex {
    let bytes = pattern.as_bytes();
    let mut out = String::from("^");
    let mut literal = String::new();
    let mut i = 0;

    let flush = |out: &mut String, literal: &mut String| {
        if !literal.is_empty() {
            out.push_str(&regex::escape(literal));
            literal.clear();
        }
    };

    while i < bytes.len() {
        let rest = &pattern[i..];
        if rest.starts_with("/**") {
            // Collapse runs of "/**" into one crossing-separator wildcard.
            let mut j = i;
            while pattern[j..].starts_with("/**") {
                j += 3;
                while bytes.get(j) == Some(&b'*') {
                    j += 1;
                }
            }
            flush(&mut out, &mut literal);
            if j >= bytes.len() {
                // Trailing "/**" also matches the bare prefix.
                out.push_str("(?:/.*)?");
            } else if bytes[j] == b'/' {
                // "/**/" also matches a single separator.
                out.push_str("/(?:.*/)?");
                j += 1;
            } else {
                out.push_str("/.*");
            }
            i = j;
        } else if rest.starts_with("**") {
            let mut j = i;
            while bytes.get(j) == Some(&b'*') {
                j += 1;
            }
            flush(&mut out, &mut literal);
            if bytes.get(j) == Some(&b'/') {
                // Leading "**/" also matches no directories at all.
                out.push_str("(?:.*/)?");
                j += 1;
            } else {
                out.push_str(".*");
            }
            i = j;
        } else if bytes[i] == b'*' {
            flush(&mut out, &mut literal);
            out.push_str("[^/]*");
            i += 1;
        } else if bytes[i] == b'?' {
            flush(&mut out, &mut literal);
            out.push_str("[^/]");
            i += 1;
        } else {
            let ch = rest.chars().next().unwrap_or('\0');
            literal.push(ch);
            i += ch.len_utf8();
        }
    }
    flush(&mut out, &mut literal);
    out.push('$');

    // The translation only emits valid syntax; escape covers the rest.
    Regex::new(&out).unwrap_or_else(|_| Regex::new("$^").unwrap())
}

/// Either a concrete path or a pattern set; the unit of delta queries.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum PathLike {
    Path(AbsPath),
    Set(PathSet),
}

impl PathLike {
    /// Singleton sets collapse to their root path so both spellings share
    /// one delta record.
    pub fn sanitize(self) -> PathLike {
        match self {
            PathLike::Set(s) if s.is_singleton() => match s.root {
                Some(root) => PathLike::Path(root),
                None => PathLike::Set(s),
            },
            other => other,
        }
    }

    pub fn key_string(&self) -> String {
        match self {
            PathLike::Path(p) => p.as_str().to_string(),
            PathLike::Set(s) => s.to_string(),
        }
    }
}

impl From<AbsPath> for PathLike {
    fn from(p: AbsPath) -> Self {
        PathLike::Path(p)
    }
}

impl From<PathSet> for PathLike {
    fn from(s: PathSet) -> Self {
        PathLike::Set(s)
    }
}

impl fmt::Display for PathLike {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathLike::Path(p) => p.fmt(f),
            PathLike::Set(s) => s.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_dots_and_slashes() {
        let p = AbsPath::new("/a/b/../c/./d/");
        assert_eq!(p.as_str(), "/a/c/d");
    }

    #[test]
    fn subpath_needs_a_separator_boundary() {
        let a = AbsPath::new("/a");
        let ab = AbsPath::new("/ab");
        let a_b = AbsPath::new("/a/b");
        assert!(!ab.is_subpath(&a));
        assert!(a_b.is_subpath(&a));
        assert!(a.is_subpath(&a));
    }

    #[test]
    fn extension_handling() {
        let p = AbsPath::new("/src/main.test.cpp");
        assert_eq!(p.extension(), Some("cpp"));
        assert!(p.has_extension(&["cpp", "cc"]));
        assert_eq!(p.with_extension(Some("o")).as_str(), "/src/main.test.o");
        assert_eq!(p.with_extension(None).as_str(), "/src/main.test");
        assert_eq!(p.name(), "main.test.cpp");
    }

    #[test]
    fn ancestors() {
        let p = AbsPath::new("/a/b/c");
        assert_eq!(p.ancestor(1).unwrap().as_str(), "/a/b");
        assert_eq!(p.ancestor(2).unwrap().as_str(), "/a");
        assert_eq!(p.parent().unwrap().as_str(), "/a/b");
    }

    #[test]
    fn relative_rebase_round_trip() {
        let src = AbsPath::new("/work/src");
        let obj = AbsPath::new("/work/obj");
        let unit = AbsPath::new("/work/src/core/main.cpp");
        let rel = unit.relative_to(&src).unwrap();
        assert_eq!(rel.rel_str(), "core/main.cpp");
        let moved = rel.rebase(&obj);
        assert_eq!(moved.as_str(), "/work/obj/core/main.cpp");
        assert_eq!(
            moved.with_extension(Some("o")).as_str(),
            "/work/obj/core/main.o"
        );
    }

    #[test]
    fn pattern_star_does_not_cross_separators() {
        let set = PathSet::new("/a/*.cpp");
        assert!(set.contains(&AbsPath::new("/a/x.cpp")));
        assert!(!set.contains(&AbsPath::new("/a/b/x.cpp")));
        assert!(!set.contains(&AbsPath::new("/a/x.hpp")));
    }

    #[test]
    fn double_star_crosses_separators() {
        let set = PathSet::new("/a/**/x.cpp");
        assert!(set.contains(&AbsPath::new("/a/x.cpp")));
        assert!(set.contains(&AbsPath::new("/a/b/x.cpp")));
        assert!(set.contains(&AbsPath::new("/a/b/c/x.cpp")));
    }

    #[test]
    fn trailing_double_star_includes_the_root() {
        let set = PathSet::new("/a/**");
        assert!(set.contains(&AbsPath::new("/a")));
        assert!(set.contains(&AbsPath::new("/a/b")));
        assert!(set.contains(&AbsPath::new("/a/b/c")));
        assert!(!set.contains(&AbsPath::new("/ab")));
    }

    #[test]
    fn rootless_pattern_matches_anywhere() {
        let set = PathSet::new("**/.git/**");
        assert!(set.contains(&AbsPath::new("/repo/.git")));
        assert!(set.contains(&AbsPath::new("/repo/.git/objects/ab")));
        assert!(set.contains(&AbsPath::new("/deep/nest/.git/config")));
        assert!(!set.contains(&AbsPath::new("/repo/src/main.cpp")));
        assert!(!set.can_find_all());
    }

    #[test]
    fn question_mark_matches_one_character() {
        let set = PathSet::new("/a/?.cpp");
        assert!(set.contains(&AbsPath::new("/a/x.cpp")));
        assert!(!set.contains(&AbsPath::new("/a/xy.cpp")));
    }

    #[test]
    fn singleton_detection() {
        assert!(PathSet::new("/a/b").is_singleton());
        assert!(!PathSet::new("/a/*").is_singleton());
        let sanitized = PathLike::Set(PathSet::new("/a/b")).sanitize();
        assert!(matches!(sanitized, PathLike::Path(p) if p.as_str() == "/a/b"));
    }

    #[test]
    fn find_all_enumerates_matches_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsPath::new(dir.path());
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.cpp"), "b").unwrap();
        std::fs::write(dir.path().join("a.cpp"), "a").unwrap();
        std::fs::write(dir.path().join("sub/c.cpp"), "c").unwrap();
        std::fs::write(dir.path().join("d.hpp"), "d").unwrap();

        let set = PathSet::new(&format!("{root}/**/*.cpp"));
        let found = set.find_all(None).unwrap();
        let names: Vec<&str> = found.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["a.cpp", "b.cpp", "c.cpp"]);
    }

    #[test]
    fn find_all_of_whole_tree_includes_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsPath::new(dir.path());
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/x"), "x").unwrap();

        let set = PathSet::under(&root);
        let found = set.find_all(None).unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0], root);
    }

    #[test]
    fn find_all_on_missing_root_is_empty() {
        let set = PathSet::new("/definitely/not/here/**");
        assert!(set.find_all(None).unwrap().is_empty());
    }

    #[test]
    fn directory_only_patterns_probe_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsPath::new(dir.path());
        std::fs::create_dir(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("f"), "f").unwrap();

        let set = PathSet::new(&format!("{root}/*/"));
        assert!(set.contains(&root.resolve("d")));
        assert!(!set.contains(&root.resolve("f")));
    }
}
