//! Gitignore matching for the manifest scan.
//!
//! Every `.gitignore` under the sync root contributes patterns anchored to
//! its containing directory. Matching follows gitignore rules: `!` negates,
//! a trailing `/` restricts to directories, a `/` anywhere anchors the
//! pattern to its gitignore's directory, `*` stays within one path segment,
//! `**` spans segments, `?` matches one non-`/` character, and the last
//! matching pattern wins.

use std::io;
use std::path::Path;

use regex::Regex;
use walkdir::WalkDir;

const GITIGNORE_FILENAME: &str = ".gitignore";

#[derive(Debug)]
struct GitignorePattern {
    regex: Regex,
    negation: bool,
    dir_only: bool,
}

impl GitignorePattern {
    fn parse(line: &str) -> Option<Self> {
        let mut line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let negation = line.starts_with('!');
        if negation {
            line = &line[1..];
        }

        let dir_only = line.ends_with('/');
        if dir_only {
            line = &line[..line.len() - 1];
        }

        // A slash anywhere (other than the stripped trailing one) anchors the
        // pattern to the gitignore's own directory.
        let anchored = line.contains('/');
        let line = line.strip_prefix('/').unwrap_or(line);
        if line.is_empty() {
            return None;
        }

        let regex = Regex::new(&glob_to_regex(line, anchored)).ok()?;
        Some(Self {
            regex,
            negation,
            dir_only,
        })
    }

    fn matches(&self, path: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        self.regex.is_match(path)
    }
}

fn glob_to_regex(glob: &str, anchored: bool) -> String {
    let mut regex = String::new();
    if anchored {
        regex.push('^');
    } else {
        regex.push_str("(^|/)");
    }

    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    if chars.get(i + 2) == Some(&'/') {
                        regex.push_str("(.*/)?");
                        i += 2;
                    } else {
                        regex.push_str(".*");
                        i += 1;
                    }
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            c if "\\.()+|^$@%{}[]".contains(c) => {
                regex.push('\\');
                regex.push(c);
            }
            c => regex.push(c),
        }
        i += 1;
    }

    // Match the path itself or anything beneath it.
    regex.push_str("(/.*)?$");
    regex
}

/// All gitignore patterns under one root, each scoped to its directory.
#[derive(Debug, Default)]
pub struct GitignoreSet {
    /// Scopes ordered root-first so deeper gitignores override shallower ones.
    scopes: Vec<(String, Vec<GitignorePattern>)>,
}

impl GitignoreSet {
    /// Scan `root` for `.gitignore` files at every level and load them all.
    pub fn load(root: &Path) -> io::Result<Self> {
        let mut set = Self::default();
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() && entry.file_name() == GITIGNORE_FILENAME {
                let scope = entry
                    .path()
                    .parent()
                    .and_then(|p| p.strip_prefix(root).ok())
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                let content = std::fs::read_to_string(entry.path())?;
                set.add_patterns(&scope, &content);
            }
        }
        set.scopes
            .sort_by_key(|(scope, _)| scope.matches('/').count() + usize::from(!scope.is_empty()));
        Ok(set)
    }

    /// Register the patterns of one gitignore file anchored at `scope`
    /// (`""` for the root).
    pub fn add_patterns(&mut self, scope: &str, content: &str) {
        let patterns: Vec<GitignorePattern> = content
            .lines()
            .filter_map(GitignorePattern::parse)
            .collect();
        if !patterns.is_empty() {
            self.scopes.push((scope.to_string(), patterns));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Whether `relative_path` (using `/` separators) is ignored.
    pub fn is_ignored(&self, relative_path: &str, is_dir: bool) -> bool {
        let relative_path = relative_path.replace('\\', "/");
        let mut ignored = false;

        for (scope, patterns) in &self.scopes {
            let candidate = if scope.is_empty() {
                Some(relative_path.as_str())
            } else {
                relative_path
                    .strip_prefix(scope.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
            };
            let Some(candidate) = candidate else { continue };

            for pattern in patterns {
                if pattern.matches(candidate, is_dir) {
                    ignored = !pattern.negation;
                }
            }
        }

        ignored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(content: &str) -> GitignoreSet {
        let mut set = GitignoreSet::default();
        set.add_patterns("", content);
        set
    }

    #[test]
    fn unanchored_pattern_matches_anywhere() {
        let s = set("*.log\n");
        assert!(s.is_ignored("debug.log", false));
        assert!(s.is_ignored("deep/nested/trace.log", false));
        assert!(!s.is_ignored("keep.txt", false));
    }

    #[test]
    fn negation_overrides_earlier_match() {
        let s = set("*.log\n!keep.log\n");
        assert!(s.is_ignored("debug.log", false));
        assert!(!s.is_ignored("keep.log", false));
        assert!(!s.is_ignored("sub/keep.log", false));
    }

    #[test]
    fn leading_slash_anchors_to_root() {
        let s = set("/build\n");
        assert!(s.is_ignored("build", true));
        assert!(s.is_ignored("build/out.o", false));
        assert!(!s.is_ignored("src/build", true));
    }

    #[test]
    fn trailing_slash_is_directory_only() {
        let s = set("docs/\n");
        assert!(s.is_ignored("docs", true));
        assert!(!s.is_ignored("docs", false));
        assert!(s.is_ignored("a/docs", true));
    }

    #[test]
    fn question_mark_matches_one_char() {
        let s = set("file?.txt\n");
        assert!(s.is_ignored("file1.txt", false));
        assert!(!s.is_ignored("file12.txt", false));
        assert!(!s.is_ignored("file/.txt", false));
    }

    #[test]
    fn star_stays_within_a_segment() {
        let s = set("src/*.o\n");
        assert!(s.is_ignored("src/a.o", false));
        assert!(!s.is_ignored("src/deep/a.o", false));
    }

    #[test]
    fn double_star_spans_segments() {
        let s = set("**/generated\nbuild/**\n");
        assert!(s.is_ignored("generated", true));
        assert!(s.is_ignored("a/b/generated", true));
        assert!(s.is_ignored("build/any/depth/file.c", false));
    }

    #[test]
    fn later_patterns_win_within_one_file() {
        let s = set("!important.log\n*.log\n");
        // The blanket ignore comes after the negation, so it wins.
        assert!(s.is_ignored("important.log", false));
    }

    #[test]
    fn nested_gitignore_is_anchored_to_its_directory() {
        let mut s = GitignoreSet::default();
        s.add_patterns("", "*.tmp\n");
        s.add_patterns("sub", "local.txt\n!special.tmp\n");

        assert!(s.is_ignored("a.tmp", false));
        assert!(s.is_ignored("sub/local.txt", false));
        // The nested negation rescues files only below its own directory.
        assert!(!s.is_ignored("sub/special.tmp", false));
        assert!(s.is_ignored("special.tmp", false));
        // A nested gitignore never affects siblings.
        assert!(!s.is_ignored("other/local.txt", false));
    }

    #[test]
    fn load_discovers_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/.gitignore"), "secret/\n").unwrap();

        let s = GitignoreSet::load(dir.path()).unwrap();
        assert!(s.is_ignored("x.log", false));
        assert!(s.is_ignored("sub/secret", true));
        assert!(!s.is_ignored("secret", true));
    }
}
