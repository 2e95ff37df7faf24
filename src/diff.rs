//! Unified diff parsing.
//!
//! Turns `git diff` style text into a [`ChangeSet`]. Computing the diff
//! itself is the source host's job; this module only reads the format.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::sync::LazyLock;

use crate::models::{ChangeSet, ChangedFile, DiffHunk, FileStatus};

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("valid hunk header regex")
});

/// Parse a multi-file unified diff.
pub fn parse_unified_diff(text: &str) -> Result<ChangeSet> {
    let mut files: Vec<ChangedFile> = Vec::new();
    let mut current: Option<FileBuilder> = None;
    let mut hunk: Option<OpenHunk> = None;

    for (line_no, line) in text.lines().enumerate() {
        if let Some(open) = hunk.as_mut() {
            if open.accepts(line) {
                open.push(line);
                if open.is_complete() {
                    flush_hunk(&mut current, &mut hunk);
                }
                continue;
            }
            flush_hunk(&mut current, &mut hunk);
        }

        if line.starts_with("diff --git ") {
            if let Some(done) = current.take() {
                files.push(done.finish()?);
            }
            current = Some(FileBuilder::from_git_header(line));
            continue;
        }

        if let Some(caps) = HUNK_HEADER.captures(line) {
            if current.is_none() {
                bail!("line {}: hunk header before any file header", line_no + 1);
            }
            let num = |i: usize, default: usize| -> Result<usize> {
                caps.get(i)
                    .map(|m| m.as_str().parse::<usize>())
                    .transpose()
                    .with_context(|| format!("line {}: bad hunk header", line_no + 1))
                    .map(|v| v.unwrap_or(default))
            };
            let open = OpenHunk::new(DiffHunk {
                old_start: num(1, 0)?,
                old_count: num(2, 1)?,
                new_start: num(3, 0)?,
                new_count: num(4, 1)?,
                lines: Vec::new(),
            });
            hunk = Some(open);
            if hunk.as_ref().is_some_and(OpenHunk::is_complete) {
                flush_hunk(&mut current, &mut hunk);
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("--- ") {
            // A second `---` without a `diff --git` line starts the next file.
            if current.as_ref().is_some_and(|b| !b.hunks.is_empty()) {
                if let Some(done) = current.take() {
                    files.push(done.finish()?);
                }
            }
            let builder = current.get_or_insert_with(FileBuilder::default);
            builder.old_path = strip_prefix_path(rest);
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            let builder = current.get_or_insert_with(FileBuilder::default);
            builder.new_path = strip_prefix_path(rest);
        } else if let Some(b) = current.as_mut() {
            if line.starts_with("new file mode") {
                b.added = true;
            } else if line.starts_with("deleted file mode") {
                b.deleted = true;
            } else if let Some(from) = line.strip_prefix("rename from ") {
                b.renamed_from = Some(from.to_string());
            } else if let Some(to) = line.strip_prefix("rename to ") {
                b.new_path = Some(to.to_string());
            }
        }
    }

    flush_hunk(&mut current, &mut hunk);
    if let Some(done) = current.take() {
        files.push(done.finish()?);
    }
    Ok(ChangeSet { files })
}

/// A hunk still consuming body lines, with the old/new line counts left.
struct OpenHunk {
    hunk: DiffHunk,
    old_left: usize,
    new_left: usize,
}

impl OpenHunk {
    fn new(hunk: DiffHunk) -> Self {
        Self {
            old_left: hunk.old_count,
            new_left: hunk.new_count,
            hunk,
        }
    }

    fn accepts(&self, line: &str) -> bool {
        line.starts_with('\\')
            || line.is_empty()
            || line.starts_with(' ')
            || (line.starts_with('-') && self.old_left > 0)
            || (line.starts_with('+') && self.new_left > 0)
    }

    fn push(&mut self, line: &str) {
        if line.starts_with('\\') {
            return;
        }
        if line.starts_with('-') {
            self.old_left -= 1;
        } else if line.starts_with('+') {
            self.new_left -= 1;
        } else {
            self.old_left = self.old_left.saturating_sub(1);
            self.new_left = self.new_left.saturating_sub(1);
        }
        self.hunk
            .lines
            .push(if line.is_empty() { " ".to_string() } else { line.to_string() });
    }

    fn is_complete(&self) -> bool {
        self.old_left == 0 && self.new_left == 0
    }
}

fn flush_hunk(current: &mut Option<FileBuilder>, hunk: &mut Option<OpenHunk>) {
    if let (Some(file), Some(open)) = (current.as_mut(), hunk.take()) {
        file.hunks.push(open.hunk);
    }
}

/// `a/src/x.rs` → `src/x.rs`; `/dev/null` → `None`.
fn strip_prefix_path(raw: &str) -> Option<String> {
    let path = raw.split('\t').next().unwrap_or(raw).trim();
    if path == "/dev/null" {
        return None;
    }
    let path = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    Some(path.to_string())
}

#[derive(Default)]
struct FileBuilder {
    old_path: Option<String>,
    new_path: Option<String>,
    added: bool,
    deleted: bool,
    renamed_from: Option<String>,
    hunks: Vec<DiffHunk>,
}

impl FileBuilder {
    fn from_git_header(line: &str) -> Self {
        // diff --git a/x b/x
        let mut parts = line.trim_start_matches("diff --git ").split_whitespace();
        let old_path = parts.next().and_then(strip_prefix_path);
        let new_path = parts.next().and_then(strip_prefix_path);
        Self {
            old_path,
            new_path,
            ..Self::default()
        }
    }

    fn finish(self) -> Result<ChangedFile> {
        let deleted = self.deleted || (self.new_path.is_none() && self.old_path.is_some());
        let added = self.added || (self.old_path.is_none() && self.new_path.is_some());
        let path = if deleted {
            self.old_path.clone()
        } else {
            self.new_path.clone()
        }
        .or_else(|| self.old_path.clone())
        .context("diff entry without a file path")?;

        let status = if deleted {
            FileStatus::Deleted
        } else if added {
            FileStatus::Added
        } else if let Some(from) = self.renamed_from {
            FileStatus::Renamed { from }
        } else {
            match &self.old_path {
                Some(old) if old != &path => FileStatus::Renamed { from: old.clone() },
                _ => FileStatus::Modified,
            }
        };

        Ok(ChangedFile {
            path,
            status,
            hunks: self.hunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
diff --git a/src/config.rs b/src/config.rs
index 111..222 100644
--- a/src/config.rs
+++ b/src/config.rs
@@ -10,3 +10,4 @@ fn load()
 let a = 1;
-let b = 2;
+let b = 3;
+let c = 4;
 let d = 5;
@@ -40 +41 @@
-old
+new
diff --git a/src/new.rs b/src/new.rs
new file mode 100644
--- /dev/null
+++ b/src/new.rs
@@ -0,0 +1,2 @@
+fn a() {}
+fn b() {}
diff --git a/gone.txt b/gone.txt
deleted file mode 100644
--- a/gone.txt
+++ /dev/null
@@ -1 +0,0 @@
-bye
";

    #[test]
    fn test_parse_multi_file_diff() {
        let cs = parse_unified_diff(SAMPLE).unwrap();
        assert_eq!(cs.files.len(), 3);

        let config = cs.file("src/config.rs").unwrap();
        assert_eq!(config.status, FileStatus::Modified);
        assert_eq!(config.hunks.len(), 2);
        assert_eq!(config.hunks[0].added_lines(), vec![11, 12]);
        assert_eq!(config.hunks[1].old_count, 1);
        assert_eq!(config.hunks[1].new_start, 41);

        let new = cs.file("src/new.rs").unwrap();
        assert_eq!(new.status, FileStatus::Added);
        assert_eq!(new.added_line_count(), 2);

        assert_eq!(cs.file("gone.txt").unwrap().status, FileStatus::Deleted);
    }

    #[test]
    fn test_rename() {
        let text = "\
diff --git a/old.rs b/new.rs
similarity index 90%
rename from old.rs
rename to new.rs
";
        let cs = parse_unified_diff(text).unwrap();
        assert_eq!(
            cs.files[0].status,
            FileStatus::Renamed {
                from: "old.rs".into()
            }
        );
        assert_eq!(cs.files[0].path, "new.rs");
    }

    #[test]
    fn test_plain_diff_without_git_header() {
        let text = "--- a/x.py\n+++ b/x.py\n@@ -1 +1 @@\n-a\n+b\n";
        let cs = parse_unified_diff(text).unwrap();
        assert_eq!(cs.files.len(), 1);
        assert_eq!(cs.files[0].path, "x.py");
    }

    #[test]
    fn test_plain_multi_file_diff() {
        let text = "--- a/x.py\n+++ b/x.py\n@@ -1 +1 @@\n-a\n+b\n--- a/y.py\n+++ b/y.py\n@@ -2,0 +3 @@\n+c\n";
        let cs = parse_unified_diff(text).unwrap();
        assert_eq!(cs.files.len(), 2);
        assert_eq!(cs.files[1].path, "y.py");
        assert_eq!(cs.files[1].hunks[0].added_lines(), vec![3]);
    }

    #[test]
    fn test_empty_diff() {
        assert!(parse_unified_diff("").unwrap().is_empty());
    }
}
