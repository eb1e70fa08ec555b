//! Bounded collection of a package's readable text.

use crate::shared::config::LimitsConfig;
use crate::shared::models::Ecosystem;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

const NPM_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "ts", "json", "sh"];
const PYPI_EXTENSIONS: &[&str] = &["py", "pyw", "cfg", "toml", "txt", "sh"];

/// Directories never descended into.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "__pycache__", ".venv", "venv"];

/// Which documentation files a tree carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocPresence {
    pub readme: bool,
    pub license: bool,
    pub changelog: bool,
    pub tests: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Corpus {
    pub text: String,
    pub files_read: usize,
    /// Matching files left out by the file limit or a read error.
    pub files_skipped: usize,
    pub docs: DocPresence,
}

fn extensions(ecosystem: Ecosystem) -> Vec<&'static str> {
    match ecosystem {
        Ecosystem::Npm => NPM_EXTENSIONS.to_vec(),
        Ecosystem::Pypi => PYPI_EXTENSIONS.to_vec(),
        Ecosystem::Other => {
            let mut all = NPM_EXTENSIONS.to_vec();
            all.extend(PYPI_EXTENSIONS.iter().filter(|e| !NPM_EXTENSIONS.contains(e)));
            all
        }
    }
}

pub(crate) fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

/// Walk `root` in file-name order and concatenate every matching file.
pub fn collect(root: &Path, ecosystem: Ecosystem, limits: &LimitsConfig) -> Corpus {
    let allowed = extensions(ecosystem);
    let mut corpus = Corpus::default();
    let mut parts: Vec<String> = Vec::new();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped_dir(e));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("skipping unreadable entry: {e}");
                continue;
            }
        };
        note_docs(&entry, &mut corpus.docs);
        if !entry.file_type().is_file() {
            continue;
        }

        let matches = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| allowed.iter().any(|a| ext.eq_ignore_ascii_case(a)));
        if !matches {
            continue;
        }
        if corpus.files_read >= limits.max_files {
            corpus.files_skipped += 1;
            continue;
        }

        match read_bounded(entry.path(), limits.max_file_bytes) {
            Ok(text) => {
                parts.push(text);
                corpus.files_read += 1;
            }
            Err(e) => {
                debug!(path = %entry.path().display(), "skipping file: {e}");
                corpus.files_skipped += 1;
            }
        }
    }

    corpus.text = parts.join("\n");
    corpus
}

/// At most `max_bytes` of a file, decoded lossily.
pub fn read_bounded(path: &Path, max_bytes: u64) -> std::io::Result<String> {
    let mut buf = Vec::new();
    File::open(path)?.take(max_bytes).read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn note_docs(entry: &DirEntry, docs: &mut DocPresence) {
    let Some(name) = entry.file_name().to_str() else {
        return;
    };
    let lower = name.to_ascii_lowercase();

    if entry.file_type().is_dir() {
        if entry.depth() > 0 && matches!(lower.as_str(), "test" | "tests" | "__tests__" | "spec") {
            docs.tests = true;
        }
        return;
    }

    let stem = lower.split('.').next().unwrap_or("");
    match stem {
        "readme" => docs.readme = true,
        "license" | "licence" | "copying" => docs.license = true,
        "changelog" | "changes" | "history" => docs.changelog = true,
        _ => {}
    }
    if lower.starts_with("test_")
        || lower.ends_with("_test.py")
        || lower.contains(".test.")
        || lower.contains(".spec.")
    {
        docs.tests = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn limits(max_files: usize, max_file_bytes: u64) -> LimitsConfig {
        LimitsConfig {
            max_files,
            max_file_bytes,
        }
    }

    #[test]
    fn collects_matching_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.js"), "second").unwrap();
        fs::write(dir.path().join("a.js"), "first").unwrap();
        fs::write(dir.path().join("image.png"), "binary").unwrap();

        let corpus = collect(dir.path(), Ecosystem::Npm, &limits(10, 1000));
        assert_eq!(corpus.text, "first\nsecond");
        assert_eq!(corpus.files_read, 2);
    }

    #[test]
    fn ecosystem_selects_extensions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("setup.py"), "import os").unwrap();
        fs::write(dir.path().join("index.js"), "require('fs')").unwrap();

        assert_eq!(collect(dir.path(), Ecosystem::Pypi, &limits(10, 1000)).text, "import os");
        assert_eq!(collect(dir.path(), Ecosystem::Other, &limits(10, 1000)).files_read, 2);
    }

    #[test]
    fn per_file_bytes_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("big.js"), "x".repeat(5000)).unwrap();
        let corpus = collect(dir.path(), Ecosystem::Npm, &limits(10, 100));
        assert_eq!(corpus.text.len(), 100);
    }

    #[test]
    fn file_count_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("f{i}.js")), "x").unwrap();
        }
        let corpus = collect(dir.path(), Ecosystem::Npm, &limits(3, 100));
        assert_eq!(corpus.files_read, 3);
        assert_eq!(corpus.files_skipped, 2);
    }

    #[test]
    fn skips_git_and_node_modules() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/dep")).unwrap();
        fs::write(dir.path().join(".git/hook.sh"), "curl evil").unwrap();
        fs::write(dir.path().join("node_modules/dep/index.js"), "eval(x)").unwrap();
        fs::write(dir.path().join("main.js"), "ok").unwrap();

        let corpus = collect(dir.path(), Ecosystem::Npm, &limits(10, 100));
        assert_eq!(corpus.text, "ok");
    }

    #[test]
    fn invalid_utf8_is_decoded_lossily() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.js"), [b'o', b'k', 0xff, 0xfe]).unwrap();
        let corpus = collect(dir.path(), Ecosystem::Npm, &limits(10, 100));
        assert!(corpus.text.starts_with("ok"));
        assert_eq!(corpus.files_read, 1);
    }

    #[test]
    fn detects_documentation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("README.md"), "# pkg").unwrap();
        fs::write(dir.path().join("LICENSE"), "MIT").unwrap();
        fs::create_dir_all(dir.path().join("tests")).unwrap();

        let docs = collect(dir.path(), Ecosystem::Npm, &limits(10, 100)).docs;
        assert!(docs.readme);
        assert!(docs.license);
        assert!(docs.tests);
        assert!(!docs.changelog);
    }

    #[test]
    fn missing_root_yields_empty_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = collect(&dir.path().join("absent"), Ecosystem::Npm, &limits(10, 100));
        assert!(corpus.text.is_empty());
        assert_eq!(corpus.files_read, 0);
    }
}
